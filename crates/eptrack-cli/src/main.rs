use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Result;
use clap::{Args, Parser, Subcommand, ValueEnum};
use eptrack_adapters::SourceKind;
use eptrack_storage::StoreStatus;
use eptrack_sync::{SyncConfig, SyncOptions, SyncRunSummary, MAX_BATCH_SIZE};
use tracing::error;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const EXIT_RUN_FAILED: u8 = 1;
const EXIT_PARTIAL_FAILURE: u8 = 2;

#[derive(Debug, Parser)]
#[command(name = "eptrack")]
#[command(about = "Incremental One Piece episode metadata sync")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Fetch episodes and insert the ones not yet stored (default).
    Sync(SyncArgs),
    /// Apply embedded SQL migrations.
    Migrate,
    /// Upsert arc reference data from a YAML file.
    SeedArcs {
        #[arg(long, default_value = "data/arcs.yaml")]
        file: PathBuf,
    },
    /// Show database health, episode range and arc coverage.
    Status,
}

#[derive(Debug, Default, Args)]
struct SyncArgs {
    #[arg(long, value_enum, default_value_t = SourceArg::Api)]
    source: SourceArg,
    /// Fetch, diff and resolve arcs without writing.
    #[arg(long)]
    dry_run: bool,
    #[arg(long, value_parser = clap::builder::RangedU64ValueParser::<usize>::new().range(1..=MAX_BATCH_SIZE as u64))]
    batch_size: Option<usize>,
    /// Skip writing reports/<run_id>/ files.
    #[arg(long)]
    no_report: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
enum SourceArg {
    #[default]
    Api,
    Scrape,
}

impl From<SourceArg> for SourceKind {
    fn from(value: SourceArg) -> Self {
        match value {
            SourceArg::Api => SourceKind::Api,
            SourceArg::Scrape => SourceKind::Scrape,
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "eptrack=info,eptrack_sync=info,eptrack_adapters=info,eptrack_storage=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    match run(cli.command.unwrap_or(Commands::Sync(SyncArgs::default()))).await {
        Ok(code) => code,
        Err(err) => {
            error!(error = ?err, "eptrack failed");
            eprintln!("error: {err:#}");
            ExitCode::from(EXIT_RUN_FAILED)
        }
    }
}

async fn run(command: Commands) -> Result<ExitCode> {
    let config = SyncConfig::from_env()?;

    match command {
        Commands::Sync(args) => {
            let options = SyncOptions {
                dry_run: args.dry_run,
                batch_size: args.batch_size,
                no_report: args.no_report,
            };
            let summary = eptrack_sync::run_sync_once(&config, args.source.into(), options).await?;
            print_summary(&summary);
            Ok(ExitCode::from(sync_exit_status(&summary)))
        }
        Commands::Migrate => {
            let store = eptrack_sync::connect_store(&config).await?;
            store.migrate().await?;
            println!("migrations applied");
            Ok(ExitCode::SUCCESS)
        }
        Commands::SeedArcs { file } => {
            let written = eptrack_sync::seed_arcs_from_file(&config, &file).await?;
            println!("seeded {written} arcs from {}", file.display());
            Ok(ExitCode::SUCCESS)
        }
        Commands::Status => {
            let store = eptrack_sync::connect_store(&config).await?;
            store.ping().await?;
            let status = store.status().await?;
            print_status(&status);
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn sync_exit_status(summary: &SyncRunSummary) -> u8 {
    if summary.aborted.is_some() {
        EXIT_RUN_FAILED
    } else if summary.is_success() {
        0
    } else {
        EXIT_PARTIAL_FAILURE
    }
}

fn print_summary(summary: &SyncRunSummary) {
    let outcome = match (&summary.aborted, summary.dry_run) {
        (Some(_), _) => "aborted",
        (None, true) => "dry run complete",
        (None, false) => "complete",
    };
    println!(
        "sync {}: run_id={} source={} fetched={} duplicates={} new={} skipped={} inserted={} failed={} batches_ok={} batches_failed={}",
        outcome,
        summary.run_id,
        summary.source,
        summary.fetched,
        summary.duplicates,
        summary.new,
        summary.skipped,
        summary.inserted,
        summary.failed,
        summary.batches_succeeded,
        summary.batches_failed,
    );
    for failure in &summary.failures {
        println!(
            "  batch {} failed (episodes {}-{}): {}",
            failure.index, failure.first_id, failure.last_id, failure.error
        );
    }
    if !summary.rejected_ids.is_empty() {
        println!("  rejected (already present): {:?}", summary.rejected_ids);
    }
    if let Some(abort) = &summary.aborted {
        eprintln!("error ({:?}): {}", abort.kind, abort.error);
    }
}

fn print_status(status: &StoreStatus) {
    println!("database: ok");
    match (status.min_episode, status.max_episode) {
        (Some(min), Some(max)) => println!(
            "episodes: {} (range {min}-{max})",
            status.episode_count
        ),
        _ => println!("episodes: {}", status.episode_count),
    }
    if let Some(latest) = status.latest_airdate {
        println!("latest air date: {latest}");
    }
    println!("arcs:");
    for arc in &status.arcs {
        println!(
            "  {:>4}  {:<20} {:>5}-{:<5} {} episodes",
            arc.id, arc.name, arc.start_episode, arc.end_episode, arc.episode_count
        );
    }
    if !status.recent.is_empty() {
        println!("recent:");
        for episode in &status.recent {
            println!(
                "  {:>5}  {}  [{}]",
                episode.id,
                episode.title,
                episode.arc_name.as_deref().unwrap_or("no arc")
            );
        }
    }
}
