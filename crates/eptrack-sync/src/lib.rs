//! Incremental sync orchestration: config, delta planning, batch writes, run reports.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Display;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use eptrack_adapters::{source_for, AdapterError, EpisodeSource, SourceEndpoints, SourceKind};
use eptrack_core::{ArcTable, ArcTableError, Episode, EpisodeDraft};
use eptrack_storage::{
    ArcSeed, BackoffPolicy, EpisodeStore, HttpClientConfig, HttpFetcher, PgEpisodeStore, StoreError,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "eptrack-sync";

pub const DEFAULT_BATCH_SIZE: usize = 100;
/// Each row binds four parameters; Postgres allows 65535 per statement.
pub const MAX_BATCH_SIZE: usize = 5000;
pub const DEFAULT_USER_AGENT: &str = "eptrack/0.1 (+episode metadata sync)";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Fetch,
    Parse,
    PersistenceRead,
    PersistenceWrite,
    Config,
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("fetching episodes: {0}")]
    Source(#[from] AdapterError),
    #[error("reading existing data: {0}")]
    PersistenceRead(#[source] StoreError),
    #[error("arc configuration: {0}")]
    ArcConfig(#[from] ArcTableError),
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl SyncError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SyncError::Source(AdapterError::Fetch { .. }) => ErrorKind::Fetch,
            SyncError::Source(AdapterError::Parse { .. }) => ErrorKind::Parse,
            SyncError::PersistenceRead(_) => ErrorKind::PersistenceRead,
            SyncError::ArcConfig(_) | SyncError::Config(_) => ErrorKind::Config,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub database_url: String,
    pub db_max_connections: u32,
    pub endpoints: SourceEndpoints,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub http_max_retries: usize,
    pub batch_size: usize,
    pub unknown_arc_id: Option<i32>,
    pub reports_dir: Option<PathBuf>,
}

impl SyncConfig {
    pub fn from_env() -> Result<Self, SyncError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the config from an arbitrary variable source. Blank values count as unset,
    /// except `EPTRACK_REPORTS_DIR` where blank disables report files.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, SyncError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let defaults = SourceEndpoints::default();

        let database_url = get("DATABASE_URL")
            .ok_or_else(|| SyncError::Config("DATABASE_URL is not set".to_string()))?;
        let batch_size = parse_var(get("EPTRACK_BATCH_SIZE"), "EPTRACK_BATCH_SIZE", DEFAULT_BATCH_SIZE)?;
        validate_batch_size(batch_size)?;

        let reports_dir = match lookup("EPTRACK_REPORTS_DIR") {
            Some(value) if value.trim().is_empty() => None,
            Some(value) => Some(PathBuf::from(value.trim())),
            None => Some(PathBuf::from("./reports")),
        };

        Ok(Self {
            database_url,
            db_max_connections: parse_var(
                get("EPTRACK_DB_MAX_CONNECTIONS"),
                "EPTRACK_DB_MAX_CONNECTIONS",
                2,
            )?,
            endpoints: SourceEndpoints {
                api_base_url: get("EPTRACK_API_BASE_URL").unwrap_or(defaults.api_base_url),
                api_max_pages: parse_var(
                    get("EPTRACK_API_MAX_PAGES"),
                    "EPTRACK_API_MAX_PAGES",
                    defaults.api_max_pages,
                )?,
                scrape_url: get("EPTRACK_SCRAPE_URL").unwrap_or(defaults.scrape_url),
            },
            user_agent: get("EPTRACK_USER_AGENT").unwrap_or_else(|| DEFAULT_USER_AGENT.to_string()),
            http_timeout_secs: parse_var(
                get("EPTRACK_HTTP_TIMEOUT_SECS"),
                "EPTRACK_HTTP_TIMEOUT_SECS",
                30,
            )?,
            http_max_retries: parse_var(
                get("EPTRACK_HTTP_MAX_RETRIES"),
                "EPTRACK_HTTP_MAX_RETRIES",
                3,
            )?,
            batch_size,
            unknown_arc_id: get("EPTRACK_UNKNOWN_ARC_ID")
                .map(|v| parse_var(Some(v), "EPTRACK_UNKNOWN_ARC_ID", 0))
                .transpose()?,
            reports_dir,
        })
    }

    pub fn http_client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
            backoff: BackoffPolicy {
                max_retries: self.http_max_retries,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    pub fn pipeline_settings(&self, options: &SyncOptions) -> PipelineSettings {
        PipelineSettings {
            batch_size: options.batch_size.unwrap_or(self.batch_size),
            dry_run: options.dry_run,
            unknown_arc_id: self.unknown_arc_id,
            reports_dir: if options.no_report {
                None
            } else {
                self.reports_dir.clone()
            },
        }
    }
}

fn parse_var<T>(value: Option<String>, key: &str, default: T) -> Result<T, SyncError>
where
    T: FromStr,
    T::Err: Display,
{
    match value {
        None => Ok(default),
        Some(raw) => raw
            .parse()
            .map_err(|e| SyncError::Config(format!("{key}={raw}: {e}"))),
    }
}

fn validate_batch_size(batch_size: usize) -> Result<(), SyncError> {
    if !(1..=MAX_BATCH_SIZE).contains(&batch_size) {
        return Err(SyncError::Config(format!(
            "batch size must be between 1 and {MAX_BATCH_SIZE}, got {batch_size}"
        )));
    }
    Ok(())
}

/// Per-invocation overrides layered on top of [`SyncConfig`].
#[derive(Debug, Clone, Default)]
pub struct SyncOptions {
    pub dry_run: bool,
    pub batch_size: Option<usize>,
    pub no_report: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineSettings {
    pub batch_size: usize,
    pub dry_run: bool,
    pub unknown_arc_id: Option<i32>,
    pub reports_dir: Option<PathBuf>,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            dry_run: false,
            unknown_arc_id: None,
            reports_dir: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ArcSeedFile {
    pub version: u32,
    pub arcs: Vec<ArcSeed>,
}

pub fn load_arc_seed(path: &Path) -> Result<ArcSeedFile> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    let file = parse_arc_seed(&text).with_context(|| format!("parsing {}", path.display()))?;
    Ok(file)
}

pub fn parse_arc_seed(text: &str) -> Result<ArcSeedFile> {
    let file: ArcSeedFile = serde_yaml::from_str(text)?;
    let mut names = BTreeSet::new();
    for arc in &file.arcs {
        if arc.name.trim().is_empty() {
            bail!("arc with range {}-{} has no name", arc.start_episode, arc.end_episode);
        }
        if arc.start_episode > arc.end_episode {
            bail!(
                "arc {} starts after it ends ({} > {})",
                arc.name,
                arc.start_episode,
                arc.end_episode
            );
        }
        if !names.insert(arc.name.as_str()) {
            bail!("arc {} is listed more than once", arc.name);
        }
    }
    Ok(file)
}

/// Fetched records split against the ids already stored.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncDelta {
    /// Unseen records, ascending by episode number.
    pub new: Vec<EpisodeDraft>,
    pub skipped: Vec<i32>,
    pub duplicates: usize,
}

/// Collapses repeated episode numbers (first occurrence wins) and drops ids already stored.
pub fn plan_delta(drafts: Vec<EpisodeDraft>, existing: &BTreeSet<i32>) -> SyncDelta {
    let mut unique: BTreeMap<i32, EpisodeDraft> = BTreeMap::new();
    let mut duplicates = 0usize;
    for draft in drafts {
        if unique.contains_key(&draft.number) {
            duplicates += 1;
            continue;
        }
        unique.insert(draft.number, draft);
    }

    let mut delta = SyncDelta {
        duplicates,
        ..Default::default()
    };
    for (number, draft) in unique {
        if existing.contains(&number) {
            delta.skipped.push(number);
        } else {
            delta.new.push(draft);
        }
    }
    delta
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BatchFailure {
    /// 1-based position of the batch within the run.
    pub index: usize,
    pub first_id: i32,
    pub last_id: i32,
    pub ids: Vec<i32>,
    pub kind: ErrorKind,
    pub error: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncRunSummary {
    pub run_id: Uuid,
    pub source: String,
    pub dry_run: bool,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub fetched: usize,
    pub duplicates: usize,
    pub new: usize,
    pub skipped: usize,
    pub inserted: usize,
    pub failed: usize,
    pub batches_succeeded: usize,
    pub batches_failed: usize,
    pub failures: Vec<BatchFailure>,
    pub rejected_ids: Vec<i32>,
    /// Set when the run stopped before writing; all counts are zero.
    pub aborted: Option<RunAbort>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunAbort {
    pub kind: ErrorKind,
    pub error: String,
}

impl SyncRunSummary {
    pub fn new(run_id: Uuid, source: &str, dry_run: bool, started_at: DateTime<Utc>) -> Self {
        Self {
            run_id,
            source: source.to_string(),
            dry_run,
            started_at,
            finished_at: started_at,
            fetched: 0,
            duplicates: 0,
            new: 0,
            skipped: 0,
            inserted: 0,
            failed: 0,
            batches_succeeded: 0,
            batches_failed: 0,
            failures: Vec::new(),
            rejected_ids: Vec::new(),
            aborted: None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.aborted.is_none() && self.batches_failed == 0 && self.failed == 0
    }
}

/// A run that stopped early, with the zero-count summary that was reported for it.
#[derive(Debug, Error)]
#[error("{error}")]
pub struct SyncAbort {
    pub summary: SyncRunSummary,
    #[source]
    pub error: SyncError,
}

impl SyncAbort {
    pub fn kind(&self) -> ErrorKind {
        self.error.kind()
    }
}

pub struct SyncPipeline {
    source: Box<dyn EpisodeSource>,
    store: Arc<dyn EpisodeStore>,
    settings: PipelineSettings,
}

impl SyncPipeline {
    pub fn new(
        source: Box<dyn EpisodeSource>,
        store: Arc<dyn EpisodeStore>,
        settings: PipelineSettings,
    ) -> Result<Self, SyncError> {
        validate_batch_size(settings.batch_size)?;
        Ok(Self {
            source,
            store,
            settings,
        })
    }

    pub async fn run_once(&self) -> Result<SyncRunSummary, SyncAbort> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let span = info_span!("sync_run", %run_id, source = self.source.source_id());

        match self.run_inner(run_id, started_at).instrument(span).await {
            Ok(summary) => {
                self.write_report(&summary).await;
                Ok(summary)
            }
            Err(error) => {
                let mut summary =
                    SyncRunSummary::new(run_id, self.source.source_id(), self.settings.dry_run, started_at);
                summary.finished_at = Utc::now();
                summary.aborted = Some(RunAbort {
                    kind: error.kind(),
                    error: error.to_string(),
                });
                error!(%run_id, kind = ?error.kind(), error = %error, "sync run aborted");
                self.write_report(&summary).await;
                Err(SyncAbort { summary, error })
            }
        }
    }

    async fn write_report(&self, summary: &SyncRunSummary) {
        let Some(dir) = &self.settings.reports_dir else {
            return;
        };
        match write_reports(dir, summary).await {
            Ok(path) => info!(run_id = %summary.run_id, path = %path.display(), "wrote run report"),
            Err(err) => warn!(run_id = %summary.run_id, error = ?err, "failed to write run report"),
        }
    }

    async fn run_inner(&self, run_id: Uuid, started_at: DateTime<Utc>) -> Result<SyncRunSummary, SyncError> {
        let drafts = self.source.fetch_all().await?;
        let fetched = drafts.len();
        info!(fetched, "fetched episode records");

        let existing = self
            .store
            .existing_ids()
            .await
            .map_err(SyncError::PersistenceRead)?;
        let arcs = self
            .store
            .load_arcs()
            .await
            .map_err(SyncError::PersistenceRead)?;
        let arc_table = ArcTable::new(arcs, self.settings.unknown_arc_id)?;

        let delta = plan_delta(drafts, &existing);
        info!(
            existing = existing.len(),
            new = delta.new.len(),
            skipped = delta.skipped.len(),
            duplicates = delta.duplicates,
            "planned delta"
        );

        let new_count = delta.new.len();
        let episodes: Vec<Episode> = delta
            .new
            .into_iter()
            .map(|draft| {
                let arc_id = arc_table.resolve(draft.number);
                Episode::from_draft(draft, arc_id)
            })
            .collect();

        let mut summary =
            SyncRunSummary::new(run_id, self.source.source_id(), self.settings.dry_run, started_at);
        summary.fetched = fetched;
        summary.duplicates = delta.duplicates;
        summary.new = new_count;
        summary.skipped = delta.skipped.len();

        if self.settings.dry_run {
            info!(would_insert = new_count, "dry run, skipping writes");
        } else {
            self.write_batches(&episodes, &mut summary).await;
        }

        summary.finished_at = Utc::now();
        info!(
            inserted = summary.inserted,
            failed = summary.failed,
            batches_succeeded = summary.batches_succeeded,
            batches_failed = summary.batches_failed,
            "sync run finished"
        );
        Ok(summary)
    }

    async fn write_batches(&self, episodes: &[Episode], summary: &mut SyncRunSummary) {
        for (offset, batch) in episodes.chunks(self.settings.batch_size).enumerate() {
            let index = offset + 1;
            let ids: Vec<i32> = batch.iter().map(|e| e.id).collect();
            let first_id = ids.first().copied().unwrap_or_default();
            let last_id = ids.last().copied().unwrap_or_default();

            match self.store.insert_batch(batch).await {
                Ok(outcome) => {
                    summary.batches_succeeded += 1;
                    summary.inserted += outcome.inserted.len();
                    if !outcome.rejected.is_empty() {
                        warn!(
                            batch = index,
                            rejected = ?outcome.rejected,
                            "ids already present, left untouched"
                        );
                        summary.failed += outcome.rejected.len();
                        summary.rejected_ids.extend(outcome.rejected);
                    }
                    info!(batch = index, first_id, last_id, inserted = outcome.inserted.len(), "batch written");
                }
                Err(err) => {
                    warn!(batch = index, first_id, last_id, error = %err, "batch failed");
                    summary.batches_failed += 1;
                    summary.failed += batch.len();
                    summary.failures.push(BatchFailure {
                        index,
                        first_id,
                        last_id,
                        ids,
                        kind: ErrorKind::PersistenceWrite,
                        error: err.to_string(),
                    });
                }
            }
        }
    }
}

pub fn render_brief(summary: &SyncRunSummary) -> String {
    let mut brief = format!(
        "# eptrack sync brief\n\n- Run ID: `{}`\n- Source: {}\n- Dry run: {}\n- Started: {}\n- Finished: {}\n- Fetched: {} ({} duplicates collapsed)\n- New: {}\n- Skipped (already stored): {}\n- Inserted: {}\n- Failed: {}\n- Batches: {} succeeded, {} failed\n",
        summary.run_id,
        summary.source,
        summary.dry_run,
        summary.started_at,
        summary.finished_at,
        summary.fetched,
        summary.duplicates,
        summary.new,
        summary.skipped,
        summary.inserted,
        summary.failed,
        summary.batches_succeeded,
        summary.batches_failed,
    );

    if let Some(abort) = &summary.aborted {
        brief.push_str(&format!(
            "\n## Aborted\n- Kind: {:?}\n- Error: {}\n",
            abort.kind, abort.error
        ));
    }
    if !summary.failures.is_empty() {
        brief.push_str("\n## Failed Batches\n");
        for failure in &summary.failures {
            brief.push_str(&format!(
                "- batch {} (episodes {}-{}, {} records): {}\n",
                failure.index,
                failure.first_id,
                failure.last_id,
                failure.ids.len(),
                failure.error
            ));
        }
    }
    if !summary.rejected_ids.is_empty() {
        brief.push_str(&format!(
            "\n## Rejected Episodes\n{}\n",
            summary
                .rejected_ids
                .iter()
                .map(|id| format!("- {id}"))
                .collect::<Vec<_>>()
                .join("\n")
        ));
    }
    brief
}

/// Writes `summary.json` and `brief.md` under `<reports_root>/<run_id>/`.
pub async fn write_reports(reports_root: &Path, summary: &SyncRunSummary) -> Result<PathBuf> {
    let run_dir = reports_root.join(summary.run_id.to_string());
    fs::create_dir_all(&run_dir)
        .await
        .with_context(|| format!("creating {}", run_dir.display()))?;

    let json = serde_json::to_vec_pretty(summary).context("serializing run summary")?;
    fs::write(run_dir.join("summary.json"), json)
        .await
        .context("writing summary.json")?;
    fs::write(run_dir.join("brief.md"), render_brief(summary))
        .await
        .context("writing brief.md")?;
    Ok(run_dir)
}

pub async fn connect_store(config: &SyncConfig) -> Result<PgEpisodeStore> {
    PgEpisodeStore::connect(&config.database_url, config.db_max_connections)
        .await
        .context("connecting to episode database")
}

/// Runs one sync. Setup failures (HTTP client, database connection) are errors; a run that
/// aborts after starting is returned as a summary with `aborted` set.
pub async fn run_sync_once(
    config: &SyncConfig,
    kind: SourceKind,
    options: SyncOptions,
) -> Result<SyncRunSummary> {
    let http = HttpFetcher::new(config.http_client_config())?;
    let source = source_for(kind, http, &config.endpoints);
    let store = connect_store(config).await?;
    let pipeline = SyncPipeline::new(source, Arc::new(store), config.pipeline_settings(&options))?;
    match pipeline.run_once().await {
        Ok(summary) => Ok(summary),
        Err(abort) => Ok(abort.summary),
    }
}

pub async fn seed_arcs_from_file(config: &SyncConfig, path: &Path) -> Result<usize> {
    let seed = load_arc_seed(path)?;
    let store = connect_store(config).await?;
    let written = store.seed_arcs(&seed.arcs).await?;
    info!(written, path = %path.display(), "seeded arcs");
    Ok(written)
}
