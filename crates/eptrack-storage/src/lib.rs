//! HTTP fetch utilities + Postgres persistence gateway for eptrack.

use std::collections::BTreeSet;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::NaiveDate;
use eptrack_core::{Episode, StoryArc};
use reqwest::header::ACCEPT;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Postgres, QueryBuilder, Row};
use thiserror::Error;
use tracing::{debug, info, info_span, warn, Instrument};

pub const CRATE_NAME: &str = "eptrack-storage";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub backoff: BackoffPolicy,
    /// Honour `HTTP_PROXY`/`HTTPS_PROXY`/`NO_PROXY` from the environment.
    pub env_proxy: bool,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: None,
            backoff: BackoffPolicy::default(),
            env_proxy: true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub final_url: String,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

/// Sequential GET client that retries transient failures with capped exponential backoff.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
    backoff: BackoffPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }
        if !config.env_proxy {
            builder = builder.no_proxy();
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            backoff: config.backoff,
        })
    }

    pub async fn fetch_bytes(&self, url: &str, accept: &str) -> Result<FetchedResponse, FetchError> {
        let span = info_span!("http_fetch", url);
        self.fetch_with_retries(url, accept).instrument(span).await
    }

    async fn fetch_with_retries(&self, url: &str, accept: &str) -> Result<FetchedResponse, FetchError> {
        let mut attempt = 0;
        loop {
            let resp_result = self.client.get(url).header(ACCEPT, accept).send().await;
            let can_retry = attempt < self.backoff.max_retries;

            match resp_result {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();

                    if status.is_success() {
                        let body = resp.bytes().await?.to_vec();
                        debug!(status = status.as_u16(), bytes = body.len(), "fetched");
                        return Ok(FetchedResponse {
                            final_url,
                            body,
                        });
                    }

                    if classify_status(status) == RetryDisposition::Retryable && can_retry {
                        let delay = self.backoff.delay_for_attempt(attempt);
                        warn!(status = status.as_u16(), attempt, ?delay, "retrying after http status");
                        tokio::time::sleep(delay).await;
                        attempt += 1;
                        continue;
                    }

                    return Err(FetchError::HttpStatus {
                        status: status.as_u16(),
                        url: final_url,
                    });
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable && can_retry {
                        let delay = self.backoff.delay_for_attempt(attempt);
                        warn!(error = %err, attempt, ?delay, "retrying after request error");
                        tokio::time::sleep(delay).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(FetchError::Request(err));
                }
            }
        }
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("connecting to database: {0}")]
    Connect(#[source] sqlx::Error),
    #[error("reading {what}: {source}")]
    Read {
        what: &'static str,
        #[source]
        source: sqlx::Error,
    },
    #[error("writing {what}: {source}")]
    Write {
        what: &'static str,
        #[source]
        source: sqlx::Error,
    },
    #[error("running migrations: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
}

impl StoreError {
    pub fn read(what: &'static str) -> impl FnOnce(sqlx::Error) -> Self {
        move |source| Self::Read { what, source }
    }

    pub fn write(what: &'static str) -> impl FnOnce(sqlx::Error) -> Self {
        move |source| Self::Write { what, source }
    }
}

/// Per-record outcome of one batch insert. Ids already present are rejected, never overwritten.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BatchInsert {
    pub inserted: Vec<i32>,
    pub rejected: Vec<i32>,
}

impl BatchInsert {
    /// Splits a submitted batch by the ids the store reported back as written.
    pub fn from_returned_ids(batch: &[Episode], returned: impl IntoIterator<Item = i32>) -> Self {
        let written: BTreeSet<i32> = returned.into_iter().collect();
        let (inserted, rejected) = batch
            .iter()
            .map(|episode| episode.id)
            .partition(|id| written.contains(id));
        Self { inserted, rejected }
    }
}

/// Read/write contract the sync pipeline relies on.
#[async_trait]
pub trait EpisodeStore: Send + Sync {
    async fn existing_ids(&self) -> Result<BTreeSet<i32>, StoreError>;

    async fn load_arcs(&self) -> Result<Vec<StoryArc>, StoreError>;

    async fn insert_batch(&self, episodes: &[Episode]) -> Result<BatchInsert, StoreError>;
}

/// Arc reference row as maintained by an administrator; keyed by name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArcSeed {
    pub name: String,
    pub start_episode: i32,
    pub end_episode: i32,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ArcCoverage {
    pub id: i32,
    pub name: String,
    pub start_episode: i32,
    pub end_episode: i32,
    pub episode_count: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct RecentEpisode {
    pub id: i32,
    pub title: String,
    pub airdate: Option<NaiveDate>,
    pub arc_name: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StoreStatus {
    pub episode_count: i64,
    pub min_episode: Option<i32>,
    pub max_episode: Option<i32>,
    pub latest_airdate: Option<NaiveDate>,
    pub arcs: Vec<ArcCoverage>,
    pub recent: Vec<RecentEpisode>,
}

#[derive(Debug, Clone)]
pub struct PgEpisodeStore {
    pool: PgPool,
}

impl PgEpisodeStore {
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections.max(1))
            .acquire_timeout(Duration::from_secs(15))
            .connect(database_url)
            .await
            .map_err(StoreError::Connect)?;
        Ok(Self { pool })
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        info!("migrations applied");
        Ok(())
    }

    pub async fn ping(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(StoreError::read("health check"))?;
        Ok(())
    }

    /// Upserts arc reference rows by name inside one transaction.
    pub async fn seed_arcs(&self, arcs: &[ArcSeed]) -> Result<usize, StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(StoreError::write("arc seed transaction"))?;

        for arc in arcs {
            sqlx::query(
                r#"
                INSERT INTO arcs (name, start_episode, end_episode, description)
                VALUES ($1, $2, $3, $4)
                ON CONFLICT (name) DO UPDATE
                   SET start_episode = EXCLUDED.start_episode,
                       end_episode = EXCLUDED.end_episode,
                       description = EXCLUDED.description
                "#,
            )
            .bind(&arc.name)
            .bind(arc.start_episode)
            .bind(arc.end_episode)
            .bind(arc.description.as_deref())
            .execute(&mut *tx)
            .await
            .map_err(StoreError::write("arcs"))?;
        }

        tx.commit()
            .await
            .map_err(StoreError::write("arc seed transaction"))?;
        Ok(arcs.len())
    }

    pub async fn status(&self) -> Result<StoreStatus, StoreError> {
        let totals = sqlx::query(
            r#"
            SELECT COUNT(*) AS episode_count,
                   MIN(id) AS min_id,
                   MAX(id) AS max_id,
                   MAX(airdate) AS latest_airdate
              FROM episodes
            "#,
        )
        .fetch_one(&self.pool)
        .await
        .map_err(StoreError::read("episode totals"))?;

        let arc_rows = sqlx::query(
            r#"
            SELECT a.id, a.name, a.start_episode, a.end_episode, COUNT(e.id) AS episode_count
              FROM arcs a
              LEFT JOIN episodes e ON e.arc_id = a.id
             GROUP BY a.id, a.name, a.start_episode, a.end_episode
             ORDER BY a.start_episode, a.id
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(StoreError::read("arc coverage"))?;

        let recent_rows = sqlx::query(
            r#"
            SELECT id, title, airdate, arc_name
              FROM episodes_with_arcs
             ORDER BY id DESC
             LIMIT 5
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(StoreError::read("recent episodes"))?;

        let read = StoreError::read;
        let mut arcs = Vec::with_capacity(arc_rows.len());
        for row in arc_rows {
            arcs.push(ArcCoverage {
                id: row.try_get("id").map_err(read("arcs.id"))?,
                name: row.try_get("name").map_err(read("arcs.name"))?,
                start_episode: row.try_get("start_episode").map_err(read("arcs.start_episode"))?,
                end_episode: row.try_get("end_episode").map_err(read("arcs.end_episode"))?,
                episode_count: row.try_get("episode_count").map_err(read("arc episode_count"))?,
            });
        }

        let mut recent = Vec::with_capacity(recent_rows.len());
        for row in recent_rows {
            recent.push(RecentEpisode {
                id: row.try_get("id").map_err(read("episodes.id"))?,
                title: row.try_get("title").map_err(read("episodes.title"))?,
                airdate: row.try_get("airdate").map_err(read("episodes.airdate"))?,
                arc_name: row.try_get("arc_name").map_err(read("arc_name"))?,
            });
        }

        Ok(StoreStatus {
            episode_count: totals.try_get("episode_count").map_err(read("episode_count"))?,
            min_episode: totals.try_get("min_id").map_err(read("min_id"))?,
            max_episode: totals.try_get("max_id").map_err(read("max_id"))?,
            latest_airdate: totals.try_get("latest_airdate").map_err(read("latest_airdate"))?,
            arcs,
            recent,
        })
    }
}

#[async_trait]
impl EpisodeStore for PgEpisodeStore {
    async fn existing_ids(&self) -> Result<BTreeSet<i32>, StoreError> {
        let ids: Vec<i32> = sqlx::query_scalar("SELECT id FROM episodes")
            .fetch_all(&self.pool)
            .await
            .map_err(StoreError::read("existing episode ids"))?;
        Ok(ids.into_iter().collect())
    }

    async fn load_arcs(&self) -> Result<Vec<StoryArc>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, name, start_episode, end_episode, description
              FROM arcs
             ORDER BY start_episode, id
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(StoreError::read("arcs"))?;

        let read = StoreError::read;
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(StoryArc {
                id: row.try_get("id").map_err(read("arcs.id"))?,
                name: row.try_get("name").map_err(read("arcs.name"))?,
                start_episode: row.try_get("start_episode").map_err(read("arcs.start_episode"))?,
                end_episode: row.try_get("end_episode").map_err(read("arcs.end_episode"))?,
                description: row.try_get("description").map_err(read("arcs.description"))?,
            });
        }
        Ok(out)
    }

    async fn insert_batch(&self, episodes: &[Episode]) -> Result<BatchInsert, StoreError> {
        if episodes.is_empty() {
            return Ok(BatchInsert::default());
        }

        let mut builder: QueryBuilder<Postgres> =
            QueryBuilder::new("INSERT INTO episodes (id, title, airdate, arc_id) ");
        builder.push_values(episodes, |mut row, episode| {
            row.push_bind(episode.id)
                .push_bind(episode.title.clone())
                .push_bind(episode.air_date)
                .push_bind(episode.arc_id);
        });
        builder.push(" ON CONFLICT (id) DO NOTHING RETURNING id");

        let returned: Vec<i32> = builder
            .build_query_scalar::<i32>()
            .fetch_all(&self.pool)
            .await
            .map_err(StoreError::write("episodes"))?;

        Ok(BatchInsert::from_returned_ids(episodes, returned))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn episode(id: i32) -> Episode {
        Episode {
            id,
            title: format!("Episode {id}"),
            air_date: None,
            arc_id: 1,
        }
    }

    #[test]
    fn retry_delays_double_until_capped() {
        let policy = BackoffPolicy {
            max_retries: 4,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(1),
        };

        let delays: Vec<_> = (0..4).map(|i| policy.delay_for_attempt(i)).collect();
        assert_eq!(
            delays,
            vec![
                Duration::from_millis(250),
                Duration::from_millis(500),
                Duration::from_secs(1),
                Duration::from_secs(1),
            ]
        );
        assert_eq!(policy.delay_for_attempt(64), Duration::from_secs(1));
    }

    #[test]
    fn server_errors_and_rate_limits_are_retryable() {
        assert_eq!(
            classify_status(StatusCode::INTERNAL_SERVER_ERROR),
            RetryDisposition::Retryable
        );
        assert_eq!(
            classify_status(StatusCode::BAD_GATEWAY),
            RetryDisposition::Retryable
        );
        assert_eq!(
            classify_status(StatusCode::TOO_MANY_REQUESTS),
            RetryDisposition::Retryable
        );
        assert_eq!(
            classify_status(StatusCode::NOT_FOUND),
            RetryDisposition::NonRetryable
        );
        assert_eq!(
            classify_status(StatusCode::FORBIDDEN),
            RetryDisposition::NonRetryable
        );
    }

    #[test]
    fn unreturned_ids_are_rejected_not_overwritten() {
        let batch = vec![episode(4), episode(5), episode(6)];
        let outcome = BatchInsert::from_returned_ids(&batch, [6, 4]);
        assert_eq!(outcome.inserted, vec![4, 6]);
        assert_eq!(outcome.rejected, vec![5]);
    }

    #[test]
    fn store_error_reports_operation() {
        let err = StoreError::read("existing episode ids")(sqlx::Error::PoolTimedOut);
        assert!(err.to_string().starts_with("reading existing episode ids"));
        let err = StoreError::write("episodes")(sqlx::Error::PoolClosed);
        assert!(err.to_string().starts_with("writing episodes"));
    }

    #[test]
    fn http_fetcher_builds_with_user_agent() {
        let fetcher = HttpFetcher::new(HttpClientConfig {
            user_agent: Some("eptrack-test/0.1".into()),
            ..Default::default()
        });
        assert!(fetcher.is_ok());
    }

    mod canned_http {
        use std::collections::HashMap;
        use std::sync::atomic::{AtomicUsize, Ordering};
        use std::sync::{Arc, Mutex};

        use tokio::io::{AsyncReadExt, AsyncWriteExt};
        use tokio::net::TcpListener;

        /// Serves queued responses per request target; the last one for a target repeats.
        pub async fn serve(routes: Vec<(&'static str, Vec<(u16, &'static str)>)>) -> (String, Arc<AtomicUsize>) {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let base = format!("http://{}", listener.local_addr().unwrap());
            let hits = Arc::new(AtomicUsize::new(0));
            let routes: Arc<Mutex<HashMap<&'static str, Vec<(u16, &'static str)>>>> =
                Arc::new(Mutex::new(routes.into_iter().collect()));

            let counter = hits.clone();
            tokio::spawn(async move {
                while let Ok((mut socket, _)) = listener.accept().await {
                    let routes = routes.clone();
                    let counter = counter.clone();
                    tokio::spawn(async move {
                        let mut request = Vec::new();
                        let mut buf = [0u8; 1024];
                        while !request.windows(4).any(|w| w == b"\r\n\r\n") {
                            match socket.read(&mut buf).await {
                                Ok(0) | Err(_) => return,
                                Ok(n) => request.extend_from_slice(&buf[..n]),
                            }
                        }
                        counter.fetch_add(1, Ordering::SeqCst);

                        let head = String::from_utf8_lossy(&request);
                        let target = head.split_whitespace().nth(1).unwrap_or("/").to_string();
                        let (status, body) = {
                            let mut routes = routes.lock().unwrap();
                            match routes.get_mut(target.as_str()) {
                                Some(queue) if queue.len() > 1 => queue.remove(0),
                                Some(queue) => queue[0],
                                None => (404, ""),
                            }
                        };
                        let response = format!(
                            "HTTP/1.1 {status} Canned\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                            body.len()
                        );
                        let _ = socket.write_all(response.as_bytes()).await;
                        let _ = socket.shutdown().await;
                    });
                }
            });

            (base, hits)
        }
    }

    fn fast_fetcher(max_retries: usize) -> HttpFetcher {
        HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(5),
            backoff: BackoffPolicy {
                max_retries,
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(5),
            },
            env_proxy: false,
            ..Default::default()
        })
        .unwrap()
    }

    #[tokio::test]
    async fn unavailable_responses_are_retried_then_surface_the_status() {
        let (base, hits) = canned_http::serve(vec![("/episodes", vec![(503, "busy")])]).await;
        let fetcher = fast_fetcher(2);

        let err = fetcher
            .fetch_bytes(&format!("{base}/episodes"), "application/json")
            .await
            .unwrap_err();

        assert!(matches!(err, FetchError::HttpStatus { status: 503, .. }), "{err:?}");
        assert_eq!(hits.load(std::sync::atomic::Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn not_found_is_not_retried() {
        let (base, hits) = canned_http::serve(vec![]).await;
        let fetcher = fast_fetcher(3);

        let err = fetcher
            .fetch_bytes(&format!("{base}/missing"), "application/json")
            .await
            .unwrap_err();

        assert!(matches!(err, FetchError::HttpStatus { status: 404, .. }), "{err:?}");
        assert_eq!(hits.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn transient_failure_recovers_on_retry() {
        let (base, hits) =
            canned_http::serve(vec![("/episodes", vec![(429, ""), (200, "[1,2]")])]).await;
        let fetcher = fast_fetcher(2);

        let response = fetcher
            .fetch_bytes(&format!("{base}/episodes"), "application/json")
            .await
            .unwrap();

        assert_eq!(response.body, b"[1,2]");
        assert!(response.final_url.ends_with("/episodes"));
        assert_eq!(hits.load(std::sync::atomic::Ordering::SeqCst), 2);
    }
}
