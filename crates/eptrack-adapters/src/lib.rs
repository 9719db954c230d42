//! Episode source contracts + API and listing-page scrape adapters.

use async_trait::async_trait;
use chrono::NaiveDate;
use eptrack_core::EpisodeDraft;
use eptrack_storage::{FetchError, HttpFetcher};
use reqwest::Url;
use scraper::{ElementRef, Html, Selector};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{info, warn};

pub const CRATE_NAME: &str = "eptrack-adapters";

pub const DEFAULT_API_BASE_URL: &str = "https://api.api-onepiece.com/v2";
pub const DEFAULT_SCRAPE_URL: &str = "https://www.animefillerlist.com/shows/one-piece";

/// Date formats seen in listing tables, tried in order.
const AIR_DATE_FORMATS: &[&str] = &[
    "%Y-%m-%d",
    "%m/%d/%Y",
    "%d/%m/%Y",
    "%B %d, %Y",
    "%b %d, %Y",
    "%Y.%m.%d",
];

const UNKNOWN_DATE_MARKERS: &[&str] = &["tba", "tbd", "unknown", "-"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SourceKind {
    Api,
    Scrape,
}

impl SourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::Api => "api",
            SourceKind::Scrape => "scrape",
        }
    }
}

impl std::fmt::Display for SourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceEndpoints {
    pub api_base_url: String,
    pub api_max_pages: usize,
    pub scrape_url: String,
}

impl Default for SourceEndpoints {
    fn default() -> Self {
        Self {
            api_base_url: DEFAULT_API_BASE_URL.to_string(),
            api_max_pages: 50,
            scrape_url: DEFAULT_SCRAPE_URL.to_string(),
        }
    }
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("fetching {url}: {source}")]
    Fetch {
        url: String,
        #[source]
        source: FetchError,
    },
    #[error("unrecognized response from {url}: {message}")]
    Parse { url: String, message: String },
}

#[async_trait]
pub trait EpisodeSource: Send + Sync {
    fn source_id(&self) -> &'static str;

    async fn fetch_all(&self) -> Result<Vec<EpisodeDraft>, AdapterError>;
}

pub fn source_for(
    kind: SourceKind,
    http: HttpFetcher,
    endpoints: &SourceEndpoints,
) -> Box<dyn EpisodeSource> {
    match kind {
        SourceKind::Api => Box::new(ApiEpisodeSource::new(
            http,
            endpoints.api_base_url.clone(),
            endpoints.api_max_pages,
        )),
        SourceKind::Scrape => Box::new(ScrapeEpisodeSource::new(http, endpoints.scrape_url.clone())),
    }
}

/// Parses a listing date cell; placeholders and unrecognized formats yield `None`.
pub fn parse_air_date(text: &str) -> Option<NaiveDate> {
    let text = text.trim();
    if text.is_empty() || UNKNOWN_DATE_MARKERS.contains(&text.to_ascii_lowercase().as_str()) {
        return None;
    }
    let parsed = AIR_DATE_FORMATS
        .iter()
        .find_map(|format| NaiveDate::parse_from_str(text, format).ok());
    if parsed.is_none() {
        warn!(air_date = text, "unparseable air date, storing as absent");
    }
    parsed
}

fn text_or_none(value: String) -> Option<String> {
    let trimmed = value.trim().to_string();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}

fn leading_episode_number(text: &str) -> Option<i32> {
    let digits: String = text
        .chars()
        .skip_while(|c| !c.is_ascii_digit())
        .take_while(|c| c.is_ascii_digit())
        .collect();
    digits.parse::<i32>().ok().filter(|n| *n > 0)
}

// ---------------------------------------------------------------------------
// API feed

#[derive(Debug, Clone)]
pub struct ApiEpisodeSource {
    http: HttpFetcher,
    base_url: String,
    max_pages: usize,
}

/// One decoded page of the API listing.
#[derive(Debug, Clone, PartialEq)]
pub struct ApiPage {
    pub drafts: Vec<EpisodeDraft>,
    pub skipped: usize,
    pub next: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ApiPayload {
    Bare(Vec<JsonValue>),
    Paged {
        #[serde(alias = "data")]
        results: Vec<JsonValue>,
        #[serde(default)]
        next: Option<String>,
    },
}

impl ApiEpisodeSource {
    pub fn new(http: HttpFetcher, base_url: impl Into<String>, max_pages: usize) -> Self {
        Self {
            http,
            base_url: base_url.into(),
            max_pages: max_pages.max(1),
        }
    }

    pub fn listing_url(&self) -> String {
        format!("{}/episodes/en", self.base_url.trim_end_matches('/'))
    }
}

#[async_trait]
impl EpisodeSource for ApiEpisodeSource {
    fn source_id(&self) -> &'static str {
        "onepiece-api"
    }

    async fn fetch_all(&self) -> Result<Vec<EpisodeDraft>, AdapterError> {
        let mut drafts = Vec::new();
        let mut skipped = 0usize;
        let mut pages = 0usize;
        let mut next_url = Some(self.listing_url());

        while let Some(url) = next_url.take() {
            if pages == self.max_pages {
                return Err(AdapterError::Parse {
                    url,
                    message: format!("pagination did not end within {} pages", self.max_pages),
                });
            }

            let response = self
                .http
                .fetch_bytes(&url, "application/json")
                .await
                .map_err(|source| AdapterError::Fetch {
                    url: url.clone(),
                    source,
                })?;
            let page = parse_api_page(&response.body).map_err(|message| AdapterError::Parse {
                url: url.clone(),
                message,
            })?;
            pages += 1;
            skipped += page.skipped;
            drafts.extend(page.drafts);

            next_url = match page.next {
                Some(next) => Some(resolve_next_url(&response.final_url, &next).map_err(|message| {
                    AdapterError::Parse {
                        url: url.clone(),
                        message,
                    }
                })?),
                None => None,
            };
        }

        info!(pages, episodes = drafts.len(), skipped, "fetched api listing");
        Ok(drafts)
    }
}

fn resolve_next_url(current: &str, next: &str) -> Result<String, String> {
    let base = Url::parse(current).map_err(|e| format!("invalid page url {current}: {e}"))?;
    base.join(next)
        .map(|u| u.to_string())
        .map_err(|e| format!("invalid next page link {next}: {e}"))
}

/// Decodes either a bare episode array (one complete page) or a `{results|data, next}` envelope.
pub fn parse_api_page(body: &[u8]) -> Result<ApiPage, String> {
    let payload: ApiPayload = serde_json::from_slice(body)
        .map_err(|e| format!("expected an episode array or paged envelope: {e}"))?;
    let (records, next) = match payload {
        ApiPayload::Bare(records) => (records, None),
        ApiPayload::Paged { results, next } => (results, next.and_then(text_or_none)),
    };

    let mut drafts = Vec::with_capacity(records.len());
    let mut skipped = 0usize;
    for record in &records {
        match api_record_to_draft(record) {
            Some(draft) => drafts.push(draft),
            None => {
                warn!(record = %record, "skipping api episode without usable number or title");
                skipped += 1;
            }
        }
    }
    Ok(ApiPage {
        drafts,
        skipped,
        next,
    })
}

fn json_str<'a>(value: &'a JsonValue, key: &str) -> Option<&'a str> {
    value.get(key)?.as_str()
}

fn api_record_to_draft(record: &JsonValue) -> Option<EpisodeDraft> {
    let number = record
        .get("id")
        .and_then(JsonValue::as_i64)
        .and_then(|id| i32::try_from(id).ok())
        .filter(|id| *id > 0)
        .or_else(|| match record.get("number")? {
            JsonValue::Number(n) => n.as_i64().and_then(|n| i32::try_from(n).ok()).filter(|n| *n > 0),
            JsonValue::String(s) => leading_episode_number(s),
            _ => None,
        })?;
    let title = json_str(record, "title").and_then(|t| text_or_none(t.to_string()))?;
    let air_date = json_str(record, "release_date").and_then(parse_air_date);
    Some(EpisodeDraft {
        number,
        title,
        air_date,
    })
}

// ---------------------------------------------------------------------------
// Listing page scrape

#[derive(Debug, Clone)]
pub struct ScrapeEpisodeSource {
    http: HttpFetcher,
    url: String,
}

impl ScrapeEpisodeSource {
    pub fn new(http: HttpFetcher, url: impl Into<String>) -> Self {
        Self {
            http,
            url: url.into(),
        }
    }
}

#[async_trait]
impl EpisodeSource for ScrapeEpisodeSource {
    fn source_id(&self) -> &'static str {
        "animefillerlist"
    }

    async fn fetch_all(&self) -> Result<Vec<EpisodeDraft>, AdapterError> {
        let response = self
            .http
            .fetch_bytes(&self.url, "text/html,application/xhtml+xml")
            .await
            .map_err(|source| AdapterError::Fetch {
                url: self.url.clone(),
                source,
            })?;
        let html = String::from_utf8_lossy(&response.body);
        let drafts = parse_episode_table(&html).map_err(|message| AdapterError::Parse {
            url: self.url.clone(),
            message,
        })?;
        info!(episodes = drafts.len(), "scraped episode listing");
        Ok(drafts)
    }
}

fn selector(css: &str) -> Result<Selector, String> {
    Selector::parse(css).map_err(|e| format!("invalid selector {css}: {e}"))
}

/// Direct `td` children of a row; cells of tables nested inside a cell are not included.
fn row_cells<'a>(row: &ElementRef<'a>) -> Vec<ElementRef<'a>> {
    row.children()
        .filter_map(ElementRef::wrap)
        .filter(|cell| cell.value().name() == "td")
        .collect()
}

fn cell_with_class<'a>(cells: &[ElementRef<'a>], class: &str) -> Option<ElementRef<'a>> {
    cells
        .iter()
        .find(|cell| cell.value().classes().any(|c| c == class))
        .copied()
}

/// Extracts episodes from the `table.EpisodeList` listing.
///
/// A missing table, or a table without data rows, means the page layout changed and is an
/// error. Individual rows that lack a number or title are skipped; bad dates become `None`.
pub fn parse_episode_table(html: &str) -> Result<Vec<EpisodeDraft>, String> {
    let document = Html::parse_document(html);
    let table_sel = selector("table.EpisodeList")?;
    let row_sel = selector("table.EpisodeList > tbody > tr, table.EpisodeList > tr")?;
    let title_link_sel = selector("a")?;

    let table = document
        .select(&table_sel)
        .next()
        .ok_or_else(|| "could not find EpisodeList table".to_string())?;

    let mut drafts = Vec::new();
    let mut data_rows = 0usize;
    for row in table.select(&row_sel) {
        let cells = row_cells(&row);
        if cells.is_empty() {
            continue;
        }
        data_rows += 1;

        let Some(number) = cell_with_class(&cells, "Number")
            .and_then(|cell| cell.text().collect::<String>().trim().parse::<i32>().ok())
            .filter(|n| *n > 0)
        else {
            warn!(row = data_rows, "skipping listing row without a numeric episode number");
            continue;
        };
        let title = cell_with_class(&cells, "Title").and_then(|cell| {
            cell.select(&title_link_sel)
                .next()
                .and_then(|link| text_or_none(link.text().collect()))
                .or_else(|| text_or_none(cell.text().collect()))
        });
        let Some(title) = title else {
            warn!(episode = number, "skipping listing row without a title");
            continue;
        };
        let air_date = cell_with_class(&cells, "Date")
            .and_then(|cell| parse_air_date(&cell.text().collect::<String>()));

        drafts.push(EpisodeDraft {
            number,
            title,
            air_date,
        });
    }

    if data_rows == 0 {
        return Err("EpisodeList table has no episode rows".to_string());
    }
    Ok(drafts)
}
