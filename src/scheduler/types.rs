//! Fetch results and outcome classification.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::fetch::{FetchMode, PageData};
use crate::planner::PlannedSource;

/// Classification of a failed fetch, driving the fallback ladder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FetchOutcome {
    /// Bot wall or legal block; escalate mode immediately
    Blocked,
    /// Throttled; retry with backoff, then escalate
    RateLimited,
    /// Gone; abort, no fallback
    NotFound,
    /// Transport failure; retry, then escalate
    FetchError,
    /// Body arrived but could not be understood
    ParseError,
}

/// True for the statuses that mark a URL permanently dead.
pub fn is_dead_status(status: u16) -> bool {
    matches!(status, 404 | 410 | 451)
}

/// Classify a non-2xx status into a fallback outcome. `None` means the
/// status needs no recovery (2xx/3xx).
pub fn classify_status(status: u16) -> Option<FetchOutcome> {
    match status {
        200..=399 => None,
        401 | 403 | 451 => Some(FetchOutcome::Blocked),
        429 => Some(FetchOutcome::RateLimited),
        404 | 410 => Some(FetchOutcome::NotFound),
        _ => Some(FetchOutcome::FetchError),
    }
}

/// Default error classifier: pattern-match the message the way operators
/// read logs.
pub fn classify_error(error: &Error) -> FetchOutcome {
    match error {
        Error::FetchTimeout { .. } => FetchOutcome::FetchError,
        other => {
            let message = other.to_string().to_ascii_lowercase();
            if message.contains("403") || message.contains("forbidden") || message.contains("blocked")
            {
                FetchOutcome::Blocked
            } else if message.contains("429") || message.contains("rate") {
                FetchOutcome::RateLimited
            } else if message.contains("404") || message.contains("not found") {
                FetchOutcome::NotFound
            } else if message.contains("parse") {
                FetchOutcome::ParseError
            } else {
                FetchOutcome::FetchError
            }
        }
    }
}

/// The per-URL record a drain yields, whatever happened.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FetchResult {
    pub url: String,
    pub final_url: String,
    pub status: u16,
    /// Media type without charset
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    pub bytes: u64,
    pub elapsed_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub ok: bool,
    pub dead: bool,
    pub redirect: bool,
    pub blocked_by_robots: bool,
    pub fetched_at: DateTime<Utc>,
    pub fetcher_kind: FetchMode,
    /// The mode the scheduler started in, when a fallback was taken
    #[serde(skip_serializing_if = "Option::is_none")]
    pub degraded_from_mode: Option<FetchMode>,
}

impl FetchResult {
    /// Build a result from fetched page data.
    pub fn from_page(
        page: &PageData,
        fetcher_kind: FetchMode,
        degraded_from_mode: Option<FetchMode>,
    ) -> Self {
        let dead = is_dead_status(page.status);
        Self {
            url: page.url.clone(),
            final_url: page.final_url.clone(),
            status: page.status,
            content_type: page.fetch_telemetry.content_type.clone(),
            bytes: page.fetch_telemetry.bytes,
            elapsed_ms: page.fetch_telemetry.elapsed_ms,
            error: None,
            ok: (200..400).contains(&page.status),
            dead,
            redirect: page.final_url != page.url,
            blocked_by_robots: page.blocked_by_robots,
            fetched_at: Utc::now(),
            fetcher_kind,
            degraded_from_mode,
        }
    }

    /// Build a result from a fetch error.
    pub fn from_error(
        url: &str,
        error: &Error,
        fetcher_kind: FetchMode,
        degraded_from_mode: Option<FetchMode>,
    ) -> Self {
        Self {
            url: url.to_string(),
            final_url: url.to_string(),
            status: 0,
            content_type: None,
            bytes: 0,
            elapsed_ms: 0,
            error: Some(error.to_string()),
            ok: false,
            dead: false,
            redirect: false,
            blocked_by_robots: false,
            fetched_at: Utc::now(),
            fetcher_kind,
            degraded_from_mode,
        }
    }

    /// Whether the page is worth extracting candidates from.
    pub fn should_extract(&self) -> bool {
        self.ok && !self.dead && !self.blocked_by_robots
    }
}

/// One drained source with its terminal result and any page data.
#[derive(Debug, Clone)]
pub struct FetchYield {
    pub source: PlannedSource,
    pub result: FetchResult,
    pub page: Option<PageData>,
}

/// Drain counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DrainStats {
    /// Sources that reached a terminal result without error
    pub processed: usize,
    /// Sources whose every mode failed
    pub failed: usize,
    /// Sources skipped before fetching (frontier cooldowns, dead paths)
    pub skipped: usize,
}
