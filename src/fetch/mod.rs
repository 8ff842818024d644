//! Fetcher seam: the engine talks to page fetchers through a trait.
//!
//! Headless-browser implementations (crawlee, playwright) live outside the
//! crate; a plain-HTTP implementation ships here for local runs and tests.

mod http;

pub use http::{HttpFetcher, HttpFetcherConfig};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Result;

/// Fetcher implementations, in escalation order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FetchMode {
    /// Managed crawler, the default entry mode
    Crawlee,
    /// Full headless browser
    Playwright,
    /// Plain HTTP client
    Http,
}

impl FetchMode {
    /// Next mode on the fallback ladder, if any.
    pub fn next_fallback(self) -> Option<Self> {
        match self {
            Self::Crawlee => Some(Self::Playwright),
            Self::Playwright => Some(Self::Http),
            Self::Http => None,
        }
    }
}

impl std::fmt::Display for FetchMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Crawlee => "crawlee",
            Self::Playwright => "playwright",
            Self::Http => "http",
        };
        write!(f, "{}", s)
    }
}

/// One fetch request.
#[derive(Debug, Clone)]
pub struct FetchRequest {
    pub url: String,
    pub host: String,
    /// Mode the scheduler wants this fetch performed in
    pub mode: FetchMode,
    /// Per-fetch deadline
    pub timeout_ms: u64,
}

/// A JSON response captured from the page's network activity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkResponse {
    pub url: String,
    pub status: u16,
    pub body: Value,
}

/// A block extracted from a PDF attachment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PdfBlock {
    /// A table of rows
    Table { page: u32, rows: Vec<Vec<String>> },
    /// Loose key-value pairs
    KeyValue { page: u32, pairs: Vec<(String, String)> },
}

/// Transport-level facts about one fetch.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FetchTelemetry {
    pub status: u16,
    /// Media type with any charset parameter stripped
    #[serde(default)]
    pub content_type: Option<String>,
    pub bytes: u64,
    pub elapsed_ms: u64,
}

/// Everything a fetcher hands to the candidate pipeline for one URL.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PageData {
    pub url: String,
    pub final_url: String,
    pub status: u16,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub html: Option<String>,
    #[serde(default)]
    pub ldjson_blocks: Vec<Value>,
    #[serde(default)]
    pub embedded_state: Vec<Value>,
    #[serde(default)]
    pub network_responses: Vec<NetworkResponse>,
    #[serde(default)]
    pub pdf_blocks: Vec<PdfBlock>,
    /// Set when the fetcher declined the URL because robots.txt disallows it
    #[serde(default)]
    pub blocked_by_robots: bool,
    #[serde(default)]
    pub fetch_telemetry: FetchTelemetry,
}

/// Page fetcher. `start`/`stop` bracket a drain; `fetch` performs one
/// request under the request's deadline.
#[async_trait]
pub trait Fetcher: Send + Sync {
    /// Bring the fetcher up. Idempotent.
    async fn start(&self) -> Result<()> {
        Ok(())
    }

    /// Tear the fetcher down. Idempotent.
    async fn stop(&self) -> Result<()> {
        Ok(())
    }

    /// Fetch one page.
    async fn fetch(&self, request: FetchRequest) -> Result<PageData>;
}

/// Strip any parameters from a content-type header value.
pub fn strip_content_type_params(raw: &str) -> String {
    raw.split(';').next().unwrap_or(raw).trim().to_ascii_lowercase()
}
