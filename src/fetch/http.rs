//! Plain-HTTP fetcher backed by reqwest.

use reqwest::Client;
use scraper::{Html, Selector};
use serde_json::Value;
use std::time::{Duration, Instant};
use tracing::debug;

use crate::error::{Error, Result};

use super::{
    strip_content_type_params, FetchRequest, FetchTelemetry, Fetcher, PageData,
};

/// Configuration for the HTTP fetcher.
#[derive(Debug, Clone)]
pub struct HttpFetcherConfig {
    /// User-agent header
    pub user_agent: String,
    /// Client-wide timeout; per-request deadlines still apply on top
    pub timeout_secs: u64,
}

impl Default for HttpFetcherConfig {
    fn default() -> Self {
        Self {
            user_agent: "harvest-core/0.1 (spec harvester)".to_string(),
            timeout_secs: 60,
        }
    }
}

/// Plain HTTP GET fetcher. No JS execution; HTML, JSON-LD, and embedded
/// state blobs are still surfaced.
pub struct HttpFetcher {
    http: Client,
}

impl HttpFetcher {
    /// Build the fetcher.
    pub fn new(config: HttpFetcherConfig) -> Result<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .user_agent(&config.user_agent)
            .build()
            .map_err(|e| Error::Internal(format!("failed to build http client: {e}")))?;
        Ok(Self { http })
    }
}

#[async_trait::async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(&self, request: FetchRequest) -> Result<PageData> {
        let started = Instant::now();
        let deadline = Duration::from_millis(request.timeout_ms);

        let response = tokio::time::timeout(deadline, self.http.get(&request.url).send())
            .await
            .map_err(|_| Error::FetchTimeout {
                url: request.url.clone(),
                timeout_ms: request.timeout_ms,
            })?
            .map_err(|e| Error::fetch(&request.url, e.to_string()))?;

        let status = response.status().as_u16();
        let final_url = response.url().to_string();
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(strip_content_type_params);

        let body = tokio::time::timeout(deadline.saturating_sub(started.elapsed()), response.text())
            .await
            .map_err(|_| Error::FetchTimeout {
                url: request.url.clone(),
                timeout_ms: request.timeout_ms,
            })?
            .map_err(|e| Error::fetch(&request.url, e.to_string()))?;

        let elapsed_ms = started.elapsed().as_millis() as u64;
        let bytes = body.len() as u64;
        debug!(url = %request.url, status, bytes, elapsed_ms, "http fetch complete");

        let is_html = content_type
            .as_deref()
            .map_or(true, |ct| ct.contains("html"));

        let (title, ldjson_blocks, embedded_state) = if is_html {
            parse_html_surfaces(&body)
        } else {
            (None, Vec::new(), Vec::new())
        };

        Ok(PageData {
            url: request.url,
            final_url,
            status,
            title,
            html: is_html.then_some(body),
            ldjson_blocks,
            embedded_state,
            network_responses: Vec::new(),
            pdf_blocks: Vec::new(),
            blocked_by_robots: false,
            fetch_telemetry: FetchTelemetry {
                status,
                content_type,
                bytes,
                elapsed_ms,
            },
        })
    }
}

/// Pull title, JSON-LD blocks, and embedded-state blobs out of an HTML body.
///
/// Synchronous on purpose: the parsed document must not live across an await.
fn parse_html_surfaces(html: &str) -> (Option<String>, Vec<Value>, Vec<Value>) {
    let document = Html::parse_document(html);

    let title = Selector::parse("title").ok().and_then(|sel| {
        document
            .select(&sel)
            .next()
            .map(|el| el.text().collect::<String>().trim().to_string())
            .filter(|t| !t.is_empty())
    });

    let mut ldjson = Vec::new();
    if let Ok(sel) = Selector::parse(r#"script[type="application/ld+json"]"#) {
        for el in document.select(&sel) {
            let raw = el.text().collect::<String>();
            if let Ok(value) = serde_json::from_str::<Value>(&raw) {
                ldjson.push(value);
            }
        }
    }

    let mut embedded = Vec::new();
    if let Ok(sel) = Selector::parse(r#"script[id="__NEXT_DATA__"]"#) {
        for el in document.select(&sel) {
            let raw = el.text().collect::<String>();
            if let Ok(value) = serde_json::from_str::<Value>(&raw) {
                embedded.push(value);
            }
        }
    }
    if let Ok(sel) = Selector::parse("script") {
        for el in document.select(&sel) {
            let raw = el.text().collect::<String>();
            if let Some(idx) = raw.find("window.__INITIAL_STATE__") {
                if let Some(start) = raw[idx..].find('{') {
                    let blob = raw[idx + start..].trim_end().trim_end_matches(';');
                    if let Ok(value) = serde_json::from_str::<Value>(blob) {
                        embedded.push(value);
                    }
                }
            }
        }
    }

    (title, ldjson, embedded)
}
