//! SQLite-backed frontier store.

use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::debug;

use crate::config::FrontierConfig;
use crate::error::{Error, Result};
use crate::planner::{normalize_url, parent_path};

use super::schema::{initialize_schema, is_initialized};

/// Cooldown reason for gone URLs.
pub const REASON_404_GONE: &str = "404_gone";
/// Cooldown reason for 403 backoff.
pub const REASON_403_BACKOFF: &str = "403_forbidden_backoff";
/// Skip reason for cooling-down URLs.
pub const SKIP_COOLDOWN: &str = "cooldown";
/// Skip reason for dead parent paths.
pub const SKIP_PATH_DEAD: &str = "path_dead_pattern";

/// Gone URLs cool down for a week.
const GONE_COOLDOWN_DAYS: i64 = 7;
/// 403 backoff never exceeds a day.
const MAX_403_BACKOFF_SECONDS: i64 = 24 * 3600;

/// An active cooldown.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cooldown {
    pub until: DateTime<Utc>,
    pub reason: String,
}

/// Durable per-URL state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrontierRow {
    pub url: String,
    pub last_status: Option<u16>,
    pub fetch_count: u32,
    pub bytes: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cooldown: Option<Cooldown>,
    pub path_dead_score: f64,
    pub fields_yielded: Vec<String>,
}

/// Outcome of a skip check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkipCheck {
    pub skip: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl SkipCheck {
    fn no() -> Self {
        Self {
            skip: false,
            reason: None,
        }
    }

    fn yes(reason: &str) -> Self {
        Self {
            skip: true,
            reason: Some(reason.to_string()),
        }
    }
}

/// A fetch observation to record.
#[derive(Debug, Clone, Default)]
pub struct RecordFetch {
    pub product_id: String,
    pub url: String,
    pub status: u16,
    pub content_type: Option<String>,
    pub bytes: u64,
    pub elapsed_ms: u64,
    pub fields_found: Vec<String>,
}

/// Normalized query hash, `sha256:`-prefixed.
pub fn query_hash(query: &str) -> String {
    let normalized = query
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase();
    let mut hasher = Sha256::new();
    hasher.update(normalized.as_bytes());
    format!("sha256:{:x}", hasher.finalize())
}

/// Durable per-URL/per-query memory preventing re-exploration of known-dead
/// or cooling-down locations. Owned by one product run at a time.
pub struct FrontierStore {
    conn: Arc<Mutex<Connection>>,
    config: FrontierConfig,
}

impl FrontierStore {
    /// Open or create a frontier store at the given path.
    pub fn open(path: impl AsRef<Path>, config: FrontierConfig) -> Result<Self> {
        let conn = Connection::open(path).map_err(|e| Error::store(e))?;
        if !is_initialized(&conn) {
            initialize_schema(&conn).map_err(|e| Error::store(e))?;
        }
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            config,
        })
    }

    /// In-memory store for tests.
    pub fn in_memory(config: FrontierConfig) -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(|e| Error::store(e))?;
        initialize_schema(&conn).map_err(|e| Error::store(e))?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            config,
        })
    }

    fn with_conn<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> rusqlite::Result<T>,
    {
        let conn = self
            .conn
            .lock()
            .map_err(|e| Error::Internal(format!("failed to lock connection: {e}")))?;
        f(&conn).map_err(|e| Error::store(e))
    }

    /// Record a retrieval query run. Returns the normalized query hash.
    pub fn record_query(&self, product_id: &str, query: &str, provider: &str) -> Result<String> {
        self.record_query_at(product_id, query, provider, Utc::now())
    }

    fn record_query_at(
        &self,
        product_id: &str,
        query: &str,
        provider: &str,
        now: DateTime<Utc>,
    ) -> Result<String> {
        let hash = query_hash(query);
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO frontier_queries (product_id, query_hash, provider, last_run_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT (product_id, query_hash, provider)
                 DO UPDATE SET last_run_at = ?4",
                params![product_id, hash, provider, now.to_rfc3339()],
            )?;
            Ok(())
        })?;
        Ok(hash)
    }

    /// Whether an identical normalized query ran inside the cooldown window.
    pub fn should_skip_query(
        &self,
        product_id: &str,
        query: &str,
        provider: &str,
        force: bool,
    ) -> Result<bool> {
        self.should_skip_query_at(product_id, query, provider, force, Utc::now())
    }

    fn should_skip_query_at(
        &self,
        product_id: &str,
        query: &str,
        provider: &str,
        force: bool,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        if force {
            return Ok(false);
        }
        let hash = query_hash(query);
        let last_run: Option<String> = self.with_conn(|conn| {
            conn.query_row(
                "SELECT last_run_at FROM frontier_queries
                 WHERE product_id = ?1 AND query_hash = ?2 AND provider = ?3",
                params![product_id, hash, provider],
                |row| row.get(0),
            )
            .optional()
        })?;
        let Some(last_run) = last_run else {
            return Ok(false);
        };
        let Ok(last_run) = DateTime::parse_from_rfc3339(&last_run) else {
            return Ok(false);
        };
        let age = now.signed_duration_since(last_run.with_timezone(&Utc));
        Ok(age < Duration::seconds(self.config.query_cooldown_seconds))
    }

    /// Record a fetch outcome and apply cooldown/path-dead side effects.
    pub fn record_fetch(&self, record: RecordFetch) -> Result<FrontierRow> {
        self.record_fetch_at(record, Utc::now())
    }

    fn record_fetch_at(&self, record: RecordFetch, now: DateTime<Utc>) -> Result<FrontierRow> {
        let Some(normalized) = normalize_url(&record.url) else {
            return Err(Error::Internal(format!("unparseable url: {}", record.url)));
        };

        let existing = self.read_row(&normalized.url)?;
        let mut fields: Vec<String> = existing
            .as_ref()
            .map(|r| r.fields_yielded.clone())
            .unwrap_or_default();
        for field in &record.fields_found {
            if !fields.contains(field) {
                fields.push(field.clone());
            }
        }

        let mut consecutive_403: u32 = if record.status == 403 {
            let prior: u32 = self.with_conn(|conn| {
                conn.query_row(
                    "SELECT consecutive_403 FROM frontier_urls WHERE url = ?1",
                    params![normalized.url],
                    |row| row.get(0),
                )
                .optional()
                .map(|v| v.unwrap_or(0))
            })?;
            prior + 1
        } else {
            0
        };

        // Cooldown side effects, monotonic per reason.
        let new_cooldown = match record.status {
            404 | 410 => Some(Cooldown {
                until: now + Duration::days(GONE_COOLDOWN_DAYS),
                reason: REASON_404_GONE.to_string(),
            }),
            403 => {
                let backoff = self
                    .config
                    .cooldown_403_base_seconds
                    .saturating_mul(1i64 << consecutive_403.min(20))
                    .min(MAX_403_BACKOFF_SECONDS);
                Some(Cooldown {
                    until: now + Duration::seconds(backoff),
                    reason: REASON_403_BACKOFF.to_string(),
                })
            }
            _ => None,
        };
        let cooldown = match (new_cooldown, existing.as_ref().and_then(|r| r.cooldown.clone())) {
            (Some(new), Some(old)) if old.reason == new.reason && old.until > new.until => {
                Some(old)
            }
            (Some(new), _) => Some(new),
            (None, old) => old,
        };

        // Path-dead bookkeeping.
        let parent = parent_path(&normalized.path);
        let mut path_dead_score = 0.0f64;
        if record.status == 404 {
            let streak: u32 = self.with_conn(|conn| {
                conn.query_row(
                    "SELECT notfound_streak FROM frontier_paths
                     WHERE host = ?1 AND parent_path = ?2",
                    params![normalized.host, parent],
                    |row| row.get(0),
                )
                .optional()
                .map(|v| v.unwrap_or(0))
            })? + 1;
            let dead = streak >= self.config.path_penalty_notfound_threshold;
            self.with_conn(|conn| {
                conn.execute(
                    "INSERT INTO frontier_paths (host, parent_path, notfound_streak, dead, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5)
                     ON CONFLICT (host, parent_path)
                     DO UPDATE SET notfound_streak = ?3, dead = ?4, updated_at = ?5",
                    params![normalized.host, parent, streak, dead as i32, now.to_rfc3339()],
                )?;
                Ok(())
            })?;
            path_dead_score = f64::from(streak)
                / f64::from(self.config.path_penalty_notfound_threshold.max(1));
            if dead {
                debug!(host = %normalized.host, parent = %parent, "parent path marked dead");
            }
        } else if (200..400).contains(&record.status) {
            consecutive_403 = 0;
            self.with_conn(|conn| {
                conn.execute(
                    "UPDATE frontier_paths SET notfound_streak = 0, dead = 0, updated_at = ?3
                     WHERE host = ?1 AND parent_path = ?2",
                    params![normalized.host, parent, now.to_rfc3339()],
                )?;
                Ok(())
            })?;
        }

        let fields_json = serde_json::to_string(&fields)?;
        let fetch_count = existing.as_ref().map_or(0, |r| r.fetch_count) + 1;
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO frontier_urls (
                    url, last_status, fetch_count, bytes, cooldown_until, cooldown_reason,
                    consecutive_403, path_dead_score, fields_yielded, updated_at
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
                 ON CONFLICT (url) DO UPDATE SET
                    last_status = ?2, fetch_count = ?3, bytes = ?4, cooldown_until = ?5,
                    cooldown_reason = ?6, consecutive_403 = ?7, path_dead_score = ?8,
                    fields_yielded = ?9, updated_at = ?10",
                params![
                    normalized.url,
                    record.status,
                    fetch_count,
                    record.bytes,
                    cooldown.as_ref().map(|c| c.until.to_rfc3339()),
                    cooldown.as_ref().map(|c| c.reason.clone()),
                    consecutive_403,
                    path_dead_score,
                    fields_json,
                    now.to_rfc3339(),
                ],
            )?;
            Ok(())
        })?;

        Ok(FrontierRow {
            url: normalized.url,
            last_status: Some(record.status),
            fetch_count,
            bytes: record.bytes,
            cooldown,
            path_dead_score,
            fields_yielded: fields,
        })
    }

    fn read_row(&self, url: &str) -> Result<Option<FrontierRow>> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT url, last_status, fetch_count, bytes, cooldown_until, cooldown_reason,
                        path_dead_score, fields_yielded
                 FROM frontier_urls WHERE url = ?1",
                params![url],
                |row| {
                    let cooldown_until: Option<String> = row.get(4)?;
                    let cooldown_reason: Option<String> = row.get(5)?;
                    let cooldown = match (cooldown_until, cooldown_reason) {
                        (Some(until), Some(reason)) => DateTime::parse_from_rfc3339(&until)
                            .ok()
                            .map(|until| Cooldown {
                                until: until.with_timezone(&Utc),
                                reason,
                            }),
                        _ => None,
                    };
                    let fields: Vec<String> =
                        serde_json::from_str::<Vec<String>>(&row.get::<_, String>(7)?)
                            .unwrap_or_default();
                    Ok(FrontierRow {
                        url: row.get(0)?,
                        last_status: row.get::<_, Option<u16>>(1)?,
                        fetch_count: row.get(2)?,
                        bytes: row.get(3)?,
                        cooldown,
                        path_dead_score: row.get(6)?,
                        fields_yielded: fields,
                    })
                },
            )
            .optional()
        })
    }

    /// Check a URL against cooldowns and dead parent paths.
    pub fn should_skip_url(&self, url: &str) -> Result<SkipCheck> {
        self.should_skip_url_at(url, Utc::now())
    }

    fn should_skip_url_at(&self, url: &str, now: DateTime<Utc>) -> Result<SkipCheck> {
        let Some(normalized) = normalize_url(url) else {
            return Ok(SkipCheck::no());
        };

        if let Some(row) = self.read_row(&normalized.url)? {
            if let Some(cooldown) = row.cooldown {
                if cooldown.until > now {
                    return Ok(SkipCheck::yes(SKIP_COOLDOWN));
                }
            }
        }

        let parent = parent_path(&normalized.path);
        let dead: Option<i32> = self.with_conn(|conn| {
            conn.query_row(
                "SELECT dead FROM frontier_paths WHERE host = ?1 AND parent_path = ?2",
                params![normalized.host, parent],
                |row| row.get(0),
            )
            .optional()
        })?;
        if dead == Some(1) {
            return Ok(SkipCheck::yes(SKIP_PATH_DEAD));
        }

        Ok(SkipCheck::no())
    }

    /// Credit a URL for a field value it contributed.
    pub fn record_yield(
        &self,
        url: &str,
        field_key: &str,
        value_hash: &str,
        confidence: f64,
    ) -> Result<()> {
        let normalized_url = normalize_url(url).map(|n| n.url).unwrap_or_else(|| url.to_string());
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO frontier_yield (url, field_key, value_hash, confidence, recorded_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT (url, field_key, value_hash)
                 DO UPDATE SET confidence = ?4, recorded_at = ?5",
                params![
                    normalized_url,
                    field_key,
                    value_hash,
                    confidence,
                    Utc::now().to_rfc3339()
                ],
            )?;
            Ok(())
        })
    }

    /// URLs that previously yielded a field, best confidence first.
    pub fn urls_for_field(&self, field_key: &str, limit: usize) -> Result<Vec<String>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT url FROM frontier_yield WHERE field_key = ?1
                 ORDER BY confidence DESC LIMIT ?2",
            )?;
            let rows = stmt.query_map(params![field_key, limit as i64], |row| row.get(0))?;
            rows.collect()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> FrontierStore {
        FrontierStore::in_memory(FrontierConfig::default()).unwrap()
    }

    fn fetch(url: &str, status: u16) -> RecordFetch {
        RecordFetch {
            product_id: "p1".into(),
            url: url.into(),
            status,
            bytes: 1000,
            ..RecordFetch::default()
        }
    }

    #[test]
    fn test_query_cooldown() {
        let s = store();
        s.record_query("p1", "logitech superlight 2 weight", "searx")
            .unwrap();
        assert!(s
            .should_skip_query("p1", "Logitech  Superlight 2 WEIGHT", "searx", false)
            .unwrap());
        assert!(!s
            .should_skip_query("p1", "logitech superlight 2 weight", "searx", true)
            .unwrap());
        assert!(!s
            .should_skip_query("p1", "different query", "searx", false)
            .unwrap());
        // Same query, other product: not skipped.
        assert!(!s
            .should_skip_query("p2", "logitech superlight 2 weight", "searx", false)
            .unwrap());
    }

    #[test]
    fn test_query_cooldown_expires() {
        let s = store();
        let past = Utc::now() - Duration::seconds(FrontierConfig::default().query_cooldown_seconds + 60);
        s.record_query_at("p1", "old query", "searx", past).unwrap();
        assert!(!s.should_skip_query("p1", "old query", "searx", false).unwrap());
    }

    #[test]
    fn test_gone_url_cools_down_for_a_week() {
        let s = store();
        let row = s.record_fetch(fetch("https://a.com/gone", 404)).unwrap();
        let cooldown = row.cooldown.unwrap();
        assert_eq!(cooldown.reason, REASON_404_GONE);
        assert!(cooldown.until > Utc::now() + Duration::days(6));

        let check = s.should_skip_url("https://a.com/gone").unwrap();
        assert!(check.skip);
        assert_eq!(check.reason.as_deref(), Some(SKIP_COOLDOWN));
    }

    #[test]
    fn test_403_backoff_doubles() {
        let s = store();
        let base = FrontierConfig::default().cooldown_403_base_seconds;

        let first = s.record_fetch(fetch("https://a.com/walled", 403)).unwrap();
        let first_until = first.cooldown.as_ref().unwrap().until;
        assert_eq!(first.cooldown.unwrap().reason, REASON_403_BACKOFF);
        let first_len = (first_until - Utc::now()).num_seconds();
        assert!((first_len - base * 2).abs() <= 2, "len {first_len}");

        let second = s.record_fetch(fetch("https://a.com/walled", 403)).unwrap();
        let second_len = (second.cooldown.unwrap().until - Utc::now()).num_seconds();
        assert!((second_len - base * 4).abs() <= 2, "len {second_len}");
    }

    #[test]
    fn test_403_backoff_caps_at_24h() {
        let s = store();
        for _ in 0..12 {
            s.record_fetch(fetch("https://a.com/walled", 403)).unwrap();
        }
        let row = s.record_fetch(fetch("https://a.com/walled", 403)).unwrap();
        let len = (row.cooldown.unwrap().until - Utc::now()).num_seconds();
        assert!(len <= 24 * 3600 + 2, "len {len}");
    }

    #[test]
    fn test_cooldown_monotonic_within_reason() {
        let s = store();
        // Build a long 403 cooldown.
        for _ in 0..6 {
            s.record_fetch(fetch("https://a.com/walled", 403)).unwrap();
        }
        let long = s.record_fetch(fetch("https://a.com/walled", 403)).unwrap();
        let long_until = long.cooldown.unwrap().until;

        // A success resets the streak; a later single 403 must not shorten
        // the standing cooldown.
        s.record_fetch(fetch("https://a.com/walled", 200)).unwrap();
        let renewed = s.record_fetch(fetch("https://a.com/walled", 403)).unwrap();
        assert!(renewed.cooldown.unwrap().until >= long_until);
    }

    #[test]
    fn test_path_dead_after_threshold() {
        let s = store();
        s.record_fetch(fetch("https://a.com/reviews/one", 404)).unwrap();
        s.record_fetch(fetch("https://a.com/reviews/two", 404)).unwrap();
        let not_dead = s.should_skip_url("https://a.com/reviews/three").unwrap();
        assert!(!not_dead.skip);

        s.record_fetch(fetch("https://a.com/reviews/three", 404)).unwrap();
        let check = s.should_skip_url("https://a.com/reviews/sibling").unwrap();
        assert!(check.skip);
        assert_eq!(check.reason.as_deref(), Some(SKIP_PATH_DEAD));

        // Other paths on the host are unaffected.
        assert!(!s.should_skip_url("https://a.com/products/x").unwrap().skip);
    }

    #[test]
    fn test_success_resets_path_streak() {
        let s = store();
        s.record_fetch(fetch("https://a.com/reviews/one", 404)).unwrap();
        s.record_fetch(fetch("https://a.com/reviews/two", 404)).unwrap();
        s.record_fetch(fetch("https://a.com/reviews/live", 200)).unwrap();
        s.record_fetch(fetch("https://a.com/reviews/three", 404)).unwrap();
        assert!(!s.should_skip_url("https://a.com/reviews/four").unwrap().skip);
    }

    #[test]
    fn test_fetch_count_and_fields_accumulate() {
        let s = store();
        let mut record = fetch("https://a.com/p", 200);
        record.fields_found = vec!["weight".into()];
        s.record_fetch(record).unwrap();

        let mut record = fetch("https://a.com/p", 200);
        record.fields_found = vec!["weight".into(), "dpi".into()];
        let row = s.record_fetch(record).unwrap();
        assert_eq!(row.fetch_count, 2);
        assert_eq!(row.fields_yielded, vec!["weight", "dpi"]);
    }

    #[test]
    fn test_record_yield_and_lookup() {
        let s = store();
        s.record_yield("https://a.com/p", "weight", "sha256:aa", 0.9).unwrap();
        s.record_yield("https://b.com/q", "weight", "sha256:bb", 0.5).unwrap();
        let urls = s.urls_for_field("weight", 10).unwrap();
        assert_eq!(urls[0], "https://a.com/p");
        assert_eq!(urls.len(), 2);
    }

    #[test]
    fn test_query_hash_is_prefixed_and_stable() {
        let a = query_hash("Logitech  G Pro weight");
        let b = query_hash("logitech g pro WEIGHT");
        assert!(a.starts_with("sha256:"));
        assert_eq!(a, b);
    }
}
