//! SQLite-backed learning stores.
//!
//! Four durable per-category memories with age-based decay: the component
//! lexicon, field anchor phrases, URL memory, and domain field yield.
//! Shared across products in a batch; writers serialize on the connection
//! lock.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

use crate::config::LearningConfig;
use crate::error::{Error, Result};
use crate::pipeline::{ProductProvenance, SourceCandidates};
use crate::planner::root_domain_of;
use crate::rules::normalize_for_compare;

use super::schema::{initialize_schema, is_initialized};

/// Component-lexicon half-life in days.
const LEXICON_HALF_LIFE_DAYS: f64 = 90.0;
/// Component-lexicon expiry in days.
const LEXICON_EXPIRY_DAYS: f64 = 180.0;
/// Field-anchor half-life in days.
const ANCHOR_HALF_LIFE_DAYS: f64 = 60.0;
/// URL-memory half-life in days.
const URL_HALF_LIFE_DAYS: f64 = 120.0;

/// Age bucket for a learned entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecayStatus {
    Active,
    Decayed,
    Expired,
}

/// Classify an entry age against a half-life and optional expiry.
pub fn decay_status(
    last_seen: DateTime<Utc>,
    now: DateTime<Utc>,
    half_life_days: f64,
    expiry_days: Option<f64>,
) -> DecayStatus {
    let age_days = now.signed_duration_since(last_seen).num_seconds() as f64 / 86_400.0;
    if let Some(expiry) = expiry_days {
        if age_days >= expiry {
            return DecayStatus::Expired;
        }
    }
    if age_days >= half_life_days {
        DecayStatus::Decayed
    } else {
        DecayStatus::Active
    }
}

/// Yield statistics for one (domain, field).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DomainYield {
    pub domain: String,
    pub field: String,
    pub seen_count: u64,
    pub used_count: u64,
}

impl DomainYield {
    /// used/seen; zero seen yields zero.
    pub fn ratio(&self) -> f64 {
        if self.seen_count == 0 {
            0.0
        } else {
            self.used_count as f64 / self.seen_count as f64
        }
    }
}

/// Hints read back for the planner and the query generator.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LearningHints {
    pub anchors_by_field: HashMap<String, Vec<String>>,
    pub known_urls: HashMap<String, Vec<String>>,
    pub component_values: HashMap<String, Vec<String>>,
    pub domain_yields: Vec<DomainYield>,
    /// Domains worth boosting in the planner
    pub high_yield_domains: Vec<String>,
}

/// Durable cross-product learning memory for one category database.
pub struct LearningStore {
    conn: Arc<Mutex<Connection>>,
    config: LearningConfig,
}

impl LearningStore {
    /// Open or create a learning store at the given path.
    pub fn open(path: impl AsRef<Path>, config: LearningConfig) -> Result<Self> {
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
    pub fn in_memory(config: LearningConfig) -> Result<Self> {
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

    /// Record a component value accepted with evidence.
    pub fn record_component_value(
        &self,
        category: &str,
        field: &str,
        value: &str,
        confidence: f64,
    ) -> Result<()> {
        let normalized = normalize_for_compare(value);
        if normalized.is_empty() {
            return Ok(());
        }
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO component_lexicon
                    (category, field, normalized_value, seen_count, confidence, last_seen)
                 VALUES (?1, ?2, ?3, 1, ?4, ?5)
                 ON CONFLICT (category, field, normalized_value) DO UPDATE SET
                    seen_count = seen_count + 1,
                    confidence = MAX(confidence, ?4),
                    last_seen = ?5",
                params![category, field, normalized, confidence, Utc::now().to_rfc3339()],
            )?;
            Ok(())
        })
    }

    /// Record an anchor phrase observed next to an accepted value.
    pub fn record_anchor(&self, category: &str, field: &str, phrase: &str) -> Result<()> {
        let phrase = phrase.split_whitespace().collect::<Vec<_>>().join(" ");
        if phrase.is_empty() {
            return Ok(());
        }
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO field_anchors (category, field, phrase, seen_count, last_seen)
                 VALUES (?1, ?2, ?3, 1, ?4)
                 ON CONFLICT (category, field, phrase) DO UPDATE SET
                    seen_count = seen_count + 1, last_seen = ?4",
                params![category, field, phrase, Utc::now().to_rfc3339()],
            )?;
            Ok(())
        })
    }

    /// Record a URL that yielded an accepted value for a field.
    pub fn record_url(&self, category: &str, field: &str, url: &str, confidence: f64) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO url_memory (category, field, url, confidence, last_seen)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT (category, field, url) DO UPDATE SET
                    confidence = MAX(confidence, ?4), last_seen = ?5",
                params![category, field, url, confidence, Utc::now().to_rfc3339()],
            )?;
            Ok(())
        })
    }

    /// A domain served a page where the field could have appeared.
    pub fn record_seen(&self, category: &str, domain: &str, field: &str) -> Result<()> {
        self.bump_yield(category, domain, field, 1, 0)
    }

    /// A domain actually contributed the field's accepted value.
    pub fn record_used(&self, category: &str, domain: &str, field: &str) -> Result<()> {
        self.bump_yield(category, domain, field, 0, 1)
    }

    fn bump_yield(
        &self,
        category: &str,
        domain: &str,
        field: &str,
        seen: u32,
        used: u32,
    ) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO domain_field_yield
                    (category, domain, field, seen_count, used_count, last_seen)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT (category, domain, field) DO UPDATE SET
                    seen_count = seen_count + ?4,
                    used_count = used_count + ?5,
                    last_seen = ?6",
                params![category, domain, field, seen, used, Utc::now().to_rfc3339()],
            )?;
            Ok(())
        })
    }

    /// Domains with enough observations and a yield ratio at or below the
    /// configured ceiling.
    pub fn low_yield_domains(&self, category: &str) -> Result<Vec<DomainYield>> {
        let rows = self.all_yields(category)?;
        Ok(rows
            .into_iter()
            .filter(|y| y.seen_count >= self.config.min_seen && y.ratio() <= self.config.max_yield)
            .collect())
    }

    fn all_yields(&self, category: &str) -> Result<Vec<DomainYield>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT domain, field, seen_count, used_count
                 FROM domain_field_yield WHERE category = ?1",
            )?;
            let rows = stmt.query_map(params![category], |row| {
                Ok(DomainYield {
                    domain: row.get(0)?,
                    field: row.get(1)?,
                    seen_count: row.get(2)?,
                    used_count: row.get(3)?,
                })
            })?;
            rows.collect()
        })
    }

    /// Populate the stores from a finished product: only accepted values
    /// with evidence contribute.
    pub fn populate_from_product(
        &self,
        category: &str,
        provenance: &ProductProvenance,
        sources: &[SourceCandidates],
    ) -> Result<()> {
        for (field, entry) in &provenance.fields {
            if entry.evidence.is_empty() {
                continue;
            }
            if let serde_json::Value::String(s) = &entry.value {
                self.record_component_value(category, field, s, entry.confidence)?;
            }
            for evidence in &entry.evidence {
                self.record_url(category, field, &evidence.url, entry.confidence)?;
                self.record_used(category, &evidence.root_domain, field)?;
            }
        }

        for source in sources {
            let domain = root_domain_of(
                source
                    .url
                    .split("://")
                    .nth(1)
                    .unwrap_or(&source.url)
                    .split('/')
                    .next()
                    .unwrap_or(&source.url),
            );
            for (field, phrase) in &source.anchor_phrases {
                if provenance.fields.contains_key(field) {
                    self.record_anchor(category, field, phrase)?;
                }
                self.record_seen(category, &domain, field)?;
            }
        }
        Ok(())
    }

    /// Read hints for the given focus fields. Expired entries are dropped;
    /// decayed ones still surface.
    pub fn read_hints(&self, category: &str, focus_fields: &[String]) -> Result<LearningHints> {
        self.read_hints_at(category, focus_fields, Utc::now())
    }

    fn read_hints_at(
        &self,
        category: &str,
        focus_fields: &[String],
        now: DateTime<Utc>,
    ) -> Result<LearningHints> {
        let mut hints = LearningHints::default();

        for field in focus_fields {
            let anchors: Vec<(String, String)> = self.with_conn(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT phrase, last_seen FROM field_anchors
                     WHERE category = ?1 AND field = ?2
                     ORDER BY seen_count DESC LIMIT 10",
                )?;
                let rows = stmt
                    .query_map(params![category, field], |row| {
                        Ok((row.get(0)?, row.get(1)?))
                    })?;
                rows.collect()
            })?;
            let anchors: Vec<String> = anchors
                .into_iter()
                .filter(|(_, last_seen)| {
                    parse_ts(last_seen).map_or(true, |ts| {
                        decay_status(ts, now, ANCHOR_HALF_LIFE_DAYS, None) != DecayStatus::Expired
                    })
                })
                .map(|(phrase, _)| phrase)
                .collect();
            if !anchors.is_empty() {
                hints.anchors_by_field.insert(field.clone(), anchors);
            }

            let urls: Vec<(String, String)> = self.with_conn(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT url, last_seen FROM url_memory
                     WHERE category = ?1 AND field = ?2
                     ORDER BY confidence DESC LIMIT 10",
                )?;
                let rows = stmt
                    .query_map(params![category, field], |row| {
                        Ok((row.get(0)?, row.get(1)?))
                    })?;
                rows.collect()
            })?;
            let urls: Vec<String> = urls
                .into_iter()
                .filter(|(_, last_seen)| {
                    parse_ts(last_seen).map_or(true, |ts| {
                        decay_status(ts, now, URL_HALF_LIFE_DAYS, None) != DecayStatus::Expired
                    })
                })
                .map(|(url, _)| url)
                .collect();
            if !urls.is_empty() {
                hints.known_urls.insert(field.clone(), urls);
            }

            let values: Vec<(String, String)> = self.with_conn(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT normalized_value, last_seen FROM component_lexicon
                     WHERE category = ?1 AND field = ?2
                     ORDER BY seen_count DESC LIMIT 25",
                )?;
                let rows = stmt
                    .query_map(params![category, field], |row| {
                        Ok((row.get(0)?, row.get(1)?))
                    })?;
                rows.collect()
            })?;
            let values: Vec<String> = values
                .into_iter()
                .filter(|(_, last_seen)| {
                    parse_ts(last_seen).map_or(true, |ts| {
                        decay_status(
                            ts,
                            now,
                            LEXICON_HALF_LIFE_DAYS,
                            Some(LEXICON_EXPIRY_DAYS),
                        ) != DecayStatus::Expired
                    })
                })
                .map(|(value, _)| value)
                .collect();
            if !values.is_empty() {
                hints.component_values.insert(field.clone(), values);
            }
        }

        hints.domain_yields = self.all_yields(category)?;
        hints.high_yield_domains = hints
            .domain_yields
            .iter()
            .filter(|y| y.seen_count >= self.config.min_seen && y.ratio() >= 0.5)
            .map(|y| y.domain.clone())
            .collect();
        hints.high_yield_domains.sort();
        hints.high_yield_domains.dedup();

        Ok(hints)
    }
}

fn parse_ts(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|ts| ts.with_timezone(&Utc))
}
