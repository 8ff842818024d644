//! Candidate and provenance types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

use crate::planner::Tier;

/// How a candidate was extracted; drives the base score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtractionMethod {
    NetworkJson,
    Ldjson,
    HtmlTable,
    PdfTable,
    PdfKv,
    Dom,
    LlmExtract,
    HelperSupportive,
}

impl ExtractionMethod {
    /// Method priority: structured network data beats page text beats
    /// model output.
    pub fn base_priority(self) -> i32 {
        match self {
            Self::NetworkJson | Self::Ldjson => 5,
            Self::HtmlTable | Self::PdfTable => 4,
            Self::PdfKv => 3,
            Self::Dom => 2,
            Self::LlmExtract | Self::HelperSupportive => 1,
        }
    }
}

/// The surface family a raw extraction came from, with surface-specific
/// evidence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "surface", rename_all = "snake_case")]
pub enum Surface {
    HtmlTable { table_id: u32, row_id: u32 },
    DefinitionList { row_id: u32 },
    JsonLd { path: String },
    EmbeddedState { path: String },
    NetworkJson { endpoint: String, path: String },
    PdfTable { page: u32 },
    PdfKeyValue { page: u32 },
    Llm { model: String },
    Helper { helper_id: String },
}

impl Surface {
    /// The method a surface folds into for scoring.
    pub fn method(&self) -> ExtractionMethod {
        match self {
            Self::HtmlTable { .. } | Self::DefinitionList { .. } => ExtractionMethod::HtmlTable,
            Self::JsonLd { .. } => ExtractionMethod::Ldjson,
            Self::EmbeddedState { .. } | Self::NetworkJson { .. } => ExtractionMethod::NetworkJson,
            Self::PdfTable { .. } => ExtractionMethod::PdfTable,
            Self::PdfKeyValue { .. } => ExtractionMethod::PdfKv,
            Self::Llm { .. } => ExtractionMethod::LlmExtract,
            Self::Helper { .. } => ExtractionMethod::HelperSupportive,
        }
    }

    /// Key path used for candidate identity and dedup.
    pub fn key_path(&self) -> String {
        match self {
            Self::HtmlTable { table_id, row_id } => format!("table[{table_id}].row[{row_id}]"),
            Self::DefinitionList { row_id } => format!("dl.row[{row_id}]"),
            Self::JsonLd { path } => format!("ldjson.{path}"),
            Self::EmbeddedState { path } => format!("state.{path}"),
            Self::NetworkJson { endpoint, path } => format!("net[{endpoint}].{path}"),
            Self::PdfTable { page } => format!("pdf[{page}].table"),
            Self::PdfKeyValue { page } => format!("pdf[{page}].kv"),
            Self::Llm { model } => format!("llm[{model}]"),
            Self::Helper { helper_id } => format!("helper[{helper_id}]"),
        }
    }
}

/// One raw `(key, value)` pulled off a surface before field mapping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawExtraction {
    /// Raw label as seen on the page
    pub key: String,
    /// Raw value text, units normalized in place
    pub value: String,
    pub surface: Surface,
    /// Section label inherited from rowspan/colspan headers, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub section: Option<String>,
}

/// A normalized text fragment with a stable ID and hash, used to verify that
/// a quoted span actually appears in the source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snippet {
    pub id: String,
    /// `sha256:`-prefixed hash of the normalized text
    pub hash: String,
    pub text: String,
}

impl Snippet {
    /// Build a snippet from raw text; whitespace is collapsed before
    /// hashing so render differences do not split snippets.
    pub fn new(raw: &str) -> Self {
        let text = raw.split_whitespace().collect::<Vec<_>>().join(" ");
        let mut hasher = Sha256::new();
        hasher.update(text.as_bytes());
        let digest = format!("{:x}", hasher.finalize());
        Self {
            id: format!("snip-{}", &digest[..12]),
            hash: format!("sha256:{digest}"),
            text,
        }
    }
}

/// Evidence carried by one candidate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateEvidence {
    pub snippet_id: String,
    pub snippet_hash: String,
    /// The quoted span
    pub quote: String,
    /// Byte offsets of the quote inside the snippet text
    pub quote_span: (usize, usize),
}

/// A single (field, value) extraction attempt.
///
/// `(field, value, method, key_path, source_id, snippet_id)` identifies a
/// candidate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    pub field: String,
    pub value: Value,
    pub method: ExtractionMethod,
    pub source_id: String,
    pub url: String,
    pub host: String,
    pub tier: Tier,
    pub key_path: String,
    pub confidence: f64,
    /// Confidence before the identity gate capped it
    #[serde(skip_serializing_if = "Option::is_none")]
    pub original_confidence: Option<f64>,
    pub evidence: CandidateEvidence,
    pub target_match_passed: bool,
    pub target_match_score: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub identity_reject_reason: Option<String>,
    /// Ranking points; never persisted to the published spec
    #[serde(default)]
    pub score: i32,
}

impl Candidate {
    /// Dedup key: `(field, value, method, key_path)`.
    pub fn dedup_key(&self) -> (String, String, ExtractionMethod, String) {
        (
            self.field.clone(),
            self.value.to_string(),
            self.method,
            self.key_path.clone(),
        )
    }
}

/// One evidence reference attached to provenance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvidenceRef {
    pub url: String,
    pub host: String,
    #[serde(rename = "rootDomain")]
    pub root_domain: String,
    pub tier: Tier,
    pub method: ExtractionMethod,
    pub quote: String,
    pub retrieved_at: DateTime<Utc>,
}

/// Durable per-field provenance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProvenanceEntry {
    pub value: Value,
    pub confidence: f64,
    pub evidence: Vec<EvidenceRef>,
    /// Sources agreeing with the value after normalization
    pub confirmations: u32,
    /// Agreeing sources that also passed the identity gate
    pub approved_confirmations: u32,
    pub pass_target: f64,
    pub meets_pass_target: bool,
    pub retrieved_at: DateTime<Utc>,
}

/// A source retained as counter-evidence after an identity reject.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RejectedSource {
    pub source_id: String,
    pub url: String,
    pub identity_score: f64,
    pub reason: String,
}

/// All provenance for one product.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProductProvenance {
    pub fields: BTreeMap<String, ProvenanceEntry>,
    #[serde(default)]
    pub rejected_sources: Vec<RejectedSource>,
}

impl ProductProvenance {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current field map, suitable for the runtime gate.
    pub fn field_values(&self) -> serde_json::Map<String, Value> {
        self.fields
            .iter()
            .map(|(k, entry)| (k.clone(), entry.value.clone()))
            .collect()
    }
}

/// A candidate that failed normalization, kept for the structured log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DroppedCandidate {
    pub field: String,
    pub raw_value: String,
    pub reason: crate::rules::NormalizeFailureCode,
}

/// Everything one source produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceCandidates {
    pub source_id: String,
    pub url: String,
    pub identity: crate::identity::IdentityMatch,
    pub candidates: Vec<Candidate>,
    #[serde(default)]
    pub dropped: Vec<DroppedCandidate>,
    /// `(field, raw page label)` pairs that matched, fed to anchor learning
    #[serde(default)]
    pub anchor_phrases: Vec<(String, String)>,
}
