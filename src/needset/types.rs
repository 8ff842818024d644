//! NeedSet rows, round snapshots, progress, and stop reasons.

use serde::{Deserialize, Serialize};

use crate::config::RunMode;
use crate::rules::RequiredLevel;

/// One under-supported field after a round.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NeedSetRow {
    pub field_key: String,
    pub required_level: RequiredLevel,
    pub need_score: f64,
    pub effective_confidence: f64,
    pub min_refs_required: u32,
    pub refs_selected: u32,
    pub min_refs_satisfied: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub distinct_sources_required: Option<u32>,
    pub distinct_sources_selected: u32,
    pub retrieval_query: String,
    /// URLs known to have yielded this field before
    #[serde(default)]
    pub hits: Vec<String>,
    /// Top sources currently backing the field's value
    #[serde(default)]
    pub prime_sources: Vec<String>,
}

/// Per-round convergence facts, compared across rounds for progress.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RoundSnapshot {
    pub round_index: u32,
    /// Required-level fields still missing or below target
    pub missing_required: Vec<String>,
    /// Critical-level fields still missing or below target
    pub missing_critical: Vec<String>,
    pub contradiction_count: u32,
    /// Mean effective confidence over schema fields with values
    pub mean_confidence: f64,
    pub validated: bool,
    pub needset_size: usize,
}

/// Why a round counted as progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressReason {
    FirstRound,
    MissingRequiredReduced,
    CriticalReduced,
    ContradictionsReduced,
    ConfidenceUp,
    Validated,
}

/// Round-over-round progress verdict.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Progress {
    pub improved: bool,
    pub reasons: Vec<ProgressReason>,
}

/// Why the orchestration loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// All needs met, no contradictions
    #[serde(rename = "complete")]
    Completed,
    BudgetExhausted,
    MaxRoundsReached,
    NoProgressStreak,
    LowQualityRounds,
}

/// Context assembled at the top of each round.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RoundContext {
    pub round_index: u32,
    #[serde(default)]
    pub mode: RunMode,
    /// Fields whose current values must be re-verified this round
    #[serde(default)]
    pub force_verify: Vec<String>,
    #[serde(default)]
    pub missing_required: Vec<String>,
    /// Extra queries carried over from the caller
    #[serde(default)]
    pub extra_queries: Vec<String>,
    /// Fields escalated after repeated misses
    #[serde(default)]
    pub escalated_fields: Vec<String>,
}
