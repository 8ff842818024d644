//! NeedSet computation, round progress, and stop conditions.

use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use tracing::debug;

use crate::config::NeedSetConfig;
use crate::identity::IdentityLock;
use crate::pipeline::{ProductProvenance, ProvenanceEntry};
use crate::rules::{FieldRulesEngine, RequiredLevel};

use super::decay::decay_factor;
use super::query::build_retrieval_query;
use super::types::{NeedSetRow, Progress, ProgressReason, RoundSnapshot, StopReason};

/// Confidence deltas below this do not count as progress.
const CONFIDENCE_EPSILON: f64 = 0.01;

/// Effective confidence for a provenance entry: raw confidence times the
/// best (largest) evidence decay factor.
pub fn effective_confidence(
    entry: &ProvenanceEntry,
    now: DateTime<Utc>,
    config: &NeedSetConfig,
) -> f64 {
    let best_decay = entry
        .evidence
        .iter()
        .map(|e| decay_factor(Some(e.retrieved_at), now, config.decay_days, config.decay_floor))
        .fold(None::<f64>, |best, d| {
            Some(best.map_or(d, |b| b.max(d)))
        })
        .unwrap_or(1.0);
    entry.confidence * best_decay
}

/// Compute the NeedSet for the current provenance state, highest need first.
///
/// `known_urls` maps field keys to URLs that yielded them before (learning
/// hints); it only populates `hits`.
pub fn compute_need_set(
    engine: &FieldRulesEngine,
    lock: &IdentityLock,
    provenance: &ProductProvenance,
    known_urls: &HashMap<String, Vec<String>>,
    config: &NeedSetConfig,
    now: DateTime<Utc>,
) -> Vec<NeedSetRow> {
    let mut rows = Vec::new();

    for (field, rule) in &engine.bundle().field_rules {
        if !rule.required_level.needset_eligible() {
            continue;
        }
        let entry = provenance.fields.get(field);
        let pass_target = rule.pass_target();

        let eff = entry.map_or(0.0, |e| effective_confidence(e, now, config));
        let refs_selected = entry.map_or(0, |e| e.evidence.len() as u32);
        let min_refs_required = rule.evidence.min_evidence_refs;
        let distinct_required = rule.evidence.distinct_sources_required;
        let distinct_selected = entry.map_or(0, |e| {
            e.evidence
                .iter()
                .map(|ev| ev.root_domain.as_str())
                .collect::<HashSet<_>>()
                .len() as u32
        });

        let below_target = eff < pass_target;
        let refs_short = refs_selected < min_refs_required;
        let sources_short = distinct_required.map_or(false, |req| distinct_selected < req);
        if !(below_target || refs_short || sources_short) {
            continue;
        }

        let need_score = rule.required_level.weight()
            * (pass_target - eff).max(0.05)
            * rule.difficulty.effort_multiplier()
            * rule.availability.multiplier();

        rows.push(NeedSetRow {
            field_key: field.clone(),
            required_level: rule.required_level,
            need_score,
            effective_confidence: eff,
            min_refs_required,
            refs_selected,
            min_refs_satisfied: !refs_short,
            distinct_sources_required: distinct_required,
            distinct_sources_selected: distinct_selected,
            retrieval_query: build_retrieval_query(lock, rule),
            hits: known_urls.get(field).cloned().unwrap_or_default(),
            prime_sources: entry
                .map(|e| e.evidence.iter().take(3).map(|ev| ev.url.clone()).collect())
                .unwrap_or_default(),
        });
    }

    rows.sort_by(|a, b| {
        b.need_score
            .partial_cmp(&a.need_score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.field_key.cmp(&b.field_key))
    });
    debug!(rows = rows.len(), "needset computed");
    rows
}

/// Build the snapshot compared across rounds.
pub fn build_snapshot(
    engine: &FieldRulesEngine,
    provenance: &ProductProvenance,
    needset: &[NeedSetRow],
    contradiction_count: u32,
    round_index: u32,
    config: &NeedSetConfig,
    now: DateTime<Utc>,
) -> RoundSnapshot {
    let mut missing_required = Vec::new();
    let mut missing_critical = Vec::new();
    for row in needset {
        match row.required_level {
            RequiredLevel::Required => missing_required.push(row.field_key.clone()),
            RequiredLevel::Critical => missing_critical.push(row.field_key.clone()),
            _ => {}
        }
    }

    let schema_fields: Vec<&ProvenanceEntry> = engine
        .bundle()
        .field_rules
        .keys()
        .filter_map(|k| provenance.fields.get(k))
        .collect();
    let mean_confidence = if schema_fields.is_empty() {
        0.0
    } else {
        schema_fields
            .iter()
            .map(|e| effective_confidence(e, now, config))
            .sum::<f64>()
            / schema_fields.len() as f64
    };

    let validated =
        missing_required.is_empty() && missing_critical.is_empty() && contradiction_count == 0;

    RoundSnapshot {
        round_index,
        missing_required,
        missing_critical,
        contradiction_count,
        mean_confidence,
        validated,
        needset_size: needset.len(),
    }
}

/// Compare two round snapshots.
pub fn evaluate_round_progress(
    previous: Option<&RoundSnapshot>,
    current: &RoundSnapshot,
) -> Progress {
    let Some(previous) = previous else {
        return Progress {
            improved: true,
            reasons: vec![ProgressReason::FirstRound],
        };
    };

    let mut reasons = Vec::new();
    if current.missing_required.len() < previous.missing_required.len() {
        reasons.push(ProgressReason::MissingRequiredReduced);
    }
    if current.missing_critical.len() < previous.missing_critical.len() {
        reasons.push(ProgressReason::CriticalReduced);
    }
    if current.contradiction_count < previous.contradiction_count {
        reasons.push(ProgressReason::ContradictionsReduced);
    }
    if current.mean_confidence > previous.mean_confidence + CONFIDENCE_EPSILON {
        reasons.push(ProgressReason::ConfidenceUp);
    }
    if current.validated && !previous.validated {
        reasons.push(ProgressReason::Validated);
    }

    Progress {
        improved: !reasons.is_empty(),
        reasons,
    }
}

/// Inputs to the stop decision.
#[derive(Debug, Clone, Copy)]
pub struct StopInputs {
    pub round_index: u32,
    pub needset_empty: bool,
    pub contradiction_count: u32,
    pub budget_exhausted: bool,
    pub no_progress_streak: u32,
    pub low_quality_rounds: u32,
}

/// Evaluate stop conditions in order; first match wins.
pub fn decide_stop(inputs: &StopInputs, config: &NeedSetConfig) -> Option<StopReason> {
    if inputs.needset_empty && inputs.contradiction_count == 0 {
        return Some(StopReason::Completed);
    }
    if inputs.budget_exhausted && inputs.round_index > 0 {
        return Some(StopReason::BudgetExhausted);
    }
    if inputs.round_index >= config.rounds_limit {
        return Some(StopReason::MaxRoundsReached);
    }
    if inputs.no_progress_streak >= config.no_progress_limit {
        return Some(StopReason::NoProgressStreak);
    }
    if inputs.low_quality_rounds >= config.max_low_quality_rounds {
        return Some(StopReason::LowQualityRounds);
    }
    None
}
