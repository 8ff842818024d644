//! Merging scored candidates into per-field provenance.

use chrono::{DateTime, Utc};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashSet};
use tracing::debug;

use crate::identity::IdentityDecision;
use crate::planner::root_domain_of;
use crate::rules::FieldRulesEngine;

use super::types::{
    Candidate, EvidenceRef, ProductProvenance, ProvenanceEntry, RejectedSource, SourceCandidates,
};

/// `sha256:`-prefixed hash of a JSON value's canonical string form.
pub fn value_hash(value: &Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(value.to_string().as_bytes());
    format!("sha256:{:x}", hasher.finalize())
}

fn evidence_ref(candidate: &Candidate, retrieved_at: DateTime<Utc>) -> EvidenceRef {
    EvidenceRef {
        url: candidate.url.clone(),
        host: candidate.host.clone(),
        root_domain: root_domain_of(&candidate.host),
        tier: candidate.tier,
        method: candidate.method,
        quote: candidate.evidence.quote.clone(),
        retrieved_at,
    }
}

/// Merge one round's source candidates into the product provenance.
///
/// Per field, the highest-scoring candidate's value becomes the provisional
/// value; every candidate agreeing after normalization contributes an
/// evidence entry. Identity-rejected sources are recorded, never dropped.
pub fn merge_into_provenance(
    provenance: &mut ProductProvenance,
    engine: &FieldRulesEngine,
    sources: &[SourceCandidates],
    retrieved_at: DateTime<Utc>,
) {
    for source in sources {
        if source.identity.decision == IdentityDecision::Reject
            && !provenance
                .rejected_sources
                .iter()
                .any(|r| r.source_id == source.source_id)
        {
            provenance.rejected_sources.push(RejectedSource {
                source_id: source.source_id.clone(),
                url: source.url.clone(),
                identity_score: source.identity.score,
                reason: source
                    .identity
                    .reject_reason
                    .clone()
                    .unwrap_or_else(|| "identity mismatch".to_string()),
            });
        }
    }

    let mut by_field: BTreeMap<&str, Vec<&Candidate>> = BTreeMap::new();
    for source in sources {
        for candidate in &source.candidates {
            by_field.entry(candidate.field.as_str()).or_default().push(candidate);
        }
    }

    for (field, candidates) in by_field {
        let Some(best) = candidates
            .iter()
            .max_by(|a, b| {
                (a.confidence, a.score)
                    .partial_cmp(&(b.confidence, b.score))
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .copied()
        else {
            continue;
        };

        let agreeing: Vec<&Candidate> = candidates
            .iter()
            .filter(|c| c.value == best.value)
            .copied()
            .collect();
        let confirming_sources: HashSet<&str> =
            agreeing.iter().map(|c| c.source_id.as_str()).collect();
        let approved_sources: HashSet<&str> = agreeing
            .iter()
            .filter(|c| c.target_match_passed)
            .map(|c| c.source_id.as_str())
            .collect();

        let pass_target = engine
            .rule(field)
            .map_or(0.8, |rule| rule.pass_target());

        match provenance.fields.get_mut(field) {
            Some(entry) if entry.value == best.value => {
                for candidate in &agreeing {
                    let reference = evidence_ref(candidate, retrieved_at);
                    let duplicate = entry
                        .evidence
                        .iter()
                        .any(|e| e.url == reference.url && e.quote == reference.quote);
                    if !duplicate {
                        entry.evidence.push(reference);
                    }
                }
                entry.confirmations += confirming_sources.len() as u32;
                entry.approved_confirmations += approved_sources.len() as u32;
                if best.confidence > entry.confidence {
                    entry.confidence = best.confidence;
                }
                entry.retrieved_at = retrieved_at;
                entry.meets_pass_target = entry.confidence >= entry.pass_target;
            }
            Some(entry) if best.confidence > entry.confidence => {
                debug!(
                    field,
                    old = %entry.value,
                    new = %best.value,
                    "provenance value superseded"
                );
                *entry = ProvenanceEntry {
                    value: best.value.clone(),
                    confidence: best.confidence,
                    evidence: agreeing
                        .iter()
                        .map(|c| evidence_ref(c, retrieved_at))
                        .collect(),
                    confirmations: confirming_sources.len() as u32,
                    approved_confirmations: approved_sources.len() as u32,
                    pass_target,
                    meets_pass_target: best.confidence >= pass_target,
                    retrieved_at,
                };
            }
            Some(_) => {
                // Existing value stands; the disagreement is visible through
                // the rejected-source record or a later constraint check.
            }
            None => {
                provenance.fields.insert(
                    field.to_string(),
                    ProvenanceEntry {
                        value: best.value.clone(),
                        confidence: best.confidence,
                        evidence: agreeing
                            .iter()
                            .map(|c| evidence_ref(c, retrieved_at))
                            .collect(),
                        confirmations: confirming_sources.len() as u32,
                        approved_confirmations: approved_sources.len() as u32,
                        pass_target,
                        meets_pass_target: best.confidence >= pass_target,
                        retrieved_at,
                    },
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::IdentityMatch;
    use crate::pipeline::types::{CandidateEvidence, ExtractionMethod};
    use crate::planner::Tier;
    use crate::rules::{FieldRule, RuleBundle, ValueType};
    use serde_json::json;

    fn engine() -> FieldRulesEngine {
        FieldRulesEngine::from_bundle(
            "gaming-mice",
            RuleBundle::empty().with_rule(FieldRule::new("weight", ValueType::Number)),
        )
        .unwrap()
    }

    fn candidate(source_id: &str, value: Value, confidence: f64, passed: bool) -> Candidate {
        Candidate {
            field: "weight".into(),
            value,
            method: ExtractionMethod::HtmlTable,
            source_id: source_id.into(),
            url: format!("https://{source_id}.com/p"),
            host: format!("{source_id}.com"),
            tier: Tier::Database,
            key_path: "table[0].row[0]".into(),
            confidence,
            original_confidence: None,
            evidence: CandidateEvidence {
                snippet_id: "snip".into(),
                snippet_hash: "sha256:00".into(),
                quote: "Weight 60 g".into(),
                quote_span: (7, 11),
            },
            target_match_passed: passed,
            target_match_score: if passed { 0.9 } else { 0.1 },
            identity_reject_reason: None,
            score: 8,
        }
    }

    fn source(source_id: &str, matched: bool, candidates: Vec<Candidate>) -> SourceCandidates {
        SourceCandidates {
            source_id: source_id.into(),
            url: format!("https://{source_id}.com/p"),
            identity: IdentityMatch {
                matched,
                score: if matched { 0.9 } else { 0.1 },
                decision: if matched {
                    IdentityDecision::Accept
                } else {
                    IdentityDecision::Reject
                },
                reject_reason: (!matched).then(|| "different product".to_string()),
            },
            candidates,
            dropped: Vec::new(),
            anchor_phrases: Vec::new(),
        }
    }

    #[test]
    fn test_best_value_wins_and_agreement_counts() {
        let mut provenance = ProductProvenance::new();
        let sources = vec![
            source("a", true, vec![candidate("a", json!(60), 0.9, true)]),
            source("b", true, vec![candidate("b", json!(60), 0.7, true)]),
            source("c", false, vec![candidate("c", json!(95), 0.1, false)]),
        ];
        merge_into_provenance(&mut provenance, &engine(), &sources, Utc::now());

        let entry = &provenance.fields["weight"];
        assert_eq!(entry.value, json!(60));
        assert_eq!(entry.confidence, 0.9);
        assert_eq!(entry.confirmations, 2);
        assert_eq!(entry.approved_confirmations, 2);
        assert_eq!(entry.evidence.len(), 2);

        // The rejected source is recorded as counter-evidence.
        assert_eq!(provenance.rejected_sources.len(), 1);
        assert_eq!(provenance.rejected_sources[0].source_id, "c");
    }

    #[test]
    fn test_agreeing_round_appends_evidence() {
        let mut provenance = ProductProvenance::new();
        let now = Utc::now();
        merge_into_provenance(
            &mut provenance,
            &engine(),
            &[source("a", true, vec![candidate("a", json!(60), 0.8, true)])],
            now,
        );
        merge_into_provenance(
            &mut provenance,
            &engine(),
            &[source("b", true, vec![candidate("b", json!(60), 0.7, true)])],
            now,
        );

        let entry = &provenance.fields["weight"];
        assert_eq!(entry.confidence, 0.8);
        assert_eq!(entry.confirmations, 2);
        assert_eq!(entry.evidence.len(), 2);
    }

    #[test]
    fn test_lower_confidence_does_not_supersede() {
        let mut provenance = ProductProvenance::new();
        let now = Utc::now();
        merge_into_provenance(
            &mut provenance,
            &engine(),
            &[source("a", true, vec![candidate("a", json!(60), 0.8, true)])],
            now,
        );
        merge_into_provenance(
            &mut provenance,
            &engine(),
            &[source("c", false, vec![candidate("c", json!(95), 0.1, false)])],
            now,
        );

        let entry = &provenance.fields["weight"];
        assert_eq!(entry.value, json!(60));
        assert_eq!(entry.confidence, 0.8);
    }

    #[test]
    fn test_higher_confidence_supersedes() {
        let mut provenance = ProductProvenance::new();
        let now = Utc::now();
        merge_into_provenance(
            &mut provenance,
            &engine(),
            &[source("a", true, vec![candidate("a", json!(59), 0.5, true)])],
            now,
        );
        merge_into_provenance(
            &mut provenance,
            &engine(),
            &[source("b", true, vec![candidate("b", json!(60), 0.9, true)])],
            now,
        );

        let entry = &provenance.fields["weight"];
        assert_eq!(entry.value, json!(60));
        assert_eq!(entry.confidence, 0.9);
        assert_eq!(entry.confirmations, 1);
    }

    #[test]
    fn test_value_hash_prefix() {
        assert!(value_hash(&json!(60)).starts_with("sha256:"));
        assert_eq!(value_hash(&json!(60)), value_hash(&json!(60)));
        assert_ne!(value_hash(&json!(60)), value_hash(&json!(61)));
    }
}
