//! The identity gate.
//!
//! A source that fails the gate is never dropped; its candidates are
//! downgraded so the run records the counter-evidence. Helper-supportive
//! candidates bypass the gate by policy but already carry the lowest method
//! priority.

use crate::identity::{IdentityMatch, IDENTITY_GATED_FIELDS};

use super::types::{Candidate, ExtractionMethod};

/// Stricter multiplier applied to identity-carrying fields from a
/// non-matching source.
const IDENTITY_FIELD_CAP_FACTOR: f64 = 0.5;

/// Apply the identity gate to a source's candidates in place.
pub fn apply_identity_gate(candidates: &mut [Candidate], identity: &IdentityMatch) {
    for candidate in candidates.iter_mut() {
        candidate.target_match_score = identity.score;

        if candidate.method == ExtractionMethod::HelperSupportive {
            // Helpers may fill fields even when identity is unlocked.
            candidate.target_match_passed = true;
            continue;
        }

        if identity.matched {
            candidate.target_match_passed = true;
            continue;
        }

        candidate.target_match_passed = false;
        candidate.original_confidence = Some(candidate.confidence);
        candidate.confidence = candidate.confidence.min(identity.score);
        if IDENTITY_GATED_FIELDS.contains(&candidate.field.as_str()) {
            candidate.confidence = candidate
                .confidence
                .min(identity.score * IDENTITY_FIELD_CAP_FACTOR);
        }
        candidate.identity_reject_reason = identity.reject_reason.clone();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::IdentityDecision;
    use crate::pipeline::types::CandidateEvidence;
    use crate::planner::Tier;
    use serde_json::json;

    fn candidate(field: &str, method: ExtractionMethod, confidence: f64) -> Candidate {
        Candidate {
            field: field.into(),
            value: json!(60),
            method,
            source_id: "src-1".into(),
            url: "https://a.com/p".into(),
            host: "a.com".into(),
            tier: Tier::Database,
            key_path: "table[0].row[0]".into(),
            confidence,
            original_confidence: None,
            evidence: CandidateEvidence {
                snippet_id: "snip-1".into(),
                snippet_hash: "sha256:00".into(),
                quote: "60 g".into(),
                quote_span: (0, 4),
            },
            target_match_passed: false,
            target_match_score: 0.0,
            identity_reject_reason: None,
            score: 8,
        }
    }

    fn rejected(score: f64) -> IdentityMatch {
        IdentityMatch {
            matched: false,
            score,
            decision: IdentityDecision::Reject,
            reject_reason: Some("different product".into()),
        }
    }

    fn accepted(score: f64) -> IdentityMatch {
        IdentityMatch {
            matched: true,
            score,
            decision: IdentityDecision::Accept,
            reject_reason: None,
        }
    }

    #[test]
    fn test_matching_source_passes_through() {
        let mut candidates = vec![candidate("weight", ExtractionMethod::HtmlTable, 0.8)];
        apply_identity_gate(&mut candidates, &accepted(0.92));
        assert!(candidates[0].target_match_passed);
        assert_eq!(candidates[0].confidence, 0.8);
        assert_eq!(candidates[0].target_match_score, 0.92);
        assert!(candidates[0].original_confidence.is_none());
    }

    #[test]
    fn test_rejected_source_capped_at_identity_score() {
        let mut candidates = vec![candidate("weight", ExtractionMethod::HtmlTable, 0.8)];
        apply_identity_gate(&mut candidates, &rejected(0.15));
        let c = &candidates[0];
        assert!(!c.target_match_passed);
        assert_eq!(c.confidence, 0.15);
        assert_eq!(c.original_confidence, Some(0.8));
        assert!(c.identity_reject_reason.is_some());
    }

    #[test]
    fn test_identity_fields_get_stricter_cap() {
        let mut candidates = vec![
            candidate("weight", ExtractionMethod::HtmlTable, 0.8),
            candidate("model", ExtractionMethod::HtmlTable, 0.8),
        ];
        apply_identity_gate(&mut candidates, &rejected(0.4));
        assert_eq!(candidates[0].confidence, 0.4);
        assert_eq!(candidates[1].confidence, 0.2);
    }

    #[test]
    fn test_helper_bypasses_gate() {
        let mut candidates = vec![candidate("weight", ExtractionMethod::HelperSupportive, 0.3)];
        apply_identity_gate(&mut candidates, &rejected(0.1));
        assert!(candidates[0].target_match_passed);
        assert_eq!(candidates[0].confidence, 0.3);
        assert!(candidates[0].original_confidence.is_none());
    }
}
