//! The per-source candidate pipeline.

use regex::Regex;
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use tracing::debug;

use crate::identity::{score_identity, IdentityLock};
use crate::rules::FieldRulesEngine;
use crate::scheduler::FetchYield;

use super::extract::{derive_source_identity, extract_surfaces};
use super::gate::apply_identity_gate;
use super::score::{confidence_from_score, match_field, plausibility, score_candidate};
use super::types::{Candidate, CandidateEvidence, DroppedCandidate, Snippet, SourceCandidates};

/// Stable source id from the fetched URL.
pub fn source_id_for(url: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(url.as_bytes());
    let digest = format!("{:x}", hasher.finalize());
    format!("src-{}", &digest[..12])
}

/// Apply a field's parse templates to a raw value; the first capturing
/// template wins, otherwise the raw value stands.
fn apply_parse_templates(templates: &[String], raw: &str) -> String {
    for template in templates {
        let Ok(re) = Regex::new(template) else {
            continue;
        };
        if let Some(caps) = re.captures(raw) {
            if let Some(captured) = caps.get(1) {
                return captured.as_str().to_string();
            }
        }
    }
    raw.to_string()
}

/// Turn one drained source into identity-gated, scored, deduped candidates.
///
/// Returns `None` when the fetch produced nothing extractable. Normalization
/// failures drop individual candidates, never the source.
pub fn build_source_candidates(
    engine: &FieldRulesEngine,
    lock: &IdentityLock,
    fetch_yield: &FetchYield,
) -> Option<SourceCandidates> {
    if !fetch_yield.result.should_extract() {
        return None;
    }
    let page = fetch_yield.page.as_ref()?;

    let extractions = extract_surfaces(page);
    let source_identity = derive_source_identity(page, &extractions);
    let identity = score_identity(lock, &source_identity);
    let source_id = source_id_for(&fetch_yield.source.url);

    let mut candidates = Vec::new();
    let mut dropped = Vec::new();
    let mut anchor_phrases = Vec::new();

    for extraction in &extractions {
        let Some((rule, field_match)) = match_field(engine.bundle(), &extraction.key) else {
            continue;
        };
        let field = rule.field_key.clone();
        anchor_phrases.push((field.clone(), extraction.key.clone()));

        let raw_value = match engine.bundle().parse_templates.get(&field) {
            Some(templates) => apply_parse_templates(templates, &extraction.value),
            None => extraction.value.clone(),
        };

        let outcome = engine.normalize_candidate(&field, &raw_value);
        let Some(value) = outcome.normalized else {
            if let Some(reason) = outcome.failure_code {
                debug!(%field, raw = %raw_value, ?reason, "candidate dropped at normalization");
                dropped.push(DroppedCandidate {
                    field,
                    raw_value,
                    reason,
                });
            }
            continue;
        };

        let plaus = plausibility(rule, engine.known_values(&field), &value);
        let score = score_candidate(extraction.surface.method(), field_match, plaus);
        let confidence = confidence_from_score(score);

        let snippet = Snippet::new(&format!("{} {}", extraction.key, extraction.value));
        let quote = extraction.value.clone();
        let quote_start = snippet.text.find(&quote).unwrap_or(0);
        let evidence = CandidateEvidence {
            snippet_id: snippet.id,
            snippet_hash: snippet.hash,
            quote_span: (quote_start, quote_start + quote.len()),
            quote,
        };

        candidates.push(Candidate {
            field: rule.field_key.clone(),
            value,
            method: extraction.surface.method(),
            source_id: source_id.clone(),
            url: fetch_yield.source.url.clone(),
            host: fetch_yield.source.host.clone(),
            tier: fetch_yield.source.tier,
            key_path: extraction.surface.key_path(),
            confidence,
            original_confidence: None,
            evidence,
            target_match_passed: false,
            target_match_score: 0.0,
            identity_reject_reason: None,
            score,
        });
    }

    apply_identity_gate(&mut candidates, &identity);

    // Dedup on (field, value, method, key_path), keeping the first (order is
    // extraction order, which is stable).
    let mut seen = HashSet::new();
    candidates.retain(|c| seen.insert(c.dedup_key()));

    Some(SourceCandidates {
        source_id,
        url: fetch_yield.source.url.clone(),
        identity,
        candidates,
        dropped,
        anchor_phrases,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetch::{FetchMode, FetchTelemetry, PageData};
    use crate::planner::{normalize_url, PlannedSource, SourceRole, Tier};
    use crate::rules::{FieldRule, RuleBundle, ValueType};
    use crate::scheduler::FetchResult;
    use serde_json::json;

    fn engine() -> FieldRulesEngine {
        let mut bundle = RuleBundle::empty()
            .with_rule(
                FieldRule::new("weight", ValueType::Number)
                    .with_unit("g")
                    .with_range(10.0, 500.0),
            )
            .with_rule(
                FieldRule::new("polling_rate", ValueType::Number)
                    .with_unit("hz")
                    .with_range(125.0, 8000.0),
            )
            .with_rule(FieldRule::new("dpi", ValueType::Number).with_range(100.0, 100_000.0));
        bundle
            .parse_templates
            .insert("weight".into(), vec![r"([\d.]+)\s*g".into()]);
        FieldRulesEngine::from_bundle("gaming-mice", bundle).unwrap()
    }

    fn lock() -> IdentityLock {
        IdentityLock::new("Logitech", "G Pro X Superlight 2", "")
    }

    fn yield_for(html: &str, title: &str) -> FetchYield {
        let n = normalize_url("https://rtings.com/review").unwrap();
        let page = PageData {
            url: n.url.clone(),
            final_url: n.url.clone(),
            status: 200,
            title: Some(title.to_string()),
            html: Some(html.to_string()),
            fetch_telemetry: FetchTelemetry {
                status: 200,
                content_type: Some("text/html".into()),
                bytes: html.len() as u64,
                elapsed_ms: 10,
            },
            ..PageData::default()
        };
        FetchYield {
            source: PlannedSource {
                url: n.url,
                host: n.host,
                root_domain: n.root_domain,
                tier: Tier::LabReview,
                role: SourceRole::Seed,
                planner_score: 0.0,
                field_reward: 0.0,
                insertion_index: 0,
                candidate_source: false,
            },
            result: FetchResult::from_page(&page, FetchMode::Http, None),
            page: Some(page),
        }
    }

    const SPEC_TABLE: &str = r#"<table>
        <tr><th>Weight</th><td>60 g (without cable)</td></tr>
        <tr><th>Polling Rate</th><td>4000 Hz</td></tr>
        <tr><th>DPI</th><td>32000</td></tr>
        <tr><th>Warranty</th><td>2 years</td></tr>
    </table>"#;

    #[test]
    fn test_happy_path_candidates() {
        let out = build_source_candidates(
            &engine(),
            &lock(),
            &yield_for(SPEC_TABLE, "Logitech G Pro X Superlight 2 review"),
        )
        .unwrap();

        assert!(out.identity.matched);
        assert_eq!(out.candidates.len(), 3);
        let by_field = |f: &str| out.candidates.iter().find(|c| c.field == f).unwrap();
        assert_eq!(by_field("weight").value, json!(60));
        assert_eq!(by_field("polling_rate").value, json!(4000));
        assert_eq!(by_field("dpi").value, json!(32000));
        assert!(out.candidates.iter().all(|c| c.target_match_passed));
        assert!(out.candidates.iter().all(|c| c.confidence > 0.5));
    }

    #[test]
    fn test_parse_template_cleans_value() {
        let out = build_source_candidates(
            &engine(),
            &lock(),
            &yield_for(SPEC_TABLE, "Logitech G Pro X Superlight 2 review"),
        )
        .unwrap();
        let weight = out.candidates.iter().find(|c| c.field == "weight").unwrap();
        // "60 g (without cable)" parses through the template, not as a raw
        // number with a junk suffix.
        assert_eq!(weight.value, json!(60));
        assert_eq!(weight.evidence.quote, "60 g (without cable)");
    }

    #[test]
    fn test_normalization_failure_drops_candidate_not_source() {
        let html = r#"<table>
            <tr><th>Weight</th><td>approximately light</td></tr>
            <tr><th>DPI</th><td>32000</td></tr>
        </table>"#;
        let out = build_source_candidates(
            &engine(),
            &lock(),
            &yield_for(html, "Logitech G Pro X Superlight 2 review"),
        )
        .unwrap();
        assert_eq!(out.candidates.len(), 1);
        assert_eq!(out.dropped.len(), 1);
        assert_eq!(out.dropped[0].field, "weight");
    }

    #[test]
    fn test_mismatched_source_downgraded_not_dropped() {
        let out = build_source_candidates(
            &engine(),
            &lock(),
            &yield_for(SPEC_TABLE, "Razer Basilisk Ultimate review"),
        )
        .unwrap();
        assert!(!out.identity.matched);
        assert!(!out.candidates.is_empty());
        for candidate in &out.candidates {
            assert!(!candidate.target_match_passed);
            assert!(candidate.confidence <= out.identity.score);
            assert!(candidate.original_confidence.is_some());
        }
    }

    #[test]
    fn test_dead_result_yields_nothing() {
        let mut fetch_yield = yield_for(SPEC_TABLE, "whatever");
        fetch_yield.result.dead = true;
        fetch_yield.result.ok = false;
        assert!(build_source_candidates(&engine(), &lock(), &fetch_yield).is_none());
    }

    #[test]
    fn test_quote_span_points_into_snippet() {
        let out = build_source_candidates(
            &engine(),
            &lock(),
            &yield_for(SPEC_TABLE, "Logitech G Pro X Superlight 2 review"),
        )
        .unwrap();
        let c = &out.candidates[0];
        let (start, end) = c.evidence.quote_span;
        let snippet = Snippet::new("Weight 60 g (without cable)");
        assert_eq!(&snippet.text[start..end], c.evidence.quote);
    }
}
