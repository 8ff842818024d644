//! Candidate scoring: method base, field-match bonus, plausibility.

use serde_json::Value;

use crate::rules::{FieldRule, KnownValueSet, RuleBundle, SearchHints, Shape, ValueType};

use super::types::ExtractionMethod;

/// Plausibility is bounded to this many points either way.
pub const PLAUSIBILITY_BOUND: i32 = 6;
/// Score at which confidence saturates.
const SCORE_CEILING: f64 = 10.0;

/// How well the raw label matched the field key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldMatch {
    /// Label equals the field key after folding
    Exact,
    /// Label matched an anchor phrase or search hint
    Anchor,
}

impl FieldMatch {
    pub fn bonus(self) -> i32 {
        match self {
            Self::Exact => 2,
            Self::Anchor => 1,
        }
    }
}

/// Map a raw page label to a schema field.
///
/// Exact match on the folded field key wins; anchor phrases from search
/// hints are the fallback.
pub fn match_field<'a>(bundle: &'a RuleBundle, raw_key: &str) -> Option<(&'a FieldRule, FieldMatch)> {
    let folded = fold_key(raw_key);
    if let Some(rule) = bundle.field_rules.get(&folded) {
        return Some((rule, FieldMatch::Exact));
    }
    for rule in bundle.field_rules.values() {
        if anchors_match(&rule.search_hints, raw_key) {
            return Some((rule, FieldMatch::Anchor));
        }
    }
    None
}

/// Fold a page label into field-key form: lowercased, non-alphanumerics to
/// single underscores.
pub fn fold_key(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut last_underscore = true;
    for ch in raw.chars() {
        if ch.is_ascii_alphanumeric() {
            out.push(ch.to_ascii_lowercase());
            last_underscore = false;
        } else if !last_underscore {
            out.push('_');
            last_underscore = true;
        }
    }
    while out.ends_with('_') {
        out.pop();
    }
    out
}

fn anchors_match(hints: &SearchHints, raw_key: &str) -> bool {
    let folded = raw_key.split_whitespace().collect::<Vec<_>>().join(" ").to_lowercase();
    hints
        .anchor_phrases
        .iter()
        .any(|phrase| folded == phrase.to_lowercase())
}

/// Per-(field, value) plausibility in `[-PLAUSIBILITY_BOUND, +PLAUSIBILITY_BOUND]`.
pub fn plausibility(rule: &FieldRule, known: Option<&KnownValueSet>, value: &Value) -> i32 {
    let mut points = 0i32;

    match rule.contract.value_type {
        ValueType::Number => {
            let numbers: Vec<f64> = match value {
                Value::Array(items) => items.iter().filter_map(Value::as_f64).collect(),
                scalar => scalar.as_f64().into_iter().collect(),
            };
            for n in &numbers {
                if let Some(range) = &rule.contract.range {
                    if range.contains(*n) {
                        points += 2;
                    } else {
                        points -= 6;
                    }
                }
                if *n < 0.0 {
                    points -= 4;
                }
            }
            if numbers.is_empty() && rule.contract.shape == Shape::Scalar {
                points -= 2;
            }
        }
        ValueType::Enum => {
            if let (Some(set), Value::String(s)) = (known, value) {
                if set.contains(s) {
                    points += 2;
                } else {
                    points -= 1;
                }
            }
        }
        ValueType::String => {
            if let Value::String(s) = value {
                if s.len() > 120 {
                    points -= 2;
                }
            }
        }
        ValueType::Bool | ValueType::Date => {}
    }

    points.clamp(-PLAUSIBILITY_BOUND, PLAUSIBILITY_BOUND)
}

/// Total ranking score: `base(method) + field_match_bonus + plausibility`.
pub fn score_candidate(method: ExtractionMethod, field_match: FieldMatch, plausibility: i32) -> i32 {
    method.base_priority() + field_match.bonus() + plausibility
}

/// Collapse a ranking score into a confidence in (0, 1).
pub fn confidence_from_score(score: i32) -> f64 {
    (f64::from(score) / SCORE_CEILING).clamp(0.05, 0.98)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::{FieldRule, RuleBundle};
    use serde_json::json;

    fn bundle() -> RuleBundle {
        RuleBundle::empty()
            .with_rule(
                FieldRule::new("polling_rate", ValueType::Number)
                    .with_unit("hz")
                    .with_range(125.0, 8000.0)
                    .with_anchor("Report Rate"),
            )
            .with_rule(FieldRule::new("weight", ValueType::Number).with_unit("g"))
    }

    #[test]
    fn test_fold_key() {
        assert_eq!(fold_key("Polling Rate"), "polling_rate");
        assert_eq!(fold_key("  DPI (max) "), "dpi_max");
    }

    #[test]
    fn test_match_field_exact_and_anchor() {
        let bundle = bundle();
        let (rule, m) = match_field(&bundle, "Polling Rate").unwrap();
        assert_eq!(rule.field_key, "polling_rate");
        assert_eq!(m, FieldMatch::Exact);

        let (rule, m) = match_field(&bundle, "Report Rate").unwrap();
        assert_eq!(rule.field_key, "polling_rate");
        assert_eq!(m, FieldMatch::Anchor);

        assert!(match_field(&bundle, "Warranty").is_none());
    }

    #[test]
    fn test_plausibility_range() {
        let bundle = bundle();
        let rule = &bundle.field_rules["polling_rate"];
        assert_eq!(plausibility(rule, None, &json!(4000)), 2);
        assert_eq!(plausibility(rule, None, &json!(9_000_000)), -6);
    }

    #[test]
    fn test_score_and_confidence() {
        // A clean in-range table match lands exactly on the required-level
        // pass target.
        let score = score_candidate(ExtractionMethod::HtmlTable, FieldMatch::Exact, 2);
        assert_eq!(score, 8);
        assert_eq!(confidence_from_score(score), 0.8);

        let network = score_candidate(ExtractionMethod::NetworkJson, FieldMatch::Exact, 2);
        assert!(confidence_from_score(network) > 0.8);
        assert_eq!(confidence_from_score(-10), 0.05);
        assert_eq!(confidence_from_score(100), 0.98);
    }
}
