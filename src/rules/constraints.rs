//! Constraint predicate evaluation.
//!
//! Value resolution precedence is component properties first, then product
//! values. A value is "known" iff non-empty and not a sentinel.

use serde_json::{Map, Value};

use super::types::{is_known_value, ComparisonOp, ConstraintPredicate, FieldRule, ValueType};
use std::collections::HashMap;

/// Outcome of evaluating one constraint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ConstraintOutcome {
    /// Whether the predicate holds (or was vacuously skipped)
    pub pass: bool,
    /// True when the predicate could not be evaluated and was skipped
    #[serde(default, skip_serializing_if = "is_false")]
    pub skipped: bool,
    /// True when a `requires` dependency is missing
    #[serde(default, skip_serializing_if = "is_false")]
    pub dependency_missing: bool,
}

fn is_false(b: &bool) -> bool {
    !*b
}

impl ConstraintOutcome {
    fn pass() -> Self {
        Self {
            pass: true,
            skipped: false,
            dependency_missing: false,
        }
    }

    fn skipped() -> Self {
        Self {
            pass: true,
            skipped: true,
            dependency_missing: false,
        }
    }

    fn fail() -> Self {
        Self {
            pass: false,
            skipped: false,
            dependency_missing: false,
        }
    }

    fn dependency_missing() -> Self {
        Self {
            pass: false,
            skipped: false,
            dependency_missing: true,
        }
    }
}

/// Resolve a field: component properties first, then product values.
fn resolve<'a>(
    field: &str,
    component_props: &'a Map<String, Value>,
    product_values: &'a Map<String, Value>,
) -> Option<&'a Value> {
    component_props.get(field).or_else(|| product_values.get(field))
}

fn known<'a>(
    field: &str,
    component_props: &'a Map<String, Value>,
    product_values: &'a Map<String, Value>,
) -> Option<&'a Value> {
    resolve(field, component_props, product_values).filter(|v| is_known_value(v))
}

/// Whether the contract for a field says numeric comparison.
fn is_numeric_field(field: &str, rules: &HashMap<String, FieldRule>) -> bool {
    rules
        .get(field)
        .map_or(false, |r| r.contract.value_type == ValueType::Number)
}

fn as_comparable_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn as_comparable_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.split_whitespace().collect::<Vec<_>>().join(" ").to_lowercase(),
        other => other.to_string(),
    }
}

fn compare(op: ComparisonOp, left: &Value, right: &Value, numeric: bool) -> ConstraintOutcome {
    if numeric {
        match (as_comparable_f64(left), as_comparable_f64(right)) {
            (Some(l), Some(r)) => {
                if op.eval_f64(l, r) {
                    ConstraintOutcome::pass()
                } else {
                    ConstraintOutcome::fail()
                }
            }
            // A non-numeric operand under a numeric contract cannot satisfy
            // the predicate.
            _ => ConstraintOutcome::fail(),
        }
    } else if op.eval_str(&as_comparable_string(left), &as_comparable_string(right)) {
        ConstraintOutcome::pass()
    } else {
        ConstraintOutcome::fail()
    }
}

/// Evaluate one predicate against component and product values.
pub fn evaluate_constraint(
    predicate: &ConstraintPredicate,
    component_props: &Map<String, Value>,
    product_values: &Map<String, Value>,
    rules: &HashMap<String, FieldRule>,
) -> ConstraintOutcome {
    match predicate {
        ConstraintPredicate::Requires { field, requires } => {
            if known(field, component_props, product_values).is_none() {
                return ConstraintOutcome::skipped();
            }
            if known(requires, component_props, product_values).is_none() {
                return ConstraintOutcome::dependency_missing();
            }
            ConstraintOutcome::pass()
        }
        ConstraintPredicate::Comparison { field, op, value } => {
            match known(field, component_props, product_values) {
                None => ConstraintOutcome::skipped(),
                Some(actual) => compare(*op, actual, value, is_numeric_field(field, rules)),
            }
        }
        ConstraintPredicate::CrossField { left, op, right } => {
            let l = known(left, component_props, product_values);
            let r = known(right, component_props, product_values);
            match (l, r) {
                (Some(lv), Some(rv)) => {
                    let numeric =
                        is_numeric_field(left, rules) || is_numeric_field(right, rules);
                    compare(*op, lv, rv, numeric)
                }
                _ => ConstraintOutcome::skipped(),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn rules() -> HashMap<String, FieldRule> {
        let mut map = HashMap::new();
        for key in ["dpi", "max_dpi", "weight"] {
            map.insert(key.to_string(), FieldRule::new(key, ValueType::Number));
        }
        map.insert(
            "sensor".to_string(),
            FieldRule::new("sensor", ValueType::String),
        );
        map
    }

    fn values(pairs: &[(&str, Value)]) -> Map<String, Value> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn test_requires_skipped_when_subject_unknown() {
        let pred = ConstraintPredicate::Requires {
            field: "sensor".into(),
            requires: "dpi".into(),
        };
        let out = evaluate_constraint(&pred, &Map::new(), &values(&[("sensor", json!("unk"))]), &rules());
        assert!(out.pass);
        assert!(out.skipped);
    }

    #[test]
    fn test_requires_dependency_missing() {
        let pred = ConstraintPredicate::Requires {
            field: "sensor".into(),
            requires: "dpi".into(),
        };
        let out = evaluate_constraint(
            &pred,
            &Map::new(),
            &values(&[("sensor", json!("HERO 2"))]),
            &rules(),
        );
        assert!(!out.pass);
        assert!(out.dependency_missing);
    }

    #[test]
    fn test_requires_both_known_passes() {
        let pred = ConstraintPredicate::Requires {
            field: "sensor".into(),
            requires: "dpi".into(),
        };
        let out = evaluate_constraint(
            &pred,
            &Map::new(),
            &values(&[("sensor", json!("HERO 2")), ("dpi", json!(32000))]),
            &rules(),
        );
        assert!(out.pass);
        assert!(!out.skipped);
    }

    #[test]
    fn test_numeric_comparison_coerces_strings() {
        let pred = ConstraintPredicate::Comparison {
            field: "dpi".into(),
            op: ComparisonOp::Ge,
            value: json!(400),
        };
        let out = evaluate_constraint(
            &pred,
            &Map::new(),
            &values(&[("dpi", json!("32000"))]),
            &rules(),
        );
        assert!(out.pass);
    }

    #[test]
    fn test_cross_field_comparison() {
        let pred = ConstraintPredicate::CrossField {
            left: "dpi".into(),
            op: ComparisonOp::Le,
            right: "max_dpi".into(),
        };
        let ok = evaluate_constraint(
            &pred,
            &Map::new(),
            &values(&[("dpi", json!(800)), ("max_dpi", json!(32000))]),
            &rules(),
        );
        assert!(ok.pass);

        let bad = evaluate_constraint(
            &pred,
            &Map::new(),
            &values(&[("dpi", json!(64000)), ("max_dpi", json!(32000))]),
            &rules(),
        );
        assert!(!bad.pass);
        assert!(!bad.dependency_missing);
    }

    #[test]
    fn test_cross_field_skips_on_missing_side() {
        let pred = ConstraintPredicate::CrossField {
            left: "dpi".into(),
            op: ComparisonOp::Le,
            right: "max_dpi".into(),
        };
        let out = evaluate_constraint(
            &pred,
            &Map::new(),
            &values(&[("dpi", json!(800))]),
            &rules(),
        );
        assert!(out.pass);
        assert!(out.skipped);
    }

    #[test]
    fn test_component_props_take_precedence() {
        let pred = ConstraintPredicate::Comparison {
            field: "weight".into(),
            op: ComparisonOp::Lt,
            value: json!(100),
        };
        let component = values(&[("weight", json!(60))]);
        let product = values(&[("weight", json!(500))]);
        let out = evaluate_constraint(&pred, &component, &product, &rules());
        assert!(out.pass);
    }

    #[test]
    fn test_string_comparison_normalized() {
        let pred = ConstraintPredicate::Comparison {
            field: "sensor".into(),
            op: ComparisonOp::Eq,
            value: json!("hero 2"),
        };
        let out = evaluate_constraint(
            &pred,
            &Map::new(),
            &values(&[("sensor", json!("  HERO   2 "))]),
            &rules(),
        );
        assert!(out.pass);
    }
}
