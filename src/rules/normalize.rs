//! Candidate normalization against field contracts.
//!
//! `normalize_candidate` parses a raw extracted string into the contract's
//! type: unit conversion, type coercion, list splitting, and list dedupe.
//! Sorting and min/max enforcement are deferred to the runtime gate.

use regex::Regex;
use serde_json::{Number, Value};
use std::sync::OnceLock;

use super::types::{
    normalize_for_compare, EnumPolicy, FieldRule, KnownValueSet, Shape, SortOrder, ValueType,
};

/// Why normalization failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NormalizeFailureCode {
    ParseFailed,
    UnitUnknown,
    RangeViolation,
    EnumUnknown,
}

/// Result of normalizing one raw value.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct NormalizeOutcome {
    /// Whether normalization succeeded
    pub ok: bool,
    /// The normalized value, on success
    #[serde(skip_serializing_if = "Option::is_none")]
    pub normalized: Option<Value>,
    /// The failure code, on failure
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_code: Option<NormalizeFailureCode>,
}

impl NormalizeOutcome {
    /// Successful outcome.
    pub fn ok(value: Value) -> Self {
        Self {
            ok: true,
            normalized: Some(value),
            failure_code: None,
        }
    }

    /// Failed outcome.
    pub fn fail(code: NormalizeFailureCode) -> Self {
        Self {
            ok: false,
            normalized: None,
            failure_code: Some(code),
        }
    }
}

fn number_with_unit_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"^\s*([+-]?\d+(?:[.,]\d+)?)\s*([a-zA-Z"']*)\s*$"#).expect("static regex")
    })
}

/// Conversion factor from a unit spelling to its family base unit.
///
/// Families: length base mm, mass base g, frequency base hz, time base ms.
fn unit_factor(unit: &str) -> Option<(&'static str, f64)> {
    match unit.to_ascii_lowercase().as_str() {
        "mm" => Some(("length", 1.0)),
        "cm" => Some(("length", 10.0)),
        "m" => Some(("length", 1000.0)),
        "in" | "inch" | "inches" | "\"" => Some(("length", 25.4)),
        "g" | "gram" | "grams" => Some(("mass", 1.0)),
        "kg" => Some(("mass", 1000.0)),
        "lb" | "lbs" => Some(("mass", 453.592)),
        "oz" => Some(("mass", 28.3495)),
        "hz" => Some(("freq", 1.0)),
        "khz" => Some(("freq", 1000.0)),
        "mhz" => Some(("freq", 1_000_000.0)),
        "ms" => Some(("time", 1.0)),
        "s" | "sec" => Some(("time", 1000.0)),
        "h" | "hr" | "hrs" | "hours" => Some(("time", 3_600_000.0)),
        _ => None,
    }
}

/// Convert a value quoted in `from` into the contract's `target` unit.
fn convert_unit(value: f64, from: &str, target: &str) -> Result<f64, NormalizeFailureCode> {
    if from.eq_ignore_ascii_case(target) {
        return Ok(value);
    }
    let (from_family, from_factor) =
        unit_factor(from).ok_or(NormalizeFailureCode::UnitUnknown)?;
    let (target_family, target_factor) =
        unit_factor(target).ok_or(NormalizeFailureCode::UnitUnknown)?;
    if from_family != target_family {
        return Err(NormalizeFailureCode::UnitUnknown);
    }
    Ok(value * from_factor / target_factor)
}

/// Render a float as a JSON number, collapsing integral values to integers.
pub fn json_number(value: f64) -> Value {
    if value.fract() == 0.0 && value.abs() < 9_007_199_254_740_992.0 {
        Value::Number(Number::from(value as i64))
    } else {
        Number::from_f64(value).map_or(Value::Null, Value::Number)
    }
}

fn normalize_number(rule: &FieldRule, raw: &str) -> Result<Value, NormalizeFailureCode> {
    let caps = number_with_unit_re()
        .captures(raw)
        .ok_or(NormalizeFailureCode::ParseFailed)?;
    let mut value: f64 = caps[1]
        .replace(',', ".")
        .parse()
        .map_err(|_| NormalizeFailureCode::ParseFailed)?;

    let quoted_unit = caps.get(2).map(|m| m.as_str()).unwrap_or("");
    if let Some(target) = rule.contract.unit.as_deref() {
        if !quoted_unit.is_empty() {
            value = convert_unit(value, quoted_unit, target)?;
        }
    } else if !quoted_unit.is_empty() && unit_factor(quoted_unit).is_none() {
        return Err(NormalizeFailureCode::UnitUnknown);
    }

    if let Some(range) = &rule.contract.range {
        if !range.contains(value) {
            return Err(NormalizeFailureCode::RangeViolation);
        }
    }
    Ok(json_number(value))
}

fn normalize_bool(raw: &str) -> Result<Value, NormalizeFailureCode> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "true" | "yes" | "y" | "1" | "on" => Ok(Value::Bool(true)),
        "false" | "no" | "n" | "0" | "off" => Ok(Value::Bool(false)),
        _ => Err(NormalizeFailureCode::ParseFailed),
    }
}

fn normalize_date(raw: &str) -> Result<Value, NormalizeFailureCode> {
    let trimmed = raw.trim();
    if let Ok(d) = chrono::NaiveDate::parse_from_str(trimmed, "%Y-%m-%d") {
        return Ok(Value::String(d.format("%Y-%m-%d").to_string()));
    }
    if let Ok(dt) = chrono::DateTime::parse_from_rfc3339(trimmed) {
        return Ok(Value::String(dt.date_naive().format("%Y-%m-%d").to_string()));
    }
    if let Ok(d) = chrono::NaiveDate::parse_from_str(trimmed, "%B %d, %Y") {
        return Ok(Value::String(d.format("%Y-%m-%d").to_string()));
    }
    Err(NormalizeFailureCode::ParseFailed)
}

fn normalize_string(raw: &str) -> Value {
    Value::String(raw.split_whitespace().collect::<Vec<_>>().join(" "))
}

fn normalize_enum(
    known: Option<&KnownValueSet>,
    raw: &str,
) -> Result<Value, NormalizeFailureCode> {
    let collapsed = raw.split_whitespace().collect::<Vec<_>>().join(" ");
    match known {
        Some(set) => match set.canonicalize(&collapsed) {
            Some(canonical) => Ok(Value::String(canonical)),
            None if set.policy == EnumPolicy::Closed => {
                Err(NormalizeFailureCode::EnumUnknown)
            }
            // Open policies keep the collapsed spelling as a suggestion.
            None => Ok(Value::String(collapsed)),
        },
        None => Ok(Value::String(collapsed)),
    }
}

fn normalize_scalar(
    rule: &FieldRule,
    known: Option<&KnownValueSet>,
    raw: &str,
) -> Result<Value, NormalizeFailureCode> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(NormalizeFailureCode::ParseFailed);
    }
    match rule.contract.value_type {
        ValueType::Number => normalize_number(rule, trimmed),
        ValueType::String => Ok(normalize_string(trimmed)),
        ValueType::Enum => normalize_enum(known, trimmed),
        ValueType::Bool => normalize_bool(trimmed),
        ValueType::Date => normalize_date(trimmed),
    }
}

/// Split a raw list payload into item strings.
fn split_list(raw: &str) -> Vec<&str> {
    raw.split(|c| matches!(c, ',' | ';' | '|' | '\n'))
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect()
}

/// Comparison key used for list dedupe.
pub fn dedupe_key(value: &Value) -> String {
    match value {
        Value::String(s) => normalize_for_compare(s),
        other => other.to_string(),
    }
}

/// Drop duplicate list items, preserving first-seen order.
pub fn dedupe_items(items: Vec<Value>) -> Vec<Value> {
    let mut seen = std::collections::HashSet::new();
    items
        .into_iter()
        .filter(|item| seen.insert(dedupe_key(item)))
        .collect()
}

/// Sort list items per the contract's sort order.
pub fn sort_items(items: &mut [Value], order: SortOrder) {
    if order == SortOrder::None {
        return;
    }
    items.sort_by(|a, b| match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => x.partial_cmp(&y).unwrap_or(std::cmp::Ordering::Equal),
        _ => dedupe_key(a).cmp(&dedupe_key(b)),
    });
    if order == SortOrder::Desc {
        items.reverse();
    }
}

/// Normalize one raw extracted value against a field rule.
///
/// List shape splits the payload, normalizes each item, and applies dedupe
/// only; the gate owns sort and min/max. Any item failure fails the whole
/// candidate.
pub fn normalize_candidate(
    rule: &FieldRule,
    known: Option<&KnownValueSet>,
    raw: &str,
) -> NormalizeOutcome {
    match rule.contract.shape {
        Shape::Scalar => match normalize_scalar(rule, known, raw) {
            Ok(value) => NormalizeOutcome::ok(value),
            Err(code) => NormalizeOutcome::fail(code),
        },
        Shape::List => {
            let items = split_list(raw);
            if items.is_empty() {
                return NormalizeOutcome::fail(NormalizeFailureCode::ParseFailed);
            }
            let mut normalized = Vec::with_capacity(items.len());
            for item in items {
                match normalize_scalar(rule, known, item) {
                    Ok(value) => normalized.push(value),
                    Err(code) => return NormalizeOutcome::fail(code),
                }
            }
            let dedupe = rule
                .contract
                .list_rules
                .as_ref()
                .map_or(false, |lr| lr.dedupe);
            if dedupe {
                normalized = dedupe_items(normalized);
            }
            NormalizeOutcome::ok(Value::Array(normalized))
        }
    }
}

/// Re-normalize an already-typed value; used by the gate so that
/// `gate ∘ gate ≡ gate`.
pub fn renormalize_value(
    rule: &FieldRule,
    known: Option<&KnownValueSet>,
    value: &Value,
) -> NormalizeOutcome {
    match value {
        Value::String(s) => normalize_candidate(rule, known, s),
        Value::Array(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                match item {
                    Value::String(s) => match normalize_scalar(rule, known, s) {
                        Ok(v) => out.push(v),
                        Err(code) => return NormalizeOutcome::fail(code),
                    },
                    other => out.push(other.clone()),
                }
            }
            let dedupe = rule
                .contract
                .list_rules
                .as_ref()
                .map_or(false, |lr| lr.dedupe);
            if dedupe {
                out = dedupe_items(out);
            }
            NormalizeOutcome::ok(Value::Array(out))
        }
        other => NormalizeOutcome::ok(other.clone()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::types::ListRules;
    use serde_json::json;

    fn weight_rule() -> FieldRule {
        FieldRule::new("weight", ValueType::Number)
            .with_unit("g")
            .with_range(10.0, 500.0)
    }

    #[test]
    fn test_number_with_unit_conversion() {
        let rule = FieldRule::new("weight", ValueType::Number).with_unit("g");
        let out = normalize_candidate(&rule, None, "2.2 lb");
        assert!(out.ok);
        let grams = out.normalized.unwrap().as_f64().unwrap();
        assert!((grams - 997.9).abs() < 0.1, "grams was {grams}");
    }

    #[test]
    fn test_number_plain_assumes_contract_unit() {
        let rule = weight_rule();
        let out = normalize_candidate(&rule, None, "60");
        assert_eq!(out.normalized, Some(json!(60)));
    }

    #[test]
    fn test_number_oz_to_grams() {
        let rule = weight_rule();
        let out = normalize_candidate(&rule, None, "2 oz");
        assert!(out.ok);
        let grams = out.normalized.unwrap().as_f64().unwrap();
        assert!((grams - 56.699).abs() < 0.01);
    }

    #[test]
    fn test_inches_to_mm() {
        let rule = FieldRule::new("length", ValueType::Number).with_unit("mm");
        let out = normalize_candidate(&rule, None, "5 in");
        assert_eq!(out.normalized.unwrap().as_f64().unwrap(), 127.0);
    }

    #[test]
    fn test_unknown_unit_fails() {
        let rule = weight_rule();
        let out = normalize_candidate(&rule, None, "60 stone");
        assert!(!out.ok);
        assert_eq!(out.failure_code, Some(NormalizeFailureCode::UnitUnknown));
    }

    #[test]
    fn test_cross_family_unit_fails() {
        let rule = weight_rule();
        let out = normalize_candidate(&rule, None, "60 mm");
        assert_eq!(out.failure_code, Some(NormalizeFailureCode::UnitUnknown));
    }

    #[test]
    fn test_range_violation() {
        let rule = weight_rule();
        let out = normalize_candidate(&rule, None, "9000");
        assert_eq!(out.failure_code, Some(NormalizeFailureCode::RangeViolation));
    }

    #[test]
    fn test_garbage_number_parse_failed() {
        let rule = weight_rule();
        let out = normalize_candidate(&rule, None, "approximately light");
        assert_eq!(out.failure_code, Some(NormalizeFailureCode::ParseFailed));
    }

    #[test]
    fn test_list_dedupe_case_insensitive() {
        let rule = FieldRule::new("colors", ValueType::String).as_list(ListRules {
            dedupe: true,
            ..ListRules::default()
        });
        let out = normalize_candidate(&rule, None, "Black, black , White");
        assert_eq!(out.normalized, Some(json!(["Black", "White"])));
    }

    #[test]
    fn test_list_keeps_order_no_sort_at_normalize() {
        let rule = FieldRule::new("sizes", ValueType::Number).as_list(ListRules {
            dedupe: true,
            sort: SortOrder::Asc,
            ..ListRules::default()
        });
        // Sorting is the gate's job.
        let out = normalize_candidate(&rule, None, "3, 1, 2");
        assert_eq!(out.normalized, Some(json!([3, 1, 2])));
    }

    #[test]
    fn test_list_numeric_dedupe_collapses() {
        let rule = FieldRule::new("sizes", ValueType::Number).as_list(ListRules {
            dedupe: true,
            min_items: Some(2),
            ..ListRules::default()
        });
        let out = normalize_candidate(&rule, None, "42, 42");
        // min_items is deferred to the gate; normalize just collapses.
        assert_eq!(out.normalized, Some(json!([42])));
    }

    #[test]
    fn test_enum_canonicalizes_known() {
        let set = KnownValueSet::closed(&["Optical"]).with_synonym("opto", "Optical");
        let rule = FieldRule::new("sensor_type", ValueType::Enum);
        let out = normalize_candidate(&rule, Some(&set), "  optical ");
        assert_eq!(out.normalized, Some(json!("Optical")));
        let out = normalize_candidate(&rule, Some(&set), "opto");
        assert_eq!(out.normalized, Some(json!("Optical")));
    }

    #[test]
    fn test_enum_unknown_under_closed_fails() {
        let set = KnownValueSet::closed(&["Optical"]);
        let rule = FieldRule::new("sensor_type", ValueType::Enum);
        let out = normalize_candidate(&rule, Some(&set), "Hall Effect");
        assert_eq!(out.failure_code, Some(NormalizeFailureCode::EnumUnknown));
    }

    #[test]
    fn test_bool_and_date() {
        let rule = FieldRule::new("wireless", ValueType::Bool);
        assert_eq!(
            normalize_candidate(&rule, None, "Yes").normalized,
            Some(json!(true))
        );
        let rule = FieldRule::new("release_date", ValueType::Date);
        assert_eq!(
            normalize_candidate(&rule, None, "2023-09-21").normalized,
            Some(json!("2023-09-21"))
        );
        assert_eq!(
            normalize_candidate(&rule, None, "September 21, 2023").normalized,
            Some(json!("2023-09-21"))
        );
    }

    #[test]
    fn test_normalize_idempotent() {
        let rule = weight_rule();
        let first = normalize_candidate(&rule, None, "2.2 lb").normalized.unwrap();
        let second = renormalize_value(&rule, None, &first).normalized.unwrap();
        assert_eq!(first, second);
    }
}
