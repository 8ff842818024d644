//! The compiled field-rules engine.
//!
//! An engine is loaded once per category from the compiled bundle, treated as
//! immutable, and shared freely. Hot reloads build a new engine and swap it at
//! a round boundary.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use tracing::debug;

use crate::error::{Error, Result};
use crate::storage::{resolve_output_key, Storage};

use super::constraints::{evaluate_constraint, ConstraintOutcome};
use super::normalize::{
    normalize_candidate, renormalize_value, sort_items, NormalizeFailureCode, NormalizeOutcome,
};
use super::types::{
    is_known_value, ConstraintPredicate, FieldRule, KeyMigrations, KnownValueSet, RuleBundle,
    Shape, SortOrder, UiField, BUNDLE_VERSION, UNK,
};

/// Stage of the runtime gate a failure or change is attributed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateStage {
    Migrations,
    Contract,
    EnumPolicy,
    ListRules,
    Constraints,
}

/// Reason codes recorded by the runtime gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateReasonCode {
    ParseFailed,
    UnitUnknown,
    RangeViolation,
    EnumUnknownUnderClosed,
    MinItemsNotMet,
    ConstraintFailed,
}

/// One recorded gate failure. The field is set to `unk` for every failure
/// except a missing `requires` dependency.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GateFailure {
    pub field: String,
    pub reason_code: GateReasonCode,
    pub stage: GateStage,
}

/// One value rewrite performed by the gate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GateChange {
    pub field: String,
    pub stage: GateStage,
    pub from: Value,
    pub to: Value,
}

/// Input to the runtime gate.
#[derive(Debug, Clone, Default)]
pub struct GateInput {
    /// Field map to gate
    pub fields: Map<String, Value>,
    /// Evaluation order; empty uses the bundle's catalog order
    pub field_order: Vec<String>,
}

/// Output of the runtime gate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GateOutput {
    /// Gated field map
    pub fields: Map<String, Value>,
    /// Value rewrites
    pub changes: Vec<GateChange>,
    /// Recorded failures
    pub failures: Vec<GateFailure>,
    /// Count of actual constraint contradictions (dependency-missing
    /// failures excluded)
    pub contradictions: u32,
}

/// Shape of the compiled `field_rules.json` artifact.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct CompiledFieldRules {
    version: String,
    field_rules: HashMap<String, FieldRule>,
}

/// The compiled, immutable rules engine for one category.
#[derive(Debug, Clone)]
pub struct FieldRulesEngine {
    category: String,
    bundle: RuleBundle,
}

impl FieldRulesEngine {
    /// Build an engine directly from a bundle; fails when the bundle version
    /// does not match the compiler format this engine understands.
    pub fn from_bundle(category: impl Into<String>, bundle: RuleBundle) -> Result<Self> {
        if bundle.version != BUNDLE_VERSION {
            return Err(Error::rules_not_compiled(
                category.into(),
                format!(
                    "bundle version '{}' does not match engine version '{}'",
                    bundle.version, BUNDLE_VERSION
                ),
            ));
        }
        Ok(Self {
            category: category.into(),
            bundle,
        })
    }

    /// Load the compiled bundle for a category from storage.
    ///
    /// `field_rules.json` is mandatory and carries the version; the remaining
    /// artifacts default to empty when absent.
    pub fn load(category: &str, storage: &dyn Storage) -> Result<Self> {
        let key = |name: &str| {
            resolve_output_key(&[
                "helper_files",
                category,
                "_generated",
                &format!("{name}.json"),
            ])
        };

        let compiled: CompiledFieldRules = match storage.read_json_or_null(&key("field_rules"))? {
            Some(value) => serde_json::from_value(value)?,
            None => {
                return Err(Error::rules_not_compiled(
                    category,
                    "field_rules.json missing",
                ))
            }
        };

        fn optional<T: serde::de::DeserializeOwned + Default>(
            storage: &dyn Storage,
            key: &str,
        ) -> Result<T> {
            Ok(match storage.read_json_or_null(key)? {
                Some(value) => serde_json::from_value(value)?,
                None => T::default(),
            })
        }

        let bundle = RuleBundle {
            version: compiled.version,
            field_rules: compiled.field_rules,
            known_values: optional::<HashMap<String, KnownValueSet>>(storage, &key("known_values"))?,
            parse_templates: optional(storage, &key("parse_templates"))?,
            cross_validation_rules: optional::<Vec<ConstraintPredicate>>(
                storage,
                &key("cross_validation_rules"),
            )?,
            key_migrations: optional::<KeyMigrations>(storage, &key("key_migrations"))?,
            ui_field_catalog: optional::<Vec<UiField>>(storage, &key("ui_field_catalog"))?,
        };

        debug!(
            category,
            fields = bundle.field_rules.len(),
            "loaded compiled rule bundle"
        );
        Self::from_bundle(category, bundle)
    }

    /// The category this engine was compiled for.
    pub fn category(&self) -> &str {
        &self.category
    }

    /// The compiled bundle.
    pub fn bundle(&self) -> &RuleBundle {
        &self.bundle
    }

    /// Rule for a field key.
    pub fn rule(&self, field: &str) -> Option<&FieldRule> {
        self.bundle.field_rules.get(field)
    }

    /// Known-value set for a field key.
    pub fn known_values(&self, field: &str) -> Option<&KnownValueSet> {
        self.bundle.known_values.get(field)
    }

    /// Normalize a raw extracted value for a field. Unknown fields fail with
    /// `parse_failed`; the schema is closed.
    pub fn normalize_candidate(&self, field: &str, raw: &str) -> NormalizeOutcome {
        match self.rule(field) {
            Some(rule) => normalize_candidate(rule, self.known_values(field), raw),
            None => NormalizeOutcome::fail(NormalizeFailureCode::ParseFailed),
        }
    }

    /// Rename fields per the compiled key migration map. An existing value
    /// under the new key wins; the stale key is dropped either way.
    pub fn apply_migrations(&self, fields: Map<String, Value>) -> Map<String, Value> {
        if self.bundle.key_migrations.key_map.is_empty() {
            return fields;
        }
        let mut out = Map::new();
        for (key, value) in fields {
            match self.bundle.key_migrations.key_map.get(&key) {
                Some(new_key) => {
                    out.entry(new_key.clone()).or_insert(value);
                }
                None => {
                    out.entry(key).or_insert(value);
                }
            }
        }
        out
    }

    /// Final pass applied before publish: migrations, enum canonicalization
    /// under policy, list sort and min/max, then cross-field constraints.
    pub fn apply_runtime_gate(&self, input: GateInput) -> GateOutput {
        let mut changes = Vec::new();
        let mut failures = Vec::new();
        let mut contradictions = 0u32;

        let before = input.fields.clone();
        let mut fields = self.apply_migrations(input.fields);
        for key in fields.keys() {
            if !before.contains_key(key) {
                changes.push(GateChange {
                    field: key.clone(),
                    stage: GateStage::Migrations,
                    from: Value::Null,
                    to: fields[key].clone(),
                });
            }
        }

        let order = if input.field_order.is_empty() {
            self.bundle.field_order()
        } else {
            input.field_order
        };
        let mut ordered: Vec<String> = order
            .iter()
            .filter(|k| fields.contains_key(*k))
            .cloned()
            .collect();
        for key in fields.keys() {
            if !ordered.contains(key) {
                ordered.push(key.clone());
            }
        }

        for field in &ordered {
            let Some(rule) = self.rule(field) else {
                continue;
            };
            let value = fields[field].clone();

            // Sentinel spellings collapse to the canonical `unk`.
            if !is_known_value(&value) {
                if !value.is_array() && value != Value::String(UNK.to_string()) {
                    set_field(&mut fields, &mut changes, field, GateStage::Contract, UNK.into());
                }
                continue;
            }

            // Typed numbers skip re-parsing but still honor the range.
            if let (Some(range), Some(n)) = (&rule.contract.range, value.as_f64()) {
                if !range.contains(n) {
                    failures.push(GateFailure {
                        field: field.clone(),
                        reason_code: GateReasonCode::RangeViolation,
                        stage: GateStage::Contract,
                    });
                    set_field(&mut fields, &mut changes, field, GateStage::Contract, UNK.into());
                    continue;
                }
            }

            let known = self.known_values(field);
            match renormalize_value(rule, known, &value) {
                NormalizeOutcome {
                    normalized: Some(normalized),
                    ..
                } => {
                    if normalized != value {
                        let stage = match rule.contract.value_type {
                            super::types::ValueType::Enum => GateStage::EnumPolicy,
                            _ => GateStage::Contract,
                        };
                        set_field(&mut fields, &mut changes, field, stage, normalized);
                    }
                }
                NormalizeOutcome {
                    failure_code: Some(code),
                    ..
                } => {
                    let (reason, stage) = match code {
                        NormalizeFailureCode::EnumUnknown => {
                            (GateReasonCode::EnumUnknownUnderClosed, GateStage::EnumPolicy)
                        }
                        NormalizeFailureCode::RangeViolation => {
                            (GateReasonCode::RangeViolation, GateStage::Contract)
                        }
                        NormalizeFailureCode::UnitUnknown => {
                            (GateReasonCode::UnitUnknown, GateStage::Contract)
                        }
                        NormalizeFailureCode::ParseFailed => {
                            (GateReasonCode::ParseFailed, GateStage::Contract)
                        }
                    };
                    failures.push(GateFailure {
                        field: field.clone(),
                        reason_code: reason,
                        stage,
                    });
                    set_field(&mut fields, &mut changes, field, stage, UNK.into());
                    continue;
                }
                _ => continue,
            }

            // List sort and min/max run after canonicalization.
            if rule.contract.shape == Shape::List {
                if let Some(list_rules) = rule.contract.list_rules.clone() {
                    if let Some(Value::Array(mut items)) = fields.get(field).cloned() {
                        let original = items.clone();
                        if list_rules.sort != SortOrder::None {
                            sort_items(&mut items, list_rules.sort);
                        }
                        if let Some(max) = list_rules.max_items {
                            items.truncate(max);
                        }
                        if let Some(min) = list_rules.min_items {
                            if items.len() < min {
                                failures.push(GateFailure {
                                    field: field.clone(),
                                    reason_code: GateReasonCode::MinItemsNotMet,
                                    stage: GateStage::ListRules,
                                });
                                set_field(
                                    &mut fields,
                                    &mut changes,
                                    field,
                                    GateStage::ListRules,
                                    UNK.into(),
                                );
                                continue;
                            }
                        }
                        if items != original {
                            set_field(
                                &mut fields,
                                &mut changes,
                                field,
                                GateStage::ListRules,
                                Value::Array(items),
                            );
                        }
                    }
                }
            }
        }

        // Cross-field constraints last: per-field constraints in field order,
        // then category-wide rules.
        let empty = Map::new();
        let mut predicates: Vec<&ConstraintPredicate> = Vec::new();
        for field in &ordered {
            if let Some(rule) = self.rule(field) {
                predicates.extend(rule.constraints.iter());
            }
        }
        predicates.extend(self.bundle.cross_validation_rules.iter());

        for predicate in predicates {
            let outcome: ConstraintOutcome =
                evaluate_constraint(predicate, &empty, &fields, &self.bundle.field_rules);
            if outcome.pass {
                continue;
            }
            let subject = predicate.subject_field().to_string();
            failures.push(GateFailure {
                field: subject.clone(),
                reason_code: GateReasonCode::ConstraintFailed,
                stage: GateStage::Constraints,
            });
            if !outcome.dependency_missing {
                contradictions += 1;
                if fields.contains_key(&subject) {
                    set_field(
                        &mut fields,
                        &mut changes,
                        &subject,
                        GateStage::Constraints,
                        UNK.into(),
                    );
                }
            }
        }

        GateOutput {
            fields,
            changes,
            failures,
            contradictions,
        }
    }
}

fn set_field(
    fields: &mut Map<String, Value>,
    changes: &mut Vec<GateChange>,
    field: &str,
    stage: GateStage,
    to: Value,
) {
    let from = fields.get(field).cloned().unwrap_or(Value::Null);
    if from == to {
        return;
    }
    changes.push(GateChange {
        field: field.to_string(),
        stage,
        from,
        to: to.clone(),
    });
    fields.insert(field.to_string(), to);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::types::{
        ComparisonOp, ListRules, RequiredLevel, ValueType,
    };
    use serde_json::json;

    fn engine() -> FieldRulesEngine {
        let bundle = RuleBundle::empty()
            .with_rule(
                FieldRule::new("weight", ValueType::Number)
                    .with_unit("g")
                    .with_range(10.0, 500.0)
                    .with_level(RequiredLevel::Required),
            )
            .with_rule(
                FieldRule::new("sizes", ValueType::Number).as_list(ListRules {
                    dedupe: true,
                    sort: SortOrder::Asc,
                    min_items: Some(2),
                    max_items: Some(6),
                }),
            )
            .with_rule(FieldRule::new("sensor_type", ValueType::Enum))
            .with_rule(
                FieldRule::new("dpi", ValueType::Number).with_constraint(
                    ConstraintPredicate::CrossField {
                        left: "dpi".into(),
                        op: ComparisonOp::Le,
                        right: "max_dpi".into(),
                    },
                ),
            )
            .with_rule(FieldRule::new("max_dpi", ValueType::Number))
            .with_known_values(
                "sensor_type",
                KnownValueSet::closed(&["Optical", "Laser"]).with_synonym("opto", "Optical"),
            )
            .with_migration("weight_grams", "weight");
        FieldRulesEngine::from_bundle("gaming-mice", bundle).unwrap()
    }

    fn gate(fields: Map<String, Value>) -> GateOutput {
        engine().apply_runtime_gate(GateInput {
            fields,
            field_order: Vec::new(),
        })
    }

    fn fields(pairs: &[(&str, Value)]) -> Map<String, Value> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn test_version_mismatch_rejected() {
        let mut bundle = RuleBundle::empty();
        bundle.version = "2".into();
        let err = FieldRulesEngine::from_bundle("gaming-mice", bundle).unwrap_err();
        assert!(matches!(err, Error::RulesNotCompiled { .. }));
    }

    #[test]
    fn test_migration_renames_and_existing_target_wins() {
        let out = engine().apply_migrations(fields(&[
            ("weight_grams", json!(60)),
            ("dpi", json!(32000)),
        ]));
        assert_eq!(out.get("weight"), Some(&json!(60)));
        assert!(!out.contains_key("weight_grams"));

        let out = engine().apply_migrations(fields(&[
            ("weight_grams", json!(60)),
            ("weight", json!(59)),
        ]));
        assert_eq!(out.get("weight"), Some(&json!(59)));
    }

    #[test]
    fn test_gate_min_items_collapse() {
        let out = gate(fields(&[("sizes", json!(["42", "42"]))]));
        assert_eq!(out.fields.get("sizes"), Some(&json!("unk")));
        let failure = &out.failures[0];
        assert_eq!(failure.field, "sizes");
        assert_eq!(failure.reason_code, GateReasonCode::MinItemsNotMet);
        assert_eq!(failure.stage, GateStage::ListRules);
    }

    #[test]
    fn test_gate_sorts_lists() {
        let out = gate(fields(&[("sizes", json!([3, 1, 2]))]));
        assert_eq!(out.fields.get("sizes"), Some(&json!([1, 2, 3])));
    }

    #[test]
    fn test_gate_closed_enum_unknown_becomes_unk() {
        let out = gate(fields(&[("sensor_type", json!("Hall Effect"))]));
        assert_eq!(out.fields.get("sensor_type"), Some(&json!("unk")));
        assert_eq!(
            out.failures[0].reason_code,
            GateReasonCode::EnumUnknownUnderClosed
        );
    }

    #[test]
    fn test_gate_canonicalizes_enum_spelling() {
        let out = gate(fields(&[("sensor_type", json!("  optical "))]));
        assert_eq!(out.fields.get("sensor_type"), Some(&json!("Optical")));
        assert!(out.failures.is_empty());
    }

    #[test]
    fn test_gate_contradiction_sets_unk_and_counts() {
        let out = gate(fields(&[("dpi", json!(64000)), ("max_dpi", json!(32000))]));
        assert_eq!(out.fields.get("dpi"), Some(&json!("unk")));
        assert_eq!(out.contradictions, 1);
        assert_eq!(
            out.failures[0].reason_code,
            GateReasonCode::ConstraintFailed
        );
    }

    #[test]
    fn test_gate_sentinel_spellings_collapse_to_unk() {
        let out = gate(fields(&[("weight", json!("unknown"))]));
        assert_eq!(out.fields.get("weight"), Some(&json!("unk")));
    }

    #[test]
    fn test_gate_idempotent() {
        use pretty_assertions::assert_eq;

        let input = fields(&[
            ("weight_grams", json!("59.5 g")),
            ("sizes", json!(["3", "1", "1"])),
            ("sensor_type", json!("opto")),
            ("dpi", json!(64000)),
            ("max_dpi", json!(32000)),
        ]);
        let once = gate(input);
        let twice = engine().apply_runtime_gate(GateInput {
            fields: once.fields.clone(),
            field_order: Vec::new(),
        });
        assert_eq!(once.fields, twice.fields);
    }

    #[test]
    fn test_unknown_fields_pass_through() {
        let out = gate(fields(&[("mystery", json!("anything"))]));
        assert_eq!(out.fields.get("mystery"), Some(&json!("anything")));
        assert!(out.failures.is_empty());
    }

    mod gate_laws {
        use super::*;
        use proptest::prelude::*;

        fn arb_value() -> impl Strategy<Value = Value> {
            prop_oneof![
                (10.0f64..500.0).prop_map(|n| json!(format!("{n:.1}"))),
                "[a-z]{1,8}( [a-z]{1,8})?".prop_map(Value::String),
                Just(json!("unk")),
                Just(json!("unknown")),
                prop::collection::vec(1u32..50, 0..5).prop_map(|v| json!(v)),
            ]
        }

        proptest! {
            #[test]
            fn gate_is_idempotent(
                weight in arb_value(),
                sizes in arb_value(),
                sensor in arb_value(),
            ) {
                let input = fields(&[
                    ("weight", weight),
                    ("sizes", sizes),
                    ("sensor_type", sensor),
                ]);
                let once = gate(input);
                let twice = engine().apply_runtime_gate(GateInput {
                    fields: once.fields.clone(),
                    field_order: Vec::new(),
                });
                prop_assert_eq!(once.fields, twice.fields);
            }
        }
    }
}
