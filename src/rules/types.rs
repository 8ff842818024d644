//! Types for the compiled field-rule bundle.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// Reserved sentinel meaning "value unknown"; never equal to a legitimate
/// value.
pub const UNK: &str = "unk";

/// Strings treated as "not a known value" alongside empty.
pub const SENTINELS: &[&str] = &["unk", "unknown", "n/a", "na", "none", "null", ""];

/// True iff a value is known: non-empty and not a sentinel.
pub fn is_known_value(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::String(s) => !SENTINELS.contains(&s.trim().to_ascii_lowercase().as_str()),
        Value::Array(items) => !items.is_empty(),
        _ => true,
    }
}

/// How strictly a field is required, from most to least.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequiredLevel {
    /// Part of the product identity itself
    Identity,
    /// Must be present and highly confident
    Critical,
    /// Must be present
    Required,
    /// Should usually be present
    Expected,
    /// Nice to have
    Optional,
}

impl RequiredLevel {
    /// Default pass target (minimum effective confidence) for the level.
    pub fn pass_target(self) -> f64 {
        match self {
            Self::Identity => 0.9,
            Self::Critical => 0.85,
            Self::Required => 0.8,
            Self::Expected => 0.75,
            Self::Optional => 0.6,
        }
    }

    /// Need-score weight for the level.
    pub fn weight(self) -> f64 {
        match self {
            Self::Identity => 4.0,
            Self::Critical => 3.0,
            Self::Required => 2.0,
            Self::Expected => 1.0,
            Self::Optional => 0.5,
        }
    }

    /// Whether the level participates in the NeedSet at all.
    pub fn needset_eligible(self) -> bool {
        matches!(self, Self::Critical | Self::Required | Self::Expected)
    }
}

/// How hard a field typically is to source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Difficulty {
    Easy,
    Medium,
    Hard,
    VeryHard,
    ExtraHard,
}

impl Difficulty {
    /// Effort multiplier applied to the need score.
    pub fn effort_multiplier(self) -> f64 {
        match self {
            Self::Easy => 1.0,
            Self::Medium => 1.15,
            Self::Hard => 1.35,
            Self::VeryHard => 1.6,
            Self::ExtraHard => 2.0,
        }
    }
}

/// How often sources disclose a field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Availability {
    Always,
    Expected,
    Sometimes,
    Rare,
    Unknown,
}

impl Availability {
    /// Search-effort multiplier applied to the need score.
    pub fn multiplier(self) -> f64 {
        match self {
            Self::Always | Self::Expected => 1.0,
            Self::Sometimes => 0.85,
            Self::Rare => 0.6,
            Self::Unknown => 0.9,
        }
    }
}

/// Value type of a field contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueType {
    Number,
    String,
    Enum,
    Bool,
    Date,
}

/// Scalar or list shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Shape {
    Scalar,
    List,
}

/// Sort order applied to list fields at the runtime gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortOrder {
    None,
    Asc,
    Desc,
}

impl Default for SortOrder {
    fn default() -> Self {
        Self::None
    }
}

/// Rules applied to list-shaped fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListRules {
    /// Drop duplicate items (whitespace-normalized, lowercased comparison)
    #[serde(default)]
    pub dedupe: bool,
    /// Sort applied at the runtime gate, not at normalization
    #[serde(default)]
    pub sort: SortOrder,
    /// Minimum item count enforced at the runtime gate
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_items: Option<usize>,
    /// Maximum item count; excess is truncated at the runtime gate
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_items: Option<usize>,
}

impl Default for ListRules {
    fn default() -> Self {
        Self {
            dedupe: true,
            sort: SortOrder::None,
            min_items: None,
            max_items: None,
        }
    }
}

/// Inclusive numeric range.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct NumericRange {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max: Option<f64>,
}

impl NumericRange {
    /// True when the value lies inside the range.
    pub fn contains(&self, value: f64) -> bool {
        self.min.map_or(true, |m| value >= m) && self.max.map_or(true, |m| value <= m)
    }
}

/// Per-field value contract.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Contract {
    /// Value type
    #[serde(rename = "type")]
    pub value_type: ValueType,
    /// Scalar or list
    pub shape: Shape,
    /// Canonical unit values are stored in, e.g. "g", "mm", "hz"
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
    /// Plausible numeric range
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub range: Option<NumericRange>,
    /// List handling, for list-shaped fields
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub list_rules: Option<ListRules>,
}

/// Evidence requirements for a field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvidencePolicy {
    /// Whether evidence quotes are mandatory
    #[serde(default)]
    pub required: bool,
    /// Minimum evidence references before the field can pass
    #[serde(default = "default_min_refs")]
    pub min_evidence_refs: u32,
    /// Distinct root domains required, when diversity matters
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub distinct_sources_required: Option<u32>,
}

fn default_min_refs() -> u32 {
    1
}

impl Default for EvidencePolicy {
    fn default() -> Self {
        Self {
            required: false,
            min_evidence_refs: 1,
            distinct_sources_required: None,
        }
    }
}

/// Comparison operators usable in constraints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ComparisonOp {
    #[serde(rename = ">=")]
    Ge,
    #[serde(rename = "<=")]
    Le,
    #[serde(rename = "==")]
    Eq,
    #[serde(rename = "!=")]
    Ne,
    #[serde(rename = "<")]
    Lt,
    #[serde(rename = ">")]
    Gt,
}

impl ComparisonOp {
    /// Evaluate over an ordering-and-equality pair.
    pub fn eval_f64(self, left: f64, right: f64) -> bool {
        match self {
            Self::Ge => left >= right,
            Self::Le => left <= right,
            Self::Eq => (left - right).abs() < f64::EPSILON,
            Self::Ne => (left - right).abs() >= f64::EPSILON,
            Self::Lt => left < right,
            Self::Gt => left > right,
        }
    }

    /// Evaluate over normalized strings.
    pub fn eval_str(self, left: &str, right: &str) -> bool {
        match self {
            Self::Ge => left >= right,
            Self::Le => left <= right,
            Self::Eq => left == right,
            Self::Ne => left != right,
            Self::Lt => left < right,
            Self::Gt => left > right,
        }
    }
}

/// A logical predicate over product/component values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ConstraintPredicate {
    /// `field <op> literal`
    Comparison {
        field: String,
        op: ComparisonOp,
        value: Value,
    },
    /// `field requires other`: if `field` is known and non-unk, `other` must
    /// be known
    Requires { field: String, requires: String },
    /// `left <op> right` across two fields
    CrossField {
        left: String,
        op: ComparisonOp,
        right: String,
    },
}

impl ConstraintPredicate {
    /// The field a gate failure is attributed to.
    pub fn subject_field(&self) -> &str {
        match self {
            Self::Comparison { field, .. } | Self::Requires { field, .. } => field,
            Self::CrossField { left, .. } => left,
        }
    }
}

/// Retrieval hints attached to a field rule.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SearchHints {
    /// Phrases that tend to sit next to the value on a page
    #[serde(default)]
    pub anchor_phrases: Vec<String>,
    /// Terms appended to retrieval queries
    #[serde(default)]
    pub query_terms: Vec<String>,
    /// Units the value is usually quoted in
    #[serde(default)]
    pub expected_units: Vec<String>,
}

/// A compiled per-field rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldRule {
    /// Key the field is stored under
    pub field_key: String,
    pub required_level: RequiredLevel,
    pub difficulty: Difficulty,
    pub availability: Availability,
    pub contract: Contract,
    #[serde(default)]
    pub evidence: EvidencePolicy,
    #[serde(default)]
    pub constraints: Vec<ConstraintPredicate>,
    #[serde(default)]
    pub search_hints: SearchHints,
}

impl FieldRule {
    /// Scalar rule with the given type; expected-level, easy, sometimes.
    pub fn new(field_key: impl Into<String>, value_type: ValueType) -> Self {
        Self {
            field_key: field_key.into(),
            required_level: RequiredLevel::Expected,
            difficulty: Difficulty::Easy,
            availability: Availability::Sometimes,
            contract: Contract {
                value_type,
                shape: Shape::Scalar,
                unit: None,
                range: None,
                list_rules: None,
            },
            evidence: EvidencePolicy::default(),
            constraints: Vec::new(),
            search_hints: SearchHints::default(),
        }
    }

    /// Switch the rule to list shape with the given list rules.
    pub fn as_list(mut self, list_rules: ListRules) -> Self {
        self.contract.shape = Shape::List;
        self.contract.list_rules = Some(list_rules);
        self
    }

    pub fn with_level(mut self, level: RequiredLevel) -> Self {
        self.required_level = level;
        self
    }

    pub fn with_difficulty(mut self, difficulty: Difficulty) -> Self {
        self.difficulty = difficulty;
        self
    }

    pub fn with_availability(mut self, availability: Availability) -> Self {
        self.availability = availability;
        self
    }

    pub fn with_unit(mut self, unit: impl Into<String>) -> Self {
        self.contract.unit = Some(unit.into());
        self
    }

    pub fn with_range(mut self, min: f64, max: f64) -> Self {
        self.contract.range = Some(NumericRange {
            min: Some(min),
            max: Some(max),
        });
        self
    }

    pub fn with_constraint(mut self, predicate: ConstraintPredicate) -> Self {
        self.constraints.push(predicate);
        self
    }

    pub fn with_anchor(mut self, phrase: impl Into<String>) -> Self {
        self.search_hints.anchor_phrases.push(phrase.into());
        self
    }

    pub fn with_evidence(mut self, evidence: EvidencePolicy) -> Self {
        self.evidence = evidence;
        self
    }

    /// Pass target for the field (level default; no per-field override in the
    /// compiled bundle yet).
    pub fn pass_target(&self) -> f64 {
        self.required_level.pass_target()
    }
}

/// Enum acceptance policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnumPolicy {
    /// Unknown values are flagged `needs_review`
    Closed,
    /// Unknown values are accepted as suggestions
    OpenPreferKnown,
    /// Everything is accepted
    Open,
}

/// Known values for one enum field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KnownValueSet {
    /// Canonical spellings
    pub canonical: Vec<String>,
    /// Synonym -> canonical mapping, lowercased keys
    #[serde(default)]
    pub synonyms: HashMap<String, String>,
    /// Acceptance policy for the field
    pub policy: EnumPolicy,
}

impl KnownValueSet {
    /// Closed set over the given canonical values.
    pub fn closed(canonical: &[&str]) -> Self {
        Self {
            canonical: canonical.iter().map(|s| s.to_string()).collect(),
            synonyms: HashMap::new(),
            policy: EnumPolicy::Closed,
        }
    }

    /// Add a synonym for a canonical value.
    pub fn with_synonym(mut self, synonym: &str, canonical: &str) -> Self {
        self.synonyms
            .insert(synonym.to_ascii_lowercase(), canonical.to_string());
        self
    }

    /// Canonical form for a raw value, if the value is known.
    pub fn canonicalize(&self, raw: &str) -> Option<String> {
        let folded = normalize_for_compare(raw);
        for c in &self.canonical {
            if normalize_for_compare(c) == folded {
                return Some(c.clone());
            }
        }
        self.synonyms.get(&folded).cloned()
    }

    /// Whether a raw value is in the known set (canonical or synonym).
    pub fn contains(&self, raw: &str) -> bool {
        self.canonicalize(raw).is_some()
    }
}

/// Whitespace-collapsed, lowercased comparison form.
pub fn normalize_for_compare(raw: &str) -> String {
    raw.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Field-key renames applied by `apply_migrations`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct KeyMigrations {
    /// old key -> new key
    #[serde(default)]
    pub key_map: HashMap<String, String>,
}

/// UI catalog entry for one field; carries display order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UiField {
    pub field_key: String,
    pub label: String,
    #[serde(default)]
    pub group: Option<String>,
}

/// The compiled rule bundle for one category.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleBundle {
    /// Compiler format version; must match [`BUNDLE_VERSION`]
    pub version: String,
    pub field_rules: HashMap<String, FieldRule>,
    #[serde(default)]
    pub known_values: HashMap<String, KnownValueSet>,
    /// Per-field regex templates with one capture group
    #[serde(default)]
    pub parse_templates: HashMap<String, Vec<String>>,
    /// Category-wide constraints, evaluated after per-field ones
    #[serde(default)]
    pub cross_validation_rules: Vec<ConstraintPredicate>,
    #[serde(default)]
    pub key_migrations: KeyMigrations,
    #[serde(default)]
    pub ui_field_catalog: Vec<UiField>,
}

/// Bundle format version this engine understands.
pub const BUNDLE_VERSION: &str = "3";

impl RuleBundle {
    /// Empty bundle at the current version; test and embedder convenience.
    pub fn empty() -> Self {
        Self {
            version: BUNDLE_VERSION.to_string(),
            field_rules: HashMap::new(),
            known_values: HashMap::new(),
            parse_templates: HashMap::new(),
            cross_validation_rules: Vec::new(),
            key_migrations: KeyMigrations::default(),
            ui_field_catalog: Vec::new(),
        }
    }

    /// Add a field rule.
    pub fn with_rule(mut self, rule: FieldRule) -> Self {
        self.field_rules.insert(rule.field_key.clone(), rule);
        self
    }

    /// Add a known-value set for an enum field.
    pub fn with_known_values(mut self, field: &str, set: KnownValueSet) -> Self {
        self.known_values.insert(field.to_string(), set);
        self
    }

    /// Add a key migration.
    pub fn with_migration(mut self, from: &str, to: &str) -> Self {
        self.key_migrations
            .key_map
            .insert(from.to_string(), to.to_string());
        self
    }

    /// Display/evaluation order: the UI catalog order, then any remaining
    /// fields sorted by key.
    pub fn field_order(&self) -> Vec<String> {
        let mut order: Vec<String> = self
            .ui_field_catalog
            .iter()
            .map(|f| f.field_key.clone())
            .collect();
        let mut rest: Vec<String> = self
            .field_rules
            .keys()
            .filter(|k| !order.contains(*k))
            .cloned()
            .collect();
        rest.sort();
        order.extend(rest);
        order
    }
}
