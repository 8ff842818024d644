//! Field rules engine: compiled per-category contracts and the runtime gate.
//!
//! The compiler (external) produces a bundle of artifacts per category; this
//! module loads that bundle into an immutable [`FieldRulesEngine`] and exposes
//! normalization, migration, constraint evaluation, and the final runtime
//! gate applied before publish.

mod constraints;
mod engine;
mod normalize;
mod types;

pub use constraints::{evaluate_constraint, ConstraintOutcome};
pub use engine::{
    FieldRulesEngine, GateChange, GateFailure, GateInput, GateOutput, GateReasonCode, GateStage,
};
pub use normalize::{
    dedupe_items, json_number, normalize_candidate, renormalize_value, sort_items,
    NormalizeFailureCode, NormalizeOutcome,
};
pub use types::{
    is_known_value, normalize_for_compare, Availability, ComparisonOp, ConstraintPredicate,
    Contract, Difficulty, EnumPolicy, EvidencePolicy, FieldRule, KeyMigrations, KnownValueSet,
    ListRules, NumericRange, RequiredLevel, RuleBundle, SearchHints, Shape, SortOrder, UiField,
    ValueType, BUNDLE_VERSION, SENTINELS, UNK,
};
