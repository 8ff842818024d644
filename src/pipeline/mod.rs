//! Candidate pipeline: page data in, identity-gated scored candidates out,
//! merged into per-field provenance.
//!
//! Stages run in order: surface extraction, identity check, identity gate,
//! normalize+score, dedup, provenance merge. Failures are per-candidate and
//! never fatal to a source.

mod extract;
mod gate;
mod merge;
mod process;
mod score;
mod types;

pub use extract::{derive_source_identity, extract_surfaces, normalize_units_in_place};
pub use gate::apply_identity_gate;
pub use merge::{merge_into_provenance, value_hash};
pub use process::{build_source_candidates, source_id_for};
pub use score::{
    confidence_from_score, fold_key, match_field, plausibility, score_candidate, FieldMatch,
    PLAUSIBILITY_BOUND,
};
pub use types::{
    Candidate, CandidateEvidence, DroppedCandidate, EvidenceRef, ExtractionMethod,
    ProductProvenance, ProvenanceEntry, RawExtraction, RejectedSource, Snippet, SourceCandidates,
    Surface,
};
