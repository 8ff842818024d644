//! Review state: shared accept/confirm lanes for human and automated review,
//! enum-policy transitions, and component-identity merges.

mod schema;
mod store;
mod types;

pub use schema::{initialize_schema, is_initialized, SCHEMA_VERSION};
pub use store::ReviewStore;
pub use types::{
    ComponentIdentity, ConfirmStatus, LaneAction, MergeReport, ReviewKey, ReviewRow, TargetKind,
};
