//! Learning stores: durable per-field/domain/URL memory with age decay.

mod schema;
mod store;

pub use schema::{initialize_schema, is_initialized, SCHEMA_VERSION};
pub use store::{decay_status, DecayStatus, DomainYield, LearningHints, LearningStore};
