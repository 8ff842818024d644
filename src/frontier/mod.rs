//! Frontier store: durable per-URL and per-query memory.
//!
//! Keeps the engine from re-exploring known-dead or cooling-down locations
//! across runs. Cooldowns only ever grow within a reason family.

mod schema;
mod store;

pub use schema::{initialize_schema, is_initialized, SCHEMA_VERSION};
pub use store::{
    query_hash, Cooldown, FrontierRow, FrontierStore, RecordFetch, SkipCheck, REASON_403_BACKOFF,
    REASON_404_GONE, SKIP_COOLDOWN, SKIP_PATH_DEAD,
};
