//! Fetch scheduler: bounded workers, per-host pacing, mode fallback.
//!
//! The scheduler owns no policy about *what* to fetch; it drains whatever
//! the planner emitted and reports what happened per URL.

mod drain;
mod pacer;
mod types;

pub use drain::{drain_queue, skip_none, DrainOptions, SkipFn};
pub use pacer::HostPacer;
pub use types::{
    classify_error, classify_status, is_dead_status, DrainStats, FetchOutcome, FetchResult,
    FetchYield,
};
