//! NeedSet and convergence: what still needs work, and when to stop.

mod decay;
mod engine;
mod query;
mod types;

pub use decay::decay_factor;
pub use engine::{
    build_snapshot, compute_need_set, decide_stop, effective_confidence, evaluate_round_progress,
    StopInputs,
};
pub use query::build_retrieval_query;
pub use types::{NeedSetRow, Progress, ProgressReason, RoundContext, RoundSnapshot, StopReason};
