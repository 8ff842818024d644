//! Evidence age decay.

use chrono::{DateTime, Utc};

/// Exponential half-life decay for one evidence row.
///
/// `clamp(2^(-age_days/decay_days), floor, 1.0)`; a missing or unparseable
/// timestamp decays not at all.
pub fn decay_factor(
    retrieved_at: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    decay_days: f64,
    decay_floor: f64,
) -> f64 {
    let Some(retrieved_at) = retrieved_at else {
        return 1.0;
    };
    if decay_days <= 0.0 {
        return 1.0;
    }
    let age_days = now.signed_duration_since(retrieved_at).num_seconds() as f64 / 86_400.0;
    if age_days <= 0.0 {
        return 1.0;
    }
    let decay = 2f64.powf(-age_days / decay_days);
    decay.clamp(decay_floor.min(1.0), 1.0)
}
