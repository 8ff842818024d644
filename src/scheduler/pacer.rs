//! Per-host fetch pacing.

use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

/// Per-host minimum inter-fetch spacing.
///
/// Slot reservation happens under one lock, so concurrent workers targeting
/// the same host serialize onto evenly spaced slots; workers on other hosts
/// are unaffected.
#[derive(Debug, Default)]
pub struct HostPacer {
    next_slot: Mutex<HashMap<String, Instant>>,
}

impl HostPacer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve the next fetch slot for a host and wait until it arrives.
    /// Returns how long the caller waited.
    pub async fn acquire(&self, host: &str, min_delay: Duration) -> Duration {
        let slot = {
            let mut slots = self.next_slot.lock().await;
            let now = Instant::now();
            let slot = match slots.get(host) {
                Some(next) if *next > now => *next,
                _ => now,
            };
            slots.insert(host.to_string(), slot + min_delay);
            slot
        };

        let now = Instant::now();
        if slot > now {
            let wait = slot - now;
            tokio::time::sleep_until(slot).await;
            wait
        } else {
            Duration::ZERO
        }
    }
}
