//! Harvest event types for observable run execution.
//!
//! Components emit a stream of events that consumers can render, batch into
//! `_runtime/metrics.jsonl`, or replay for analysis. The library never
//! installs a subscriber; sinks are plain channels.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use tokio::sync::mpsc::UnboundedSender;

/// Types of events emitted during a harvest run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HarvestEventType {
    /// Scheduler worker picked up a source
    SchedulerTick,
    /// Worker is waiting on the per-host pacer
    SchedulerHostWait,
    /// Fallback to the next fetch mode started
    SchedulerFallbackStarted,
    /// A fallback mode produced a usable result
    SchedulerFallbackSucceeded,
    /// All fetch modes failed for a source
    SchedulerFallbackExhausted,
    /// The drain finished; queue exhausted
    SchedulerDrainCompleted,
    /// A round began
    RoundStarted,
    /// A round finished and was merged
    RoundCompleted,
    /// NeedSet recomputed
    NeedsetComputed,
    /// A stop condition fired
    StopConditionFired,
    /// The run spec was promoted to the published slot
    SpecPromoted,
    /// The run spec did not beat the published summary
    SpecNotPromoted,
}

impl std::fmt::Display for HarvestEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::SchedulerTick => "scheduler_tick",
            Self::SchedulerHostWait => "scheduler_host_wait",
            Self::SchedulerFallbackStarted => "scheduler_fallback_started",
            Self::SchedulerFallbackSucceeded => "scheduler_fallback_succeeded",
            Self::SchedulerFallbackExhausted => "scheduler_fallback_exhausted",
            Self::SchedulerDrainCompleted => "scheduler_drain_completed",
            Self::RoundStarted => "round_started",
            Self::RoundCompleted => "round_completed",
            Self::NeedsetComputed => "needset_computed",
            Self::StopConditionFired => "stop_condition_fired",
            Self::SpecPromoted => "spec_promoted",
            Self::SpecNotPromoted => "spec_not_promoted",
        };
        write!(f, "{}", s)
    }
}

/// An event emitted during a harvest run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HarvestEvent {
    /// Type of the event
    pub event_type: HarvestEventType,
    /// Round index the event belongs to (0-based)
    pub round: u32,
    /// Human-readable description
    pub content: String,
    /// Event-specific metadata
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<HashMap<String, Value>>,
    /// When the event occurred
    pub timestamp: DateTime<Utc>,
}

impl HarvestEvent {
    /// Create a new event.
    pub fn new(event_type: HarvestEventType, round: u32, content: impl Into<String>) -> Self {
        Self {
            event_type,
            round,
            content: content.into(),
            metadata: None,
            timestamp: Utc::now(),
        }
    }

    /// Add a metadata entry to the event.
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata
            .get_or_insert_with(HashMap::new)
            .insert(key.into(), value.into());
        self
    }
}

/// Cheap cloneable sink for harvest events.
///
/// A disconnected or absent receiver is fine; sends are fire-and-forget.
#[derive(Debug, Clone, Default)]
pub struct EventSink {
    tx: Option<UnboundedSender<HarvestEvent>>,
}

impl EventSink {
    /// Sink that drops every event.
    pub fn disabled() -> Self {
        Self { tx: None }
    }

    /// Sink backed by an unbounded channel sender.
    pub fn channel(tx: UnboundedSender<HarvestEvent>) -> Self {
        Self { tx: Some(tx) }
    }

    /// Emit an event. Never fails.
    pub fn emit(&self, event: HarvestEvent) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_serialization_uses_snake_case() {
        let event = HarvestEvent::new(
            HarvestEventType::SchedulerFallbackStarted,
            2,
            "escalating a.com to playwright",
        )
        .with_metadata("host", "a.com");

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event_type"], "scheduler_fallback_started");
        assert_eq!(json["round"], 2);
        assert_eq!(json["metadata"]["host"], "a.com");
    }

    #[test]
    fn test_disabled_sink_is_silent() {
        let sink = EventSink::disabled();
        sink.emit(HarvestEvent::new(
            HarvestEventType::SchedulerTick,
            0,
            "tick",
        ));
    }

    #[tokio::test]
    async fn test_channel_sink_delivers() {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let sink = EventSink::channel(tx);
        sink.emit(HarvestEvent::new(
            HarvestEventType::SchedulerDrainCompleted,
            1,
            "drain done",
        ));
        let got = rx.recv().await.unwrap();
        assert_eq!(got.event_type, HarvestEventType::SchedulerDrainCompleted);
    }
}
