//! Typed event bus
//!
//! The core emits a closed set of event variants over a multi-producer,
//! multi-subscriber broadcast channel. Subscribers pattern-match on the
//! variants; the wire names stay stable for external log consumers.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

// ============================================================================
// EVENT VARIANTS
// ============================================================================

/// Events emitted by the memory core
#[non_exhaustive]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum MemoryEvent {
    /// Nidra moved between sleep phases
    NidraStateChange {
        from: String,
        to: String,
        at: DateTime<Utc>,
    },
    /// Periodic liveness beat for the current Nidra phase
    NidraHeartbeat { state: String, at: DateTime<Utc> },
    /// The dream handler is about to run
    NidraConsolidationStart { at: DateTime<Utc> },
    /// The dream handler finished (or was cancelled)
    NidraConsolidationEnd {
        at: DateTime<Utc>,
        cancelled: bool,
    },
    /// The dominant rasa changed
    RasaShift {
        from: String,
        to: String,
        at: DateTime<Utc>,
    },
    /// A summary or memory was embedded and upserted into the vector store
    MemoryIndexed {
        source_type: String,
        source_id: String,
        at: DateTime<Utc>,
    },
    /// A daily consolidation file was written
    DayWritten {
        date: NaiveDate,
        sessions_processed: usize,
        at: DateTime<Utc>,
    },
}

impl MemoryEvent {
    /// Stable wire name of the variant
    pub fn name(&self) -> &'static str {
        match self {
            MemoryEvent::NidraStateChange { .. } => "nidra:state_change",
            MemoryEvent::NidraHeartbeat { .. } => "nidra:heartbeat",
            MemoryEvent::NidraConsolidationStart { .. } => "nidra:consolidation_start",
            MemoryEvent::NidraConsolidationEnd { .. } => "nidra:consolidation_end",
            MemoryEvent::RasaShift { .. } => "nava_rasa:rasa_shift",
            MemoryEvent::MemoryIndexed { .. } => "memory:indexed",
            MemoryEvent::DayWritten { .. } => "consolidation:day_written",
        }
    }
}

// ============================================================================
// EVENT BUS
// ============================================================================

/// Broadcast bus carrying [`MemoryEvent`]s
///
/// Cloning is cheap; all clones share the same channel. Emitting with no
/// subscribers is not an error.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<MemoryEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

impl EventBus {
    /// Create a bus with the given per-subscriber buffer capacity
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Emit an event to all current subscribers
    pub fn emit(&self, event: MemoryEvent) {
        tracing::debug!(event = event.name(), "emit");
        let _ = self.sender.send(event);
    }

    /// Subscribe to future events
    pub fn subscribe(&self) -> broadcast::Receiver<MemoryEvent> {
        self.sender.subscribe()
    }

    /// Number of live subscribers
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_names_stable() {
        let at = Utc::now();
        let cases = [
            (
                MemoryEvent::NidraStateChange {
                    from: "listening".into(),
                    to: "dreaming".into(),
                    at,
                },
                "nidra:state_change",
            ),
            (
                MemoryEvent::NidraHeartbeat {
                    state: "listening".into(),
                    at,
                },
                "nidra:heartbeat",
            ),
            (
                MemoryEvent::RasaShift {
                    from: "shanta".into(),
                    to: "veera".into(),
                    at,
                },
                "nava_rasa:rasa_shift",
            ),
            (
                MemoryEvent::MemoryIndexed {
                    source_type: "daily_summary".into(),
                    source_id: "2025-06-15".into(),
                    at,
                },
                "memory:indexed",
            ),
        ];
        for (event, name) in cases {
            assert_eq!(event.name(), name);
        }
    }

    #[tokio::test]
    async fn test_bus_delivers_to_subscriber() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();
        bus.emit(MemoryEvent::NidraHeartbeat {
            state: "listening".into(),
            at: Utc::now(),
        });
        let got = rx.recv().await.unwrap();
        assert_eq!(got.name(), "nidra:heartbeat");
    }

    #[test]
    fn test_emit_without_subscribers_is_ok() {
        let bus = EventBus::default();
        bus.emit(MemoryEvent::NidraConsolidationStart { at: Utc::now() });
        assert_eq!(bus.subscriber_count(), 0);
    }
}
