//! Event types for streaming execution progress
//!
//! Events flow one way, from the orchestrator to observers. A sink can
//! only receive events; nothing reachable from it mutates engine state.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Trait for sending execution events
///
/// This abstracts over the transport mechanism (broadcast channel, IPC
/// bridge, test collector) so the engine can be embedded anywhere.
pub trait EventSink: Send + Sync {
    /// Send an event
    ///
    /// Returns an error if the event could not be delivered (e.g., channel closed)
    fn send(&self, event: ExecutionEvent) -> Result<(), EventError>;
}

/// Error when sending events fails
#[derive(Debug, Clone)]
pub struct EventError {
    pub message: String,
}

impl std::fmt::Display for EventError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Event error: {}", self.message)
    }
}

impl std::error::Error for EventError {}

impl EventError {
    pub fn channel_closed() -> Self {
        Self {
            message: "Channel closed".to_string(),
        }
    }
}

/// Lifecycle events emitted during execution
///
/// The payload shape is the same for atomic and composite nodes; the
/// `composite` flag tells them apart.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ExecutionEvent {
    /// A node (or composite) started executing
    #[serde(rename_all = "camelCase")]
    ExecuteStart {
        node_id: String,
        execution_id: String,
        composite: bool,
    },

    /// Progress of a node or of a composite's whole run
    #[serde(rename_all = "camelCase")]
    Progress {
        node_id: String,
        execution_id: String,
        percentage: u8,
        message: Option<String>,
        composite: bool,
    },

    /// A node finished successfully
    #[serde(rename_all = "camelCase")]
    Complete {
        node_id: String,
        execution_id: String,
        duration_ms: u64,
        composite: bool,
    },

    /// A node failed after exhausting its retries
    #[serde(rename_all = "camelCase")]
    Error {
        node_id: String,
        execution_id: String,
        error: String,
        composite: bool,
    },

    /// A run was cancelled
    #[serde(rename_all = "camelCase")]
    Cancel {
        node_id: String,
        execution_id: String,
        composite: bool,
    },
}

impl ExecutionEvent {
    /// Create a progress event
    pub fn progress(
        node_id: &str,
        execution_id: &str,
        percentage: u8,
        message: Option<String>,
        composite: bool,
    ) -> Self {
        Self::Progress {
            node_id: node_id.to_string(),
            execution_id: execution_id.to_string(),
            percentage: percentage.min(100),
            message,
            composite,
        }
    }

    /// Node the event is about
    pub fn node_id(&self) -> &str {
        match self {
            Self::ExecuteStart { node_id, .. }
            | Self::Progress { node_id, .. }
            | Self::Complete { node_id, .. }
            | Self::Error { node_id, .. }
            | Self::Cancel { node_id, .. } => node_id,
        }
    }

    pub fn is_composite(&self) -> bool {
        match self {
            Self::ExecuteStart { composite, .. }
            | Self::Progress { composite, .. }
            | Self::Complete { composite, .. }
            | Self::Error { composite, .. }
            | Self::Cancel { composite, .. } => *composite,
        }
    }
}

/// A no-op event sink that discards all events
///
/// Useful for testing or when events aren't needed.
pub struct NullEventSink;

impl EventSink for NullEventSink {
    fn send(&self, _event: ExecutionEvent) -> Result<(), EventError> {
        Ok(())
    }
}

/// A vector-based event sink that collects events
///
/// Useful for testing to verify events were emitted correctly.
pub struct VecEventSink {
    events: parking_lot::Mutex<Vec<ExecutionEvent>>,
}

impl VecEventSink {
    pub fn new() -> Self {
        Self {
            events: parking_lot::Mutex::new(Vec::new()),
        }
    }

    /// Get all collected events
    pub fn events(&self) -> Vec<ExecutionEvent> {
        self.events.lock().clone()
    }

    /// Clear all collected events
    pub fn clear(&self) {
        self.events.lock().clear();
    }
}

impl Default for VecEventSink {
    fn default() -> Self {
        Self::new()
    }
}

impl EventSink for VecEventSink {
    fn send(&self, event: ExecutionEvent) -> Result<(), EventError> {
        self.events.lock().push(event);
        Ok(())
    }
}

/// Fan-out sink backed by a tokio broadcast channel
///
/// Each subscriber gets its own receiver. Slow subscribers lag and miss
/// events rather than blocking the engine.
pub struct BroadcastEventSink {
    sender: broadcast::Sender<ExecutionEvent>,
}

impl BroadcastEventSink {
    /// Create a sink whose channel buffers up to `capacity` events per subscriber
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ExecutionEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl EventSink for BroadcastEventSink {
    fn send(&self, event: ExecutionEvent) -> Result<(), EventError> {
        // No subscribers is not an error for a broadcast bus
        if self.sender.receiver_count() == 0 {
            return Ok(());
        }
        self.sender
            .send(event)
            .map(|_| ())
            .map_err(|_| EventError::channel_closed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vec_event_sink() {
        let sink = VecEventSink::new();

        sink.send(ExecutionEvent::progress("task1", "exec1", 50, Some("halfway".to_string()), false))
            .unwrap();

        let events = sink.events();
        assert_eq!(events.len(), 1);

        match &events[0] {
            ExecutionEvent::Progress { node_id, percentage, .. } => {
                assert_eq!(node_id, "task1");
                assert_eq!(*percentage, 50);
            }
            _ => panic!("Expected Progress event"),
        }

        sink.clear();
        assert!(sink.events().is_empty());
    }

    #[test]
    fn test_null_event_sink() {
        let sink = NullEventSink;
        // Should not panic
        sink.send(ExecutionEvent::progress("task1", "exec1", 100, None, true))
            .unwrap();
    }

    #[test]
    fn test_progress_percentage_capped() {
        let event = ExecutionEvent::progress("n", "e", 180, None, false);
        assert!(matches!(event, ExecutionEvent::Progress { percentage: 100, .. }));
    }

    #[test]
    fn test_event_serialization_tag() {
        let event = ExecutionEvent::Cancel {
            node_id: "root".into(),
            execution_id: "e1".into(),
            composite: true,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "cancel");
        assert_eq!(json["nodeId"], "root");
        assert_eq!(json["composite"], true);
        assert_eq!(event.node_id(), "root");
        assert!(event.is_composite());
    }

    #[tokio::test]
    async fn test_broadcast_reaches_every_subscriber() {
        let sink = BroadcastEventSink::new(16);
        let mut first = sink.subscribe();
        let mut second = sink.subscribe();
        assert_eq!(sink.subscriber_count(), 2);

        sink.send(ExecutionEvent::progress("n", "e", 10, None, false)).unwrap();

        assert_eq!(first.recv().await.unwrap().node_id(), "n");
        assert_eq!(second.recv().await.unwrap().node_id(), "n");
    }

    #[test]
    fn test_broadcast_without_subscribers_is_ok() {
        let sink = BroadcastEventSink::new(4);
        assert!(sink.send(ExecutionEvent::progress("n", "e", 0, None, false)).is_ok());
    }
}
