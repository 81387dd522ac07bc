//! Run-scoped event publication
//!
//! Each run gets its own broadcast channel, created when the run starts and
//! torn down when it terminates. Emission never blocks orchestration: a
//! slow or absent subscriber only loses its own messages.

use std::collections::HashMap;
use std::sync::RwLock;

use strata_core::OrchestrationEvent;
use tokio::sync::broadcast;
use tracing::trace;

const CHANNEL_CAPACITY: usize = 256;

/// Broadcast hub keyed by run id.
#[derive(Default)]
pub struct EventBus {
    channels: RwLock<HashMap<String, broadcast::Sender<OrchestrationEvent>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a channel for a run. Idempotent.
    pub fn register(&self, run_id: &str) {
        if let Ok(mut channels) = self.channels.write() {
            channels
                .entry(run_id.to_string())
                .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        }
    }

    /// Subscribe to a run's events. None if the run is unknown or already
    /// torn down.
    pub fn subscribe(&self, run_id: &str) -> Option<broadcast::Receiver<OrchestrationEvent>> {
        self.channels
            .read()
            .ok()
            .and_then(|channels| channels.get(run_id).map(|tx| tx.subscribe()))
    }

    /// Publish an event on its run's channel. Fire-and-forget: delivery
    /// failures (no subscribers, lagging receivers) are ignored.
    pub fn emit(&self, event: OrchestrationEvent) {
        let Ok(channels) = self.channels.read() else {
            return;
        };
        if let Some(tx) = channels.get(event.run_id()) {
            trace!(run_id = %event.run_id(), "Emitting event");
            let _ = tx.send(event);
        }
    }

    /// Tear down a run's channel once the run terminates.
    pub fn unregister(&self, run_id: &str) {
        if let Ok(mut channels) = self.channels.write() {
            channels.remove(run_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_core::{RunState, SliceStatus};

    #[tokio::test]
    async fn test_subscribers_receive_run_events() {
        let bus = EventBus::new();
        bus.register("run-1");
        let mut rx = bus.subscribe("run-1").unwrap();

        bus.emit(OrchestrationEvent::StateChanged {
            run_id: "run-1".to_string(),
            from: RunState::Created,
            to: RunState::Classifying,
        });

        let event = rx.recv().await.unwrap();
        assert!(matches!(event, OrchestrationEvent::StateChanged { .. }));
    }

    #[tokio::test]
    async fn test_events_are_scoped_to_their_run() {
        let bus = EventBus::new();
        bus.register("run-a");
        bus.register("run-b");
        let mut rx_b = bus.subscribe("run-b").unwrap();

        bus.emit(OrchestrationEvent::SliceFinished {
            run_id: "run-a".to_string(),
            slice_id: "s1".to_string(),
            index: 0,
            status: SliceStatus::Succeeded,
        });
        bus.emit(OrchestrationEvent::SliceFinished {
            run_id: "run-b".to_string(),
            slice_id: "s2".to_string(),
            index: 0,
            status: SliceStatus::Failed,
        });

        // Only run-b's event arrives on run-b's channel
        match rx_b.recv().await.unwrap() {
            OrchestrationEvent::SliceFinished { run_id, .. } => assert_eq!(run_id, "run-b"),
            other => panic!("unexpected event {:?}", other),
        }
        assert!(rx_b.try_recv().is_err());
    }

    #[test]
    fn test_emit_without_subscribers_does_not_block() {
        let bus = EventBus::new();
        bus.register("run-1");
        bus.emit(OrchestrationEvent::MilestoneReached {
            run_id: "run-1".to_string(),
            stage: "executing".to_string(),
            progress: 0.5,
        });
    }

    #[test]
    fn test_unregister_tears_down_channel() {
        let bus = EventBus::new();
        bus.register("run-1");
        assert!(bus.subscribe("run-1").is_some());

        bus.unregister("run-1");
        assert!(bus.subscribe("run-1").is_none());
    }
}
