//! Fire-and-forget notification seam
//!
//! Saga compensation triggers and Enterprise-tier milestones are surfaced
//! to a `Notifier` for human-in-the-loop approval. Delivery is best-effort:
//! the orchestrator spawns the call and never blocks on confirmation.

use async_trait::async_trait;
use strata_core::OrchestrationEvent;
use tracing::info;

/// Optional external notification sink.
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Deliver one event. Errors are the implementation's problem; the
    /// orchestrator never observes them.
    async fn notify(&self, event: OrchestrationEvent);
}

/// Notifier that writes events to the tracing log.
#[derive(Debug, Clone, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, event: OrchestrationEvent) {
        match &event {
            OrchestrationEvent::CompensationTriggered { run_id, failed_step } => {
                info!(%run_id, failed_step, "Saga compensation triggered");
            }
            OrchestrationEvent::MilestoneReached {
                run_id,
                stage,
                progress,
            } => {
                info!(%run_id, %stage, progress, "Milestone reached");
            }
            OrchestrationEvent::StateChanged { run_id, from, to } => {
                info!(%run_id, %from, %to, "Run state changed");
            }
            OrchestrationEvent::SliceFinished {
                run_id,
                slice_id,
                index,
                status,
            } => {
                info!(%run_id, %slice_id, index, %status, "Slice finished");
            }
        }
    }
}
