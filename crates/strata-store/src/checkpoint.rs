//! Checkpoint records for pause/resume/recovery

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strata_core::{OrchestrationRun, RunState, SliceOutcome};

/// Point-in-time serialization of an orchestration run.
///
/// Carries the run itself (slices with payloads included) plus the outcomes
/// of completed slices, so a crashed process can reconstruct the run and
/// re-enter the recorded state without repeating finished work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub run: OrchestrationRun,
    /// Outcomes recorded so far, index-ordered; completed outputs ride
    /// here so resume never re-executes a succeeded slice
    pub outcomes: Vec<SliceOutcome>,
    /// Human-readable stage name at the time of the write
    pub stage: String,
    pub created_at: DateTime<Utc>,
}

impl Checkpoint {
    pub fn of(run: &OrchestrationRun, outcomes: Vec<SliceOutcome>, stage: impl Into<String>) -> Self {
        Self {
            run: run.clone(),
            outcomes,
            stage: stage.into(),
            created_at: Utc::now(),
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run.run_id
    }

    pub fn state(&self) -> RunState {
        self.run.state
    }

    pub fn version(&self) -> u64 {
        self.run.version
    }

    /// Indexes of slices already Succeeded at checkpoint time
    pub fn completed_indexes(&self) -> Vec<usize> {
        self.outcomes
            .iter()
            .filter(|o| o.status == strata_core::SliceStatus::Succeeded)
            .map(|o| o.index)
            .collect()
    }
}

/// Filter for listing checkpoints
#[derive(Debug, Clone, Default)]
pub struct CheckpointFilter {
    pub state: Option<RunState>,
    pub since: Option<DateTime<Utc>>,
}

impl CheckpointFilter {
    pub fn with_state(mut self, state: RunState) -> Self {
        self.state = Some(state);
        self
    }

    pub fn since(mut self, since: DateTime<Utc>) -> Self {
        self.since = Some(since);
        self
    }

    pub fn matches(&self, checkpoint: &Checkpoint) -> bool {
        if let Some(state) = self.state {
            if checkpoint.state() != state {
                return false;
            }
        }
        if let Some(since) = self.since {
            if checkpoint.created_at < since {
                return false;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_core::{SliceStatus, Task};

    fn sample_run() -> OrchestrationRun {
        let mut run = OrchestrationRun::new(Task::new("test task"));
        run.state = RunState::Executing;
        run.version = 3;
        run
    }

    #[test]
    fn test_checkpoint_captures_run_state() {
        let run = sample_run();
        let cp = Checkpoint::of(&run, Vec::new(), "executing");
        assert_eq!(cp.run_id(), run.run_id);
        assert_eq!(cp.state(), RunState::Executing);
        assert_eq!(cp.version(), 3);
    }

    #[test]
    fn test_completed_indexes() {
        let run = sample_run();
        let outcomes = vec![
            SliceOutcome::succeeded(0, "s-0", serde_json::json!("a")),
            SliceOutcome::failed(1, "s-1", "boom"),
            SliceOutcome::succeeded(2, "s-2", serde_json::json!("c")),
        ];
        let cp = Checkpoint::of(&run, outcomes, "executing");
        assert_eq!(cp.completed_indexes(), vec![0, 2]);
        assert_eq!(
            cp.outcomes[1].status,
            SliceStatus::Failed,
        );
    }

    #[test]
    fn test_filter_by_state() {
        let cp = Checkpoint::of(&sample_run(), Vec::new(), "executing");
        assert!(CheckpointFilter::default()
            .with_state(RunState::Executing)
            .matches(&cp));
        assert!(!CheckpointFilter::default()
            .with_state(RunState::Paused)
            .matches(&cp));
    }

    #[test]
    fn test_filter_by_time() {
        let cp = Checkpoint::of(&sample_run(), Vec::new(), "executing");
        let past = Utc::now() - chrono::Duration::hours(1);
        let future = Utc::now() + chrono::Duration::hours(1);
        assert!(CheckpointFilter::default().since(past).matches(&cp));
        assert!(!CheckpointFilter::default().since(future).matches(&cp));
    }

    #[test]
    fn test_checkpoint_json_roundtrip() {
        let cp = Checkpoint::of(
            &sample_run(),
            vec![SliceOutcome::succeeded(0, "s-0", serde_json::json!(42))],
            "executing",
        );
        let json = serde_json::to_string(&cp).unwrap();
        let back: Checkpoint = serde_json::from_str(&json).unwrap();
        assert_eq!(back.run_id(), cp.run_id());
        assert_eq!(back.outcomes.len(), 1);
        assert_eq!(back.outcomes[0].output, Some(serde_json::json!(42)));
    }
}
