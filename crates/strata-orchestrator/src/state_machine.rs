//! Pure state machine for run control flow
//!
//! This module implements a pure functional state machine with NO I/O.
//! All state transitions are deterministic and testable.
//!
//! Key design principles:
//! - Pure function: transition(state, event) -> (state, actions)
//! - No async, no I/O
//! - Invalid transitions go to Failed state (never panic)
//! - Pausing boxes the prior state so resume restores it exactly

use strata_core::{ComplexityTier, Pattern, RunState};

/// Orchestration run state
#[derive(Debug, Clone, PartialEq)]
pub enum State {
    /// Run accepted, nothing started yet
    Created,
    /// Classifying the root task's complexity
    Classifying { task_id: String },
    /// Decomposing the task into slices
    Decomposing { tier: ComplexityTier, depth: u32 },
    /// Validating capacity and choosing a pattern for the slice batch
    Scheduling { slice_count: usize },
    /// Slices executing under a pattern; `pattern` is None for an atomic
    /// task that runs as a single slice
    Executing {
        pattern: Option<Pattern>,
        total_slices: usize,
    },
    /// Combining slice outcomes and applying the failure policy
    Aggregating {
        pattern: Option<Pattern>,
        failed: usize,
        total: usize,
    },
    /// Suspended; the boxed state is restored verbatim on resume
    Paused { prior: Box<State> },
    /// Terminal: run completed acceptably
    Succeeded { summary: String },
    /// Terminal: run failed with error context
    Failed { error: String },
    /// Terminal: run cancelled by request
    Cancelled,
}

impl State {
    /// Named state as persisted in checkpoints
    pub fn run_state(&self) -> RunState {
        match self {
            Self::Created => RunState::Created,
            Self::Classifying { .. } => RunState::Classifying,
            Self::Decomposing { .. } => RunState::Decomposing,
            Self::Scheduling { .. } => RunState::Scheduling,
            Self::Executing { .. } => RunState::Executing,
            Self::Aggregating { .. } => RunState::Aggregating,
            Self::Paused { .. } => RunState::Paused,
            Self::Succeeded { .. } => RunState::Succeeded,
            Self::Failed { .. } => RunState::Failed,
            Self::Cancelled => RunState::Cancelled,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.run_state().is_terminal()
    }
}

/// Events that drive state transitions
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    /// Begin orchestrating the root task
    Start { task_id: String },
    /// Classification finished
    Classified { tier: ComplexityTier, depth: u32 },
    /// Decomposition produced a slice batch
    Decomposed { slice_count: usize },
    /// The task could not be decomposed; treat it as atomic
    DecompositionUnavailable,
    /// Capacity was validated and a pattern chosen
    CapacityValidated { pattern: Pattern },
    /// All slices reached a terminal status (or pause stopped scheduling)
    ExecutionFinished { failed: usize, total: usize },
    /// Aggregation accepted the outcome set under the failure policy
    AggregationAccepted { summary: String },
    /// Aggregation rejected the outcome set
    AggregationRejected { error: String },
    /// Operator requested a pause
    PauseRequested,
    /// Operator requested a resume
    ResumeRequested,
    /// Operator requested cancellation
    CancelRequested,
    /// Unrecoverable error
    Error { message: String },
}

/// Side effects the orchestrator must execute after a transition
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    /// Persist a checkpoint before acting on the new state
    WriteCheckpoint { stage: String },
    /// Publish a state-change event on the run's channel
    EmitStateChange { from: RunState, to: RunState },
    /// Release any capacity still held for the run
    ReleaseCapacity,
    /// Log activity
    LogActivity { message: String },
}

fn advance(from: &State, to: State, mut extra: Vec<Action>) -> (State, Vec<Action>) {
    let mut actions = vec![
        Action::WriteCheckpoint {
            stage: to.run_state().to_string(),
        },
        Action::EmitStateChange {
            from: from.run_state(),
            to: to.run_state(),
        },
    ];
    actions.append(&mut extra);
    (to, actions)
}

/// Pure state transition function
///
/// Takes current state and event, returns new state and actions to execute.
/// This function is completely deterministic and has no side effects.
///
/// # Invalid Transitions
/// Any invalid transition results in a Failed state with descriptive error.
/// This function never panics.
pub fn transition(state: State, event: Event) -> (State, Vec<Action>) {
    match (state, event) {
        (s @ State::Created, Event::Start { task_id }) => {
            let log = Action::LogActivity {
                message: format!("Classifying task {}", task_id),
            };
            advance(&s, State::Classifying { task_id }, vec![log])
        }

        (s @ State::Classifying { .. }, Event::Classified { tier, depth }) => {
            if depth == 0 {
                // Atomic task: skip decomposition and scheduling, execute
                // the task as a single slice
                let log = Action::LogActivity {
                    message: format!("Task is {}, executing directly", tier),
                };
                advance(
                    &s,
                    State::Executing {
                        pattern: None,
                        total_slices: 1,
                    },
                    vec![log],
                )
            } else {
                let log = Action::LogActivity {
                    message: format!("Task is {}, decomposing to depth {}", tier, depth),
                };
                advance(&s, State::Decomposing { tier, depth }, vec![log])
            }
        }

        (s @ State::Decomposing { .. }, Event::Decomposed { slice_count }) => {
            if slice_count == 0 {
                advance(
                    &s,
                    State::Executing {
                        pattern: None,
                        total_slices: 1,
                    },
                    vec![Action::LogActivity {
                        message: "Decomposition produced no slices, treating as atomic"
                            .to_string(),
                    }],
                )
            } else {
                let log = Action::LogActivity {
                    message: format!("Decomposed into {} slices", slice_count),
                };
                advance(&s, State::Scheduling { slice_count }, vec![log])
            }
        }

        (s @ State::Decomposing { .. }, Event::DecompositionUnavailable) => advance(
            &s,
            State::Executing {
                pattern: None,
                total_slices: 1,
            },
            vec![Action::LogActivity {
                message: "Task cannot be decomposed, treating as atomic".to_string(),
            }],
        ),

        (s @ State::Scheduling { slice_count }, Event::CapacityValidated { pattern }) => {
            let log = Action::LogActivity {
                message: format!("Executing {} slices under {}", slice_count, pattern),
            };
            advance(
                &s,
                State::Executing {
                    pattern: Some(pattern),
                    total_slices: slice_count,
                },
                vec![log],
            )
        }

        (s @ State::Executing { .. }, Event::ExecutionFinished { failed, total }) => {
            let pattern = match &s {
                State::Executing { pattern, .. } => *pattern,
                _ => None,
            };
            advance(
                &s,
                State::Aggregating {
                    pattern,
                    failed,
                    total,
                },
                vec![],
            )
        }

        (s @ State::Aggregating { .. }, Event::AggregationAccepted { summary }) => {
            let log = Action::LogActivity {
                message: format!("Run succeeded: {}", summary),
            };
            advance(&s, State::Succeeded { summary }, vec![log, Action::ReleaseCapacity])
        }

        (s @ State::Aggregating { .. }, Event::AggregationRejected { error }) => {
            advance(&s, State::Failed { error }, vec![Action::ReleaseCapacity])
        }

        // Pause suspends any non-terminal state and remembers it exactly
        (s, Event::PauseRequested) if !s.is_terminal() && s.run_state() != RunState::Paused => {
            let prior = Box::new(s.clone());
            advance(&s, State::Paused { prior }, vec![])
        }

        (State::Paused { prior }, Event::ResumeRequested) => {
            let restored = *prior;
            let from = RunState::Paused;
            let actions = vec![
                Action::WriteCheckpoint {
                    stage: restored.run_state().to_string(),
                },
                Action::EmitStateChange {
                    from,
                    to: restored.run_state(),
                },
                Action::LogActivity {
                    message: format!("Resumed into {}", restored.run_state()),
                },
            ];
            (restored, actions)
        }

        // Cancellation is accepted from any non-terminal state
        (s, Event::CancelRequested) if !s.is_terminal() => {
            advance(&s, State::Cancelled, vec![Action::ReleaseCapacity])
        }

        (s, Event::Error { message }) if !s.is_terminal() => advance(
            &s,
            State::Failed { error: message },
            vec![Action::ReleaseCapacity],
        ),

        // Repeated pause requests are absorbed
        (s @ State::Paused { .. }, Event::PauseRequested) => (s, vec![]),

        // Invalid transition: fail with context, never panic
        (state, event) => {
            let error = format!("invalid transition: {:?} in state {:?}", event, state);
            advance(&state, State::Failed { error }, vec![])
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn has_checkpoint(actions: &[Action], stage: &str) -> bool {
        actions
            .iter()
            .any(|a| matches!(a, Action::WriteCheckpoint { stage: s } if s == stage))
    }

    #[test]
    fn test_happy_path_walk() {
        let (s, a) = transition(
            State::Created,
            Event::Start {
                task_id: "t1".to_string(),
            },
        );
        assert_eq!(s.run_state(), RunState::Classifying);
        assert!(has_checkpoint(&a, "classifying"));

        let (s, _) = transition(
            s,
            Event::Classified {
                tier: ComplexityTier::Moderate,
                depth: 2,
            },
        );
        assert_eq!(s.run_state(), RunState::Decomposing);

        let (s, _) = transition(s, Event::Decomposed { slice_count: 5 });
        assert_eq!(s.run_state(), RunState::Scheduling);

        let (s, _) = transition(
            s,
            Event::CapacityValidated {
                pattern: Pattern::MapReduce,
            },
        );
        assert_eq!(
            s,
            State::Executing {
                pattern: Some(Pattern::MapReduce),
                total_slices: 5,
            }
        );

        let (s, _) = transition(s, Event::ExecutionFinished { failed: 0, total: 5 });
        assert_eq!(s.run_state(), RunState::Aggregating);

        let (s, a) = transition(
            s,
            Event::AggregationAccepted {
                summary: "5/5 slices".to_string(),
            },
        );
        assert_eq!(s.run_state(), RunState::Succeeded);
        assert!(a.contains(&Action::ReleaseCapacity));
    }

    #[test]
    fn test_atomic_task_skips_decomposition() {
        let (s, _) = transition(
            State::Classifying {
                task_id: "t1".to_string(),
            },
            Event::Classified {
                tier: ComplexityTier::Atomic,
                depth: 0,
            },
        );
        assert_eq!(
            s,
            State::Executing {
                pattern: None,
                total_slices: 1,
            }
        );
    }

    #[test]
    fn test_undecomposable_task_executes_as_atomic() {
        let (s, _) = transition(
            State::Decomposing {
                tier: ComplexityTier::Simple,
                depth: 1,
            },
            Event::DecompositionUnavailable,
        );
        assert_eq!(s.run_state(), RunState::Executing);
    }

    #[test]
    fn test_pause_and_resume_restore_prior_state() {
        let executing = State::Executing {
            pattern: Some(Pattern::Pipeline),
            total_slices: 3,
        };

        let (paused, _) = transition(executing.clone(), Event::PauseRequested);
        assert_eq!(paused.run_state(), RunState::Paused);

        let (restored, actions) = transition(paused, Event::ResumeRequested);
        assert_eq!(restored, executing);
        assert!(has_checkpoint(&actions, "executing"));
    }

    #[test]
    fn test_cancel_from_every_non_terminal_state() {
        let states = vec![
            State::Created,
            State::Classifying {
                task_id: "t".to_string(),
            },
            State::Decomposing {
                tier: ComplexityTier::Complex,
                depth: 3,
            },
            State::Scheduling { slice_count: 4 },
            State::Executing {
                pattern: Some(Pattern::ForkJoin),
                total_slices: 4,
            },
            State::Aggregating {
                pattern: Some(Pattern::ForkJoin),
                failed: 0,
                total: 4,
            },
            State::Paused {
                prior: Box::new(State::Created),
            },
        ];

        for state in states {
            let (s, a) = transition(state, Event::CancelRequested);
            assert_eq!(s, State::Cancelled);
            assert!(a.contains(&Action::ReleaseCapacity));
        }
    }

    #[test]
    fn test_invalid_transition_fails_without_panicking() {
        let (s, _) = transition(State::Created, Event::Decomposed { slice_count: 3 });
        match s {
            State::Failed { error } => assert!(error.contains("invalid transition")),
            other => panic!("expected Failed, got {:?}", other),
        }
    }

    #[test]
    fn test_terminal_states_reject_further_events() {
        let (s, _) = transition(
            State::Succeeded {
                summary: "done".to_string(),
            },
            Event::CancelRequested,
        );
        assert!(matches!(s, State::Failed { .. }));
    }

    #[test]
    fn test_error_event_releases_capacity() {
        let (s, a) = transition(
            State::Executing {
                pattern: Some(Pattern::Saga),
                total_slices: 3,
            },
            Event::Error {
                message: "checkpoint write failed".to_string(),
            },
        );
        assert_eq!(s.run_state(), RunState::Failed);
        assert!(a.contains(&Action::ReleaseCapacity));
    }
}
