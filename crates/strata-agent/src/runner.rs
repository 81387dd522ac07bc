//! Agent execution seam
//!
//! The orchestrator schedules and awaits slice work but never owns the
//! implementation. `AgentRunner` is the single-method capability interface;
//! variant agent kinds are distinguished by `AgentHandle` capability tags,
//! not by type.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use strata_core::{Level, Result, RunId, SliceId, StrataError};
use tokio_util::sync::CancellationToken;

/// Per-invocation context threaded through every slice execution.
///
/// Carries identifiers and the cancellation token explicitly; agents must
/// observe the token and return promptly when it fires - the orchestrator
/// never forcibly kills agent work.
#[derive(Debug, Clone)]
pub struct SliceContext {
    pub run_id: RunId,
    pub slice_id: SliceId,
    pub index: usize,
    pub level: Level,
    pub token: CancellationToken,
}

impl SliceContext {
    pub fn new(
        run_id: impl Into<RunId>,
        slice_id: impl Into<SliceId>,
        index: usize,
        level: Level,
        token: CancellationToken,
    ) -> Self {
        Self {
            run_id: run_id.into(),
            slice_id: slice_id.into(),
            index,
            level,
            token,
        }
    }
}

/// The actual work execution behind a slice.
#[async_trait]
pub trait AgentRunner: Send + Sync {
    /// Execute one slice payload and return its result.
    ///
    /// Implementations must observe `ctx.token` cooperatively.
    async fn run(&self, ctx: &SliceContext, payload: &Value) -> Result<Value>;

    /// Undo a previously completed slice (Saga rollback).
    ///
    /// Contract: compensation actions MUST be idempotent. Compensation is
    /// attempted exactly once per completed step; the engine never retries
    /// a failed compensation.
    async fn compensate(&self, ctx: &SliceContext, _payload: &Value) -> Result<()> {
        Err(StrataError::CompensationFailed {
            attempted: Vec::new(),
            reason: format!(
                "runner does not support compensation (slice {})",
                ctx.slice_id
            ),
        })
    }
}

/// Scripted behavior for one slice index in a [`MockRunner`]
#[derive(Debug, Clone)]
pub enum MockBehavior {
    /// Succeed after an artificial delay; `output = None` echoes
    /// `{"index": N, "input": payload}`
    Succeed {
        latency_ms: u64,
        output: Option<Value>,
    },
    /// Fail after an artificial delay
    Fail { latency_ms: u64, message: String },
}

impl Default for MockBehavior {
    fn default() -> Self {
        Self::Succeed {
            latency_ms: 0,
            output: None,
        }
    }
}

#[derive(Default)]
struct MockState {
    behaviors: HashMap<usize, MockBehavior>,
    compensation_failures: HashMap<usize, String>,
    /// Slice indexes in invocation order
    invocations: Vec<usize>,
    /// Payloads seen per invocation, in invocation order
    payloads: Vec<(usize, Value)>,
    /// Compensated indexes, in compensation order
    compensations: Vec<usize>,
}

/// Scripted [`AgentRunner`] for tests.
///
/// Clones share state, so a test can keep a handle for assertions while the
/// orchestrator owns another.
#[derive(Clone, Default)]
pub struct MockRunner {
    state: Arc<Mutex<MockState>>,
    active: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
}

impl MockRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Script the behavior for one slice index
    pub fn with_behavior(self, index: usize, behavior: MockBehavior) -> Self {
        self.state
            .lock()
            .unwrap()
            .behaviors
            .insert(index, behavior);
        self
    }

    /// Shorthand: fail the slice at `index`
    pub fn failing_at(self, index: usize, message: impl Into<String>) -> Self {
        self.with_behavior(
            index,
            MockBehavior::Fail {
                latency_ms: 0,
                message: message.into(),
            },
        )
    }

    /// Shorthand: succeed at `index` after `latency_ms`
    pub fn with_latency(self, index: usize, latency_ms: u64) -> Self {
        self.with_behavior(
            index,
            MockBehavior::Succeed {
                latency_ms,
                output: None,
            },
        )
    }

    /// Script a compensation failure for one slice index
    pub fn failing_compensation_at(self, index: usize, message: impl Into<String>) -> Self {
        self.state
            .lock()
            .unwrap()
            .compensation_failures
            .insert(index, message.into());
        self
    }

    /// Slice indexes in the order they were invoked
    pub fn invocations(&self) -> Vec<usize> {
        self.state.lock().unwrap().invocations.clone()
    }

    /// Number of times the slice at `index` was invoked
    pub fn invocation_count(&self, index: usize) -> usize {
        self.state
            .lock()
            .unwrap()
            .invocations
            .iter()
            .filter(|i| **i == index)
            .count()
    }

    /// Payloads received, in invocation order
    pub fn payloads(&self) -> Vec<(usize, Value)> {
        self.state.lock().unwrap().payloads.clone()
    }

    /// Compensated indexes, in compensation order
    pub fn compensations(&self) -> Vec<usize> {
        self.state.lock().unwrap().compensations.clone()
    }

    /// Highest number of concurrently running slices observed
    pub fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    fn behavior_for(&self, index: usize) -> MockBehavior {
        self.state
            .lock()
            .unwrap()
            .behaviors
            .get(&index)
            .cloned()
            .unwrap_or_default()
    }

    fn enter(&self) {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
    }

    fn exit(&self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl AgentRunner for MockRunner {
    async fn run(&self, ctx: &SliceContext, payload: &Value) -> Result<Value> {
        {
            let mut state = self.state.lock().unwrap();
            state.invocations.push(ctx.index);
            state.payloads.push((ctx.index, payload.clone()));
        }

        let behavior = self.behavior_for(ctx.index);
        self.enter();

        let latency = match &behavior {
            MockBehavior::Succeed { latency_ms, .. } => *latency_ms,
            MockBehavior::Fail { latency_ms, .. } => *latency_ms,
        };

        let cancelled = tokio::select! {
            _ = tokio::time::sleep(Duration::from_millis(latency)) => false,
            _ = ctx.token.cancelled() => true,
        };
        self.exit();

        if cancelled {
            return Err(StrataError::Cancelled(ctx.run_id.clone()));
        }

        match behavior {
            MockBehavior::Succeed { output, .. } => Ok(output.unwrap_or_else(|| {
                serde_json::json!({ "index": ctx.index, "input": payload })
            })),
            MockBehavior::Fail { message, .. } => Err(StrataError::SliceExecutionFailed {
                slice_id: ctx.slice_id.clone(),
                level: ctx.level,
                reason: message,
            }),
        }
    }

    async fn compensate(&self, ctx: &SliceContext, _payload: &Value) -> Result<()> {
        let failure = {
            let mut state = self.state.lock().unwrap();
            state.compensations.push(ctx.index);
            state.compensation_failures.get(&ctx.index).cloned()
        };

        match failure {
            Some(reason) => Err(StrataError::CompensationFailed {
                attempted: Vec::new(),
                reason,
            }),
            None => Ok(()),
        }
    }
}
