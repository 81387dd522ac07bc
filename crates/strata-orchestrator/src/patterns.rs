//! Concurrency patterns over slice batches
//!
//! Five patterns with distinct scheduling and aggregation semantics:
//! MapReduce, Pipeline, ForkJoin, ScatterGather, and Saga. All of them
//! funnel slice execution through [`LevelScheduler`] permits, so level
//! capacity bounds hold regardless of the pattern in effect.
//!
//! Aggregation is always performed in slice index order, independent of
//! completion order, so results are deterministic under reordered
//! completion.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use strata_agent::{AgentRunner, Notifier, SliceContext};
use strata_core::{
    ExecutorDefaults, OrchestrationEvent, Pattern, Result, SliceOutcome, SliceStatus, StrataError,
    TaskSlice,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::events::EventBus;
use crate::scheduler::LevelScheduler;

/// Cross-cutting controls threaded through one batch execution.
///
/// Carries the cancellation token, the pause flag, and outcomes completed
/// by a previous attempt (resume skips those slices entirely).
#[derive(Clone)]
pub struct BatchControl {
    token: CancellationToken,
    paused: Arc<AtomicBool>,
    precompleted: HashMap<usize, SliceOutcome>,
}

impl BatchControl {
    pub fn new(token: CancellationToken) -> Self {
        Self {
            token,
            paused: Arc::new(AtomicBool::new(false)),
            precompleted: HashMap::new(),
        }
    }

    /// Share an externally owned pause flag
    pub fn with_paused_flag(mut self, flag: Arc<AtomicBool>) -> Self {
        self.paused = flag;
        self
    }

    /// Seed outcomes from a prior attempt; only succeeded outcomes are
    /// honored, everything else is re-executed
    pub fn with_precompleted(mut self, outcomes: impl IntoIterator<Item = SliceOutcome>) -> Self {
        self.precompleted = outcomes
            .into_iter()
            .filter(|o| o.status == SliceStatus::Succeeded)
            .map(|o| (o.index, o))
            .collect();
        self
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    fn prior(&self, index: usize) -> Option<SliceOutcome> {
        self.precompleted.get(&index).cloned()
    }
}

/// Result of executing one slice batch under a pattern.
#[derive(Debug, Clone)]
pub struct PatternResult {
    pub pattern: Pattern,
    /// Per-slice outcomes in index order; never swallows partial failures
    pub outcomes: Vec<SliceOutcome>,
    /// Pattern-specific combined output, present when aggregation ran
    pub aggregated: Option<Value>,
    /// Saga only: slice indexes compensated, in compensation order
    pub compensated: Vec<usize>,
}

impl PatternResult {
    fn new(pattern: Pattern, mut outcomes: Vec<SliceOutcome>) -> Self {
        outcomes.sort_by_key(|o| o.index);
        Self {
            pattern,
            outcomes,
            aggregated: None,
            compensated: Vec::new(),
        }
    }

    pub fn succeeded(&self) -> usize {
        self.count(SliceStatus::Succeeded)
    }

    pub fn failed(&self) -> usize {
        self.count(SliceStatus::Failed)
    }

    pub fn pending(&self) -> usize {
        self.count(SliceStatus::Pending)
    }

    pub fn cancelled(&self) -> usize {
        self.count(SliceStatus::Cancelled)
    }

    fn count(&self, status: SliceStatus) -> usize {
        self.outcomes.iter().filter(|o| o.status == status).count()
    }

    /// Apply the pattern's failure policy to decide overall acceptance.
    ///
    /// Pipeline and Saga tolerate no failures; the fan-out patterns accept
    /// up to `max_failure_ratio` of the batch failing. Absent
    /// scatter-gather responses are explicit markers, never failures.
    pub fn is_acceptable(&self, max_failure_ratio: f64) -> bool {
        let total = self.outcomes.len();
        if total == 0 {
            return true;
        }
        let unresolved = self.failed() + self.cancelled() + self.pending();
        if !self.pattern.tolerates_partial_failure() {
            return unresolved == 0;
        }
        (unresolved as f64) / (total as f64) <= max_failure_ratio
    }

    /// One-line summary for logs and the success state
    pub fn summary(&self) -> String {
        format!(
            "{}/{} slices succeeded under {}",
            self.succeeded(),
            self.outcomes.len(),
            self.pattern
        )
    }
}

/// Executes slice batches under one of the five patterns.
pub struct PatternExecutor {
    scheduler: Arc<LevelScheduler>,
    runner: Arc<dyn AgentRunner>,
    bus: Option<Arc<EventBus>>,
    notifier: Option<Arc<dyn Notifier>>,
    defaults: ExecutorDefaults,
}

impl PatternExecutor {
    pub fn new(
        scheduler: Arc<LevelScheduler>,
        runner: Arc<dyn AgentRunner>,
        defaults: ExecutorDefaults,
    ) -> Self {
        Self {
            scheduler,
            runner,
            bus: None,
            notifier: None,
            defaults,
        }
    }

    pub fn with_event_bus(mut self, bus: Arc<EventBus>) -> Self {
        self.bus = Some(bus);
        self
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    /// Recommend a pattern for a slice batch.
    ///
    /// Rules are checked in order: all-compensable batches run as Saga;
    /// any sequential dependency forces Pipeline; identical payloads
    /// broadcast as ScatterGather; independent batches at or above the
    /// fan-out threshold run as MapReduce; everything else is ForkJoin.
    pub fn recommend(&self, slices: &[TaskSlice]) -> Pattern {
        if !slices.is_empty() && slices.iter().all(|s| s.compensable) {
            return Pattern::Saga;
        }
        if slices.iter().any(|s| s.depends_on_prior) {
            return Pattern::Pipeline;
        }
        if slices.len() > 1 && slices.windows(2).all(|w| w[0].payload == w[1].payload) {
            return Pattern::ScatterGather;
        }
        if slices.len() >= self.defaults.fanout_threshold {
            return Pattern::MapReduce;
        }
        Pattern::ForkJoin
    }

    /// Recommend a pattern and execute under it
    pub async fn execute_auto(
        &self,
        slices: &[TaskSlice],
        ctl: &BatchControl,
    ) -> Result<PatternResult> {
        let pattern = self.recommend(slices);
        self.execute(pattern, slices, ctl).await
    }

    /// Execute a slice batch under an explicit pattern.
    ///
    /// Slices must be index-ordered. Returns Err only for unrecoverable
    /// conditions (a failed Saga compensation); per-slice failures ride in
    /// the result's outcomes.
    pub async fn execute(
        &self,
        pattern: Pattern,
        slices: &[TaskSlice],
        ctl: &BatchControl,
    ) -> Result<PatternResult> {
        if slices.is_empty() {
            return Ok(PatternResult::new(pattern, Vec::new()));
        }

        debug!(%pattern, slices = slices.len(), "Executing batch");

        match pattern {
            Pattern::MapReduce => self.map_reduce(slices, ctl).await,
            Pattern::Pipeline => self.pipeline(slices, ctl).await,
            Pattern::ForkJoin => self.fork_join(slices, ctl).await,
            Pattern::ScatterGather => self.scatter_gather(slices, ctl).await,
            Pattern::Saga => self.saga(slices, ctl).await,
        }
    }

    /// Concurrent fan-out; aggregation reduces successful outputs in index
    /// order regardless of completion order.
    async fn map_reduce(&self, slices: &[TaskSlice], ctl: &BatchControl) -> Result<PatternResult> {
        let outcomes = self.run_concurrent(slices, ctl).await;
        let mut result = PatternResult::new(Pattern::MapReduce, outcomes);

        let reduced: Vec<Value> = result
            .outcomes
            .iter()
            .filter(|o| o.status == SliceStatus::Succeeded && !o.absent)
            .filter_map(|o| o.output.clone())
            .collect();
        result.aggregated = Some(Value::Array(reduced));
        Ok(result)
    }

    /// Concurrent fan-out with a join barrier; the aggregate is the full
    /// ordered outcome list, failures included.
    async fn fork_join(&self, slices: &[TaskSlice], ctl: &BatchControl) -> Result<PatternResult> {
        let outcomes = self.run_concurrent(slices, ctl).await;
        let mut result = PatternResult::new(Pattern::ForkJoin, outcomes);
        result.aggregated = serde_json::to_value(&result.outcomes).ok();
        Ok(result)
    }

    /// Sequential chain; each stage's payload carries the prior stage's
    /// output. A failed stage stops the chain and downstream stages are
    /// reported Pending, never attempted.
    async fn pipeline(&self, slices: &[TaskSlice], ctl: &BatchControl) -> Result<PatternResult> {
        let mut outcomes = Vec::with_capacity(slices.len());
        let mut carry: Option<Value> = None;
        let mut halted = false;

        for slice in slices {
            if halted {
                outcomes.push(SliceOutcome::pending(slice.index, slice.id.clone()));
                continue;
            }
            if let Some(prior) = ctl.prior(slice.index) {
                carry = prior.output.clone();
                outcomes.push(prior);
                continue;
            }

            let payload = match &carry {
                Some(prev) => json!({ "input": slice.payload, "prior": prev }),
                None => slice.payload.clone(),
            };
            let outcome = self.run_slice(slice, payload, None, ctl).await;
            match outcome.status {
                SliceStatus::Succeeded => carry = outcome.output.clone(),
                _ => halted = true,
            }
            outcomes.push(outcome);
        }

        let mut result = PatternResult::new(Pattern::Pipeline, outcomes);
        if !halted {
            result.aggregated = carry;
        }
        Ok(result)
    }

    /// Broadcast the same payload to every recipient with a per-agent
    /// response deadline. A recipient missing the deadline yields an
    /// explicit absent marker, not a failure.
    async fn scatter_gather(
        &self,
        slices: &[TaskSlice],
        ctl: &BatchControl,
    ) -> Result<PatternResult> {
        let payload = slices[0].payload.clone();
        let deadline = Duration::from_millis(self.defaults.gather_deadline_ms);

        let futures = slices.iter().map(|slice| {
            let payload = payload.clone();
            async move {
                if let Some(prior) = ctl.prior(slice.index) {
                    return prior;
                }
                self.run_slice(slice, payload, Some(deadline), ctl).await
            }
        });
        let outcomes = futures::future::join_all(futures).await;

        let mut result = PatternResult::new(Pattern::ScatterGather, outcomes);
        let responses: Vec<Value> = result
            .outcomes
            .iter()
            .filter(|o| !o.absent)
            .filter_map(|o| o.output.clone())
            .collect();
        let absent: Vec<usize> = result
            .outcomes
            .iter()
            .filter(|o| o.absent)
            .map(|o| o.index)
            .collect();
        result.aggregated = Some(json!({ "responses": responses, "absent": absent }));
        Ok(result)
    }

    /// Ordered transaction steps. A failed step triggers compensation of
    /// all completed steps in reverse order; a failed compensation is
    /// unrecoverable and surfaces the full attempted chain.
    async fn saga(&self, slices: &[TaskSlice], ctl: &BatchControl) -> Result<PatternResult> {
        let mut outcomes = Vec::with_capacity(slices.len());
        let mut completed: Vec<&TaskSlice> = Vec::new();
        let mut compensated = Vec::new();
        let mut halted = false;

        for slice in slices {
            if halted {
                outcomes.push(SliceOutcome::pending(slice.index, slice.id.clone()));
                continue;
            }
            if let Some(prior) = ctl.prior(slice.index) {
                completed.push(slice);
                outcomes.push(prior);
                continue;
            }

            let outcome = self.run_slice(slice, slice.payload.clone(), None, ctl).await;
            let status = outcome.status;
            outcomes.push(outcome);

            match status {
                SliceStatus::Succeeded => completed.push(slice),
                SliceStatus::Pending => halted = true,
                _ => {
                    // Transaction broken: roll back every completed step
                    warn!(
                        run_id = %slice.run_id,
                        failed_step = slice.index,
                        "Saga step failed, compensating"
                    );
                    self.emit_compensation(slice);
                    compensated = self.compensate_chain(&completed).await?;
                    halted = true;
                }
            }
        }

        let mut result = PatternResult::new(Pattern::Saga, outcomes);
        result.compensated = compensated;
        if !halted {
            let outputs: Vec<Value> = result
                .outcomes
                .iter()
                .filter_map(|o| o.output.clone())
                .collect();
            result.aggregated = Some(Value::Array(outputs));
        }
        Ok(result)
    }

    /// Compensate completed Saga steps in reverse completion order.
    ///
    /// Each compensation is attempted exactly once; a failure aborts the
    /// chain and carries every index attempted so far.
    async fn compensate_chain(&self, completed: &[&TaskSlice]) -> Result<Vec<usize>> {
        let mut attempted = Vec::with_capacity(completed.len());

        for slice in completed.iter().rev() {
            attempted.push(slice.index);
            let ctx = SliceContext::new(
                slice.run_id.clone(),
                slice.id.clone(),
                slice.index,
                slice.level,
                CancellationToken::new(),
            );
            if let Err(e) = self.runner.compensate(&ctx, &slice.payload).await {
                return Err(StrataError::CompensationFailed {
                    attempted,
                    reason: e.to_string(),
                });
            }
        }
        Ok(attempted)
    }

    /// Run independent slices concurrently, skipping precompleted ones.
    /// Output order mirrors input order.
    async fn run_concurrent(&self, slices: &[TaskSlice], ctl: &BatchControl) -> Vec<SliceOutcome> {
        let futures = slices.iter().map(|slice| async move {
            if let Some(prior) = ctl.prior(slice.index) {
                return prior;
            }
            self.run_slice(slice, slice.payload.clone(), None, ctl).await
        });
        futures::future::join_all(futures).await
    }

    /// Execute one slice behind a level permit.
    ///
    /// Every invocation acquires exactly one slot at the slice's level, so
    /// the level capacity bound holds no matter how wide the batch fans
    /// out. Pause is observed before and after the wait for capacity:
    /// in-flight work finishes, but nothing new starts.
    async fn run_slice(
        &self,
        slice: &TaskSlice,
        payload: Value,
        deadline: Option<Duration>,
        ctl: &BatchControl,
    ) -> SliceOutcome {
        if ctl.token.is_cancelled() {
            return self.finish(slice, SliceOutcome::cancelled(slice.index, slice.id.clone()));
        }
        if ctl.is_paused() {
            return self.finish(slice, SliceOutcome::pending(slice.index, slice.id.clone()));
        }

        let acquire_timeout = Duration::from_millis(self.defaults.acquire_timeout_ms);
        let lease = match self
            .scheduler
            .acquire(slice.level, 1, acquire_timeout, &ctl.token)
            .await
        {
            Ok(lease) => lease,
            Err(StrataError::Cancelled(_)) => {
                return self.finish(slice, SliceOutcome::cancelled(slice.index, slice.id.clone()))
            }
            Err(e) => {
                return self.finish(slice, SliceOutcome::failed(slice.index, slice.id.clone(), e.to_string()))
            }
        };

        if ctl.is_paused() {
            drop(lease);
            return self.finish(slice, SliceOutcome::pending(slice.index, slice.id.clone()));
        }

        let ctx = SliceContext::new(
            slice.run_id.clone(),
            slice.id.clone(),
            slice.index,
            slice.level,
            ctl.token.child_token(),
        );

        let grace = Duration::from_millis(self.defaults.grace_period_ms);
        let invoked = async {
            match deadline {
                Some(d) => match tokio::time::timeout(d, self.runner.run(&ctx, &payload)).await {
                    Ok(result) => result.map(Some),
                    // Missed deadline: explicit absent marker
                    Err(_) => Ok(None),
                },
                None => self.runner.run(&ctx, &payload).await.map(Some),
            }
        };
        let result = tokio::select! {
            r = invoked => r,
            // Cancelled and the runner did not return within the grace
            // period: mark the slice Cancelled and move on
            _ = async {
                ctl.token.cancelled().await;
                tokio::time::sleep(grace).await;
            } => Err(StrataError::Cancelled(slice.run_id.clone())),
        };
        drop(lease);

        let outcome = match result {
            Ok(Some(output)) => SliceOutcome::succeeded(slice.index, slice.id.clone(), output),
            Ok(None) => SliceOutcome::absent(slice.index, slice.id.clone()),
            Err(StrataError::Cancelled(_)) => SliceOutcome::cancelled(slice.index, slice.id.clone()),
            Err(e) => SliceOutcome::failed(slice.index, slice.id.clone(), e.to_string()),
        };
        self.finish(slice, outcome)
    }

    fn finish(&self, slice: &TaskSlice, outcome: SliceOutcome) -> SliceOutcome {
        if let Some(bus) = &self.bus {
            bus.emit(OrchestrationEvent::SliceFinished {
                run_id: slice.run_id.clone(),
                slice_id: slice.id.clone(),
                index: slice.index,
                status: outcome.status,
            });
        }
        outcome
    }

    /// Fire-and-forget compensation notification; a human approval point.
    fn emit_compensation(&self, failed: &TaskSlice) {
        let event = OrchestrationEvent::CompensationTriggered {
            run_id: failed.run_id.clone(),
            failed_step: failed.index,
        };
        if let Some(bus) = &self.bus {
            bus.emit(event.clone());
        }
        if let Some(notifier) = &self.notifier {
            let notifier = Arc::clone(notifier);
            tokio::spawn(async move {
                notifier.notify(event).await;
            });
        }
    }
}
