//! Hierarchical run orchestration
//!
//! The orchestrator drives one run per call through the pure state machine:
//! classify, decompose, schedule, execute, aggregate. Every state advance
//! is checkpointed before the run proceeds, so a run can be paused, resumed
//! from its last checkpoint, or recovered after a crash. Control operations
//! (pause/resume/cancel) act on live runs through per-run control handles
//! and on suspended runs through the state store.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use serde_json::{json, Value};
use strata_agent::{AgentRunner, Notifier};
use strata_core::{
    ComplexityTier, Level, OrchestrationEvent, OrchestrationResult, OrchestrationRun, Pattern,
    Result, RunId, RunState, SliceOutcome, SliceStatus, StrataConfig, StrataError, Task,
    TaskSlice,
};
use strata_planning::{ComplexityClassifier, Decomposer};
use strata_store::{Checkpoint, StateStore};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::events::EventBus;
use crate::patterns::{BatchControl, PatternExecutor};
use crate::scheduler::LevelScheduler;
use crate::state_machine::{transition, Action, Event, State};

/// Live control handles for one in-flight run
#[derive(Clone)]
struct RunControls {
    token: CancellationToken,
    paused: Arc<AtomicBool>,
}

/// The engine: one instance orchestrates many runs against a shared
/// scheduler, store, and event bus.
pub struct HierarchicalOrchestrator<S: StateStore> {
    config: StrataConfig,
    classifier: ComplexityClassifier,
    decomposer: Arc<dyn Decomposer>,
    scheduler: Arc<LevelScheduler>,
    executor: PatternExecutor,
    store: Arc<S>,
    bus: Arc<EventBus>,
    notifier: Option<Arc<dyn Notifier>>,
    controls: Mutex<HashMap<RunId, RunControls>>,
}

impl<S: StateStore> HierarchicalOrchestrator<S> {
    pub fn new(
        config: StrataConfig,
        decomposer: Arc<dyn Decomposer>,
        runner: Arc<dyn AgentRunner>,
        store: Arc<S>,
    ) -> Self {
        let scheduler = Arc::new(LevelScheduler::new(config.capacities.clone()));
        let bus = Arc::new(EventBus::new());
        let executor = PatternExecutor::new(
            Arc::clone(&scheduler),
            runner,
            config.executor.clone(),
        )
        .with_event_bus(Arc::clone(&bus));

        Self {
            classifier: ComplexityClassifier::new(config.classifier.clone()),
            config,
            decomposer,
            scheduler,
            executor,
            store,
            bus,
            notifier: None,
            controls: Mutex::new(HashMap::new()),
        }
    }

    /// Attach a notifier for compensation and milestone approval points
    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = Some(Arc::clone(&notifier));
        let executor = self.executor;
        self.executor = executor.with_notifier(notifier);
        self
    }

    /// Subscribe to a run's event stream. None once the run has terminated
    /// and its channel was torn down.
    pub fn subscribe(&self, run_id: &str) -> Option<broadcast::Receiver<OrchestrationEvent>> {
        self.bus.subscribe(run_id)
    }

    pub fn scheduler(&self) -> &LevelScheduler {
        &self.scheduler
    }

    /// Orchestrate one task end to end.
    ///
    /// Returns the final result for terminal runs, or a Paused result if a
    /// pause request stopped scheduling partway through.
    pub async fn orchestrate(&self, task: Task) -> Result<OrchestrationResult> {
        let mut run = OrchestrationRun::new(task);
        let controls = self.register(&run.run_id);
        info!(run_id = %run.run_id, task = %run.root_task.description, "Starting orchestration");

        let result = self.drive(&mut run, Vec::new(), &controls).await;
        self.teardown(&run.run_id, &result);
        result
    }

    /// Request a pause: in-flight slices finish, nothing new is scheduled,
    /// and the run checkpoints into the Paused state.
    pub fn pause(&self, run_id: &str) -> Result<()> {
        let controls = self
            .controls
            .lock()
            .ok()
            .and_then(|map| map.get(run_id).cloned())
            .ok_or_else(|| StrataError::RunNotFound(run_id.to_string()))?;

        controls.paused.store(true, Ordering::SeqCst);
        info!(run_id, "Pause requested");
        Ok(())
    }

    /// Resume a run from its last durable checkpoint.
    ///
    /// Succeeded slices are never re-executed; everything else runs again.
    /// Also serves crash recovery: any non-terminal checkpoint can be
    /// resumed, not just explicitly paused ones.
    pub async fn resume(&self, run_id: &str) -> Result<OrchestrationResult> {
        let checkpoint = self.store.load(run_id).await?;
        if checkpoint.state().is_terminal() {
            return Err(StrataError::InvalidTransition(format!(
                "run {} is already {}",
                run_id,
                checkpoint.state()
            )));
        }

        let mut run = checkpoint.run;
        let prior_outcomes = checkpoint.outcomes;
        let controls = self.register(&run.run_id);
        info!(run_id, from_state = %run.state, "Resuming run");

        let result = self.drive(&mut run, prior_outcomes, &controls).await;
        self.teardown(&run.run_id, &result);
        result
    }

    /// Cancel a run. Live runs stop cooperatively: in-flight slices observe
    /// the token and outstanding ones are marked Cancelled after the grace
    /// period. Suspended runs are cancelled directly in the store.
    pub async fn cancel(&self, run_id: &str) -> Result<()> {
        let live = self
            .controls
            .lock()
            .ok()
            .and_then(|map| map.get(run_id).cloned());
        if let Some(controls) = live {
            info!(run_id, "Cancelling live run");
            controls.token.cancel();
            return Ok(());
        }

        // Not in flight: cancel the suspended checkpoint directly
        let checkpoint = self.store.load(run_id).await?;
        if checkpoint.state().is_terminal() {
            return Err(StrataError::InvalidTransition(format!(
                "run {} is already {}",
                run_id,
                checkpoint.state()
            )));
        }

        let mut run = checkpoint.run;
        let from = run.state;
        run.state = RunState::Cancelled;
        run.version += 1;
        run.updated_at = Utc::now();
        self.store
            .save(&Checkpoint::of(&run, checkpoint.outcomes, "cancelled"))
            .await?;
        self.bus.emit(OrchestrationEvent::StateChanged {
            run_id: run_id.to_string(),
            from,
            to: RunState::Cancelled,
        });
        self.bus.unregister(run_id);
        info!(run_id, "Cancelled suspended run");
        Ok(())
    }

    fn register(&self, run_id: &str) -> RunControls {
        self.bus.register(run_id);
        let controls = RunControls {
            token: CancellationToken::new(),
            paused: Arc::new(AtomicBool::new(false)),
        };
        if let Ok(mut map) = self.controls.lock() {
            map.insert(run_id.to_string(), controls.clone());
        }
        controls
    }

    fn teardown(&self, run_id: &str, result: &Result<OrchestrationResult>) {
        if let Ok(mut map) = self.controls.lock() {
            map.remove(run_id);
        }
        // Paused runs keep their channel open for resumption
        let terminal = match result {
            Ok(r) => r.status.is_terminal(),
            Err(_) => true,
        };
        if terminal {
            self.bus.unregister(run_id);
        }
    }

    /// Drive a run through the state machine until it is terminal or
    /// suspended. Every transition is checkpointed before the run advances.
    async fn drive(
        &self,
        run: &mut OrchestrationRun,
        prior_outcomes: Vec<SliceOutcome>,
        controls: &RunControls,
    ) -> Result<OrchestrationResult> {
        let mut state = entry_state(run);

        if state == State::Created {
            state = self
                .step(
                    run,
                    state,
                    Event::Start {
                        task_id: run.root_task.id.clone(),
                    },
                    &prior_outcomes,
                )
                .await?;

            let classification = self.classifier.classify(&run.root_task);
            if classification.ambiguous {
                warn!(run_id = %run.run_id, "Classification ambiguous, defaulting to atomic");
            }
            run.root_task.tier = classification.tier;
            run.depth = classification.depth.min(self.config.max_depth);
            state = self
                .step(
                    run,
                    state,
                    Event::Classified {
                        tier: classification.tier,
                        depth: run.depth,
                    },
                    &prior_outcomes,
                )
                .await?;
        }

        if matches!(state, State::Decomposing { .. }) {
            match self.expand(run).await {
                Ok(count) => {
                    state = self
                        .step(run, state, Event::Decomposed { slice_count: count }, &prior_outcomes)
                        .await?;
                }
                Err(e) => {
                    debug!(run_id = %run.run_id, error = %e, "Decomposition unavailable");
                    state = self
                        .step(run, state, Event::DecompositionUnavailable, &prior_outcomes)
                        .await?;
                }
            }
        }

        // Atomic run: the root description executes as a single slice
        if run.slices.is_empty() {
            let slice = TaskSlice::new(
                run.root_task.id.clone(),
                0,
                json!({ "directive": run.root_task.description }),
            )
            .with_run(run.run_id.clone())
            .with_level(Level::Primary);
            run.slices.push(slice);
        }

        if matches!(state, State::Scheduling { .. }) {
            // Slices queue FIFO behind per-slice permits, so a batch wider
            // than a level's capacity is fine; a zero-capacity level is not.
            if let Some(level) = self.zero_capacity_level(run) {
                let e = StrataError::CapacityExceeded {
                    level,
                    requested: 1,
                    capacity: 0,
                };
                run.error_context = Some(e.to_string());
                self.step(
                    run,
                    state,
                    Event::Error {
                        message: e.to_string(),
                    },
                    &prior_outcomes,
                )
                .await?;
                return Ok(self.result_of(run, prior_outcomes, None));
            }

            let top = top_slices(run);
            let pattern = match run.pattern {
                Some(p) => p,
                None => self.executor.recommend(&top),
            };
            run.pattern = Some(pattern);
            state = self
                .step(run, state, Event::CapacityValidated { pattern }, &prior_outcomes)
                .await?;
        }

        let control = BatchControl::new(controls.token.clone())
            .with_paused_flag(Arc::clone(&controls.paused))
            .with_precompleted(prior_outcomes.clone());

        let (outcomes, aggregated, compensated) =
            match self.execute_hierarchy(run, &control).await {
                Ok(executed) => executed,
                Err(e) => {
                    // Unrecoverable (a failed Saga compensation): checkpoint
                    // the failure, then surface the full error to the caller
                    run.error_context = Some(e.to_string());
                    self.step(
                        run,
                        state,
                        Event::Error {
                            message: e.to_string(),
                        },
                        &prior_outcomes,
                    )
                    .await?;
                    return Err(e);
                }
            };

        record_outcomes(run, &outcomes);
        let total = outcomes.len();
        let succeeded = outcomes
            .iter()
            .filter(|o| o.status == SliceStatus::Succeeded)
            .count();
        run.update_progress(succeeded as f64 / total.max(1) as f64, false);

        if controls.token.is_cancelled() {
            run.error_context = Some("run cancelled".to_string());
            self.step(run, state, Event::CancelRequested, &outcomes).await?;
            return Ok(self.result_of(run, outcomes, aggregated));
        }

        if control.is_paused() {
            self.step(run, state, Event::PauseRequested, &outcomes).await?;
            info!(run_id = %run.run_id, completed = succeeded, total, "Run paused");
            return Ok(self.result_of(run, outcomes, None));
        }

        let failed = total - succeeded;
        state = self
            .step(run, state, Event::ExecutionFinished { failed, total }, &outcomes)
            .await?;

        if !compensated.is_empty() {
            // Saga rollback restores pre-transaction progress
            run.update_progress(0.0, true);
        }

        if self.acceptable(run.pattern, &outcomes) {
            let summary = format!("{}/{} slices succeeded", succeeded, total);
            self.step(run, state, Event::AggregationAccepted { summary }, &outcomes)
                .await?;
            Ok(self.result_of(run, outcomes, aggregated))
        } else {
            let error = outcomes
                .iter()
                .filter_map(|o| o.error.as_deref())
                .collect::<Vec<_>>()
                .join("; ");
            let error = if error.is_empty() {
                format!("{} of {} slices did not succeed", failed, total)
            } else {
                error
            };
            run.error_context = Some(error.clone());
            self.step(run, state, Event::AggregationRejected { error }, &outcomes)
                .await?;
            Ok(self.result_of(run, outcomes, aggregated))
        }
    }

    /// Decompose the root task into its slice hierarchy.
    ///
    /// Root slices land at the secondary level. Below max depth, slices
    /// whose directive still classifies above Atomic are decomposed once
    /// more into tertiary children; anything deeper is forced Atomic.
    async fn expand(&self, run: &mut OrchestrationRun) -> Result<usize> {
        let decomposed = self.decomposer.decompose(&run.root_task).await?;

        let mut next_index = 0usize;
        let mut parents = Vec::with_capacity(decomposed.len());
        for mut slice in decomposed {
            slice.run_id = run.run_id.clone();
            slice.level = Level::for_depth(1);
            slice.index = next_index;
            next_index += 1;
            parents.push(slice);
        }

        let mut children = Vec::new();
        if run.depth >= 2 {
            for parent in &parents {
                let directive = parent
                    .payload
                    .get("directive")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default();
                let sub_task = Task::new(directive).with_parent(run.root_task.id.clone());
                if self.classifier.classify(&sub_task).depth == 0 {
                    continue;
                }
                let Ok(sub_slices) = self.decomposer.decompose(&sub_task).await else {
                    continue;
                };
                for mut child in sub_slices {
                    child.run_id = run.run_id.clone();
                    child.level = Level::for_depth(2);
                    child.parent_slice_id = Some(parent.id.clone());
                    child.index = next_index;
                    next_index += 1;
                    children.push(child);
                }
            }
        }

        debug!(
            run_id = %run.run_id,
            secondary = parents.len(),
            tertiary = children.len(),
            "Built slice hierarchy"
        );
        run.slices = parents;
        run.slices.extend(children);
        Ok(run.slices.len())
    }

    /// Execute the slice hierarchy bottom-up: all child batches first
    /// (concurrently, each under its own recommended pattern), then the top
    /// batch with each parent's payload enriched by its children's
    /// aggregate. Results bubble up level by level.
    async fn execute_hierarchy(
        &self,
        run: &OrchestrationRun,
        control: &BatchControl,
    ) -> Result<(Vec<SliceOutcome>, Option<Value>, Vec<usize>)> {
        let mut top = top_slices(run);

        let mut groups: Vec<(String, Vec<TaskSlice>)> = Vec::new();
        for slice in &run.slices {
            if let Some(parent_id) = &slice.parent_slice_id {
                match groups.iter_mut().find(|(id, _)| id == parent_id) {
                    Some((_, batch)) => batch.push(slice.clone()),
                    None => groups.push((parent_id.clone(), vec![slice.clone()])),
                }
            }
        }

        let mut all_outcomes = Vec::new();
        if !groups.is_empty() {
            let child_results = futures::future::join_all(groups.iter().map(
                |(parent_id, batch)| async move {
                    (parent_id.clone(), self.executor.execute_auto(batch, control).await)
                },
            ))
            .await;

            for (parent_id, result) in child_results {
                let result = result?;
                if let Some(parent) = top.iter_mut().find(|s| s.id == parent_id) {
                    let aggregate = result.aggregated.clone().unwrap_or(Value::Null);
                    match &mut parent.payload {
                        Value::Object(map) => {
                            map.insert("children".to_string(), aggregate);
                        }
                        other => {
                            *other = json!({ "input": other.clone(), "children": aggregate });
                        }
                    }
                }
                all_outcomes.extend(result.outcomes);
            }
        }

        let top_result = match run.pattern {
            Some(pattern) => self.executor.execute(pattern, &top, control).await?,
            // Atomic run: a single slice behind a plain join barrier
            None => self.executor.execute(Pattern::ForkJoin, &top, control).await?,
        };

        let aggregated = top_result.aggregated.clone();
        let compensated = top_result.compensated.clone();
        all_outcomes.extend(top_result.outcomes);
        all_outcomes.sort_by_key(|o| o.index);
        Ok((all_outcomes, aggregated, compensated))
    }

    async fn step(
        &self,
        run: &mut OrchestrationRun,
        state: State,
        event: Event,
        outcomes: &[SliceOutcome],
    ) -> Result<State> {
        let (next, actions) = transition(state, event);
        for action in actions {
            match action {
                Action::WriteCheckpoint { stage } => {
                    run.state = next.run_state();
                    run.version += 1;
                    run.updated_at = Utc::now();
                    let checkpoint = Checkpoint::of(run, outcomes.to_vec(), stage);
                    // The run must never advance past an unwritten checkpoint
                    self.store.save(&checkpoint).await.map_err(|e| {
                        StrataError::CheckpointWriteFailed {
                            run_id: run.run_id.clone(),
                            reason: e.to_string(),
                        }
                    })?;
                }
                Action::EmitStateChange { from, to } => {
                    self.bus.emit(OrchestrationEvent::StateChanged {
                        run_id: run.run_id.clone(),
                        from,
                        to,
                    });
                    self.milestone(run, to);
                }
                // Slice leases release on drop; nothing is held across states
                Action::ReleaseCapacity => {}
                Action::LogActivity { message } => {
                    info!(run_id = %run.run_id, "{}", message);
                }
            }
        }
        Ok(next)
    }

    /// Enterprise-tier state changes double as human approval milestones.
    fn milestone(&self, run: &OrchestrationRun, stage: RunState) {
        if run.root_task.tier < ComplexityTier::Enterprise {
            return;
        }
        let event = OrchestrationEvent::MilestoneReached {
            run_id: run.run_id.clone(),
            stage: stage.to_string(),
            progress: run.progress,
        };
        self.bus.emit(event.clone());
        if let Some(notifier) = &self.notifier {
            let notifier = Arc::clone(notifier);
            tokio::spawn(async move {
                notifier.notify(event).await;
            });
        }
    }

    fn zero_capacity_level(&self, run: &OrchestrationRun) -> Option<Level> {
        run.slices
            .iter()
            .map(|s| s.level)
            .find(|level| self.scheduler.capacity(*level) == 0)
    }

    fn acceptable(&self, pattern: Option<Pattern>, outcomes: &[SliceOutcome]) -> bool {
        let total = outcomes.len();
        if total == 0 {
            return true;
        }
        let unresolved = outcomes
            .iter()
            .filter(|o| o.status != SliceStatus::Succeeded)
            .count();
        let tolerant = pattern.map(|p| p.tolerates_partial_failure()).unwrap_or(false);
        if tolerant {
            (unresolved as f64) / (total as f64) <= self.config.executor.max_failure_ratio
        } else {
            unresolved == 0
        }
    }

    fn result_of(
        &self,
        run: &OrchestrationRun,
        outcomes: Vec<SliceOutcome>,
        aggregated: Option<Value>,
    ) -> OrchestrationResult {
        OrchestrationResult {
            run_id: run.run_id.clone(),
            status: run.state,
            progress: run.progress,
            pattern: run.pattern,
            outcomes,
            aggregated,
            error_context: run.error_context.clone(),
        }
    }
}

/// Pick where the state machine re-enters for a (possibly resumed) run.
fn entry_state(run: &OrchestrationRun) -> State {
    // Runs suspended before any slices existed restart from the top;
    // classification and decomposition are deterministic, so replaying
    // them is safe. Runs with slices re-validate capacity and re-enter
    // execution with their recorded pattern.
    if run.state == RunState::Created || run.slices.is_empty() {
        State::Created
    } else {
        State::Scheduling {
            slice_count: run.slices.len(),
        }
    }
}

/// Top-of-hierarchy slices (no parent), in index order
fn top_slices(run: &OrchestrationRun) -> Vec<TaskSlice> {
    run.slices
        .iter()
        .filter(|s| s.parent_slice_id.is_none())
        .cloned()
        .collect()
}

fn record_outcomes(run: &mut OrchestrationRun, outcomes: &[SliceOutcome]) {
    for outcome in outcomes {
        if let Some(slice) = run.slices.iter_mut().find(|s| s.id == outcome.slice_id) {
            slice.status = outcome.status;
        }
    }
}
