//! End-to-end orchestration tests: full runs through classification,
//! decomposition, scheduling, pattern execution, and aggregation, plus the
//! pause/resume/cancel and recovery flows.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use strata_agent::{MockRunner, Notifier};
use strata_core::{
    Level, OrchestrationEvent, OrchestrationRun, Pattern, Result, RunState, SliceOutcome,
    SliceStatus, StrataConfig, Task, TaskSlice,
};
use strata_orchestrator::HierarchicalOrchestrator;
use strata_planning::{Decomposer, HeuristicDecomposer};
use strata_store::{Checkpoint, CheckpointFilter, JsonFileStore, MemoryStateStore, StateStore};
use tempfile::TempDir;

/// Splits any task into `fanout` independent slices with distinct payloads.
struct FlatDecomposer {
    fanout: usize,
    compensable: bool,
}

impl FlatDecomposer {
    fn new(fanout: usize) -> Self {
        Self {
            fanout,
            compensable: false,
        }
    }

    fn compensable(fanout: usize) -> Self {
        Self {
            fanout,
            compensable: true,
        }
    }
}

#[async_trait]
impl Decomposer for FlatDecomposer {
    async fn decompose(&self, task: &Task) -> Result<Vec<TaskSlice>> {
        Ok((0..self.fanout)
            .map(|i| {
                TaskSlice::new(task.id.clone(), i, json!({ "part": i }))
                    .compensable(self.compensable)
            })
            .collect())
    }
}

/// Two-level decomposer: `top` slices, each splitting into `children`
/// tertiary slices. Top directives carry two clauses so they classify
/// above Atomic and get decomposed once more.
struct TieredDecomposer {
    top: usize,
    children: usize,
}

#[async_trait]
impl Decomposer for TieredDecomposer {
    async fn decompose(&self, task: &Task) -> Result<Vec<TaskSlice>> {
        if task.parent_id.is_none() {
            Ok((0..self.top)
                .map(|i| {
                    TaskSlice::new(
                        task.id.clone(),
                        i,
                        json!({ "directive": format!("stage {}; verify {}", i, i) }),
                    )
                })
                .collect())
        } else {
            Ok((0..self.children)
                .map(|i| {
                    TaskSlice::new(task.id.clone(), i, json!({ "unit": i, "of": task.description }))
                })
                .collect())
        }
    }
}

/// Broadcasts the same payload to `recipients` slices.
struct BroadcastDecomposer {
    recipients: usize,
}

#[async_trait]
impl Decomposer for BroadcastDecomposer {
    async fn decompose(&self, task: &Task) -> Result<Vec<TaskSlice>> {
        Ok((0..self.recipients)
            .map(|i| TaskSlice::new(task.id.clone(), i, json!({ "poll": "status" })))
            .collect())
    }
}

#[derive(Clone, Default)]
struct RecordingNotifier {
    events: Arc<Mutex<Vec<OrchestrationEvent>>>,
}

impl RecordingNotifier {
    fn events(&self) -> Vec<OrchestrationEvent> {
        self.events.lock().unwrap().clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, event: OrchestrationEvent) {
        self.events.lock().unwrap().push(event);
    }
}

fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn engine(
    config: StrataConfig,
    decomposer: impl Decomposer + 'static,
    runner: MockRunner,
    store: Arc<MemoryStateStore>,
) -> HierarchicalOrchestrator<MemoryStateStore> {
    init_logging();
    HierarchicalOrchestrator::new(config, Arc::new(decomposer), Arc::new(runner), store)
}

/// Poll the store until some run reaches `state`; returns its run id.
async fn wait_for_state(store: &MemoryStateStore, state: RunState) -> String {
    for _ in 0..400 {
        let checkpoints = store.list(&CheckpointFilter::default()).await.unwrap();
        if let Some(cp) = checkpoints.iter().find(|c| c.state() == state) {
            return cp.run_id().to_string();
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("no run reached state {}", state);
}

#[tokio::test]
async fn atomic_task_executes_as_single_slice() {
    let store = Arc::new(MemoryStateStore::new());
    let runner = MockRunner::new();
    let orchestrator = engine(
        StrataConfig::default(),
        HeuristicDecomposer::new(),
        runner.clone(),
        Arc::clone(&store),
    );

    let result = orchestrator
        .orchestrate(Task::new("Rename the config file"))
        .await
        .unwrap();

    assert_eq!(result.status, RunState::Succeeded);
    assert_eq!(result.outcomes.len(), 1);
    assert_eq!(result.pattern, None);
    assert!((result.progress - 1.0).abs() < f64::EPSILON);
    assert_eq!(runner.invocations().len(), 1);

    // Terminal checkpoint was archived, never deleted
    let checkpoint = store.load(&result.run_id).await.unwrap();
    assert_eq!(checkpoint.state(), RunState::Succeeded);
}

#[tokio::test]
async fn wide_fanout_respects_tertiary_capacity() {
    // 2 secondary slices each decompose into 20 tertiary slices; with a
    // tertiary capacity of 30, the 40 children contend FIFO: at most 30
    // run concurrently and the remaining 10 queue.
    let store = Arc::new(MemoryStateStore::new());
    let mut runner = MockRunner::new();
    for i in 2..42 {
        runner = runner.with_latency(i, 25);
    }
    let orchestrator = engine(
        StrataConfig::default(),
        TieredDecomposer {
            top: 2,
            children: 20,
        },
        runner.clone(),
        Arc::clone(&store),
    );

    let result = orchestrator
        .orchestrate(Task::new("plan alpha; plan beta; plan gamma; plan delta"))
        .await
        .unwrap();

    assert_eq!(result.status, RunState::Succeeded);
    // 2 parents + 40 children, every outcome reported
    assert_eq!(result.outcomes.len(), 42);
    let children = result.outcomes.iter().filter(|o| o.index >= 2).count();
    assert_eq!(children, 40);
    assert!(result
        .outcomes
        .iter()
        .all(|o| o.status == SliceStatus::Succeeded));
    assert_eq!(runner.peak_concurrency(), 30);
}

#[tokio::test]
async fn pipeline_stage_failure_stops_downstream_and_fails_run() {
    let store = Arc::new(MemoryStateStore::new());
    let runner = MockRunner::new().failing_at(1, "transform step rejected input");
    let orchestrator = engine(
        StrataConfig::default(),
        HeuristicDecomposer::new(),
        runner.clone(),
        Arc::clone(&store),
    );

    // "then" clauses carry sequential dependency hints, forcing Pipeline
    let result = orchestrator
        .orchestrate(Task::new(
            "fetch the data then transform it then publish results",
        ))
        .await
        .unwrap();

    assert_eq!(result.status, RunState::Failed);
    assert_eq!(result.pattern, Some(Pattern::Pipeline));
    assert_eq!(result.outcomes[0].status, SliceStatus::Succeeded);
    assert_eq!(result.outcomes[1].status, SliceStatus::Failed);
    assert_eq!(result.outcomes[2].status, SliceStatus::Pending);
    // Stage three was never attempted
    assert_eq!(runner.invocation_count(2), 0);
    assert!(result
        .error_context
        .as_deref()
        .unwrap()
        .contains("transform step rejected input"));
}

#[tokio::test]
async fn scatter_gather_tolerates_missed_deadline() {
    let store = Arc::new(MemoryStateStore::new());
    let runner = MockRunner::new().with_latency(1, 5_000);
    let mut config = StrataConfig::default();
    config.executor.gather_deadline_ms = 50;
    let orchestrator = engine(
        config,
        BroadcastDecomposer { recipients: 5 },
        runner,
        Arc::clone(&store),
    );

    let result = orchestrator
        .orchestrate(Task::new("poll every agent; compare their answers"))
        .await
        .unwrap();

    assert_eq!(result.status, RunState::Succeeded);
    assert_eq!(result.pattern, Some(Pattern::ScatterGather));

    let aggregated = result.aggregated.unwrap();
    assert_eq!(aggregated["responses"].as_array().unwrap().len(), 4);
    assert_eq!(aggregated["absent"], json!([1]));
    assert!(result.outcomes[1].absent);
}

#[tokio::test]
async fn saga_failure_compensates_in_reverse_and_rolls_back_progress() {
    let store = Arc::new(MemoryStateStore::new());
    let runner = MockRunner::new().failing_at(2, "charge was declined");
    let notifier = RecordingNotifier::default();
    let orchestrator = engine(
        StrataConfig::default(),
        FlatDecomposer::compensable(4),
        runner.clone(),
        Arc::clone(&store),
    )
    .with_notifier(Arc::new(notifier.clone()));

    let result = orchestrator
        .orchestrate(Task::new("reserve stock; charge card; ship order"))
        .await
        .unwrap();

    assert_eq!(result.status, RunState::Failed);
    assert_eq!(result.pattern, Some(Pattern::Saga));
    // Completed steps rolled back newest-first
    assert_eq!(runner.compensations(), vec![1, 0]);
    // Step four was never attempted
    assert_eq!(runner.invocation_count(3), 0);
    // Rollback restored pre-transaction progress
    assert!(result.progress.abs() < f64::EPSILON);

    // Compensation is a fire-and-forget approval point
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(notifier
        .events()
        .iter()
        .any(|e| matches!(e, OrchestrationEvent::CompensationTriggered { failed_step: 2, .. })));
}

#[tokio::test]
async fn pause_stops_scheduling_and_resume_runs_only_the_remainder() {
    let store = Arc::new(MemoryStateStore::new());
    let mut runner = MockRunner::new();
    for i in 0..10 {
        runner = runner.with_latency(i, 200);
    }
    let mut config = StrataConfig::default();
    config.capacities.secondary = 6;
    let orchestrator = Arc::new(engine(
        config,
        FlatDecomposer::new(10),
        runner.clone(),
        Arc::clone(&store),
    ));

    let driver = {
        let orchestrator = Arc::clone(&orchestrator);
        tokio::spawn(async move {
            orchestrator
                .orchestrate(Task::new("first; second; third"))
                .await
        })
    };

    // Six slices start immediately, four queue behind the capacity bound.
    // Pause while the six are in flight.
    let run_id = wait_for_state(&store, RunState::Executing).await;
    let mut events = orchestrator.subscribe(&run_id).unwrap();
    tokio::time::sleep(Duration::from_millis(60)).await;
    orchestrator.pause(&run_id).unwrap();

    let paused = driver.await.unwrap().unwrap();
    assert_eq!(paused.status, RunState::Paused);
    let done: Vec<usize> = paused
        .outcomes
        .iter()
        .filter(|o| o.status == SliceStatus::Succeeded)
        .map(|o| o.index)
        .collect();
    assert_eq!(done.len(), 6, "in-flight slices finish, queued ones do not");
    assert_eq!(runner.invocations().len(), 6);

    // The pause transition was published on the run's channel
    let mut saw_pause = false;
    while let Ok(event) = events.try_recv() {
        if matches!(
            event,
            OrchestrationEvent::StateChanged {
                to: RunState::Paused,
                ..
            }
        ) {
            saw_pause = true;
        }
    }
    assert!(saw_pause);

    // Resume executes exactly the four remaining slices, once each
    let resumed = orchestrator.resume(&run_id).await.unwrap();
    assert_eq!(resumed.status, RunState::Succeeded);
    assert_eq!(resumed.outcomes.len(), 10);
    for i in 0..10 {
        assert_eq!(runner.invocation_count(i), 1, "slice {} ran exactly once", i);
    }
}

#[tokio::test]
async fn cancel_marks_in_flight_slices_cancelled() {
    let store = Arc::new(MemoryStateStore::new());
    let mut runner = MockRunner::new();
    for i in 0..4 {
        runner = runner.with_latency(i, 2_000);
    }
    let orchestrator = Arc::new(engine(
        StrataConfig::default(),
        FlatDecomposer::new(4),
        runner,
        Arc::clone(&store),
    ));

    let driver = {
        let orchestrator = Arc::clone(&orchestrator);
        tokio::spawn(async move {
            orchestrator
                .orchestrate(Task::new("first; second; third"))
                .await
        })
    };

    let run_id = wait_for_state(&store, RunState::Executing).await;
    tokio::time::sleep(Duration::from_millis(30)).await;
    orchestrator.cancel(&run_id).await.unwrap();

    let result = driver.await.unwrap().unwrap();
    assert_eq!(result.status, RunState::Cancelled);
    assert!(result
        .outcomes
        .iter()
        .all(|o| o.status == SliceStatus::Cancelled));

    // Cancelling a terminal run is rejected
    let err = orchestrator.cancel(&run_id).await.unwrap_err();
    assert!(matches!(err, strata_core::StrataError::InvalidTransition(_)));
}

#[tokio::test]
async fn recovery_resumes_an_executing_checkpoint_without_repeating_work() {
    // Simulate a crash: write an Executing checkpoint with 3 of 5 slices
    // done, then hand the store to a fresh engine instance.
    let dir = TempDir::new().unwrap();
    let store = Arc::new(JsonFileStore::new(dir.path()));

    let task = Task::new("a; b; c; d; e");
    let mut run = OrchestrationRun::new(task.clone());
    run.depth = 1;
    run.state = RunState::Executing;
    run.pattern = Some(Pattern::MapReduce);
    run.version = 4;
    run.slices = (0..5)
        .map(|i| {
            TaskSlice::new(task.id.clone(), i, json!({ "part": i }))
                .with_run(run.run_id.clone())
                .with_level(Level::Secondary)
        })
        .collect();
    let outcomes: Vec<SliceOutcome> = (0..3)
        .map(|i| SliceOutcome::succeeded(i, run.slices[i].id.clone(), json!(format!("done-{}", i))))
        .collect();
    store
        .save(&Checkpoint::of(&run, outcomes, "executing"))
        .await
        .unwrap();

    let runner = MockRunner::new();
    let orchestrator = HierarchicalOrchestrator::new(
        StrataConfig::default(),
        Arc::new(FlatDecomposer::new(5)),
        Arc::new(runner.clone()),
        Arc::clone(&store),
    );

    let result = orchestrator.resume(&run.run_id).await.unwrap();
    assert_eq!(result.status, RunState::Succeeded);
    assert_eq!(result.outcomes.len(), 5);

    // Only the two unfinished slices were executed
    let mut invoked = runner.invocations();
    invoked.sort_unstable();
    assert_eq!(invoked, vec![3, 4]);

    // Prior outputs survived into the aggregate
    let aggregated = result.aggregated.unwrap();
    assert_eq!(aggregated[0], json!("done-0"));

    // Resuming the now-terminal run is rejected
    let err = orchestrator.resume(&run.run_id).await.unwrap_err();
    assert!(matches!(err, strata_core::StrataError::InvalidTransition(_)));
}

#[tokio::test]
async fn enterprise_runs_emit_milestones() {
    let store = Arc::new(MemoryStateStore::new());
    let notifier = RecordingNotifier::default();
    let orchestrator = engine(
        StrataConfig::default(),
        HeuristicDecomposer::new(),
        MockRunner::new(),
        Arc::clone(&store),
    )
    .with_notifier(Arc::new(notifier.clone()));

    // Eleven-plus work units classify as Enterprise
    let description = (1..=12)
        .map(|i| format!("work unit {}", i))
        .collect::<Vec<_>>()
        .join("; ");
    let result = orchestrator.orchestrate(Task::new(description)).await.unwrap();
    assert_eq!(result.status, RunState::Succeeded);

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(notifier
        .events()
        .iter()
        .any(|e| matches!(e, OrchestrationEvent::MilestoneReached { .. })));
}

#[tokio::test]
async fn zero_capacity_level_fails_the_run_at_scheduling() {
    let store = Arc::new(MemoryStateStore::new());
    let mut config = StrataConfig::default();
    config.capacities.secondary = 0;
    let orchestrator = engine(
        config,
        FlatDecomposer::new(3),
        MockRunner::new(),
        Arc::clone(&store),
    );

    let result = orchestrator
        .orchestrate(Task::new("first; second; third"))
        .await
        .unwrap();

    assert_eq!(result.status, RunState::Failed);
    assert!(result
        .error_context
        .as_deref()
        .unwrap()
        .to_lowercase()
        .contains("capacity"));
}

#[tokio::test]
async fn checkpoints_advance_monotonically_through_a_run() {
    let store = Arc::new(MemoryStateStore::new());
    let orchestrator = engine(
        StrataConfig::default(),
        FlatDecomposer::new(4),
        MockRunner::new(),
        Arc::clone(&store),
    );

    let result = orchestrator
        .orchestrate(Task::new("first; second; third"))
        .await
        .unwrap();
    assert_eq!(result.status, RunState::Succeeded);

    // Created -> classifying, decomposing, scheduling, executing (via
    // capacity validation), aggregating, succeeded: each advance bumped
    // the version
    let checkpoint = store.load(&result.run_id).await.unwrap();
    assert_eq!(checkpoint.state(), RunState::Succeeded);
    assert!(checkpoint.version() >= 5);
    assert_eq!(checkpoint.completed_indexes().len(), 4);
}
