//! Core type definitions for Strata orchestration

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Task identifier
pub type TaskId = String;

/// Orchestration run identifier
pub type RunId = String;

/// Task slice identifier
pub type SliceId = String;

/// Task complexity tiers, ordered from simplest to most complex
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum ComplexityTier {
    #[default]
    Atomic = 0,
    Simple = 1,
    Moderate = 2,
    Complex = 3,
    Enterprise = 4,
}

impl ComplexityTier {
    /// Hierarchy depth this tier requires (Atomic needs no decomposition)
    pub fn required_depth(&self) -> u32 {
        match self {
            Self::Atomic => 0,
            Self::Simple => 1,
            Self::Moderate => 2,
            Self::Complex => 3,
            Self::Enterprise => 4,
        }
    }
}

impl std::fmt::Display for ComplexityTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Atomic => write!(f, "atomic"),
            Self::Simple => write!(f, "simple"),
            Self::Moderate => write!(f, "moderate"),
            Self::Complex => write!(f, "complex"),
            Self::Enterprise => write!(f, "enterprise"),
        }
    }
}

impl std::str::FromStr for ComplexityTier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "atomic" | "0" => Ok(Self::Atomic),
            "simple" | "1" => Ok(Self::Simple),
            "moderate" | "2" => Ok(Self::Moderate),
            "complex" | "3" => Ok(Self::Complex),
            "enterprise" | "4" => Ok(Self::Enterprise),
            _ => Err(format!("Invalid complexity tier: {}", s)),
        }
    }
}

/// Hierarchy strata, each with its own capacity bound
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    Primary,
    Secondary,
    Tertiary,
}

impl Level {
    /// Map a decomposition depth to the level its slices execute at.
    ///
    /// The root task itself occupies the primary stratum (depth 0); its
    /// slices run at the secondary level, their children and anything
    /// deeper at the tertiary level (deeper slices are forced Atomic
    /// elsewhere to guarantee termination).
    pub fn for_depth(depth: u32) -> Self {
        match depth {
            0 => Self::Primary,
            1 => Self::Secondary,
            _ => Self::Tertiary,
        }
    }

    /// The level one stratum below, if any
    pub fn child(&self) -> Option<Self> {
        match self {
            Self::Primary => Some(Self::Secondary),
            Self::Secondary => Some(Self::Tertiary),
            Self::Tertiary => None,
        }
    }

    pub fn all() -> [Level; 3] {
        [Self::Primary, Self::Secondary, Self::Tertiary]
    }
}

impl std::fmt::Display for Level {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Primary => write!(f, "primary"),
            Self::Secondary => write!(f, "secondary"),
            Self::Tertiary => write!(f, "tertiary"),
        }
    }
}

impl std::str::FromStr for Level {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "primary" => Ok(Self::Primary),
            "secondary" => Ok(Self::Secondary),
            "tertiary" => Ok(Self::Tertiary),
            _ => Err(format!("Invalid level: {}", s)),
        }
    }
}

/// Concurrency/aggregation patterns applied to a slice batch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Pattern {
    MapReduce,
    Pipeline,
    ForkJoin,
    ScatterGather,
    Saga,
}

impl Pattern {
    /// Whether the pattern tolerates partial slice failures (below the
    /// configured failure ratio). Pipeline and Saga do not.
    pub fn tolerates_partial_failure(&self) -> bool {
        !matches!(self, Self::Pipeline | Self::Saga)
    }
}

impl std::fmt::Display for Pattern {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MapReduce => write!(f, "map_reduce"),
            Self::Pipeline => write!(f, "pipeline"),
            Self::ForkJoin => write!(f, "fork_join"),
            Self::ScatterGather => write!(f, "scatter_gather"),
            Self::Saga => write!(f, "saga"),
        }
    }
}

impl std::str::FromStr for Pattern {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "map_reduce" | "mapreduce" => Ok(Self::MapReduce),
            "pipeline" => Ok(Self::Pipeline),
            "fork_join" | "forkjoin" => Ok(Self::ForkJoin),
            "scatter_gather" | "scattergather" => Ok(Self::ScatterGather),
            "saga" => Ok(Self::Saga),
            _ => Err(format!("Invalid pattern: {}", s)),
        }
    }
}

/// Status of a single task slice
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SliceStatus {
    #[default]
    Pending,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl SliceStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Cancelled)
    }
}

impl std::fmt::Display for SliceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Succeeded => write!(f, "succeeded"),
            Self::Failed => write!(f, "failed"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// A high-level task submitted to the orchestrator.
///
/// Immutable once created; each decomposition step mints new Tasks with
/// `parent_id` pointing at the task they were split from.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub description: String,
    pub parent_id: Option<TaskId>,
    pub tier: ComplexityTier,
    pub created_at: DateTime<Utc>,
}

impl Task {
    pub fn new(description: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            description: description.into(),
            parent_id: None,
            tier: ComplexityTier::Atomic,
            created_at: Utc::now(),
        }
    }

    pub fn with_parent(mut self, parent_id: impl Into<TaskId>) -> Self {
        self.parent_id = Some(parent_id.into());
        self
    }

    pub fn with_tier(mut self, tier: ComplexityTier) -> Self {
        self.tier = tier;
        self
    }
}

/// One unit of decomposed work, assigned to a single agent invocation.
///
/// Owned exclusively by the scheduler while Running; ownership transfers to
/// the pattern executor's result aggregator on completion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSlice {
    pub id: SliceId,
    /// The task this slice was decomposed from
    pub task_id: TaskId,
    /// The run this slice belongs to (exactly one)
    pub run_id: RunId,
    /// Position within the batch; aggregation is always in index order
    pub index: usize,
    /// Opaque work payload, interpreted only by the AgentRunner
    pub payload: serde_json::Value,
    pub level: Level,
    pub status: SliceStatus,
    /// Hint: this slice consumes the prior slice's output
    pub depends_on_prior: bool,
    /// Hint: this slice has a compensating action (Saga candidate)
    pub compensable: bool,
    /// Parent slice when this slice came from a nested decomposition
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_slice_id: Option<SliceId>,
}

impl TaskSlice {
    pub fn new(task_id: impl Into<TaskId>, index: usize, payload: serde_json::Value) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            task_id: task_id.into(),
            run_id: String::new(),
            index,
            payload,
            level: Level::Primary,
            status: SliceStatus::Pending,
            depends_on_prior: false,
            compensable: false,
            parent_slice_id: None,
        }
    }

    pub fn with_level(mut self, level: Level) -> Self {
        self.level = level;
        self
    }

    pub fn with_run(mut self, run_id: impl Into<RunId>) -> Self {
        self.run_id = run_id.into();
        self
    }

    pub fn depends_on_prior(mut self, depends: bool) -> Self {
        self.depends_on_prior = depends;
        self
    }

    pub fn compensable(mut self, compensable: bool) -> Self {
        self.compensable = compensable;
        self
    }

    pub fn with_parent_slice(mut self, parent: impl Into<SliceId>) -> Self {
        self.parent_slice_id = Some(parent.into());
        self
    }
}

/// Lightweight reference to an executable unit of work.
///
/// The orchestrator never owns agent implementations, only handles plus a
/// bounded capacity count per level. Variant agent kinds are distinguished
/// by capability tags, not by type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentHandle {
    pub id: String,
    pub level: Level,
    pub capabilities: Vec<String>,
}

impl AgentHandle {
    pub fn new(level: Level) -> Self {
        Self {
            id: format!("agent-{}", &Uuid::new_v4().to_string()[..8]),
            level,
            capabilities: Vec::new(),
        }
    }

    pub fn with_capabilities(mut self, capabilities: Vec<String>) -> Self {
        self.capabilities = capabilities;
        self
    }

    pub fn has_capability(&self, tag: &str) -> bool {
        self.capabilities.iter().any(|c| c == tag)
    }
}

/// Outcome of one slice execution, reported alongside the aggregate status.
///
/// Partial failures are never swallowed: every error context rides here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SliceOutcome {
    pub index: usize,
    pub slice_id: SliceId,
    pub status: SliceStatus,
    pub output: Option<serde_json::Value>,
    pub error: Option<String>,
    /// Scatter-gather only: the agent missed the response deadline.
    /// Absent responses are explicit markers, not failures.
    #[serde(default)]
    pub absent: bool,
}

impl SliceOutcome {
    pub fn succeeded(index: usize, slice_id: impl Into<SliceId>, output: serde_json::Value) -> Self {
        Self {
            index,
            slice_id: slice_id.into(),
            status: SliceStatus::Succeeded,
            output: Some(output),
            error: None,
            absent: false,
        }
    }

    pub fn failed(index: usize, slice_id: impl Into<SliceId>, error: impl Into<String>) -> Self {
        Self {
            index,
            slice_id: slice_id.into(),
            status: SliceStatus::Failed,
            output: None,
            error: Some(error.into()),
            absent: false,
        }
    }

    pub fn pending(index: usize, slice_id: impl Into<SliceId>) -> Self {
        Self {
            index,
            slice_id: slice_id.into(),
            status: SliceStatus::Pending,
            output: None,
            error: None,
            absent: false,
        }
    }

    pub fn cancelled(index: usize, slice_id: impl Into<SliceId>) -> Self {
        Self {
            index,
            slice_id: slice_id.into(),
            status: SliceStatus::Cancelled,
            output: None,
            error: None,
            absent: false,
        }
    }

    pub fn absent(index: usize, slice_id: impl Into<SliceId>) -> Self {
        Self {
            index,
            slice_id: slice_id.into(),
            status: SliceStatus::Succeeded,
            output: None,
            error: None,
            absent: true,
        }
    }
}

/// Named orchestration states as persisted in checkpoints
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Created,
    Classifying,
    Decomposing,
    Scheduling,
    Executing,
    Aggregating,
    Paused,
    Succeeded,
    Failed,
    Cancelled,
}

impl RunState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Cancelled)
    }
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Created => "created",
            Self::Classifying => "classifying",
            Self::Decomposing => "decomposing",
            Self::Scheduling => "scheduling",
            Self::Executing => "executing",
            Self::Aggregating => "aggregating",
            Self::Paused => "paused",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        write!(f, "{}", name)
    }
}

impl std::str::FromStr for RunState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "created" => Ok(Self::Created),
            "classifying" => Ok(Self::Classifying),
            "decomposing" => Ok(Self::Decomposing),
            "scheduling" => Ok(Self::Scheduling),
            "executing" => Ok(Self::Executing),
            "aggregating" => Ok(Self::Aggregating),
            "paused" => Ok(Self::Paused),
            "succeeded" => Ok(Self::Succeeded),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            _ => Err(format!("Invalid run state: {}", s)),
        }
    }
}

/// Aggregate root for one orchestration.
///
/// Created when orchestration starts, mutated only by the orchestrator, and
/// archived (never deleted) on success, failure, or cancellation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestrationRun {
    pub run_id: RunId,
    pub root_task: Task,
    /// Hierarchy depth chosen by classification
    pub depth: u32,
    pub slices: Vec<TaskSlice>,
    /// Overall progress in [0.0, 1.0]; monotone non-decreasing except when
    /// a Saga rollback restores an earlier checkpoint
    pub progress: f64,
    pub pattern: Option<Pattern>,
    /// Checkpoint version counter, bumped on every durable write
    pub version: u64,
    pub error_context: Option<String>,
    pub state: RunState,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl OrchestrationRun {
    pub fn new(root_task: Task) -> Self {
        let now = Utc::now();
        Self {
            run_id: format!("run-{}", Uuid::new_v4()),
            root_task,
            depth: 0,
            slices: Vec::new(),
            progress: 0.0,
            pattern: None,
            version: 0,
            error_context: None,
            state: RunState::Created,
            created_at: now,
            updated_at: now,
        }
    }

    /// Slices assigned to one level, in index order
    pub fn slices_at(&self, level: Level) -> Vec<&TaskSlice> {
        self.slices.iter().filter(|s| s.level == level).collect()
    }

    /// Advance progress; values below the current progress are ignored
    /// unless `rollback` is set (Saga compensation).
    pub fn update_progress(&mut self, progress: f64, rollback: bool) {
        let clamped = progress.clamp(0.0, 1.0);
        if rollback || clamped > self.progress {
            self.progress = clamped;
        }
        self.updated_at = Utc::now();
    }

    pub fn completed_slices(&self) -> usize {
        self.slices
            .iter()
            .filter(|s| s.status == SliceStatus::Succeeded)
            .count()
    }
}

/// Events published on a run's channel and forwarded to notifiers.
///
/// Subscriptions are scoped to a run id and cleaned up when the run
/// terminates.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OrchestrationEvent {
    StateChanged {
        run_id: RunId,
        from: RunState,
        to: RunState,
    },
    SliceFinished {
        run_id: RunId,
        slice_id: SliceId,
        index: usize,
        status: SliceStatus,
    },
    /// A Saga step failed and rollback began; human approval point.
    CompensationTriggered {
        run_id: RunId,
        failed_step: usize,
    },
    /// Enterprise-tier progress milestone; human approval point.
    MilestoneReached {
        run_id: RunId,
        stage: String,
        progress: f64,
    },
}

impl OrchestrationEvent {
    pub fn run_id(&self) -> &RunId {
        match self {
            Self::StateChanged { run_id, .. }
            | Self::SliceFinished { run_id, .. }
            | Self::CompensationTriggered { run_id, .. }
            | Self::MilestoneReached { run_id, .. } => run_id,
        }
    }
}

/// Final result of an orchestration run.
///
/// Always reports both the aggregate status and the full list of per-slice
/// error contexts; partial failures are never silent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestrationResult {
    pub run_id: RunId,
    pub status: RunState,
    pub progress: f64,
    pub pattern: Option<Pattern>,
    pub outcomes: Vec<SliceOutcome>,
    pub aggregated: Option<serde_json::Value>,
    pub error_context: Option<String>,
}

impl OrchestrationResult {
    /// Error contexts of all failed slices, in index order
    pub fn slice_errors(&self) -> Vec<&str> {
        self.outcomes
            .iter()
            .filter_map(|o| o.error.as_deref())
            .collect()
    }
}
