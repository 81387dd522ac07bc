//! Task decomposition seam
//!
//! The orchestrator never interprets task text itself; it asks a
//! `Decomposer` for structured slices. Decomposition failure is non-fatal
//! by contract: callers treat a task that cannot be decomposed as Atomic.

use async_trait::async_trait;
use strata_core::{Result, StrataError, Task, TaskSlice};
use tracing::debug;

use crate::classifier::clause_units;

/// External capability that turns a task into ordered slices.
#[async_trait]
pub trait Decomposer: Send + Sync {
    /// Decompose a task into slices, index-ordered.
    ///
    /// An error means "cannot decompose further"; the orchestrator treats
    /// the task as Atomic rather than failing the run.
    async fn decompose(&self, task: &Task) -> Result<Vec<TaskSlice>>;
}

/// Deterministic decomposer that splits a description on clause
/// boundaries. Used as the default wiring and throughout the test suite.
#[derive(Debug, Clone, Default)]
pub struct HeuristicDecomposer;

impl HeuristicDecomposer {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Decomposer for HeuristicDecomposer {
    async fn decompose(&self, task: &Task) -> Result<Vec<TaskSlice>> {
        let units = clause_units(&task.description);

        if units.len() < 2 {
            return Err(StrataError::Decomposition(format!(
                "task {} has no decomposable structure",
                task.id
            )));
        }

        debug!(task_id = %task.id, slices = units.len(), "Decomposed task");

        Ok(units
            .into_iter()
            .enumerate()
            .map(|(index, unit)| {
                TaskSlice::new(
                    task.id.clone(),
                    index,
                    serde_json::json!({
                        "directive": unit.text,
                        "parent": task.description,
                    }),
                )
                .depends_on_prior(unit.sequential)
            })
            .collect())
    }
}
