//! # strata-orchestrator
//!
//! The Strata engine: hierarchical task orchestration over a bounded
//! three-level agent hierarchy.
//!
//! - `LevelScheduler`: FIFO per-level capacity permits, the single
//!   mechanism preventing uncontrolled fan-out
//! - `PatternExecutor`: five concurrency patterns (MapReduce, Pipeline,
//!   ForkJoin, ScatterGather, Saga) with deterministic index-order
//!   aggregation
//! - `state_machine`: a pure transition function driving run control flow
//! - `EventBus`: run-scoped broadcast of orchestration events
//! - `HierarchicalOrchestrator`: classify, decompose, schedule, execute,
//!   aggregate, with a durable checkpoint before every state advance

#![allow(dead_code)]

mod events;
mod orchestrator;
mod patterns;
mod scheduler;
pub mod state_machine;

pub use events::EventBus;
pub use orchestrator::HierarchicalOrchestrator;
pub use patterns::{BatchControl, PatternExecutor, PatternResult};
pub use scheduler::{LevelLease, LevelScheduler};
