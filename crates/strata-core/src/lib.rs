//! # strata-core
//!
//! Core types for the Strata hierarchical orchestration engine.
//!
//! Strata takes a high-level task, classifies its complexity, decomposes it
//! across a bounded three-level agent hierarchy (Primary/Secondary/Tertiary),
//! executes slice batches under one of five concurrency patterns, and
//! checkpoints every state transition so a run can be paused, resumed, or
//! recovered after failure.
//!
//! ## Core Paradigm
//!
//! - A Task is immutable once created; decomposition mints new Tasks
//! - A TaskSlice is one unit of decomposed work, owned by exactly one run
//! - AgentHandle is a capability reference, not an implementation
//! - Level capacities are the single mechanism preventing uncontrolled fan-out
//! - A Checkpoint is byte-for-byte sufficient to resume a run

#![allow(dead_code)]

mod config;
mod error;
mod types;

pub use config::{
    ClassifierThresholds, ExecutorDefaults, LevelCapacities, StrataConfig,
};
pub use error::{Result, StrataError};
pub use types::*;
