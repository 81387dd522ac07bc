//! # strata-store
//!
//! Durable checkpoint storage for Strata orchestration runs.
//!
//! A checkpoint is a point-in-time serialization of an `OrchestrationRun`
//! plus the outputs of every completed slice - byte-for-byte sufficient to
//! resume the run without re-querying any collaborator. Stores must provide
//! atomic save-or-fail semantics: no partial checkpoint writes, ever.

#![allow(dead_code)]

mod checkpoint;
mod store;

pub use checkpoint::{Checkpoint, CheckpointFilter};
pub use store::{JsonFileStore, MemoryStateStore, StateStore};
