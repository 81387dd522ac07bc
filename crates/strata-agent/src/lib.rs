//! # strata-agent
//!
//! The execution seams of Strata orchestration.
//!
//! This crate provides:
//! - `AgentRunner`: the narrow interface to whatever actually performs a
//!   slice's work (an LLM call, a static-analysis pass, a Git API call)
//! - `SliceContext`: the explicit per-invocation context object carrying
//!   identifiers and the cancellation token - never ambient global state
//! - `Notifier`: fire-and-forget notification seam for human-in-the-loop
//!   approval points
//! - `MockRunner`: scripted runner used throughout the test suites

#![allow(dead_code)]

mod notifier;
mod runner;

pub use notifier::{LogNotifier, Notifier};
pub use runner::{AgentRunner, MockBehavior, MockRunner, SliceContext};
