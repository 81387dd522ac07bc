//! # strata-planning
//!
//! Complexity classification and the decomposition seam for Strata.
//!
//! The classifier is a pure function from task description to complexity
//! tier and hierarchy depth. The `Decomposer` trait is the narrow interface
//! to the external capability that turns a task into structured slices;
//! a deterministic heuristic implementation ships for tests and defaults.

#![allow(dead_code)]

mod classifier;
mod decomposer;

pub use classifier::{Classification, ComplexityClassifier};
pub use decomposer::{Decomposer, HeuristicDecomposer};
