//! Pure complexity classification
//!
//! Maps a task description to a complexity tier and required hierarchy
//! depth. No async, no I/O, fully deterministic: classifying the same text
//! twice always yields the same tier. Classification never blocks the
//! pipeline - unparseable input defaults to Atomic with a diagnostic flag.

use serde::{Deserialize, Serialize};
use strata_core::{ClassifierThresholds, ComplexityTier, Task};

/// Result of classifying one task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Classification {
    pub tier: ComplexityTier,
    /// Hierarchy depth the tier requires (0 = no decomposition)
    pub depth: u32,
    /// Set when the description was empty or unparseable and the
    /// classifier fell back to Atomic
    pub ambiguous: bool,
}

/// Deterministic task-complexity classifier.
///
/// Tier boundaries come from [`ClassifierThresholds`] (policy, not
/// hard-coded magic): the classifier counts work units in the description
/// and maps the count through the configured thresholds.
#[derive(Debug, Clone)]
pub struct ComplexityClassifier {
    thresholds: ClassifierThresholds,
}

impl ComplexityClassifier {
    pub fn new(thresholds: ClassifierThresholds) -> Self {
        Self { thresholds }
    }

    /// Classify a task. Pure and idempotent; never errors.
    pub fn classify(&self, task: &Task) -> Classification {
        let units = clause_units(&task.description);

        if units.is_empty() {
            return Classification {
                tier: ComplexityTier::Atomic,
                depth: 0,
                ambiguous: true,
            };
        }

        let count = units.len();
        let t = &self.thresholds;
        let tier = if count <= t.atomic_max_units {
            ComplexityTier::Atomic
        } else if count <= t.simple_max_units {
            ComplexityTier::Simple
        } else if count <= t.moderate_max_units {
            ComplexityTier::Moderate
        } else if count <= t.complex_max_units {
            ComplexityTier::Complex
        } else {
            ComplexityTier::Enterprise
        };

        Classification {
            tier,
            depth: tier.required_depth(),
            ambiguous: false,
        }
    }
}

impl Default for ComplexityClassifier {
    fn default() -> Self {
        Self::new(ClassifierThresholds::default())
    }
}

/// Split a description into work units: one clause per line, semicolon
/// segment, or "and"/"then" conjunction. Units without any alphanumeric
/// content are dropped.
pub(crate) fn clause_units(text: &str) -> Vec<ClauseUnit> {
    let mut units = Vec::new();

    for line in text.lines() {
        for segment in line.split(';') {
            let mut rest = segment;
            let mut sequential = false;

            loop {
                let and_pos = rest.find(" and ");
                let then_pos = rest.find(" then ");

                let (pos, sep_len, next_sequential) = match (and_pos, then_pos) {
                    (Some(a), Some(t)) if a < t => (a, " and ".len(), false),
                    (Some(_), Some(t)) => (t, " then ".len(), true),
                    (Some(a), None) => (a, " and ".len(), false),
                    (None, Some(t)) => (t, " then ".len(), true),
                    (None, None) => {
                        push_unit(&mut units, rest, sequential);
                        break;
                    }
                };

                push_unit(&mut units, &rest[..pos], sequential);
                rest = &rest[pos + sep_len..];
                sequential = next_sequential;
            }
        }
    }

    units
}

/// One clause of a task description
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ClauseUnit {
    pub text: String,
    /// This clause followed a "then" conjunction - it consumes the
    /// prior clause's output
    pub sequential: bool,
}

fn push_unit(units: &mut Vec<ClauseUnit>, raw: &str, sequential: bool) {
    let trimmed = raw.trim().trim_start_matches(['-', '*', ' ']).trim();
    if trimmed.chars().any(|c| c.is_alphanumeric()) {
        units.push(ClauseUnit {
            text: trimmed.to_string(),
            sequential,
        });
    }
}
