//! Configuration management for Strata
//!
//! This module provides configuration structures for orchestration settings:
//! per-level capacities, classifier thresholds, executor defaults, and the
//! maximum decomposition depth.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::Result;

/// Engine-level Strata configuration
///
/// Loaded from `strata.toml` in the working directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrataConfig {
    /// Per-level agent capacity bounds
    #[serde(default)]
    pub capacities: LevelCapacities,

    /// Complexity classification thresholds (policy, not magic numbers)
    #[serde(default)]
    pub classifier: ClassifierThresholds,

    /// Pattern executor defaults
    #[serde(default)]
    pub executor: ExecutorDefaults,

    /// Maximum decomposition depth; slices beyond it are forced Atomic
    #[serde(default = "default_max_depth")]
    pub max_depth: u32,
}

/// Bounded agent capacity per hierarchy level
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LevelCapacities {
    #[serde(default = "default_primary_capacity")]
    pub primary: usize,

    #[serde(default = "default_secondary_capacity")]
    pub secondary: usize,

    #[serde(default = "default_tertiary_capacity")]
    pub tertiary: usize,
}

impl LevelCapacities {
    pub fn capacity_of(&self, level: crate::Level) -> usize {
        match level {
            crate::Level::Primary => self.primary,
            crate::Level::Secondary => self.secondary,
            crate::Level::Tertiary => self.tertiary,
        }
    }
}

/// Thresholds mapping a task's work-unit count to a complexity tier.
///
/// A work unit is one clause of the description (lines, semicolons,
/// "and"/"then" conjunctions). Counts above `complex_max_units` classify
/// as Enterprise.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassifierThresholds {
    #[serde(default = "default_atomic_max_units")]
    pub atomic_max_units: usize,

    #[serde(default = "default_simple_max_units")]
    pub simple_max_units: usize,

    #[serde(default = "default_moderate_max_units")]
    pub moderate_max_units: usize,

    #[serde(default = "default_complex_max_units")]
    pub complex_max_units: usize,
}

/// Pattern executor defaults
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorDefaults {
    /// Independent slice count at or above which MapReduce is recommended
    #[serde(default = "default_fanout_threshold")]
    pub fanout_threshold: usize,

    /// Fraction of slices allowed to fail while MapReduce/ForkJoin/
    /// ScatterGather still count as an overall success
    #[serde(default = "default_max_failure_ratio")]
    pub max_failure_ratio: f64,

    /// Scatter-gather per-agent response deadline (ms)
    #[serde(default = "default_gather_deadline_ms")]
    pub gather_deadline_ms: u64,

    /// LevelScheduler acquisition timeout (ms)
    #[serde(default = "default_acquire_timeout_ms")]
    pub acquire_timeout_ms: u64,

    /// Grace period before outstanding slices are marked Cancelled (ms)
    #[serde(default = "default_grace_period_ms")]
    pub grace_period_ms: u64,
}

// Default value providers

fn default_primary_capacity() -> usize {
    1
}

fn default_secondary_capacity() -> usize {
    10
}

fn default_tertiary_capacity() -> usize {
    30
}

fn default_atomic_max_units() -> usize {
    1
}

fn default_simple_max_units() -> usize {
    3
}

fn default_moderate_max_units() -> usize {
    6
}

fn default_complex_max_units() -> usize {
    10
}

fn default_fanout_threshold() -> usize {
    4
}

fn default_max_failure_ratio() -> f64 {
    0.5
}

fn default_gather_deadline_ms() -> u64 {
    30_000
}

fn default_acquire_timeout_ms() -> u64 {
    30_000
}

fn default_grace_period_ms() -> u64 {
    2_000
}

fn default_max_depth() -> u32 {
    3
}

impl StrataConfig {
    /// Load configuration from `strata.toml` or use defaults
    pub fn load_or_default(dir: &Path) -> Result<Self> {
        let config_path = dir.join("strata.toml");

        if config_path.exists() {
            let content = std::fs::read_to_string(&config_path)?;
            Ok(toml::from_str(&content).map_err(|e| {
                crate::StrataError::Other(format!("Failed to parse config file: {}", e))
            })?)
        } else {
            Ok(Self::default())
        }
    }

    /// Write default configuration to `strata.toml`
    pub fn write_default(dir: &Path) -> Result<()> {
        std::fs::create_dir_all(dir)?;

        let config_path = dir.join("strata.toml");
        let config = Self::default();
        let content = toml::to_string_pretty(&config).map_err(|e| {
            crate::StrataError::Other(format!("Failed to serialize config: {}", e))
        })?;
        std::fs::write(&config_path, content)?;
        Ok(())
    }
}

impl Default for StrataConfig {
    fn default() -> Self {
        Self {
            capacities: LevelCapacities::default(),
            classifier: ClassifierThresholds::default(),
            executor: ExecutorDefaults::default(),
            max_depth: default_max_depth(),
        }
    }
}

impl Default for LevelCapacities {
    fn default() -> Self {
        Self {
            primary: default_primary_capacity(),
            secondary: default_secondary_capacity(),
            tertiary: default_tertiary_capacity(),
        }
    }
}

impl Default for ClassifierThresholds {
    fn default() -> Self {
        Self {
            atomic_max_units: default_atomic_max_units(),
            simple_max_units: default_simple_max_units(),
            moderate_max_units: default_moderate_max_units(),
            complex_max_units: default_complex_max_units(),
        }
    }
}

impl Default for ExecutorDefaults {
    fn default() -> Self {
        Self {
            fanout_threshold: default_fanout_threshold(),
            max_failure_ratio: default_max_failure_ratio(),
            gather_deadline_ms: default_gather_deadline_ms(),
            acquire_timeout_ms: default_acquire_timeout_ms(),
            grace_period_ms: default_grace_period_ms(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Level;
    use tempfile::TempDir;

    #[test]
    fn test_default_capacities() {
        let caps = LevelCapacities::default();
        assert_eq!(caps.capacity_of(Level::Primary), 1);
        assert_eq!(caps.capacity_of(Level::Secondary), 10);
        assert_eq!(caps.capacity_of(Level::Tertiary), 30);
    }

    #[test]
    fn test_load_missing_file_uses_defaults() {
        let dir = TempDir::new().unwrap();
        let config = StrataConfig::load_or_default(dir.path()).unwrap();
        assert_eq!(config.max_depth, 3);
        assert_eq!(config.executor.fanout_threshold, 4);
    }

    #[test]
    fn test_write_then_load_roundtrip() {
        let dir = TempDir::new().unwrap();
        StrataConfig::write_default(dir.path()).unwrap();

        let config = StrataConfig::load_or_default(dir.path()).unwrap();
        assert_eq!(config.capacities.tertiary, 30);
        assert!((config.executor.max_failure_ratio - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn test_partial_config_fills_defaults() {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join("strata.toml"),
            "max_depth = 2\n[capacities]\ntertiary = 8\n",
        )
        .unwrap();

        let config = StrataConfig::load_or_default(dir.path()).unwrap();
        assert_eq!(config.max_depth, 2);
        assert_eq!(config.capacities.tertiary, 8);
        // Unspecified fields fall back to defaults
        assert_eq!(config.capacities.primary, 1);
        assert_eq!(config.classifier.simple_max_units, 3);
    }
}
