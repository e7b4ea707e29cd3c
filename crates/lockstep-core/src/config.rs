//! Configuration loading and typed config structures for the lockstep
//! clock.
//!
//! The canonical configuration lives in `lockstep-config.yaml` at the
//! project root. This module defines strongly-typed structs that mirror
//! the YAML structure, and provides a loader that reads and validates the
//! file.

use std::path::{Path, PathBuf};

use serde::Deserialize;

/// Default simulation time quantum per step, in milliseconds.
pub const DEFAULT_SLICE_MS: u64 = 50;

/// Default lockstep period, in milliseconds of simulated time.
pub const DEFAULT_LOCKSTEP_PERIOD_MS: u64 = 100;

/// Default wall-clock tick interval, in milliseconds.
pub const DEFAULT_WALL_TICK_MS: u64 = 50;

/// Errors that can occur when loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read the configuration file from disk.
    #[error("failed to read config file: {source}")]
    Io {
        /// The underlying I/O error.
        #[from]
        source: std::io::Error,
    },

    /// Failed to parse YAML content.
    #[error("failed to parse config YAML: {source}")]
    Yaml {
        /// The underlying YAML parse error.
        source: serde_yml::Error,
    },

    /// The configuration parsed but carries an unusable value.
    #[error("invalid configuration: {reason}")]
    Invalid {
        /// Explanation of what is wrong with the configuration.
        reason: String,
    },
}

impl From<serde_yml::Error> for ConfigError {
    fn from(source: serde_yml::Error) -> Self {
        Self::Yaml { source }
    }
}

/// Timing parameters of the lockstep clock.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ClockConfig {
    /// Simulated milliseconds each step advances.
    pub slice_ms: u64,

    /// Simulated milliseconds per lockstep index.
    pub lockstep_period_ms: u64,

    /// Wall-clock milliseconds between periodic ticks.
    pub wall_tick_ms: u64,

    /// Whether to gate steps on network confirmations. `false` runs the
    /// clock in offline/single-player mode where the admission gate is a
    /// no-op.
    pub lockstep_waiting: bool,
}

impl Default for ClockConfig {
    fn default() -> Self {
        Self {
            slice_ms: DEFAULT_SLICE_MS,
            lockstep_period_ms: DEFAULT_LOCKSTEP_PERIOD_MS,
            wall_tick_ms: DEFAULT_WALL_TICK_MS,
            lockstep_waiting: true,
        }
    }
}

impl ClockConfig {
    /// A config for offline/single-player runs: default timing, no
    /// lockstep gating.
    pub fn offline() -> Self {
        Self {
            lockstep_waiting: false,
            ..Self::default()
        }
    }

    /// Validate the timing parameters.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] if any interval is zero or the
    /// lockstep period is not a whole number of slices (lockstep indices
    /// must land exactly on step boundaries on every client).
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.slice_ms == 0 {
            return Err(ConfigError::Invalid {
                reason: "slice_ms must be at least 1".to_owned(),
            });
        }
        if self.lockstep_period_ms == 0 {
            return Err(ConfigError::Invalid {
                reason: "lockstep_period_ms must be at least 1".to_owned(),
            });
        }
        if self.wall_tick_ms == 0 {
            return Err(ConfigError::Invalid {
                reason: "wall_tick_ms must be at least 1".to_owned(),
            });
        }
        if self
            .lockstep_period_ms
            .checked_rem(self.slice_ms)
            .is_none_or(|remainder| remainder != 0)
        {
            return Err(ConfigError::Invalid {
                reason: format!(
                    "lockstep_period_ms ({}) must be a multiple of slice_ms ({})",
                    self.lockstep_period_ms, self.slice_ms
                ),
            });
        }
        Ok(())
    }
}

/// Replay recording and loading paths for an engine run.
#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize)]
#[serde(default)]
pub struct ReplayConfig {
    /// File to record accepted batches into, if set.
    pub record_path: Option<PathBuf>,

    /// Replay log to load before the run, if set.
    pub load_path: Option<PathBuf>,
}

/// Bounds of an engine demo run.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    /// Simulated milliseconds to fast-forward through during the run.
    pub run_for_ms: u64,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self { run_for_ms: 60_000 }
    }
}

/// Top-level engine configuration.
///
/// Mirrors the structure of `lockstep-config.yaml`. All fields have
/// defaults, so an empty file is a valid configuration.
#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Clock timing parameters.
    pub clock: ClockConfig,

    /// Run bounds.
    pub run: RunConfig,

    /// Replay record/load paths.
    pub replay: ReplayConfig,
}

impl EngineConfig {
    /// Load configuration from a YAML file at the given path.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Io`] if the file cannot be read,
    /// [`ConfigError::Yaml`] if it fails to parse, or
    /// [`ConfigError::Invalid`] if the clock timing is unusable.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = serde_yml::from_str(&content)?;
        config.clock.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        ClockConfig::default().validate().unwrap();
        assert_eq!(ClockConfig::default().slice_ms, 50);
        assert_eq!(ClockConfig::default().lockstep_period_ms, 100);
        assert!(ClockConfig::default().lockstep_waiting);
    }

    #[test]
    fn offline_config_disables_lockstep_waiting() {
        let config = ClockConfig::offline();
        assert!(!config.lockstep_waiting);
        config.validate().unwrap();
    }

    #[test]
    fn zero_intervals_are_rejected() {
        let config = ClockConfig {
            slice_ms: 0,
            ..ClockConfig::default()
        };
        assert!(config.validate().is_err());

        let config = ClockConfig {
            lockstep_period_ms: 0,
            ..ClockConfig::default()
        };
        assert!(config.validate().is_err());

        let config = ClockConfig {
            wall_tick_ms: 0,
            ..ClockConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn period_must_be_a_multiple_of_the_slice() {
        let config = ClockConfig {
            slice_ms: 50,
            lockstep_period_ms: 120,
            ..ClockConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid { .. })
        ));
    }

    #[test]
    fn yaml_fills_missing_fields_with_defaults() {
        let config: EngineConfig = serde_yml::from_str("clock:\n  slice_ms: 25\n").unwrap();
        assert_eq!(config.clock.slice_ms, 25);
        assert_eq!(config.clock.lockstep_period_ms, DEFAULT_LOCKSTEP_PERIOD_MS);
        assert_eq!(config.run.run_for_ms, 60_000);
        assert!(config.replay.record_path.is_none());
    }

    #[test]
    fn empty_yaml_is_a_valid_configuration() {
        let config: EngineConfig = serde_yml::from_str("{}").unwrap();
        config.clock.validate().unwrap();
    }
}
