//! Error type for the engine binary.
//!
//! Uses `thiserror` to wrap the failures of each startup phase: loading
//! configuration, building the clock, loading or recording replay logs,
//! and the run itself.

use lockstep_core::clock::ClockError;
use lockstep_core::config::ConfigError;
use lockstep_core::replay::ReplayError;

/// Errors that can occur while running the engine.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Configuration could not be loaded or is invalid.
    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    /// A clock operation failed.
    #[error("clock error: {0}")]
    Clock(#[from] ClockError),

    /// A replay log could not be recorded or loaded.
    #[error("replay error: {0}")]
    Replay(#[from] ReplayError),

    /// A file could not be opened or created.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
