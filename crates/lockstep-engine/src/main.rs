//! Engine entry point for the lockstep clock.
//!
//! Wires the clock to its configuration file and replay logs, then drives
//! a bounded demo run:
//!
//! ```text
//! lockstep-config.yaml --> LockstepClock --> LoggingExecutor
//!            replay load ---^       ^--- replay record
//! ```
//!
//! The run fast-forwards through `run.run_for_ms` of simulated time. With
//! `clock.lockstep_waiting: true` the run only progresses as far as the
//! loaded replay log confirms; offline runs (`lockstep_waiting: false`)
//! go the full distance.

mod error;

use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::PathBuf;

use tracing::info;
use tracing_subscriber::EnvFilter;

use lockstep_core::clock::LockstepClock;
use lockstep_core::config::EngineConfig;
use lockstep_core::executor::LoggingExecutor;
use lockstep_core::replay;

use crate::error::EngineError;

/// Default configuration path, relative to the working directory.
const DEFAULT_CONFIG_PATH: &str = "lockstep-config.yaml";

/// Application entry point.
///
/// Initializes logging, loads configuration from the YAML file (path from
/// the first CLI argument, falling back to `lockstep-config.yaml`), builds
/// the clock, wires replay recording and loading, then fast-forwards
/// through the configured run.
///
/// # Errors
///
/// Returns an error if initialization, replay wiring, or the run fails.
#[tokio::main]
async fn main() -> Result<(), EngineError> {
    // Initialize structured logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(true)
        .init();

    info!("lockstep-engine starting");

    // Load configuration
    let config_path = std::env::args()
        .nth(1)
        .map_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH), PathBuf::from);
    let config = EngineConfig::load(&config_path)?;
    info!(
        config_path = %config_path.display(),
        slice_ms = config.clock.slice_ms,
        lockstep_period_ms = config.clock.lockstep_period_ms,
        wall_tick_ms = config.clock.wall_tick_ms,
        lockstep_waiting = config.clock.lockstep_waiting,
        run_for_ms = config.run.run_for_ms,
        "configuration loaded"
    );

    // Build the clock and hand it the demo executor
    let mut clock = LockstepClock::new(config.clock)?;
    clock.set_task_executor(Box::new(LoggingExecutor::new()));

    // Wire replay recording
    if let Some(record_path) = &config.replay.record_path {
        let sink = BufWriter::new(File::create(record_path)?);
        clock.attach_replay_sink(Box::new(sink))?;
        info!(record_path = %record_path.display(), "replay recording enabled");
    }

    // Load a prior replay log into the task queue
    if let Some(load_path) = &config.replay.load_path {
        let reader = BufReader::new(File::open(load_path)?);
        let summary = replay::load_into(reader, &clock.task_queue())?;
        info!(
            load_path = %load_path.display(),
            batches = summary.batches_loaded,
            last_lockstep = ?summary.last_lockstep,
            "replay log loaded"
        );
    }

    // Run the simulation
    info!(run_for_ms = config.run.run_for_ms, "starting the run");
    clock.fast_forward(config.run.run_for_ms).await?;

    // Flush and detach the replay sink
    clock.stop().await;

    info!(
        elapsed_ms = clock.elapsed_ms(),
        lockstep = %clock.current_lockstep(),
        "run complete"
    );
    Ok(())
}
