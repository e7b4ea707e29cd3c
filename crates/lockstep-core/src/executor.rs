//! The executor seam between the clock and the game simulation.
//!
//! The clock does not know what a task means; it hands each confirmed
//! packet to a [`TaskExecutor`] at the right lockstep. One bad task must
//! not freeze the shared game clock for all players, so per-packet
//! failures are collected into a [`BatchOutcome`] and the batch continues.

use lockstep_types::{LockstepIndex, TaskPacket};
use tracing::debug;

/// Error raised by a task's simulation effect.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("task execution failed: {message}")]
pub struct ExecutorError {
    /// Description of the failure.
    pub message: String,
}

impl ExecutorError {
    /// Create an error from a failure description.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Capability consumed by the clock to apply confirmed tasks to the
/// simulation.
///
/// Implementations mutate game state; the clock guarantees every client
/// sees the same packets in the same order at the same lockstep.
pub trait TaskExecutor: Send {
    /// Apply one packet's effect to the simulation.
    ///
    /// # Errors
    ///
    /// Returns [`ExecutorError`] if the effect fails; the clock logs the
    /// failure and continues with the remaining packets of the batch.
    fn execute(&mut self, packet: &TaskPacket) -> Result<(), ExecutorError>;
}

/// One packet's failure within a batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PacketFailure {
    /// Index of the packet within the batch.
    pub packet_index: usize,
    /// The error the executor returned.
    pub error: ExecutorError,
}

/// Aggregated result of executing one batch, success and failure alike.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchOutcome {
    /// The lockstep the batch executed at.
    pub lockstep: LockstepIndex,
    /// Number of packets that executed successfully.
    pub executed: usize,
    /// Per-packet failures, in batch order.
    pub failures: Vec<PacketFailure>,
}

impl BatchOutcome {
    /// Create an empty outcome for the given lockstep.
    pub const fn new(lockstep: LockstepIndex) -> Self {
        Self {
            lockstep,
            executed: 0,
            failures: Vec::new(),
        }
    }

    /// Whether every packet executed successfully.
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

/// An executor that only logs each packet.
///
/// Used to exercise the clock end-to-end before a game simulation is
/// wired in, and by the engine binary's offline demo run.
#[derive(Debug, Clone, Default)]
pub struct LoggingExecutor;

impl LoggingExecutor {
    /// Create a new logging executor.
    pub const fn new() -> Self {
        Self
    }
}

impl TaskExecutor for LoggingExecutor {
    fn execute(&mut self, packet: &TaskPacket) -> Result<(), ExecutorError> {
        debug!(payload_len = packet.payload.len(), "task executed");
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn logging_executor_accepts_every_packet() {
        let mut executor = LoggingExecutor::new();
        assert!(executor.execute(&TaskPacket::new(vec![1, 2, 3])).is_ok());
        assert!(executor.execute(&TaskPacket::new(Vec::new())).is_ok());
    }

    #[test]
    fn outcome_tracks_failures_without_aborting() {
        let mut outcome = BatchOutcome::new(LockstepIndex::new(4));
        outcome.executed = 2;
        outcome.failures.push(PacketFailure {
            packet_index: 1,
            error: ExecutorError::new("bad task"),
        });
        assert!(!outcome.is_clean());
        assert_eq!(outcome.executed, 2);
    }
}
