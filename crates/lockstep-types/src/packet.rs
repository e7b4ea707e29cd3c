//! Task packets and batches: the opaque simulation commands the clock
//! delivers in lockstep order.
//!
//! The clock never interprets a packet -- it only guarantees that every
//! client executes the same packets at the same lockstep index. Payload
//! encoding is owned by the game layer.

use serde::{Deserialize, Serialize};

use crate::index::LockstepIndex;

/// A single opaque simulation command.
///
/// The payload is whatever the game layer serialized; the clock and the
/// replay log treat it as bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskPacket {
    /// Opaque command bytes, owned by the game layer.
    pub payload: Vec<u8>,
}

impl TaskPacket {
    /// Create a packet from raw payload bytes.
    pub const fn new(payload: Vec<u8>) -> Self {
        Self { payload }
    }
}

/// An ordered collection of [`TaskPacket`]s confirmed for one lockstep.
///
/// Immutable once accepted by the clock. At most one batch is accepted per
/// lockstep index; a second batch for an already-confirmed index is a
/// protocol violation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskBatch {
    /// The lockstep index this batch must execute at.
    pub lockstep: LockstepIndex,
    /// The packets to execute, in order.
    pub packets: Vec<TaskPacket>,
}

impl TaskBatch {
    /// Create a batch for the given lockstep index.
    pub const fn new(lockstep: LockstepIndex, packets: Vec<TaskPacket>) -> Self {
        Self { lockstep, packets }
    }

    /// Create a batch confirming a lockstep with no tasks.
    ///
    /// Empty batches raise the confirmation frontier without ever being
    /// queued or executed.
    pub const fn empty(lockstep: LockstepIndex) -> Self {
        Self {
            lockstep,
            packets: Vec::new(),
        }
    }

    /// Whether this batch carries no packets.
    pub fn is_empty(&self) -> bool {
        self.packets.is_empty()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn batch_round_trips_through_json() {
        let batch = TaskBatch::new(
            LockstepIndex::new(7),
            vec![TaskPacket::new(vec![1, 2, 3]), TaskPacket::new(vec![])],
        );
        let json = serde_json::to_string(&batch).unwrap();
        let back: TaskBatch = serde_json::from_str(&json).unwrap();
        assert_eq!(back, batch);
    }

    #[test]
    fn empty_batch_has_no_packets() {
        let batch = TaskBatch::empty(LockstepIndex::new(3));
        assert!(batch.is_empty());
        assert_eq!(batch.lockstep, LockstepIndex::new(3));
    }
}
