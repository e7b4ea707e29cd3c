//! The lockstep index: the logical time unit of network synchronization.
//!
//! All clients derive the same index from the same elapsed simulation time,
//! so the index -- not the wall-clock tick -- is the unit the network layer
//! confirms and the clock gates on.

use serde::{Deserialize, Serialize};

/// Logical time index derived from elapsed simulation time.
///
/// `L = elapsed_ms / lockstep_period_ms` (integer division). Identical
/// across all clients at the same elapsed time. Wraps a plain counter;
/// ordering and equality follow the counter.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct LockstepIndex(pub u64);

impl LockstepIndex {
    /// The first lockstep of a game.
    pub const ZERO: Self = Self(0);

    /// Create an index from a raw counter value.
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    /// Return the raw counter value.
    pub const fn get(self) -> u64 {
        self.0
    }

    /// Return the index that follows this one, or `None` on counter
    /// exhaustion.
    pub const fn next(self) -> Option<Self> {
        match self.0.checked_add(1) {
            Some(value) => Some(Self(value)),
            None => None,
        }
    }

    /// Derive the index for a given elapsed simulation time.
    ///
    /// `period_ms` must be non-zero; a zero period yields
    /// [`LockstepIndex::ZERO`] rather than dividing by zero (the clock
    /// config validates the period before any derivation happens).
    pub const fn from_elapsed(elapsed_ms: u64, period_ms: u64) -> Self {
        match elapsed_ms.checked_div(period_ms) {
            Some(value) => Self(value),
            None => Self::ZERO,
        }
    }
}

impl core::fmt::Display for LockstepIndex {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "lockstep {}", self.0)
    }
}

impl From<u64> for LockstepIndex {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl From<LockstepIndex> for u64 {
    fn from(index: LockstepIndex) -> Self {
        index.0
    }
}
