//! Shared type definitions for the lockstep simulation clock.
//!
//! This crate is the single source of truth for the types exchanged between
//! the clock, the network layer, and the replay log. It contains pure data
//! only -- no I/O, no runtime.
//!
//! # Modules
//!
//! - [`index`] -- The [`LockstepIndex`] logical time unit.
//! - [`packet`] -- [`TaskPacket`] and [`TaskBatch`], the opaque simulation
//!   commands confirmed per lockstep.

pub mod index;
pub mod packet;

// Re-export all public types at crate root for convenience.
pub use index::LockstepIndex;
pub use packet::{TaskBatch, TaskPacket};
