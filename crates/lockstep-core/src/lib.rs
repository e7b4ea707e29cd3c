//! Deterministic lockstep simulation clock.
//!
//! This crate owns the clock that keeps independently-running game clients
//! bit-for-bit consistent: it advances simulated time in fixed slices,
//! gates each step on network-confirmed locksteps, and delivers confirmed
//! task batches to the game in a strict, reproducible order.
//!
//! # Modules
//!
//! - [`speed`] -- [`SpeedController`] with the asymmetric speed-change law
//!   and pause state.
//! - [`timerable`] -- [`TimerableRegistry`] for independently-periodic
//!   callbacks driven off each tick.
//! - [`queue`] -- [`TaskQueue`] with monotonic admission control and the
//!   blocking admission wait.
//! - [`replay`] -- [`ReplayChannel`] append-only log of accepted batches
//!   and the loader that replays a log through the live acceptance path.
//! - [`executor`] -- The [`TaskExecutor`] seam to the game simulation.
//! - [`clock`] -- [`LockstepClock`], the orchestrator that ties the above
//!   to a periodic tick source.
//! - [`config`] -- Configuration loading from `lockstep-config.yaml` into
//!   strongly-typed structs.
//!
//! [`SpeedController`]: speed::SpeedController
//! [`TimerableRegistry`]: timerable::TimerableRegistry
//! [`TaskQueue`]: queue::TaskQueue
//! [`ReplayChannel`]: replay::ReplayChannel
//! [`TaskExecutor`]: executor::TaskExecutor
//! [`LockstepClock`]: clock::LockstepClock

pub mod clock;
pub mod config;
pub mod executor;
pub mod queue;
pub mod replay;
pub mod speed;
pub mod timerable;
