//! Independently-periodic callbacks driven off the simulation tick.
//!
//! A timerable may use a period shorter than the tick slice; the registry
//! then fires it multiple times per slice so the long-run rate stays
//! faithful instead of being limited to once per slice.
//!
//! Additions and removals are staged in side lists and merged into the
//! live registry only at the integration point inside a step. The live
//! list is never mutated while it is being iterated, and the control
//! context never blocks on the (potentially slower) tick context.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tracing::{debug, warn};

/// A periodic callback scheduled on the clock.
pub trait Timerable: Send {
    /// Invoked each time the registration's period elapses.
    fn on_timer(&mut self);
}

/// Handle identifying one scheduled [`Timerable`].
///
/// Issued by [`TimerableHandle::schedule`] and used to cancel the
/// registration. Cancelling an id that is no longer (or never was)
/// registered is reported but harmless, so racing shutdown paths can
/// cancel idempotently.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TimerableId(u64);

impl core::fmt::Display for TimerableId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "timerable {}", self.0)
    }
}

/// One live registration: callback, period, and countdown to next fire.
struct ScheduledTimerable {
    id: TimerableId,
    callback: Box<dyn Timerable>,
    period_ms: u64,
    /// Goes negative when the slice overshoots the period; the fire loop
    /// pays the debt back by firing once per owed period.
    countdown_ms: i64,
}

impl ScheduledTimerable {
    fn check_execution(&mut self, slice_ms: i64) {
        self.countdown_ms = self.countdown_ms.saturating_sub(slice_ms);
        let period = i64::try_from(self.period_ms).unwrap_or(i64::MAX);
        while self.countdown_ms <= 0 {
            self.callback.on_timer();
            self.countdown_ms = self.countdown_ms.saturating_add(period);
        }
    }
}

/// Staged add/remove requests shared between control and tick contexts.
#[derive(Default)]
struct StagedOps {
    adds: Mutex<Vec<ScheduledTimerable>>,
    removals: Mutex<Vec<TimerableId>>,
    next_id: AtomicU64,
}

/// Recover the guarded data even if a panicking holder poisoned the lock;
/// the staging lists stay structurally valid either way.
fn lock_recovering<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Cloneable control-context handle for scheduling and cancelling.
///
/// Requests made through the handle are buffered and only applied at the
/// next step's integration point, never while the registry is iterating.
#[derive(Clone)]
pub struct TimerableHandle {
    staged: Arc<StagedOps>,
}

impl TimerableHandle {
    /// Buffer a registration; applied at the next integration point.
    ///
    /// Periods shorter than the tick slice are honored by firing multiple
    /// times per slice. A zero period is clamped to one millisecond to
    /// keep the fire loop finite.
    pub fn schedule(&self, callback: Box<dyn Timerable>, period_ms: u64) -> TimerableId {
        let id = TimerableId(self.staged.next_id.fetch_add(1, Ordering::Relaxed));
        let period_ms = period_ms.max(1);
        let countdown_ms = i64::try_from(period_ms).unwrap_or(i64::MAX);
        lock_recovering(&self.staged.adds).push(ScheduledTimerable {
            id,
            callback,
            period_ms,
            countdown_ms,
        });
        id
    }

    /// Buffer a removal; applied at the next integration point.
    pub fn cancel(&self, id: TimerableId) {
        lock_recovering(&self.staged.removals).push(id);
    }
}

impl core::fmt::Debug for TimerableHandle {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("TimerableHandle").finish_non_exhaustive()
    }
}

/// The live set of scheduled timerables.
///
/// Owned by the tick context; only [`integrate_pending`] and [`tick`]
/// touch the live list, so callbacks never observe a registry mutated
/// mid-iteration.
///
/// [`integrate_pending`]: TimerableRegistry::integrate_pending
/// [`tick`]: TimerableRegistry::tick
#[derive(Default)]
pub struct TimerableRegistry {
    active: Vec<ScheduledTimerable>,
    staged: Arc<StagedOps>,
}

impl TimerableRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Return a control-context handle for scheduling and cancelling.
    pub fn handle(&self) -> TimerableHandle {
        TimerableHandle {
            staged: Arc::clone(&self.staged),
        }
    }

    /// Number of live registrations.
    pub fn len(&self) -> usize {
        self.active.len()
    }

    /// Whether no registrations are live.
    pub fn is_empty(&self) -> bool {
        self.active.is_empty()
    }

    /// Merge staged additions and removals into the live list.
    ///
    /// Additions are applied before removals, so a schedule-then-cancel
    /// staged within the same step nets out to no registration. A removal
    /// whose id is not live is reported and skipped.
    pub fn integrate_pending(&mut self) {
        let adds: Vec<ScheduledTimerable> = std::mem::take(&mut *lock_recovering(&self.staged.adds));
        for add in adds {
            debug!(id = %add.id, period_ms = add.period_ms, "timerable registered");
            self.active.push(add);
        }

        let removals: Vec<TimerableId> =
            std::mem::take(&mut *lock_recovering(&self.staged.removals));
        for id in removals {
            if let Some(position) = self.active.iter().position(|entry| entry.id == id) {
                self.active.remove(position);
                debug!(%id, "timerable cancelled");
            } else {
                warn!(%id, "cancel requested for a timerable that is not registered");
            }
        }
    }

    /// Advance every live registration by one tick slice, firing each
    /// callback once per elapsed period.
    pub fn tick(&mut self, slice_ms: u64) {
        let slice = i64::try_from(slice_ms).unwrap_or(i64::MAX);
        for entry in &mut self.active {
            entry.check_execution(slice);
        }
    }
}

impl core::fmt::Debug for TimerableRegistry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("TimerableRegistry")
            .field("active", &self.active.len())
            .finish_non_exhaustive()
    }
}
