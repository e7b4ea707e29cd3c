//! Ordered buffer of confirmed task batches with monotonic admission
//! control.
//!
//! The queue is shared between the clock (consumer, tick context) and the
//! network layer (producer). One lock covers the ordered buffer and the
//! confirmation frontier as a single critical-section family;
//! [`TaskQueue::await_admission`] is the system's only backpressure point,
//! where the simulation stalls to avoid running ahead of network consensus.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use lockstep_types::{LockstepIndex, TaskBatch};
use tokio::sync::Notify;
use tokio::sync::futures::Notified;
use tracing::{debug, trace};

use crate::replay::ReplayChannel;

/// Protocol-consistency violations. All variants are fatal to the clock
/// instance: they indicate the network layer or a caller broke the
/// lockstep contract, and continuing would risk undetected desync.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QueueError {
    /// A confirmation arrived out of order or duplicated an index.
    #[error("out-of-order confirmation: expected {expected:?}, got {got}")]
    OutOfOrderConfirmation {
        /// The only admissible next index, if the frontier is bounded.
        expected: Option<LockstepIndex>,
        /// The index that was actually submitted.
        got: LockstepIndex,
    },

    /// A batch was inserted for an index already held in the buffer.
    #[error("duplicate batch for {lockstep}")]
    DuplicateLockstep {
        /// The index confirmed twice.
        lockstep: LockstepIndex,
    },

    /// A queued batch was found below the lockstep being drained: a
    /// confirmed batch was never consumed and the clock fell behind its
    /// own queue.
    #[error("stale batch for {queued} found while draining {requested}")]
    StaleBatch {
        /// The index of the stale batch at the head of the buffer.
        queued: LockstepIndex,
        /// The index the clock asked to drain.
        requested: LockstepIndex,
    },
}

/// Cooperative shutdown signal.
///
/// `stop()` raises it from a control context to unblock a tick context
/// suspended in [`TaskQueue::await_admission`]; without it a permanently
/// silent peer would deadlock shutdown.
#[derive(Debug, Default)]
pub struct ShutdownSignal {
    requested: AtomicBool,
    notify: Notify,
}

impl ShutdownSignal {
    /// Create an unraised signal.
    pub const fn new() -> Self {
        Self {
            requested: AtomicBool::new(false),
            notify: Notify::const_new(),
        }
    }

    /// Raise the signal and wake every waiter. Idempotent.
    pub fn request(&self) {
        self.requested.store(true, Ordering::Release);
        self.notify.notify_waiters();
    }

    /// Whether the signal has been raised.
    pub fn is_requested(&self) -> bool {
        self.requested.load(Ordering::Acquire)
    }

    /// A future resolved by the next [`request`](Self::request).
    pub fn notified(&self) -> Notified<'_> {
        self.notify.notified()
    }
}

/// The confirmation frontier: the highest lockstep index the network layer
/// has confirmed. Monotonically non-decreasing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Frontier {
    /// Normal networked mode. `None` means nothing is confirmed yet, so
    /// the only admissible confirmation is lockstep 0.
    Bounded {
        /// Highest confirmed index so far.
        confirmed: Option<LockstepIndex>,
    },
    /// Offline/single-player mode: the admission gate is a no-op.
    Unbounded,
}

impl Frontier {
    /// Whether the simulation may advance to the given lockstep.
    fn admits(self, lockstep: LockstepIndex) -> bool {
        match self {
            Self::Unbounded => true,
            Self::Bounded { confirmed } => confirmed.is_some_and(|high| high >= lockstep),
        }
    }

    /// The only index the next confirmation may carry, or `None` when the
    /// frontier is unbounded and anything goes.
    fn next_expected(self) -> Option<LockstepIndex> {
        match self {
            Self::Unbounded => None,
            Self::Bounded { confirmed } => Some(
                confirmed
                    .and_then(LockstepIndex::next)
                    .unwrap_or(LockstepIndex::ZERO),
            ),
        }
    }

    fn raise(&mut self, lockstep: LockstepIndex) {
        if let Self::Bounded { confirmed } = self {
            let raised = confirmed.map_or(lockstep, |high| high.max(lockstep));
            *confirmed = Some(raised);
        }
    }
}

/// Whether the queue gates the simulation on network confirmations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmissionMode {
    /// Gate every lockstep on a confirmation (networked game).
    Networked,
    /// Admit every lockstep unconditionally (offline game, replay tools).
    Unbounded,
}

/// Outcome of [`TaskQueue::await_admission`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// The frontier reached the requested lockstep.
    Granted,
    /// The shutdown signal was raised while waiting.
    ShutdownRequested,
}

struct QueueInner {
    batches: VecDeque<TaskBatch>,
    frontier: Frontier,
}

/// Ordered buffer of confirmed task batches keyed by lockstep index.
pub struct TaskQueue {
    inner: Mutex<QueueInner>,
    admitted: Notify,
    replay: Arc<ReplayChannel>,
}

/// Recover the guarded data even if a panicking holder poisoned the lock;
/// the frontier and buffer stay structurally valid either way.
fn lock_recovering(mutex: &Mutex<QueueInner>) -> MutexGuard<'_, QueueInner> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl TaskQueue {
    /// Create a queue in the given admission mode, forwarding accepted
    /// batches to the given replay channel.
    pub fn new(mode: AdmissionMode, replay: Arc<ReplayChannel>) -> Self {
        let frontier = match mode {
            AdmissionMode::Networked => Frontier::Bounded { confirmed: None },
            AdmissionMode::Unbounded => Frontier::Unbounded,
        };
        Self {
            inner: Mutex::new(QueueInner {
                batches: VecDeque::new(),
                frontier,
            }),
            admitted: Notify::new(),
            replay,
        }
    }

    /// Accept a confirmed batch from the network layer (or the replay
    /// loader, which shares this path and these invariants).
    ///
    /// Empty batches raise the frontier without being queued, recorded, or
    /// executed. Non-empty batches are buffered in lockstep order and
    /// forwarded to the replay channel. Any waiter blocked on the frontier
    /// is woken.
    ///
    /// # Errors
    ///
    /// [`QueueError::OutOfOrderConfirmation`] if the batch does not carry
    /// the next expected index, or [`QueueError::DuplicateLockstep`] if a
    /// batch for that index is already buffered. Both are fatal protocol
    /// violations.
    pub fn accept(&self, batch: TaskBatch) -> Result<(), QueueError> {
        let lockstep = batch.lockstep;
        {
            let mut inner = lock_recovering(&self.inner);

            if let Some(expected) = inner.frontier.next_expected()
                && lockstep != expected
            {
                return Err(QueueError::OutOfOrderConfirmation {
                    expected: Some(expected),
                    got: lockstep,
                });
            }

            if !batch.is_empty() {
                let position = inner
                    .batches
                    .partition_point(|queued| queued.lockstep <= lockstep);
                if position > 0
                    && inner
                        .batches
                        .get(position.wrapping_sub(1))
                        .is_some_and(|queued| queued.lockstep == lockstep)
                {
                    return Err(QueueError::DuplicateLockstep { lockstep });
                }
                debug!(%lockstep, packets = batch.packets.len(), "batch accepted");
                self.replay.record(&batch);
                inner.batches.insert(position, batch);
            }

            inner.frontier.raise(lockstep);
        }

        self.admitted.notify_waiters();
        Ok(())
    }

    /// Remove and return every batch due at exactly the given lockstep, in
    /// acceptance order.
    ///
    /// # Errors
    ///
    /// [`QueueError::StaleBatch`] if a buffered batch is found strictly
    /// below the requested index. Fatal: a confirmed batch was never
    /// consumed.
    pub fn pop_due(&self, lockstep: LockstepIndex) -> Result<Vec<TaskBatch>, QueueError> {
        let mut inner = lock_recovering(&self.inner);
        let mut due = Vec::new();
        while let Some(front) = inner.batches.front() {
            if front.lockstep < lockstep {
                return Err(QueueError::StaleBatch {
                    queued: front.lockstep,
                    requested: lockstep,
                });
            }
            if front.lockstep > lockstep {
                break;
            }
            if let Some(batch) = inner.batches.pop_front() {
                due.push(batch);
            }
        }
        Ok(due)
    }

    /// Suspend until the frontier reaches the given lockstep, or until the
    /// shutdown signal is raised.
    ///
    /// Returns immediately when already admissible (always, in unbounded
    /// mode). No timeout is applied: a permanently unresponsive network
    /// layer stalls the caller until shutdown.
    pub async fn await_admission(
        &self,
        lockstep: LockstepIndex,
        shutdown: &ShutdownSignal,
    ) -> Admission {
        loop {
            // Register both wakeups before checking the conditions, so a
            // concurrent accept() or request() cannot slip between check
            // and suspension.
            let admitted = self.admitted.notified();
            let stopped = shutdown.notified();
            tokio::pin!(admitted, stopped);

            if lock_recovering(&self.inner).frontier.admits(lockstep) {
                return Admission::Granted;
            }
            if shutdown.is_requested() {
                return Admission::ShutdownRequested;
            }

            trace!(%lockstep, "waiting for lockstep confirmation");
            tokio::select! {
                () = &mut admitted => {}
                () = &mut stopped => {}
            }
        }
    }

    /// Current confirmation frontier.
    pub fn frontier(&self) -> Frontier {
        lock_recovering(&self.inner).frontier
    }

    /// Number of buffered batches.
    pub fn len(&self) -> usize {
        lock_recovering(&self.inner).batches.len()
    }

    /// Whether no batches are buffered.
    pub fn is_empty(&self) -> bool {
        lock_recovering(&self.inner).batches.is_empty()
    }

    /// Remove and return every still-buffered batch in order, for
    /// persisting unconsumed confirmations into a save game.
    pub fn drain_remaining(&self) -> Vec<TaskBatch> {
        lock_recovering(&self.inner).batches.drain(..).collect()
    }
}

impl core::fmt::Debug for TaskQueue {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let inner = lock_recovering(&self.inner);
        f.debug_struct("TaskQueue")
            .field("buffered", &inner.batches.len())
            .field("frontier", &inner.frontier)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use lockstep_types::TaskPacket;
    use std::time::Duration;

    fn networked_queue() -> TaskQueue {
        TaskQueue::new(AdmissionMode::Networked, Arc::new(ReplayChannel::new()))
    }

    fn unbounded_queue() -> TaskQueue {
        TaskQueue::new(AdmissionMode::Unbounded, Arc::new(ReplayChannel::new()))
    }

    fn batch(lockstep: u64, marker: u8) -> TaskBatch {
        TaskBatch::new(
            LockstepIndex::new(lockstep),
            vec![TaskPacket::new(vec![marker])],
        )
    }

    #[test]
    fn pop_due_returns_exactly_the_batch_for_the_index_never_early() {
        let queue = networked_queue();
        queue.accept(batch(0, 10)).unwrap();
        queue.accept(batch(1, 11)).unwrap();

        let due = queue.pop_due(LockstepIndex::ZERO).unwrap();
        assert_eq!(due, vec![batch(0, 10)]);

        // Never more than once.
        assert!(queue.pop_due(LockstepIndex::ZERO).unwrap().is_empty());

        let due = queue.pop_due(LockstepIndex::new(1)).unwrap();
        assert_eq!(due, vec![batch(1, 11)]);
    }

    #[test]
    fn batches_buffered_early_are_not_returned_early() {
        let queue = networked_queue();
        queue.accept(TaskBatch::empty(LockstepIndex::ZERO)).unwrap();
        queue.accept(batch(1, 7)).unwrap();

        // Lockstep 1 is confirmed but the clock is still at 0.
        assert!(queue.pop_due(LockstepIndex::ZERO).unwrap().is_empty());
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn out_of_order_confirmation_is_a_fatal_protocol_violation() {
        let queue = networked_queue();
        let err = queue.accept(batch(3, 1)).unwrap_err();
        assert_eq!(
            err,
            QueueError::OutOfOrderConfirmation {
                expected: Some(LockstepIndex::ZERO),
                got: LockstepIndex::new(3),
            }
        );
    }

    #[test]
    fn duplicate_lockstep_is_rejected() {
        // Unbounded mode skips the monotonic gate, so a duplicate can
        // reach the buffer check.
        let queue = unbounded_queue();
        queue.accept(batch(2, 1)).unwrap();
        let err = queue.accept(batch(2, 2)).unwrap_err();
        assert_eq!(
            err,
            QueueError::DuplicateLockstep {
                lockstep: LockstepIndex::new(2),
            }
        );
    }

    #[test]
    fn stale_batch_below_the_drained_index_is_fatal() {
        let queue = networked_queue();
        queue.accept(batch(0, 1)).unwrap();
        let err = queue.pop_due(LockstepIndex::new(1)).unwrap_err();
        assert_eq!(
            err,
            QueueError::StaleBatch {
                queued: LockstepIndex::ZERO,
                requested: LockstepIndex::new(1),
            }
        );
    }

    #[test]
    fn empty_batches_raise_the_frontier_without_being_queued() {
        let queue = networked_queue();
        queue.accept(TaskBatch::empty(LockstepIndex::ZERO)).unwrap();
        queue.accept(TaskBatch::empty(LockstepIndex::new(1))).unwrap();
        assert!(queue.is_empty());
        assert_eq!(
            queue.frontier(),
            Frontier::Bounded {
                confirmed: Some(LockstepIndex::new(1)),
            }
        );
    }

    #[tokio::test]
    async fn await_admission_never_returns_before_the_frontier_reaches_the_index() {
        let queue = Arc::new(networked_queue());
        let shutdown = Arc::new(ShutdownSignal::new());

        let waiter_queue = Arc::clone(&queue);
        let waiter_shutdown = Arc::clone(&shutdown);
        let waiter = tokio::spawn(async move {
            waiter_queue
                .await_admission(LockstepIndex::ZERO, &waiter_shutdown)
                .await
        });

        // Nothing confirmed yet: the waiter must still be suspended.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        queue.accept(TaskBatch::empty(LockstepIndex::ZERO)).unwrap();
        assert_eq!(waiter.await.unwrap(), Admission::Granted);
    }

    #[tokio::test]
    async fn await_admission_returns_immediately_when_already_admissible() {
        let queue = networked_queue();
        let shutdown = ShutdownSignal::new();
        queue.accept(TaskBatch::empty(LockstepIndex::ZERO)).unwrap();
        assert_eq!(
            queue.await_admission(LockstepIndex::ZERO, &shutdown).await,
            Admission::Granted
        );
    }

    #[tokio::test]
    async fn unbounded_mode_admits_everything() {
        let queue = unbounded_queue();
        let shutdown = ShutdownSignal::new();
        assert_eq!(
            queue
                .await_admission(LockstepIndex::new(1_000_000), &shutdown)
                .await,
            Admission::Granted
        );
    }

    #[tokio::test]
    async fn shutdown_unblocks_a_suspended_admission_wait() {
        let queue = Arc::new(networked_queue());
        let shutdown = Arc::new(ShutdownSignal::new());

        let waiter_queue = Arc::clone(&queue);
        let waiter_shutdown = Arc::clone(&shutdown);
        let waiter = tokio::spawn(async move {
            waiter_queue
                .await_admission(LockstepIndex::ZERO, &waiter_shutdown)
                .await
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        shutdown.request();
        assert_eq!(waiter.await.unwrap(), Admission::ShutdownRequested);
    }

    #[test]
    fn drain_remaining_returns_unconsumed_batches_in_order() {
        let queue = networked_queue();
        queue.accept(batch(0, 1)).unwrap();
        queue.accept(batch(1, 2)).unwrap();
        let drained = queue.drain_remaining();
        assert_eq!(drained, vec![batch(0, 1), batch(1, 2)]);
        assert!(queue.is_empty());
    }
}
