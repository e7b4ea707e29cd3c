//! Append-only replay log of accepted task batches, and the loader that
//! replays such a log back through the live acceptance path.
//!
//! The stream format is one JSON record per line, written in acceptance
//! order. Loading feeds each record into [`TaskQueue::accept`], so replay
//! and live play share one code path and one set of invariants.
//!
//! Recording is best-effort: losing a replay record must never crash or
//! stall the live game, so I/O failures degrade to "replay unavailable"
//! with a log entry.

use std::io::{BufRead, Write};
use std::sync::{Mutex, MutexGuard, PoisonError};

use lockstep_types::{LockstepIndex, TaskBatch};
use tracing::{debug, info, warn};

use crate::queue::{QueueError, TaskQueue};

/// Errors surfaced by the replay channel.
#[derive(Debug, thiserror::Error)]
pub enum ReplayError {
    /// A sink is already attached; re-attaching is a programmer error.
    #[error("replay sink cannot be attached twice")]
    SinkAlreadyAttached,

    /// The stream could not be read or written.
    #[error("replay I/O failed: {source}")]
    Io {
        /// The underlying I/O error.
        #[from]
        source: std::io::Error,
    },

    /// A record failed to deserialize mid-stream (as opposed to the
    /// stream ending cleanly on a record boundary).
    #[error("replay stream corrupted at record {record}: {source}")]
    Corrupt {
        /// 1-based index of the unreadable record.
        record: usize,
        /// The underlying parse error.
        source: serde_json::Error,
    },

    /// A loaded batch violated the acceptance invariants.
    #[error("replayed batch rejected: {source}")]
    Queue {
        /// The underlying protocol violation.
        #[from]
        source: QueueError,
    },
}

/// Summary returned by a successful [`load_into`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ReplaySummary {
    /// Number of batches fed into the queue.
    pub batches_loaded: usize,
    /// Highest lockstep index seen in the stream.
    pub last_lockstep: Option<LockstepIndex>,
}

type Sink = Box<dyn Write + Send>;

/// Optional output sink receiving every accepted batch in acceptance
/// order.
///
/// The sink is set at most once per clock lifetime; its closing is owned
/// by an external persistence layer, reached through [`detach`].
///
/// [`detach`]: ReplayChannel::detach
#[derive(Default)]
pub struct ReplayChannel {
    sink: Mutex<Option<Sink>>,
}

/// Recover the guarded sink even if a panicking holder poisoned the lock.
fn lock_recovering(mutex: &Mutex<Option<Sink>>) -> MutexGuard<'_, Option<Sink>> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Serialize one batch as a single JSON line.
pub fn write_record(writer: &mut dyn Write, batch: &TaskBatch) -> Result<(), ReplayError> {
    serde_json::to_writer(&mut *writer, batch).map_err(std::io::Error::from)?;
    writer.write_all(b"\n")?;
    Ok(())
}

impl ReplayChannel {
    /// Create a channel with no sink attached.
    pub const fn new() -> Self {
        Self {
            sink: Mutex::new(None),
        }
    }

    /// Attach the output sink.
    ///
    /// # Errors
    ///
    /// [`ReplayError::SinkAlreadyAttached`] if a sink was attached before;
    /// one-shot per clock lifetime.
    pub fn attach(&self, sink: Sink) -> Result<(), ReplayError> {
        let mut guard = lock_recovering(&self.sink);
        if guard.is_some() {
            return Err(ReplayError::SinkAlreadyAttached);
        }
        *guard = Some(sink);
        info!("replay sink attached");
        Ok(())
    }

    /// Whether a sink is currently attached.
    pub fn is_attached(&self) -> bool {
        lock_recovering(&self.sink).is_some()
    }

    /// Best-effort append of one accepted batch to the sink.
    ///
    /// A write or flush failure is logged and swallowed; the live
    /// simulation keeps running with replay degraded.
    pub fn record(&self, batch: &TaskBatch) {
        let mut guard = lock_recovering(&self.sink);
        let Some(sink) = guard.as_mut() else {
            return;
        };
        let written =
            write_record(sink.as_mut(), batch).and_then(|()| sink.flush().map_err(ReplayError::from));
        if let Err(error) = written {
            warn!(lockstep = %batch.lockstep, %error, "replay record dropped");
        }
    }

    /// Flush and release the sink. Safe to call when nothing is attached.
    pub fn detach(&self) {
        let mut guard = lock_recovering(&self.sink);
        if let Some(mut sink) = guard.take() {
            if let Err(error) = sink.flush() {
                warn!(%error, "replay sink flush failed on detach");
            }
            debug!("replay sink detached");
        }
    }
}

impl core::fmt::Debug for ReplayChannel {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ReplayChannel")
            .field("attached", &self.is_attached())
            .finish_non_exhaustive()
    }
}

/// Deserialize a replay stream and feed every batch into the queue,
/// exactly as if the batches arrived over the network.
///
/// Terminates cleanly on end-of-stream. Replay logs are normally loaded
/// into a queue in unbounded admission mode, since empty confirmations are
/// not recorded and the log therefore has index gaps.
///
/// # Errors
///
/// [`ReplayError::Corrupt`] if a record fails to parse mid-stream,
/// [`ReplayError::Io`] if reading fails, or [`ReplayError::Queue`] if an
/// accepted batch violates the queue invariants.
pub fn load_into(reader: impl BufRead, queue: &TaskQueue) -> Result<ReplaySummary, ReplayError> {
    let mut summary = ReplaySummary::default();

    for (line_number, line) in reader.lines().enumerate() {
        let line = line?;
        if line.is_empty() {
            continue;
        }
        let record = line_number.saturating_add(1);
        let batch: TaskBatch = serde_json::from_str(&line)
            .map_err(|source| ReplayError::Corrupt { record, source })?;

        summary.last_lockstep = Some(
            summary
                .last_lockstep
                .map_or(batch.lockstep, |high| high.max(batch.lockstep)),
        );
        queue.accept(batch)?;
        summary.batches_loaded = summary.batches_loaded.saturating_add(1);
    }

    info!(
        batches = summary.batches_loaded,
        last_lockstep = ?summary.last_lockstep,
        "replay log loaded"
    );
    Ok(summary)
}
