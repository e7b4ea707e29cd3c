//! The lockstep clock orchestrator.
//!
//! One spawned tick task is the only context that mutates elapsed time,
//! the progress accumulator, and the live timerable list, and the only
//! context that invokes the [`TaskExecutor`] -- simulation mutation stays
//! single-threaded and deterministic. The network context feeds
//! confirmations through [`LockstepClock::submit_confirmed_batch`]; the
//! control/UI context uses the speed, pause, and timerable mutators.
//!
//! The step state sits behind an async mutex taken once per wall tick and
//! for the whole of a fast-forward, which gives the two step-running paths
//! mutual exclusion. The only suspension point inside a step is the
//! admission wait, woken by a confirmation or by the shutdown signal.

use std::io::Write;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use lockstep_types::{LockstepIndex, TaskBatch, TaskPacket};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::config::{ClockConfig, ConfigError};
use crate::executor::{BatchOutcome, PacketFailure, TaskExecutor};
use crate::queue::{Admission, AdmissionMode, QueueError, ShutdownSignal, TaskQueue};
use crate::replay::{self, ReplayChannel, ReplayError};
use crate::speed::SpeedController;
use crate::timerable::{Timerable, TimerableHandle, TimerableId, TimerableRegistry};

/// Failures that are fatal to the clock instance.
///
/// These indicate the network layer or a caller broke the lockstep
/// contract (or the time counter is exhausted); continuing would risk
/// undetected desync, so the clock latches the error and stops.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FatalClockError {
    /// The lockstep protocol was violated.
    #[error("lockstep protocol violation: {source}")]
    Protocol {
        /// The underlying queue violation.
        #[from]
        source: QueueError,
    },

    /// The elapsed time counter would overflow.
    #[error("elapsed time counter overflow")]
    TimeOverflow,
}

/// Errors returned by clock control operations.
#[derive(Debug, thiserror::Error)]
pub enum ClockError {
    /// `start()` was called on a clock that is already running.
    #[error("clock already started")]
    AlreadyStarted,

    /// `start()` or a fast-forward was called on a stopped clock; a
    /// stopped clock is never restarted, a fresh instance is required.
    #[error("clock is stopped; create a fresh instance")]
    AlreadyStopped,

    /// The operation tripped (or ran into a previously latched) fatal
    /// failure.
    #[error("fatal clock failure: {source}")]
    Fatal {
        /// The latched fatal failure.
        #[from]
        source: FatalClockError,
    },
}

/// Lifecycle state of the clock.
///
/// `Stopped -> Running <-> Paused -> Stopped`; `Stopped` is both initial
/// and terminal. Pausing does not touch the tick source: ticks keep
/// firing but are inert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClockState {
    /// Not started yet, or terminally stopped.
    Stopped,
    /// Ticking and advancing simulated time.
    Running,
    /// Ticking but inert.
    Paused,
}

impl ClockState {
    const fn as_u8(self) -> u8 {
        match self {
            Self::Stopped => 0,
            Self::Running => 1,
            Self::Paused => 2,
        }
    }

    const fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Running,
            2 => Self::Paused,
            _ => Self::Stopped,
        }
    }
}

/// How a simulation step ended.
enum StepOutcome {
    /// The step ran to completion.
    Completed,
    /// The shutdown signal interrupted the admission wait.
    ShutdownRequested,
}

/// Whether the tick loop should keep running after a tick.
enum TickFlow {
    Continue,
    Stop,
}

/// State owned by the tick context, behind the step mutex.
struct StepState {
    /// Simulated milliseconds elapsed so far.
    elapsed_ms: u64,
    /// Fractional steps accumulated from speed-scaled wall ticks.
    progress: f32,
    /// Live timerable registrations.
    registry: TimerableRegistry,
}

/// Recover guarded data even if a panicking holder poisoned the lock.
fn lock_recovering<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// State shared between the tick task and the control surface.
struct ClockShared {
    config: ClockConfig,
    speed: Mutex<SpeedController>,
    queue: Arc<TaskQueue>,
    replay: Arc<ReplayChannel>,
    timer_handle: TimerableHandle,
    executor: Mutex<Option<Box<dyn TaskExecutor>>>,
    step: tokio::sync::Mutex<StepState>,
    state: AtomicU8,
    ever_started: AtomicBool,
    shutdown: ShutdownSignal,
    /// Mirror of `StepState::elapsed_ms` for lock-free control-path reads.
    elapsed_ms: AtomicU64,
    fatal: Mutex<Option<FatalClockError>>,
}

impl ClockShared {
    fn state(&self) -> ClockState {
        ClockState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: ClockState) {
        self.state.store(state.as_u8(), Ordering::Release);
    }

    /// Latch a fatal failure, raise shutdown, and stop the clock. The
    /// first failure wins; later ones are logged only.
    fn latch_fatal(&self, fatal: &FatalClockError) {
        error!(error = %fatal, "fatal clock failure; stopping the clock");
        lock_recovering(&self.fatal).get_or_insert_with(|| fatal.clone());
        self.shutdown.request();
        self.set_state(ClockState::Stopped);
    }

    /// Reflect a pause-flag change in the lifecycle state, if the clock
    /// has a lifecycle to reflect it in.
    fn sync_pause_state(&self, paused: bool) {
        if self.ever_started.load(Ordering::Acquire) && !self.shutdown.is_requested() {
            self.set_state(if paused {
                ClockState::Paused
            } else {
                ClockState::Running
            });
        }
    }

    /// Handle one wall-clock tick: apply pause gates, accumulate
    /// speed-scaled progress, and run the owed simulation steps.
    async fn on_tick(&self) -> TickFlow {
        let factor = {
            let mut speed = lock_recovering(&self.speed);
            if speed.is_pause_active() {
                return TickFlow::Continue;
            }
            if speed.consume_stall(self.config.wall_tick_ms) {
                debug!(
                    remaining_ms = speed.pause_remaining_ms(),
                    "soft stall consumed a tick"
                );
                return TickFlow::Continue;
            }
            speed.speed_factor()
        };

        let mut step = self.step.lock().await;
        step.progress += factor;
        while step.progress >= 1.0 {
            match self.execute_step(&mut step).await {
                Ok(StepOutcome::Completed) => step.progress -= 1.0,
                Ok(StepOutcome::ShutdownRequested) => return TickFlow::Stop,
                Err(fatal) => {
                    self.latch_fatal(&fatal);
                    return TickFlow::Stop;
                }
            }
        }
        TickFlow::Continue
    }

    /// Run one simulation step: advance simulated time by one slice, wait
    /// for lockstep admission, execute the due batches, and drive the
    /// timerable registry.
    async fn execute_step(&self, step: &mut StepState) -> Result<StepOutcome, FatalClockError> {
        let elapsed = step
            .elapsed_ms
            .checked_add(self.config.slice_ms)
            .ok_or(FatalClockError::TimeOverflow)?;
        step.elapsed_ms = elapsed;
        self.elapsed_ms.store(elapsed, Ordering::Release);

        let lockstep = LockstepIndex::from_elapsed(elapsed, self.config.lockstep_period_ms);
        match self.queue.await_admission(lockstep, &self.shutdown).await {
            Admission::ShutdownRequested => return Ok(StepOutcome::ShutdownRequested),
            Admission::Granted => {}
        }

        for batch in self.queue.pop_due(lockstep)? {
            self.execute_due_batch(&batch);
        }

        step.registry.integrate_pending();
        step.registry.tick(self.config.slice_ms);
        Ok(StepOutcome::Completed)
    }

    /// Execute every packet of a due batch, collecting per-packet failures
    /// without aborting the batch.
    fn execute_due_batch(&self, batch: &TaskBatch) {
        let lockstep = batch.lockstep;
        let mut guard = lock_recovering(&self.executor);
        let Some(executor) = guard.as_mut() else {
            warn!(%lockstep, "no task executor configured; batch skipped");
            return;
        };

        let mut outcome = BatchOutcome::new(lockstep);
        for (packet_index, packet) in batch.packets.iter().enumerate() {
            match executor.execute(packet) {
                Ok(()) => outcome.executed = outcome.executed.saturating_add(1),
                Err(error) => {
                    warn!(
                        %lockstep,
                        packet_index,
                        %error,
                        "task failed; continuing with the rest of the batch"
                    );
                    outcome.failures.push(PacketFailure {
                        packet_index,
                        error,
                    });
                }
            }
        }
        debug!(
            %lockstep,
            executed = outcome.executed,
            failures = outcome.failures.len(),
            "batch executed"
        );
    }
}

/// The periodic tick task: fires every `wall_tick_ms` until shutdown.
async fn run_tick_loop(shared: Arc<ClockShared>) {
    let mut interval = tokio::time::interval(Duration::from_millis(shared.config.wall_tick_ms));
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        // Checked before suspending, so a signal raised before this
        // iteration exits without waiting for the next tick.
        if shared.shutdown.is_requested() {
            break;
        }
        let stopped = shared.shutdown.notified();
        tokio::pin!(stopped);
        tokio::select! {
            () = &mut stopped => break,
            _ = interval.tick() => {
                if matches!(shared.on_tick().await, TickFlow::Stop) {
                    break;
                }
            }
        }
    }
    debug!("tick task exited");
}

/// The deterministic lockstep simulation clock.
///
/// All synchronous game actions are based on this clock; it also triggers
/// the execution of network-confirmed task batches. Explicitly constructed
/// and owned -- collaborators receive it by reference, there is no
/// process-wide instance.
pub struct LockstepClock {
    shared: Arc<ClockShared>,
    tick_task: Option<JoinHandle<()>>,
}

impl LockstepClock {
    /// Create a clock from a validated configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the timing parameters are unusable.
    pub fn new(config: ClockConfig) -> Result<Self, ConfigError> {
        config.validate()?;

        let replay = Arc::new(ReplayChannel::new());
        let mode = if config.lockstep_waiting {
            AdmissionMode::Networked
        } else {
            AdmissionMode::Unbounded
        };
        let queue = Arc::new(TaskQueue::new(mode, Arc::clone(&replay)));
        let registry = TimerableRegistry::new();
        let timer_handle = registry.handle();

        Ok(Self {
            shared: Arc::new(ClockShared {
                config,
                speed: Mutex::new(SpeedController::new()),
                queue,
                replay,
                timer_handle,
                executor: Mutex::new(None),
                step: tokio::sync::Mutex::new(StepState {
                    elapsed_ms: 0,
                    progress: 0.0,
                    registry,
                }),
                state: AtomicU8::new(ClockState::Stopped.as_u8()),
                ever_started: AtomicBool::new(false),
                shutdown: ShutdownSignal::new(),
                elapsed_ms: AtomicU64::new(0),
                fatal: Mutex::new(None),
            }),
            tick_task: None,
        })
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Arm the periodic tick source and transition to Running.
    ///
    /// # Errors
    ///
    /// [`ClockError::AlreadyStarted`] on a second start,
    /// [`ClockError::AlreadyStopped`] on a start after stop or after a
    /// latched fatal failure.
    pub fn start(&mut self) -> Result<(), ClockError> {
        // A latched fatal raises the shutdown signal, so this also keeps a
        // never-started clock terminal after a protocol violation.
        if self.shared.shutdown.is_requested() {
            return Err(ClockError::AlreadyStopped);
        }
        if self.shared.ever_started.swap(true, Ordering::AcqRel) {
            return Err(ClockError::AlreadyStarted);
        }

        self.shared.set_state(ClockState::Running);
        self.tick_task = Some(tokio::spawn(run_tick_loop(Arc::clone(&self.shared))));
        info!(
            wall_tick_ms = self.shared.config.wall_tick_ms,
            slice_ms = self.shared.config.slice_ms,
            lockstep_period_ms = self.shared.config.lockstep_period_ms,
            lockstep_waiting = self.shared.config.lockstep_waiting,
            "lockstep clock started"
        );
        Ok(())
    }

    /// Disarm the tick source, let any in-flight step finish, and detach
    /// the replay sink. Terminal: the clock cannot be restarted.
    pub async fn stop(&mut self) {
        self.shared.shutdown.request();
        if let Some(task) = self.tick_task.take() {
            // The in-flight step completes (or its admission wait is
            // unblocked by the shutdown signal) before the task exits.
            if let Err(join_error) = task.await {
                warn!(%join_error, "tick task did not exit cleanly");
            }
        }
        self.shared.set_state(ClockState::Stopped);
        self.shared.replay.detach();
        info!(
            elapsed_ms = self.elapsed_ms(),
            "lockstep clock stopped"
        );
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ClockState {
        self.shared.state()
    }

    /// The latched fatal failure, if a protocol violation stopped the
    /// clock.
    pub fn fatal_error(&self) -> Option<FatalClockError> {
        lock_recovering(&self.shared.fatal).clone()
    }

    // -----------------------------------------------------------------------
    // Time
    // -----------------------------------------------------------------------

    /// Elapsed simulated time in milliseconds.
    pub fn elapsed_ms(&self) -> u64 {
        self.shared.elapsed_ms.load(Ordering::Acquire)
    }

    /// The lockstep index the clock is currently at.
    pub fn current_lockstep(&self) -> LockstepIndex {
        LockstepIndex::from_elapsed(self.elapsed_ms(), self.shared.config.lockstep_period_ms)
    }

    /// Overwrite elapsed simulated time, for save-game restoration.
    ///
    /// Only meaningful before `start()` or while paused; the new value
    /// takes effect from the next simulation step.
    pub async fn set_elapsed_ms(&self, elapsed_ms: u64) {
        let mut step = self.shared.step.lock().await;
        step.elapsed_ms = elapsed_ms;
        self.shared.elapsed_ms.store(elapsed_ms, Ordering::Release);
        info!(elapsed_ms, "elapsed time restored");
    }

    // -----------------------------------------------------------------------
    // Speed and pause
    // -----------------------------------------------------------------------

    /// Current speed factor.
    pub fn speed(&self) -> f32 {
        lock_recovering(&self.shared.speed).speed_factor()
    }

    /// Set the speed factor directly, without bounds checking.
    pub fn set_speed(&self, factor: f32) {
        lock_recovering(&self.shared.speed).set_speed_factor(factor);
    }

    /// Multiply the speed factor, without bounds checking.
    pub fn multiply_speed(&self, factor: f32) {
        lock_recovering(&self.shared.speed).multiply(factor);
    }

    /// Increase the speed factor by a step, per the asymmetric speed law.
    pub fn increase_speed(&self, step: f32) {
        lock_recovering(&self.shared.speed).increase(step);
    }

    /// Decrease the speed factor by a step, per the asymmetric speed law.
    pub fn decrease_speed(&self, step: f32) {
        lock_recovering(&self.shared.speed).decrease(step);
    }

    /// Whether the hard pause is active.
    pub fn is_pause_active(&self) -> bool {
        lock_recovering(&self.shared.speed).is_pause_active()
    }

    /// Set the hard pause flag.
    pub fn set_pause_active(&self, pausing: bool) {
        lock_recovering(&self.shared.speed).set_pause_active(pausing);
        self.shared.sync_pause_state(pausing);
    }

    /// Toggle Running and Paused without touching the tick source.
    pub fn invert_pausing(&self) {
        let paused = {
            let mut speed = lock_recovering(&self.shared.speed);
            speed.invert_pausing();
            speed.is_pause_active()
        };
        self.shared.sync_pause_state(paused);
    }

    /// Stall the clock for the given wall time without a pause/resume
    /// handshake; ticks are consumed without effect until it expires.
    pub fn pause_for(&self, duration_ms: u64) {
        info!(duration_ms, "soft stall requested");
        lock_recovering(&self.shared.speed).pause_for(duration_ms);
    }

    // -----------------------------------------------------------------------
    // Fast-forward
    // -----------------------------------------------------------------------

    /// Run simulation steps back-to-back, bypassing the wall-clock
    /// accumulator, until the given amount of simulated time has passed.
    ///
    /// # Errors
    ///
    /// [`ClockError::AlreadyStopped`] if the clock is stopped, or
    /// [`ClockError::Fatal`] if a step trips a protocol violation.
    pub async fn fast_forward(&self, duration_ms: u64) -> Result<(), ClockError> {
        let target = self
            .elapsed_ms()
            .checked_add(duration_ms)
            .ok_or(FatalClockError::TimeOverflow)?;
        self.fast_forward_to(target).await
    }

    /// Run simulation steps back-to-back until elapsed simulated time
    /// reaches `target_ms`.
    ///
    /// The hard pause flag is forced on for the duration of the call so
    /// the periodic tick path stays inert, then restored to its prior
    /// state. In networked mode the catch-up still honors lockstep
    /// admission, batch execution, and timerables step by step.
    ///
    /// # Errors
    ///
    /// [`ClockError::AlreadyStopped`] if the clock is stopped, or
    /// [`ClockError::Fatal`] if a step trips a protocol violation.
    pub async fn fast_forward_to(&self, target_ms: u64) -> Result<(), ClockError> {
        if self.shared.shutdown.is_requested() {
            return Err(ClockError::AlreadyStopped);
        }

        let prior_pause = {
            let mut speed = lock_recovering(&self.shared.speed);
            let prior = speed.is_pause_active();
            speed.set_pause_active(true);
            prior
        };
        info!(target_ms, "fast forwarding");

        let result = self.run_steps_until(target_ms).await;

        {
            let mut speed = lock_recovering(&self.shared.speed);
            speed.set_pause_active(prior_pause);
        }
        self.shared.sync_pause_state(prior_pause);

        match result {
            Ok(()) => Ok(()),
            Err(fatal) => {
                self.shared.latch_fatal(&fatal);
                Err(ClockError::Fatal { source: fatal })
            }
        }
    }

    async fn run_steps_until(&self, target_ms: u64) -> Result<(), FatalClockError> {
        let mut step = self.shared.step.lock().await;
        while step.elapsed_ms < target_ms {
            match self.shared.execute_step(&mut step).await? {
                StepOutcome::ShutdownRequested => break,
                StepOutcome::Completed => {}
            }
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Tasks and confirmations
    // -----------------------------------------------------------------------

    /// Hand the clock the executor that applies confirmed tasks to the
    /// simulation.
    pub fn set_task_executor(&self, executor: Box<dyn TaskExecutor>) {
        *lock_recovering(&self.shared.executor) = Some(executor);
    }

    /// Entry point for the network layer: accept a confirmed batch for
    /// the given lockstep.
    ///
    /// # Errors
    ///
    /// Returns the protocol violation if the confirmation is out of order
    /// or duplicated; the violation is also latched and stops the clock.
    pub fn submit_confirmed_batch(
        &self,
        lockstep: LockstepIndex,
        packets: Vec<TaskPacket>,
    ) -> Result<(), FatalClockError> {
        match self.shared.queue.accept(TaskBatch::new(lockstep, packets)) {
            Ok(()) => Ok(()),
            Err(source) => {
                let fatal = FatalClockError::Protocol { source };
                self.shared.latch_fatal(&fatal);
                Err(fatal)
            }
        }
    }

    /// The shared task queue, for a network layer that feeds batches
    /// directly.
    pub fn task_queue(&self) -> Arc<TaskQueue> {
        Arc::clone(&self.shared.queue)
    }

    // -----------------------------------------------------------------------
    // Timerables
    // -----------------------------------------------------------------------

    /// Schedule a periodic callback; applied at the next step's
    /// integration point.
    pub fn schedule_timerable(&self, callback: Box<dyn Timerable>, period_ms: u64) -> TimerableId {
        self.shared.timer_handle.schedule(callback, period_ms)
    }

    /// Cancel a scheduled callback; applied at the next step's
    /// integration point. Idempotent.
    pub fn cancel_timerable(&self, id: TimerableId) {
        self.shared.timer_handle.cancel(id);
    }

    // -----------------------------------------------------------------------
    // Replay
    // -----------------------------------------------------------------------

    /// Attach the replay recording sink.
    ///
    /// # Errors
    ///
    /// [`ReplayError::SinkAlreadyAttached`] if a sink was attached before.
    pub fn attach_replay_sink(&self, sink: Box<dyn Write + Send>) -> Result<(), ReplayError> {
        self.shared.replay.attach(sink)
    }

    /// The replay channel, for loading a recorded log into the queue.
    pub fn replay_channel(&self) -> Arc<ReplayChannel> {
        Arc::clone(&self.shared.replay)
    }

    /// Persist every still-queued batch for a save game, in order.
    /// Returns the number of batches written.
    ///
    /// # Errors
    ///
    /// [`ReplayError::Io`] if writing fails.
    pub fn save_remaining_tasks(&self, writer: &mut dyn Write) -> Result<usize, ReplayError> {
        let batches = self.shared.queue.drain_remaining();
        for batch in &batches {
            replay::write_record(writer, batch)?;
        }
        writer.flush()?;
        Ok(batches.len())
    }
}

impl Drop for LockstepClock {
    fn drop(&mut self) {
        // A dropped clock must not leave the tick task spinning. The task
        // observes the signal on its next select and exits.
        self.shared.shutdown.request();
    }
}

impl core::fmt::Debug for LockstepClock {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("LockstepClock")
            .field("state", &self.state())
            .field("elapsed_ms", &self.elapsed_ms())
            .field("lockstep", &self.current_lockstep())
            .finish_non_exhaustive()
    }
}
