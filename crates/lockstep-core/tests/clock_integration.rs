//! End-to-end tests driving the live tick loop.
//!
//! Runs under tokio's paused clock, so the periodic tick source is driven
//! deterministically by virtual time rather than the wall clock.

#![allow(clippy::unwrap_used)]

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use lockstep_core::clock::{ClockState, LockstepClock};
use lockstep_core::config::ClockConfig;
use lockstep_core::executor::{ExecutorError, TaskExecutor};
use lockstep_types::{LockstepIndex, TaskPacket};

struct RecordingExecutor {
    seen: Arc<Mutex<Vec<u8>>>,
}

impl TaskExecutor for RecordingExecutor {
    fn execute(&mut self, packet: &TaskPacket) -> Result<(), ExecutorError> {
        self.seen
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(packet.payload.first().copied().unwrap_or(0));
        Ok(())
    }
}

fn offline_config() -> ClockConfig {
    ClockConfig {
        slice_ms: 50,
        lockstep_period_ms: 200,
        wall_tick_ms: 50,
        lockstep_waiting: false,
    }
}

fn networked_config() -> ClockConfig {
    ClockConfig {
        lockstep_waiting: true,
        ..offline_config()
    }
}

#[tokio::test(start_paused = true)]
async fn live_loop_advances_simulated_time_with_virtual_time() {
    let mut clock = LockstepClock::new(offline_config()).unwrap();
    clock.start().unwrap();

    tokio::time::sleep(Duration::from_millis(500)).await;
    clock.stop().await;

    // One 50ms step per 50ms tick; allow one tick of scheduling slack on
    // either side.
    let elapsed = clock.elapsed_ms();
    assert!(
        (450..=600).contains(&elapsed),
        "expected roughly 500ms of simulated time, got {elapsed}"
    );
    assert_eq!(clock.state(), ClockState::Stopped);
}

#[tokio::test(start_paused = true)]
async fn hard_pause_halts_the_loop_and_resume_continues_it() {
    let mut clock = LockstepClock::new(offline_config()).unwrap();
    clock.set_pause_active(true);
    clock.start().unwrap();

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(clock.elapsed_ms(), 0, "paused clock must not advance");
    assert_eq!(clock.state(), ClockState::Paused);

    clock.set_pause_active(false);
    assert_eq!(clock.state(), ClockState::Running);
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(clock.elapsed_ms() >= 400, "resumed clock must advance");

    clock.stop().await;
}

#[tokio::test(start_paused = true)]
async fn soft_stall_consumes_ticks_then_expires_on_its_own() {
    let mut clock = LockstepClock::new(offline_config()).unwrap();
    clock.pause_for(200);
    clock.start().unwrap();

    // 400ms of virtual time with the first 200ms stalled: about 200ms of
    // simulated time, and no pause/resume handshake needed.
    tokio::time::sleep(Duration::from_millis(400)).await;
    clock.stop().await;

    let elapsed = clock.elapsed_ms();
    assert!(
        (150..=300).contains(&elapsed),
        "expected the stall to swallow about half the ticks, got {elapsed}"
    );
}

#[tokio::test(start_paused = true)]
async fn admission_gating_halts_the_live_loop_at_the_frontier() {
    let mut clock = LockstepClock::new(networked_config()).unwrap();
    let seen = Arc::new(Mutex::new(Vec::new()));
    clock.set_task_executor(Box::new(RecordingExecutor {
        seen: Arc::clone(&seen),
    }));
    clock.start().unwrap();

    // No confirmations yet: the first step parks at lockstep 0.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(clock.elapsed_ms(), 50, "first step must wait at lockstep 0");

    // Confirming lockstep 0 lets the loop run until lockstep 1 is due.
    clock
        .submit_confirmed_batch(LockstepIndex::ZERO, vec![TaskPacket::new(vec![42])])
        .unwrap();
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(
        clock.elapsed_ms(),
        200,
        "loop must stop again at the unconfirmed lockstep 1"
    );
    assert_eq!(*seen.lock().unwrap(), vec![42]);

    clock.stop().await;
}

#[tokio::test(start_paused = true)]
async fn stop_unblocks_a_step_parked_on_admission() {
    let mut clock = LockstepClock::new(networked_config()).unwrap();
    clock.start().unwrap();

    // Park the first step on the lockstep 0 admission wait.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(clock.elapsed_ms(), 50);

    // stop() must not deadlock against the parked step.
    clock.stop().await;
    assert_eq!(clock.state(), ClockState::Stopped);
}
