//! Time-based events and the one-shot timer facility backing them.
//!
//! [`timeout`] and [`at_time`] are base events driven by tokio's timer
//! wheel. A timeout's clock starts at registration, not at construction:
//! composing it into a choose costs nothing until the sync actually
//! blocks. When another branch commits first, the pending timer is
//! cancelled through the transaction cleanup.

use crate::event::group::{EventStatus, LeafPoll};
use crate::event::Event;
use crate::transaction::Transaction;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::trace;

const PENDING: u8 = 0;
const FIRED: u8 = 1;
const CANCELLED: u8 = 2;

/// Handle to a scheduled one-shot timer.
///
/// Firing and cancellation race; the CAS on the shared state decides the
/// winner and [`TimerHandle::cancel`] reports which way it went.
pub struct TimerHandle {
    state: Arc<AtomicU8>,
    task: tokio::task::JoinHandle<()>,
}

impl TimerHandle {
    /// Cancels the timer.
    ///
    /// Returns true iff cancellation won the race against firing; a
    /// second cancel returns false.
    pub fn cancel(&self) -> bool {
        if self
            .state
            .compare_exchange(PENDING, CANCELLED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            self.task.abort();
            true
        } else {
            false
        }
    }

    /// Returns whether the timer's callback ran.
    #[must_use]
    pub fn has_fired(&self) -> bool {
        self.state.load(Ordering::Acquire) == FIRED
    }
}

impl std::fmt::Debug for TimerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = match self.state.load(Ordering::Acquire) {
            PENDING => "pending",
            FIRED => "fired",
            _ => "cancelled",
        };
        f.debug_struct("TimerHandle").field("state", &state).finish()
    }
}

/// Schedules `callback` to run once at `deadline`.
///
/// Must be called within a tokio runtime. The callback runs on a spawned
/// task with no locks held.
pub fn schedule<F>(deadline: Instant, callback: F) -> TimerHandle
where
    F: FnOnce() + Send + 'static,
{
    let state = Arc::new(AtomicU8::new(PENDING));
    let flag = state.clone();
    let task = tokio::spawn(async move {
        tokio::time::sleep_until(deadline).await;
        if flag
            .compare_exchange(PENDING, FIRED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            callback();
        }
    });
    TimerHandle { state, task }
}

/// An event enabled `duration` after its sync blocks on it.
///
/// A zero duration is immediately enabled. The timer is scheduled at
/// registration time, so the window is measured from the moment the
/// enclosing sync actually starts waiting.
#[must_use]
pub fn timeout(duration: Duration) -> Event<()> {
    Event::from_leaf(move || timer_leaf(TimerSpec::After(duration)))
}

/// An event enabled once `deadline` has passed.
#[must_use]
pub fn at_time(deadline: Instant) -> Event<()> {
    Event::from_leaf(move || timer_leaf(TimerSpec::At(deadline)))
}

#[derive(Clone, Copy)]
enum TimerSpec {
    After(Duration),
    At(Instant),
}

impl TimerSpec {
    fn ready_now(self) -> bool {
        match self {
            Self::After(duration) => duration.is_zero(),
            Self::At(deadline) => Instant::now() >= deadline,
        }
    }

    fn deadline(self) -> Instant {
        match self {
            Self::After(duration) => Instant::now() + duration,
            Self::At(deadline) => deadline,
        }
    }
}

fn timer_leaf(spec: TimerSpec) -> LeafPoll<()> {
    let done = Arc::new(AtomicBool::new(false));
    let mut registered = false;
    Box::new(move || {
        if done.load(Ordering::Acquire) {
            return EventStatus::Enabled {
                priority: -1,
                value: Ok(()),
            };
        }
        // After registration only the committed done flag counts; an
        // elapsed deadline alone must not win a wake-phase re-poll.
        if registered {
            return EventStatus::blocked_noop();
        }
        if spec.ready_now() {
            return EventStatus::Enabled {
                priority: -1,
                value: Ok(()),
            };
        }
        registered = true;
        let done = done.clone();
        EventStatus::Blocked(Box::new(move |txn: &Arc<Transaction>| {
            let deadline = spec.deadline();
            let fire_txn = txn.clone();
            let handle = schedule(deadline, move || {
                // The done flag is set only between claim and commit so
                // a losing timer can never mark its leaf enabled.
                if fire_txn.claim() {
                    done.store(true, Ordering::Release);
                    fire_txn.commit_claimed();
                    fire_txn.finish_commit();
                } else {
                    trace!("timer fired for a decided sync");
                }
            });
            txn.add_cleanup(move || {
                handle.cancel();
            });
        }))
    })
}
