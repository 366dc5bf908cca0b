//! N-party barriers with enrollments.

use crate::errors::EventideError;
use crate::event::group::{EventStatus, LeafPoll, RegisterFn};
use crate::event::{sync, Event};
use crate::transaction::Transaction;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// An N-party barrier carrying shared state.
///
/// Participants [`enroll`](Barrier::enroll) to obtain an [`Enrollment`]
/// and wait on it. When every non-resigned enrollment is waiting, the
/// update function is applied to the barrier's state once, all waiters
/// resume with the new state, and the waiting set resets for the next
/// round. Resigning while everyone else is already waiting triggers the
/// round.
pub struct Barrier<S> {
    inner: Arc<Mutex<BarrierState<S>>>,
}

type UpdateFn<S> = Box<dyn Fn(&S) -> S + Send>;

struct BarrierState<S> {
    enrolled: usize,
    waiting: Vec<Waiter<S>>,
    value: S,
    update: UpdateFn<S>,
}

struct Waiter<S> {
    txn: Arc<Transaction>,
    slot: Arc<Mutex<Option<S>>>,
}

impl<S: Clone + Send + 'static> Barrier<S> {
    /// Creates a barrier with an initial state and a per-round update.
    #[must_use]
    pub fn new<F>(initial: S, update: F) -> Self
    where
        F: Fn(&S) -> S + Send + 'static,
    {
        Self {
            inner: Arc::new(Mutex::new(BarrierState {
                enrolled: 0,
                waiting: Vec::new(),
                value: initial,
                update: Box::new(update),
            })),
        }
    }

    /// Enrolls a new participant.
    ///
    /// Each participant needs its own enrollment; the round triggers
    /// when every live enrollment is waiting.
    #[must_use]
    pub fn enroll(&self) -> Enrollment<S> {
        self.inner.lock().enrolled += 1;
        Enrollment {
            barrier: self.clone(),
            resigned: AtomicBool::new(false),
        }
    }

    /// The barrier's current state.
    #[must_use]
    pub fn state(&self) -> S {
        self.inner.lock().value.clone()
    }

    /// Number of live enrollments.
    #[must_use]
    pub fn enrolled(&self) -> usize {
        self.inner.lock().enrolled
    }
}

impl<T> Clone for Barrier<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<S> std::fmt::Debug for Barrier<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.lock();
        f.debug_struct("Barrier")
            .field("enrolled", &state.enrolled)
            .field("waiting", &state.waiting.len())
            .finish()
    }
}

/// Applies the update, wakes every live waiter with the new state and
/// resets the waiting set. Caller delivers the collected resumptions
/// after releasing the barrier lock.
fn trigger_round<S: Clone + Send + 'static>(
    state: &mut BarrierState<S>,
    resumes: &mut Vec<Arc<Transaction>>,
) -> S {
    state.value = (state.update)(&state.value);
    let new_state = state.value.clone();
    for waiter in std::mem::take(&mut state.waiting) {
        if !waiter.txn.claim() {
            continue;
        }
        *waiter.slot.lock() = Some(new_state.clone());
        waiter.txn.commit_claimed();
        resumes.push(waiter.txn);
    }
    new_state
}

fn finish_all(resumes: Vec<Arc<Transaction>>) {
    for txn in resumes {
        txn.finish_commit();
    }
}

/// A participant's handle on a [`Barrier`].
///
/// Dropping an enrollment resigns it.
pub struct Enrollment<S: Clone + Send + 'static> {
    barrier: Barrier<S>,
    resigned: AtomicBool,
}

impl<S: Clone + Send + 'static> Enrollment<S> {
    /// An event enabled when the round completes, yielding the updated
    /// barrier state.
    #[must_use]
    pub fn wait_evt(&self) -> Event<S> {
        let inner = self.barrier.inner.clone();
        Event::from_leaf(move || wait_leaf(inner))
    }

    /// Blocking wait: `sync(wait_evt())`.
    ///
    /// # Errors
    ///
    /// Infallible for a bare wait; the `Result` carries errors only when
    /// the event is composed with fallible branches.
    pub async fn wait(&self) -> Result<S, EventideError> {
        sync(self.wait_evt()).await
    }

    /// Withdraws this enrollment from the barrier.
    ///
    /// Returns false if already resigned. If every remaining enrollment
    /// is already waiting, the round triggers.
    pub fn resign(&self) -> bool {
        if self
            .resigned
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        let resumes = {
            let mut state = self.barrier.inner.lock();
            state.enrolled = state.enrolled.saturating_sub(1);
            let mut resumes = Vec::new();
            if !state.waiting.is_empty() && state.waiting.len() >= state.enrolled {
                trigger_round(&mut state, &mut resumes);
            }
            resumes
        };
        finish_all(resumes);
        true
    }
}

impl<S: Clone + Send + 'static> Drop for Enrollment<S> {
    fn drop(&mut self) {
        let _ = self.resign();
    }
}

impl<S: Clone + Send + 'static> std::fmt::Debug for Enrollment<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Enrollment")
            .field("resigned", &self.resigned.load(Ordering::Acquire))
            .finish()
    }
}

fn wait_leaf<S: Clone + Send + 'static>(
    inner: Arc<Mutex<BarrierState<S>>>,
) -> LeafPoll<S> {
    let slot: Arc<Mutex<Option<S>>> = Arc::new(Mutex::new(None));
    let mut registered = false;
    Box::new(move || {
        if let Some(v) = slot.lock().take() {
            return EventStatus::Enabled {
                priority: -1,
                value: Ok(v),
            };
        }
        if registered {
            return EventStatus::blocked_noop();
        }
        let (completed, resumes) = {
            let mut state = inner.lock();
            if state.enrolled > 0 && state.waiting.len() + 1 >= state.enrolled {
                // Last arriver: complete the round in place.
                let mut resumes = Vec::new();
                let new_state = trigger_round(&mut state, &mut resumes);
                (Some(new_state), resumes)
            } else {
                (None, Vec::new())
            }
        };
        finish_all(resumes);
        if let Some(new_state) = completed {
            return EventStatus::Enabled {
                priority: -1,
                value: Ok(new_state),
            };
        }
        registered = true;
        EventStatus::Blocked(wait_register(inner.clone(), slot.clone()))
    })
}

fn wait_register<S: Clone + Send + 'static>(
    inner: Arc<Mutex<BarrierState<S>>>,
    slot: Arc<Mutex<Option<S>>>,
) -> RegisterFn {
    Box::new(move |txn: &Arc<Transaction>| {
        let mut commit_self = false;
        let mut enrolled_in_queue = false;
        let resumes = {
            let mut state = inner.lock();
            let mut resumes = Vec::new();
            if state.enrolled > 0 && state.waiting.len() + 1 >= state.enrolled {
                // The set completed between poll and registration.
                if txn.claim() {
                    let new_state = trigger_round(&mut state, &mut resumes);
                    *slot.lock() = Some(new_state);
                    txn.commit_claimed();
                    commit_self = true;
                }
            } else {
                state.waiting.push(Waiter {
                    txn: txn.clone(),
                    slot: slot.clone(),
                });
                enrolled_in_queue = true;
            }
            resumes
        };
        if commit_self {
            txn.finish_commit();
        }
        finish_all(resumes);
        if enrolled_in_queue {
            let inner = inner.clone();
            let id = txn.id();
            txn.add_cleanup(move || {
                inner.lock().waiting.retain(|waiter| waiter.txn.id() != id);
            });
        }
    })
}
