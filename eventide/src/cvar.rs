//! Monotone condition variables.
//!
//! A [`CVar`] moves from unset to set exactly once and never resets.
//! Setting it commits and resumes every fiber blocked on [`CVar::wait`];
//! waiters arriving after the set complete immediately. The sync engine
//! uses a private cvar per `with_nack` branch to signal loss; the type is
//! public so application code can use the same mechanism directly.

use crate::errors::EventideError;
use crate::event::group::{EventStatus, LeafPoll, RegisterFn};
use crate::event::{sync, Event};
use crate::transaction::Transaction;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// A two-state, set-once condition variable.
#[derive(Clone)]
pub struct CVar {
    inner: Arc<Mutex<CVarState>>,
}

struct CVarState {
    set: bool,
    waiters: Vec<Waiter>,
}

struct Waiter {
    txn: Arc<Transaction>,
    done: Arc<AtomicBool>,
}

impl CVar {
    /// Creates a new, unset condition variable.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(CVarState {
                set: false,
                waiters: Vec::new(),
            })),
        }
    }

    /// Returns whether the cvar has been set.
    #[must_use]
    pub fn is_set(&self) -> bool {
        self.inner.lock().set
    }

    /// Sets the cvar, waking every live waiter. Idempotent.
    pub fn set(&self) {
        let waiters = {
            let mut state = self.inner.lock();
            if state.set {
                return;
            }
            state.set = true;
            std::mem::take(&mut state.waiters)
        };
        // Commit and resume outside the lock.
        for waiter in waiters {
            if !waiter.txn.claim() {
                continue;
            }
            waiter.done.store(true, Ordering::Release);
            waiter.txn.commit_claimed();
            waiter.txn.finish_commit();
        }
    }

    /// An event that becomes enabled once the cvar is set.
    #[must_use]
    pub fn wait_evt(&self) -> Event<()> {
        let inner = self.inner.clone();
        Event::from_leaf(move || wait_leaf(inner))
    }

    /// Blocks the calling fiber until the cvar is set.
    ///
    /// # Errors
    ///
    /// Infallible for a bare wait; the `Result` carries errors only when
    /// the event is composed with fallible branches.
    pub async fn wait(&self) -> Result<(), EventideError> {
        sync(self.wait_evt()).await
    }

    /// Identity equality of the underlying cvar.
    #[must_use]
    pub fn same(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Default for CVar {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for CVar {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.lock();
        f.debug_struct("CVar")
            .field("set", &state.set)
            .field("waiters", &state.waiters.len())
            .finish()
    }
}

fn wait_leaf(inner: Arc<Mutex<CVarState>>) -> LeafPoll<()> {
    let done = Arc::new(AtomicBool::new(false));
    let mut registered = false;
    Box::new(move || {
        if done.load(Ordering::Acquire) {
            return EventStatus::Enabled {
                priority: -1,
                value: Ok(()),
            };
        }
        if registered {
            return EventStatus::blocked_noop();
        }
        if inner.lock().set {
            return EventStatus::Enabled {
                priority: -1,
                value: Ok(()),
            };
        }
        registered = true;
        EventStatus::Blocked(wait_register(inner.clone(), done.clone()))
    })
}

fn wait_register(inner: Arc<Mutex<CVarState>>, done: Arc<AtomicBool>) -> RegisterFn {
    Box::new(move |txn: &Arc<Transaction>| {
        let mut commit_self = false;
        let mut enrolled = false;
        {
            let mut state = inner.lock();
            if state.set {
                // Set between poll and registration: complete in place.
                if txn.claim() {
                    done.store(true, Ordering::Release);
                    txn.commit_claimed();
                    commit_self = true;
                }
            } else {
                state.waiters.push(Waiter {
                    txn: txn.clone(),
                    done,
                });
                enrolled = true;
            }
        }
        if commit_self {
            txn.finish_commit();
        }
        if enrolled {
            let inner = inner.clone();
            let id = txn.id();
            txn.add_cleanup(move || {
                inner.lock().waiters.retain(|waiter| waiter.txn.id() != id);
            });
        }
    })
}
