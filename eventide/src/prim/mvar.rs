//! Capacity-1 take/put cells.

use crate::errors::EventideError;
use crate::event::group::{EventStatus, LeafPoll, RegisterFn};
use crate::event::{sync, Event};
use crate::transaction::Transaction;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;

/// A cell holding at most one value.
///
/// [`MVar::put`] fills an empty cell or fails; [`MVar::take`] empties a
/// full cell; [`MVar::get`] reads without emptying; [`MVar::swap`]
/// atomically replaces the contents, blocking until the cell is full. A
/// put hands the value to the oldest live taker directly; a taker that
/// registered via [`MVar::swap_evt`] reinstates its replacement value,
/// which may serve further waiters in turn.
pub struct MVar<T> {
    inner: Arc<Mutex<MVarState<T>>>,
}

struct MVarState<T> {
    value: Option<T>,
    takers: VecDeque<Taker<T>>,
    getters: Vec<Getter<T>>,
    rank: i64,
}

struct Taker<T> {
    txn: Arc<Transaction>,
    slot: Arc<Mutex<Option<T>>>,
    /// `Some` for a swap waiter: installed as the new value on handoff.
    replacement: Option<T>,
}

struct Getter<T> {
    txn: Arc<Transaction>,
    slot: Arc<Mutex<Option<T>>>,
}

impl<T: Clone + Send + 'static> MVar<T> {
    /// Creates a new, empty cell.
    #[must_use]
    pub fn new() -> Self {
        Self::build(None)
    }

    /// Creates a cell already holding `value`.
    #[must_use]
    pub fn with_value(value: T) -> Self {
        Self::build(Some(value))
    }

    fn build(value: Option<T>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(MVarState {
                value,
                takers: VecDeque::new(),
                getters: Vec::new(),
                rank: 0,
            })),
        }
    }

    /// Fills the cell, serving any blocked getters and takers.
    ///
    /// # Errors
    ///
    /// Returns [`EventideError::AlreadyWritten`] if the cell is full.
    pub fn put(&self, value: T) -> Result<(), EventideError> {
        let resumes = {
            let mut state = self.inner.lock();
            if state.value.is_some() {
                return Err(EventideError::AlreadyWritten);
            }
            state.value = Some(value);
            let mut resumes = Vec::new();
            drain_waiters(&mut state, &mut resumes);
            resumes
        };
        finish_all(resumes);
        Ok(())
    }

    /// An event that takes the value, emptying the cell.
    #[must_use]
    pub fn take_evt(&self) -> Event<T> {
        let inner = self.inner.clone();
        Event::from_leaf(move || take_leaf(inner, None))
    }

    /// An event that replaces the contents, yielding the old value.
    #[must_use]
    pub fn swap_evt(&self, replacement: T) -> Event<T> {
        let inner = self.inner.clone();
        Event::from_leaf(move || take_leaf(inner, Some(replacement)))
    }

    /// An event that reads the value without emptying the cell.
    #[must_use]
    pub fn get_evt(&self) -> Event<T> {
        let inner = self.inner.clone();
        Event::from_leaf(move || get_leaf(inner))
    }

    /// Blocking take: `sync(take_evt())`.
    ///
    /// # Errors
    ///
    /// Infallible for a bare take; the `Result` carries errors only when
    /// the event is composed with fallible branches.
    pub async fn take(&self) -> Result<T, EventideError> {
        sync(self.take_evt()).await
    }

    /// Blocking non-destructive read: `sync(get_evt())`.
    ///
    /// # Errors
    ///
    /// Infallible for a bare get; see [`MVar::take`].
    pub async fn get(&self) -> Result<T, EventideError> {
        sync(self.get_evt()).await
    }

    /// Atomically replaces the contents, returning the old value.
    ///
    /// Blocks until the cell is full.
    ///
    /// # Errors
    ///
    /// Infallible for a bare swap; see [`MVar::take`].
    pub async fn swap(&self, replacement: T) -> Result<T, EventideError> {
        sync(self.swap_evt(replacement)).await
    }

    /// Non-blocking take attempt.
    #[must_use]
    pub fn take_poll(&self) -> Option<T> {
        self.inner.lock().value.take()
    }

    /// Non-blocking read attempt.
    #[must_use]
    pub fn get_poll(&self) -> Option<T> {
        self.inner.lock().value.clone()
    }

    /// Whether the cell currently holds a value.
    #[must_use]
    pub fn is_full(&self) -> bool {
        self.inner.lock().value.is_some()
    }

    /// Identity equality of the underlying cell.
    #[must_use]
    pub fn same(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl<T: Clone + Send + 'static> Default for MVar<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for MVar<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> std::fmt::Debug for MVar<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.lock();
        f.debug_struct("MVar")
            .field("full", &state.value.is_some())
            .field("takers", &state.takers.len())
            .field("getters", &state.getters.len())
            .finish()
    }
}

/// Serves getters and takers while a value is present, cascading through
/// swap replacements. Commits happen under the cell lock; resumptions
/// are collected for delivery after it is released.
fn drain_waiters<T: Clone + Send + 'static>(
    state: &mut MVarState<T>,
    resumes: &mut Vec<Arc<Transaction>>,
) {
    while state.value.is_some() {
        // Getters read the now-present value, non-destructively.
        for getter in std::mem::take(&mut state.getters) {
            if !getter.txn.claim() {
                continue;
            }
            *getter.slot.lock() = state.value.clone();
            getter.txn.commit_claimed();
            resumes.push(getter.txn);
        }
        // One taker consumes it; a swap taker refills the cell.
        let mut advanced = false;
        while let Some(mut taker) = state.takers.pop_front() {
            if !taker.txn.claim() {
                continue;
            }
            *taker.slot.lock() = state.value.take();
            state.value = taker.replacement.take();
            taker.txn.commit_claimed();
            resumes.push(taker.txn);
            advanced = true;
            break;
        }
        if !advanced {
            break;
        }
    }
}

fn finish_all(resumes: Vec<Arc<Transaction>>) {
    for txn in resumes {
        txn.finish_commit();
    }
}

fn take_leaf<T: Clone + Send + 'static>(
    inner: Arc<Mutex<MVarState<T>>>,
    replacement: Option<T>,
) -> LeafPoll<T> {
    let slot: Arc<Mutex<Option<T>>> = Arc::new(Mutex::new(None));
    let mut replacement = replacement;
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
        let (taken, resumes) = {
            let mut state = inner.lock();
            match state.value.take() {
                Some(v) => {
                    state.rank += 1;
                    let rank = state.rank;
                    state.value = replacement.take();
                    let mut resumes = Vec::new();
                    if state.value.is_some() {
                        drain_waiters(&mut state, &mut resumes);
                    }
                    (Some((rank, v)), resumes)
                }
                None => (None, Vec::new()),
            }
        };
        finish_all(resumes);
        if let Some((rank, v)) = taken {
            return EventStatus::Enabled {
                priority: rank,
                value: Ok(v),
            };
        }
        registered = true;
        EventStatus::Blocked(take_register(
            inner.clone(),
            slot.clone(),
            replacement.take(),
        ))
    })
}

fn take_register<T: Clone + Send + 'static>(
    inner: Arc<Mutex<MVarState<T>>>,
    slot: Arc<Mutex<Option<T>>>,
    replacement: Option<T>,
) -> RegisterFn {
    Box::new(move |txn: &Arc<Transaction>| {
        let mut replacement = replacement;
        let mut commit_self = false;
        let mut enrolled = false;
        let resumes = {
            let mut state = inner.lock();
            let mut resumes = Vec::new();
            if state.value.is_some() {
                // Filled between poll and registration.
                if txn.claim() {
                    *slot.lock() = state.value.take();
                    state.value = replacement.take();
                    txn.commit_claimed();
                    commit_self = true;
                    if state.value.is_some() {
                        drain_waiters(&mut state, &mut resumes);
                    }
                }
            } else {
                state.takers.push_back(Taker {
                    txn: txn.clone(),
                    slot: slot.clone(),
                    replacement: replacement.take(),
                });
                enrolled = true;
            }
            resumes
        };
        if commit_self {
            txn.finish_commit();
        }
        finish_all(resumes);
        if enrolled {
            let inner = inner.clone();
            let id = txn.id();
            txn.add_cleanup(move || {
                inner.lock().takers.retain(|taker| taker.txn.id() != id);
            });
        }
    })
}

fn get_leaf<T: Clone + Send + 'static>(inner: Arc<Mutex<MVarState<T>>>) -> LeafPoll<T> {
    let slot: Arc<Mutex<Option<T>>> = Arc::new(Mutex::new(None));
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
        let read = {
            let mut state = inner.lock();
            state.value.clone().map(|v| {
                state.rank += 1;
                (state.rank, v)
            })
        };
        if let Some((rank, v)) = read {
            return EventStatus::Enabled {
                priority: rank,
                value: Ok(v),
            };
        }
        registered = true;
        EventStatus::Blocked(get_register(inner.clone(), slot.clone()))
    })
}

fn get_register<T: Clone + Send + 'static>(
    inner: Arc<Mutex<MVarState<T>>>,
    slot: Arc<Mutex<Option<T>>>,
) -> RegisterFn {
    Box::new(move |txn: &Arc<Transaction>| {
        let mut commit_self = false;
        let mut enrolled = false;
        {
            let mut state = inner.lock();
            if let Some(v) = state.value.clone() {
                if txn.claim() {
                    *slot.lock() = Some(v);
                    txn.commit_claimed();
                    commit_self = true;
                }
            } else {
                state.getters.push(Getter {
                    txn: txn.clone(),
                    slot: slot.clone(),
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
                inner.lock().getters.retain(|getter| getter.txn.id() != id);
            });
        }
    })
}
