//! Write-once cells.

use crate::errors::EventideError;
use crate::event::group::{EventStatus, LeafPoll, RegisterFn};
use crate::event::{sync, Event};
use crate::transaction::Transaction;
use parking_lot::Mutex;
use std::sync::Arc;

/// A write-once cell.
///
/// The first [`IVar::put`] stores the value and wakes every blocked
/// reader; later puts fail with [`EventideError::AlreadyWritten`]. Reads
/// are non-destructive: every reader observes the same value.
pub struct IVar<T> {
    inner: Arc<Mutex<IVarState<T>>>,
}

struct IVarState<T> {
    value: Option<T>,
    readers: Vec<Reader<T>>,
}

struct Reader<T> {
    txn: Arc<Transaction>,
    slot: Arc<Mutex<Option<T>>>,
}

impl<T: Clone + Send + 'static> IVar<T> {
    /// Creates a new, unwritten cell.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(IVarState {
                value: None,
                readers: Vec::new(),
            })),
        }
    }

    /// Writes the value, waking all blocked readers.
    ///
    /// # Errors
    ///
    /// Returns [`EventideError::AlreadyWritten`] on the second write.
    pub fn put(&self, value: T) -> Result<(), EventideError> {
        let (readers, snapshot) = {
            let mut state = self.inner.lock();
            if state.value.is_some() {
                return Err(EventideError::AlreadyWritten);
            }
            state.value = Some(value);
            (std::mem::take(&mut state.readers), state.value.clone())
        };
        for reader in readers {
            if !reader.txn.claim() {
                continue;
            }
            *reader.slot.lock() = snapshot.clone();
            reader.txn.commit_claimed();
            reader.txn.finish_commit();
        }
        Ok(())
    }

    /// An event that yields the stored value, non-destructively.
    #[must_use]
    pub fn get_evt(&self) -> Event<T> {
        let inner = self.inner.clone();
        Event::from_leaf(move || get_leaf(inner))
    }

    /// Blocking read: `sync(get_evt())`.
    ///
    /// # Errors
    ///
    /// Infallible for a bare get; the `Result` carries errors only when
    /// the event is composed with fallible branches.
    pub async fn get(&self) -> Result<T, EventideError> {
        sync(self.get_evt()).await
    }

    /// Non-blocking read attempt.
    #[must_use]
    pub fn get_poll(&self) -> Option<T> {
        self.inner.lock().value.clone()
    }

    /// Whether the cell has been written.
    #[must_use]
    pub fn is_set(&self) -> bool {
        self.inner.lock().value.is_some()
    }

    /// Identity equality of the underlying cell.
    #[must_use]
    pub fn same(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl<T: Clone + Send + 'static> Default for IVar<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for IVar<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> std::fmt::Debug for IVar<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.lock();
        f.debug_struct("IVar")
            .field("written", &state.value.is_some())
            .field("readers", &state.readers.len())
            .finish()
    }
}

fn get_leaf<T: Clone + Send + 'static>(
    inner: Arc<Mutex<IVarState<T>>>,
) -> LeafPoll<T> {
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
        if let Some(v) = inner.lock().value.clone() {
            return EventStatus::Enabled {
                priority: -1,
                value: Ok(v),
            };
        }
        registered = true;
        EventStatus::Blocked(get_register(inner.clone(), slot.clone()))
    })
}

fn get_register<T: Clone + Send + 'static>(
    inner: Arc<Mutex<IVarState<T>>>,
    slot: Arc<Mutex<Option<T>>>,
) -> RegisterFn {
    Box::new(move |txn: &Arc<Transaction>| {
        let mut commit_self = false;
        let mut enrolled = false;
        {
            let mut state = inner.lock();
            if let Some(v) = state.value.clone() {
                // Written between poll and registration.
                if txn.claim() {
                    *slot.lock() = Some(v);
                    txn.commit_claimed();
                    commit_self = true;
                }
            } else {
                state.readers.push(Reader {
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
                inner.lock().readers.retain(|reader| reader.txn.id() != id);
            });
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fiber::{spawn, yield_now};
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_put_then_get_repeatedly() {
        let ivar = IVar::new();
        assert!(ivar.put(5).is_ok());
        assert_eq!(ivar.get().await, Ok(5));
        assert_eq!(ivar.get().await, Ok(5));
        assert_eq!(ivar.get_poll(), Some(5));
    }

    #[tokio::test]
    async fn test_second_put_fails() {
        let ivar = IVar::new();
        assert!(ivar.put(1).is_ok());
        assert_eq!(ivar.put(2), Err(EventideError::AlreadyWritten));
        // The original value is untouched.
        assert_eq!(ivar.get_poll(), Some(1));
    }

    #[tokio::test]
    async fn test_put_wakes_all_readers() {
        let ivar = IVar::new();
        let seen = Arc::new(AtomicUsize::new(0));
        for _ in 0..3 {
            let rx = ivar.clone();
            let seen = seen.clone();
            spawn(async move {
                if rx.get().await == Ok(7) {
                    seen.fetch_add(1, Ordering::SeqCst);
                }
            });
        }
        for _ in 0..10 {
            yield_now().await;
        }
        assert!(ivar.put(7).is_ok());
        for _ in 0..10 {
            yield_now().await;
        }
        assert_eq!(seen.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_get_poll_unwritten() {
        let ivar: IVar<i32> = IVar::new();
        assert_eq!(ivar.get_poll(), None);
        assert!(!ivar.is_set());
    }
}
