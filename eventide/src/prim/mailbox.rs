//! Asynchronous mailboxes.

use crate::errors::EventideError;
use crate::event::group::{EventStatus, LeafPoll, RegisterFn};
use crate::event::{sync, Event};
use crate::transaction::Transaction;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;

/// An unbounded asynchronous queue.
///
/// [`Mailbox::send`] never blocks: the value is handed directly to the
/// oldest live waiting receiver, or buffered. Receivers are served in
/// FIFO order; the rank of a served receiver is carried as the advisory
/// `priority` of its enabled poll.
pub struct Mailbox<T> {
    inner: Arc<Mutex<MailboxState<T>>>,
}

struct MailboxState<T> {
    buffer: VecDeque<T>,
    waiters: VecDeque<Waiter<T>>,
    rank: i64,
}

struct Waiter<T> {
    txn: Arc<Transaction>,
    slot: Arc<Mutex<Option<T>>>,
}

impl<T: Send + 'static> Mailbox<T> {
    /// Creates a new, empty mailbox.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(MailboxState {
                buffer: VecDeque::new(),
                waiters: VecDeque::new(),
                rank: 0,
            })),
        }
    }

    /// Sends a value. Never blocks.
    ///
    /// The value is handed directly to the oldest live waiting receiver
    /// if one exists, otherwise buffered; the decision is atomic with
    /// respect to receiver registration.
    pub fn send(&self, value: T) {
        let mut value = Some(value);
        let handed_off = {
            let mut state = self.inner.lock();
            let peer = loop {
                let Some(waiter) = state.waiters.pop_front() else {
                    break None;
                };
                if !waiter.txn.claim() {
                    continue;
                }
                if let Some(v) = value.take() {
                    *waiter.slot.lock() = Some(v);
                }
                waiter.txn.commit_claimed();
                break Some(waiter.txn);
            };
            if peer.is_none() {
                if let Some(v) = value.take() {
                    state.buffer.push_back(v);
                }
            }
            peer
        };
        if let Some(peer) = handed_off {
            peer.finish_commit();
        }
    }

    /// An event that receives the oldest queued value.
    #[must_use]
    pub fn recv_evt(&self) -> Event<T> {
        let inner = self.inner.clone();
        Event::from_leaf(move || recv_leaf(inner))
    }

    /// Blocking receive: `sync(recv_evt())`.
    ///
    /// # Errors
    ///
    /// Infallible for a bare receive; the `Result` carries errors only
    /// when the event is composed with fallible branches.
    pub async fn recv(&self) -> Result<T, EventideError> {
        sync(self.recv_evt()).await
    }

    /// Non-blocking receive attempt.
    #[must_use]
    pub fn recv_poll(&self) -> Option<T> {
        self.inner.lock().buffer.pop_front()
    }

    /// Number of buffered values.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().buffer.len()
    }

    /// Whether the buffer is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.lock().buffer.is_empty()
    }

    /// Identity equality of the underlying mailbox.
    #[must_use]
    pub fn same(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl<T: Send + 'static> Default for Mailbox<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for Mailbox<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> std::fmt::Debug for Mailbox<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.lock();
        f.debug_struct("Mailbox")
            .field("buffered", &state.buffer.len())
            .field("waiters", &state.waiters.len())
            .finish()
    }
}

fn recv_leaf<T: Send + 'static>(inner: Arc<Mutex<MailboxState<T>>>) -> LeafPoll<T> {
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
        let dequeued = {
            let mut state = inner.lock();
            state.buffer.pop_front().map(|v| {
                state.rank += 1;
                (state.rank, v)
            })
        };
        if let Some((rank, v)) = dequeued {
            return EventStatus::Enabled {
                priority: rank,
                value: Ok(v),
            };
        }
        registered = true;
        EventStatus::Blocked(recv_register(inner.clone(), slot.clone()))
    })
}

fn recv_register<T: Send + 'static>(
    inner: Arc<Mutex<MailboxState<T>>>,
    slot: Arc<Mutex<Option<T>>>,
) -> RegisterFn {
    Box::new(move |txn: &Arc<Transaction>| {
        let mut commit_self = false;
        let mut enrolled = false;
        {
            let mut state = inner.lock();
            if state.buffer.is_empty() {
                state.waiters.push_back(Waiter {
                    txn: txn.clone(),
                    slot: slot.clone(),
                });
                enrolled = true;
            } else if txn.claim() {
                // A value arrived between poll and registration.
                *slot.lock() = state.buffer.pop_front();
                txn.commit_claimed();
                commit_self = true;
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fiber::{spawn, yield_now};
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn test_send_then_recv_in_order() {
        let mailbox = Mailbox::new();
        for v in 1..=5 {
            mailbox.send(v);
        }
        let mut received = Vec::new();
        for _ in 0..5 {
            received.push(mailbox.recv().await.ok());
        }
        assert_eq!(received, vec![Some(1), Some(2), Some(3), Some(4), Some(5)]);
        assert!(mailbox.is_empty());
    }

    #[tokio::test]
    async fn test_send_never_blocks() {
        let mailbox = Mailbox::new();
        for v in 0..1000 {
            mailbox.send(v);
        }
        assert_eq!(mailbox.len(), 1000);
    }

    #[tokio::test]
    async fn test_send_hands_off_to_waiting_receiver() {
        let mailbox = Mailbox::new();
        let rx = mailbox.clone();
        let handle = tokio::spawn(async move { rx.recv().await });
        for _ in 0..10 {
            yield_now().await;
        }
        mailbox.send(42);
        assert_eq!(handle.await.ok(), Some(Ok(42)));
        // Handed off, not buffered.
        assert!(mailbox.is_empty());
    }

    #[tokio::test]
    async fn test_recv_poll_is_non_blocking() {
        let mailbox: Mailbox<i32> = Mailbox::new();
        assert_eq!(mailbox.recv_poll(), None);
        mailbox.send(3);
        assert_eq!(mailbox.recv_poll(), Some(3));
    }

    #[tokio::test]
    async fn test_receivers_served_fifo() {
        let mailbox = Mailbox::new();
        let results = Arc::new(Mutex::new(Vec::new()));
        for tag in ["first", "second"] {
            let rx = mailbox.clone();
            let results = results.clone();
            spawn(async move {
                let v: Result<i32, _> = rx.recv().await;
                results.lock().push((tag, v.ok()));
            });
            for _ in 0..10 {
                yield_now().await;
            }
        }
        mailbox.send(1);
        mailbox.send(2);
        for _ in 0..20 {
            yield_now().await;
        }
        let results = results.lock().clone();
        assert_eq!(results, vec![("first", Some(1)), ("second", Some(2))]);
    }
}
