//! Synchronous rendezvous channels.
//!
//! A [`Channel`] carries no buffer: every value moves through a
//! rendezvous pairing exactly one send offer with exactly one receive
//! offer. Offers are matched in FIFO order among live offers; cancelled
//! offers are dropped when encountered at the head of a queue and
//! removed by transaction id when their sync is decided elsewhere.
//!
//! All queue manipulation happens under one per-channel mutex. Peers are
//! resumed only after the mutex is released; a rendezvous discovered
//! while registering commits both transactions through the id-ordered
//! claim protocol in [`crate::transaction`].

use crate::errors::EventideError;
use crate::event::group::{EventStatus, LeafPoll, RegisterFn};
use crate::event::{sync, Event};
use crate::transaction::{claim_pair, PairClaim, Transaction};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::trace;

/// A synchronous rendezvous point between senders and receivers.
///
/// Cloning yields another handle to the same channel; equality of
/// channels is object identity, tested with [`Channel::same`].
pub struct Channel<T> {
    inner: Arc<Mutex<ChannelState<T>>>,
}

struct ChannelState<T> {
    closed: bool,
    senders: VecDeque<SendOffer<T>>,
    receivers: VecDeque<RecvOffer<T>>,
}

/// A blocked sender: the value travels with the offer; the shared done
/// flag tells the sender's re-poll that the value was consumed.
struct SendOffer<T> {
    txn: Arc<Transaction>,
    value: T,
    done: Arc<AtomicBool>,
}

/// A blocked receiver: the matching sender writes into the shared slot,
/// whose occupancy doubles as the receiver's done flag.
struct RecvOffer<T> {
    txn: Arc<Transaction>,
    slot: Arc<Mutex<Option<T>>>,
}

impl<T: Send + 'static> Channel<T> {
    /// Creates a new open channel.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(ChannelState {
                closed: false,
                senders: VecDeque::new(),
                receivers: VecDeque::new(),
            })),
        }
    }

    /// Identity equality: whether both handles name the same channel.
    #[must_use]
    pub fn same(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Marks the channel as refusing new offers.
    ///
    /// Offers already enqueued continue to completion; new send and
    /// receive events observe [`EventideError::Closed`] at sync.
    pub fn close(&self) {
        self.inner.lock().closed = true;
    }

    /// Returns whether the channel has been closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    /// An event that sends `value` once a receiver rendezvouses with it.
    #[must_use]
    pub fn send_evt(&self, value: T) -> Event<()> {
        let chan = self.inner.clone();
        Event::from_leaf(move || send_leaf(chan, value))
    }

    /// An event that receives the value of one rendezvoused send.
    #[must_use]
    pub fn recv_evt(&self) -> Event<T> {
        let chan = self.inner.clone();
        Event::from_leaf(move || recv_leaf(chan))
    }

    /// Blocking send: `sync(send_evt(value))`.
    ///
    /// # Errors
    ///
    /// Returns [`EventideError::Closed`] if the channel was closed before
    /// the offer was made.
    pub async fn send(&self, value: T) -> Result<(), EventideError> {
        sync(self.send_evt(value)).await
    }

    /// Blocking receive: `sync(recv_evt())`.
    ///
    /// # Errors
    ///
    /// Returns [`EventideError::Closed`] if the channel was closed before
    /// the offer was made.
    pub async fn recv(&self) -> Result<T, EventideError> {
        sync(self.recv_evt()).await
    }

    /// Non-blocking send attempt.
    ///
    /// Succeeds iff a live receiver is queued right now; the value is
    /// consumed either way. Never suspends.
    pub fn send_poll(&self, value: T) -> bool {
        let mut value = Some(value);
        let peer = {
            let mut state = self.inner.lock();
            if state.closed {
                None
            } else {
                loop {
                    let Some(offer) = state.receivers.pop_front() else {
                        break None;
                    };
                    if !offer.txn.claim() {
                        continue;
                    }
                    if let Some(v) = value.take() {
                        *offer.slot.lock() = Some(v);
                    }
                    offer.txn.commit_claimed();
                    break Some(offer.txn);
                }
            }
        };
        match peer {
            Some(txn) => {
                txn.finish_commit();
                true
            }
            None => false,
        }
    }

    /// Non-blocking receive attempt.
    ///
    /// Succeeds iff a live sender is queued right now. In-flight senders
    /// on a closed channel may still be drained here. Never suspends.
    #[must_use]
    pub fn recv_poll(&self) -> Option<T> {
        let received = {
            let mut state = self.inner.lock();
            loop {
                let Some(offer) = state.senders.pop_front() else {
                    break None;
                };
                if !offer.txn.claim() {
                    continue;
                }
                offer.done.store(true, Ordering::Release);
                offer.txn.commit_claimed();
                break Some((offer.value, offer.txn));
            }
        };
        received.map(|(value, txn)| {
            txn.finish_commit();
            value
        })
    }
}

impl<T: Send + 'static> Default for Channel<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for Channel<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> std::fmt::Debug for Channel<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.lock();
        f.debug_struct("Channel")
            .field("closed", &state.closed)
            .field("senders", &state.senders.len())
            .field("receivers", &state.receivers.len())
            .finish()
    }
}

/// What a send poll decided under the channel lock.
enum SendPoll {
    /// Rendezvoused with the queued receiver; resume it after unlocking.
    Sent(Arc<Transaction>),
    Closed,
    MustBlock,
}

fn send_leaf<T: Send + 'static>(
    chan: Arc<Mutex<ChannelState<T>>>,
    value: T,
) -> LeafPoll<()> {
    let done = Arc::new(AtomicBool::new(false));
    let mut value = Some(value);
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
        let outcome = {
            let mut state = chan.lock();
            loop {
                let Some(offer) = state.receivers.pop_front() else {
                    break if state.closed {
                        SendPoll::Closed
                    } else {
                        SendPoll::MustBlock
                    };
                };
                if !offer.txn.claim() {
                    trace!("dropping cancelled receive offer");
                    continue;
                }
                if let Some(v) = value.take() {
                    *offer.slot.lock() = Some(v);
                }
                offer.txn.commit_claimed();
                break SendPoll::Sent(offer.txn);
            }
        };
        match outcome {
            SendPoll::Sent(peer) => {
                peer.finish_commit();
                EventStatus::Enabled {
                    priority: -1,
                    value: Ok(()),
                }
            }
            SendPoll::Closed => EventStatus::Enabled {
                priority: -1,
                value: Err(EventideError::Closed),
            },
            SendPoll::MustBlock => {
                registered = true;
                match value.take() {
                    Some(v) => EventStatus::Blocked(send_register(
                        chan.clone(),
                        v,
                        done.clone(),
                    )),
                    // The value was already consumed; nothing to offer.
                    None => EventStatus::blocked_noop(),
                }
            }
        }
    })
}

fn send_register<T: Send + 'static>(
    chan: Arc<Mutex<ChannelState<T>>>,
    value: T,
    done: Arc<AtomicBool>,
) -> RegisterFn {
    Box::new(move |txn: &Arc<Transaction>| {
        let mut value = Some(value);
        let mut matched: Option<Arc<Transaction>> = None;
        let mut self_dead = false;
        let enqueued = {
            let mut state = chan.lock();
            loop {
                let Some(offer) = state.receivers.pop_front() else {
                    break;
                };
                match claim_pair(txn, &offer.txn) {
                    PairClaim::PeerDead => continue,
                    PairClaim::SelfDead => {
                        // Another leaf of this sync won; the popped
                        // receiver stays first in line.
                        state.receivers.push_front(offer);
                        self_dead = true;
                        break;
                    }
                    PairClaim::Claimed => {
                        if let Some(v) = value.take() {
                            *offer.slot.lock() = Some(v);
                        }
                        done.store(true, Ordering::Release);
                        txn.commit_claimed();
                        offer.txn.commit_claimed();
                        matched = Some(offer.txn);
                        break;
                    }
                }
            }
            if matched.is_none() && !self_dead {
                if let Some(v) = value.take() {
                    state.senders.push_back(SendOffer {
                        txn: txn.clone(),
                        value: v,
                        done: done.clone(),
                    });
                    true
                } else {
                    false
                }
            } else {
                false
            }
        };
        if let Some(peer) = matched {
            peer.finish_commit();
            txn.finish_commit();
        }
        if enqueued {
            let chan = chan.clone();
            let id = txn.id();
            txn.add_cleanup(move || {
                chan.lock().senders.retain(|offer| offer.txn.id() != id);
            });
        }
    })
}

/// What a receive poll decided under the channel lock.
enum RecvPoll<T> {
    Received(T, Arc<Transaction>),
    Closed,
    MustBlock,
}

fn recv_leaf<T: Send + 'static>(chan: Arc<Mutex<ChannelState<T>>>) -> LeafPoll<T> {
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
        let outcome = {
            let mut state = chan.lock();
            loop {
                let Some(offer) = state.senders.pop_front() else {
                    break if state.closed {
                        RecvPoll::Closed
                    } else {
                        RecvPoll::MustBlock
                    };
                };
                if !offer.txn.claim() {
                    trace!("dropping cancelled send offer");
                    continue;
                }
                offer.done.store(true, Ordering::Release);
                offer.txn.commit_claimed();
                break RecvPoll::Received(offer.value, offer.txn);
            }
        };
        match outcome {
            RecvPoll::Received(v, peer) => {
                peer.finish_commit();
                EventStatus::Enabled {
                    priority: -1,
                    value: Ok(v),
                }
            }
            RecvPoll::Closed => EventStatus::Enabled {
                priority: -1,
                value: Err(EventideError::Closed),
            },
            RecvPoll::MustBlock => {
                registered = true;
                EventStatus::Blocked(recv_register(chan.clone(), slot.clone()))
            }
        }
    })
}

fn recv_register<T: Send + 'static>(
    chan: Arc<Mutex<ChannelState<T>>>,
    slot: Arc<Mutex<Option<T>>>,
) -> RegisterFn {
    Box::new(move |txn: &Arc<Transaction>| {
        let mut matched: Option<Arc<Transaction>> = None;
        let mut self_dead = false;
        let enqueued = {
            let mut state = chan.lock();
            loop {
                let Some(offer) = state.senders.pop_front() else {
                    break;
                };
                match claim_pair(txn, &offer.txn) {
                    PairClaim::PeerDead => continue,
                    PairClaim::SelfDead => {
                        state.senders.push_front(offer);
                        self_dead = true;
                        break;
                    }
                    PairClaim::Claimed => {
                        // Value lands in the slot before either commit,
                        // so a woken sender implies a visible value.
                        *slot.lock() = Some(offer.value);
                        offer.done.store(true, Ordering::Release);
                        txn.commit_claimed();
                        offer.txn.commit_claimed();
                        matched = Some(offer.txn);
                        break;
                    }
                }
            }
            if matched.is_none() && !self_dead {
                state.receivers.push_back(RecvOffer {
                    txn: txn.clone(),
                    slot: slot.clone(),
                });
                true
            } else {
                false
            }
        };
        if let Some(peer) = matched {
            peer.finish_commit();
            txn.finish_commit();
        }
        if enqueued {
            let chan = chan.clone();
            let id = txn.id();
            txn.add_cleanup(move || {
                chan.lock().receivers.retain(|offer| offer.txn.id() != id);
            });
        }
    })
}
