//! The synchronization engine: two-phase poll / block-and-commit.

use super::group::{EventGroup, EventStatus, LeafPoll, RegisterFn};
use super::Event;
use crate::cvar::CVar;
use crate::errors::EventideError;
use crate::transaction::Transaction;
use std::ops::Range;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::{debug, error, trace};

/// Synchronizes on an event, returning the winning branch's value.
///
/// The engine walks the forced event tree in source order, expanding
/// deferred nodes as it goes. The first enabled leaf wins the poll fast
/// path. If no leaf is enabled, one [`Transaction`] is registered with
/// every leaf and the calling fiber suspends until a peer commits it;
/// the re-poll after waking identifies the committed leaf. Either way,
/// every losing `with_nack` branch has its cvar set before this returns.
///
/// # Errors
///
/// Propagates the winning leaf's error: `Closed` from a channel event,
/// or `Panicked` from a `wrap` transform, unless intercepted by
/// `wrap_handler`.
pub async fn sync<T: Send + 'static>(event: Event<T>) -> Result<T, EventideError> {
    let mut walk = Walk {
        polls: Vec::new(),
        registers: Vec::new(),
        nacks: Vec::new(),
        winner: None,
    };
    walk.poll_phase(event.force());

    if let Some((index, value)) = walk.winner.take() {
        trace!(winner = index, "sync enabled during poll phase");
        fire_nacks(&walk.nacks, index);
        return value;
    }

    if walk.polls.is_empty() {
        debug!("sync on an empty event group; suspending forever");
        return std::future::pending().await;
    }

    // Block phase: one shared transaction, waker installed before any
    // leaf registers, registrations in source order.
    let txn = Transaction::new();
    let (wake_tx, wake_rx) = oneshot::channel();
    txn.set_waker(wake_tx);
    let guard = CancelOnDrop::new(txn.clone());

    for register in walk.registers.drain(..) {
        // A registration can complete the rendezvous itself, after which
        // the remaining leaves have nothing to wait for.
        if txn.is_terminal() {
            break;
        }
        register(&txn);
    }
    trace!(txn = txn.id(), leaves = walk.polls.len(), "sync suspending");

    let _ = wake_rx.await;

    // Wake phase: exactly one leaf observed its commit.
    for (index, poll) in walk.polls.iter_mut().enumerate() {
        if let EventStatus::Enabled { value, .. } = poll() {
            guard.disarm();
            trace!(txn = txn.id(), winner = index, "sync committed");
            fire_nacks(&walk.nacks, index);
            return value;
        }
    }
    error!(txn = txn.id(), "transaction committed without an enabled leaf");
    unreachable!("sync woke without a committed base event");
}

/// In-order walk state: collected leaves, their registrations, the nack
/// groups encountered so far, and the first enabled leaf.
struct Walk<T> {
    polls: Vec<LeafPoll<T>>,
    registers: Vec<RegisterFn>,
    nacks: Vec<NackRecord>,
    winner: Option<(usize, Result<T, EventideError>)>,
}

/// A nack group's cvar together with the leaf indices beneath it.
struct NackRecord {
    cvar: CVar,
    leaves: Range<usize>,
}

impl<T: Send + 'static> Walk<T> {
    /// Walks the tree depth-first, polling leaves until one is enabled.
    ///
    /// The walk continues through every sibling after a winner is found:
    /// later branches are no longer polled and guard thunks stay
    /// unevaluated, but nack groups anywhere in the tree are still
    /// recorded so every losing branch can be told it lost.
    fn poll_phase(&mut self, group: EventGroup<T>) {
        match group {
            EventGroup::Base(polls) => {
                for mut poll in polls {
                    if self.winner.is_some() {
                        break;
                    }
                    match poll() {
                        EventStatus::Enabled { value, .. } => {
                            self.winner = Some((self.polls.len(), value));
                            self.polls.push(poll);
                        }
                        EventStatus::Blocked(register) => {
                            self.polls.push(poll);
                            self.registers.push(register);
                        }
                    }
                }
            }
            EventGroup::Nested(groups) => {
                for group in groups {
                    self.poll_phase(group);
                }
            }
            EventGroup::Nack(cvar, inner) => {
                let start = self.polls.len();
                self.poll_phase(*inner);
                // A range that contains the winner simply never fires; a
                // group reached only after the winner records an empty
                // range and always fires.
                self.nacks.push(NackRecord {
                    cvar,
                    leaves: start..self.polls.len(),
                });
            }
            EventGroup::Lazy(force) => {
                // Guard thunks never run once an earlier branch has won.
                if self.winner.is_none() {
                    self.poll_phase(force());
                }
            }
        }
    }
}

/// Sets the cvar of every nack group that does not contain the winner.
fn fire_nacks(nacks: &[NackRecord], winner: usize) {
    for record in nacks {
        if !record.leaves.contains(&winner) {
            record.cvar.set();
        }
    }
}

/// Cancels the transaction if the sync future is dropped or unwinds
/// after registration, running every installed cleanup.
struct CancelOnDrop {
    txn: Arc<Transaction>,
    armed: AtomicBool,
}

impl CancelOnDrop {
    fn new(txn: Arc<Transaction>) -> Self {
        Self {
            txn,
            armed: AtomicBool::new(true),
        }
    }

    fn disarm(&self) {
        self.armed.store(false, Ordering::Release);
    }
}

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        if self.armed.load(Ordering::Acquire) {
            self.txn.try_cancel();
        }
    }
}
