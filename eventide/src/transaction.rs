//! The shared commit cell arbitrating one blocked synchronization.
//!
//! Every blocked `sync` call creates a single [`Transaction`] and
//! registers it with each base event it is waiting on. The first peer to
//! commit the transaction wins; everyone else observes the terminal
//! state and abandons. Cleanup hooks installed by registrations run
//! exactly once, on the transition out of `Active`.

use parking_lot::Mutex;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::warn;

/// Waiting for a commit or a cancellation.
const ACTIVE: u8 = 0;
/// Transiently held by a matcher; resolves to `ACTIVE` or `COMMITTED`.
const CLAIMED: u8 = 1;
/// A peer committed this synchronization.
const COMMITTED: u8 = 2;
/// The synchronization was abandoned.
const CANCELLED: u8 = 3;

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

type Cleanup = Box<dyn FnOnce() + Send>;

/// Shared atomic state for one blocked synchronization.
///
/// State transitions are `Active -> Committed` or `Active -> Cancelled`,
/// each at most once. The transient claimed state used by the rendezvous
/// pairing protocol is internal and never outlives a match attempt.
pub struct Transaction {
    id: u64,
    state: AtomicU8,
    waker: Mutex<Option<oneshot::Sender<()>>>,
    cleanups: Mutex<Vec<Cleanup>>,
}

impl Transaction {
    /// Creates a fresh, active transaction with a unique id.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
            state: AtomicU8::new(ACTIVE),
            waker: Mutex::new(None),
            cleanups: Mutex::new(Vec::new()),
        })
    }

    /// Returns the unique id, used for targeted removal from wait queues.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Records the wake channel of the suspended fiber.
    pub(crate) fn set_waker(&self, sender: oneshot::Sender<()>) {
        *self.waker.lock() = Some(sender);
    }

    /// Returns whether the transaction is still active.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.state.load(Ordering::Acquire) == ACTIVE
    }

    /// Returns whether the transaction was cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.state.load(Ordering::Acquire) == CANCELLED
    }

    /// Returns whether the transaction reached a terminal state.
    pub(crate) fn is_terminal(&self) -> bool {
        matches!(self.state.load(Ordering::Acquire), COMMITTED | CANCELLED)
    }

    /// Installs a cleanup hook, run once when the transaction leaves the
    /// active state. If the transaction is already terminal the hook runs
    /// immediately.
    pub fn add_cleanup<F>(&self, cleanup: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let boxed: Cleanup = Box::new(cleanup);
        let run_now = {
            let mut cleanups = self.cleanups.lock();
            if self.is_terminal() {
                Some(boxed)
            } else {
                cleanups.push(boxed);
                None
            }
        };
        if let Some(boxed) = run_now {
            run_one(boxed);
        }
    }

    /// Acquires the transaction for a match attempt.
    ///
    /// Spins through a concurrent claim (claim windows contain no locks
    /// and no suspension points) and fails on a terminal state.
    pub(crate) fn claim(&self) -> bool {
        loop {
            match self.state.compare_exchange(
                ACTIVE,
                CLAIMED,
                Ordering::Acquire,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(CLAIMED) => std::hint::spin_loop(),
                Err(_) => return false,
            }
        }
    }

    /// Finalizes a held claim as a commit.
    pub(crate) fn commit_claimed(&self) {
        self.state.store(COMMITTED, Ordering::Release);
    }

    /// Rolls a held claim back to the active state.
    pub(crate) fn unclaim(&self) {
        self.state.store(ACTIVE, Ordering::Release);
    }

    /// Wakes the suspended fiber, if one is recorded.
    pub(crate) fn resume(&self) {
        if let Some(sender) = self.waker.lock().take() {
            // The receiver is dropped only when the sync future itself
            // was dropped; nothing to wake in that case.
            let _ = sender.send(());
        }
    }

    /// Runs and discards every installed cleanup hook.
    pub(crate) fn run_cleanups(&self) {
        let cleanups = std::mem::take(&mut *self.cleanups.lock());
        for cleanup in cleanups {
            run_one(cleanup);
        }
    }

    /// Wakes the fiber and runs cleanups after a finalized commit.
    pub(crate) fn finish_commit(&self) {
        self.resume();
        self.run_cleanups();
    }

    /// Attempts to commit the transaction and wake its fiber.
    ///
    /// Returns false if the transaction already reached a terminal state.
    pub fn try_commit_and_resume(&self) -> bool {
        if self.claim() {
            self.commit_claimed();
            self.finish_commit();
            true
        } else {
            false
        }
    }

    /// Attempts to cancel the transaction, running cleanups on success.
    ///
    /// Cancelling an already-terminal transaction is a silent no-op
    /// returning false.
    pub fn try_cancel(&self) -> bool {
        loop {
            match self.state.compare_exchange(
                ACTIVE,
                CANCELLED,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    self.run_cleanups();
                    return true;
                }
                Err(CLAIMED) => std::hint::spin_loop(),
                Err(_) => return false,
            }
        }
    }
}

impl std::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = match self.state.load(Ordering::Acquire) {
            ACTIVE => "active",
            CLAIMED => "claimed",
            COMMITTED => "committed",
            _ => "cancelled",
        };
        f.debug_struct("Transaction")
            .field("id", &self.id)
            .field("state", &state)
            .finish()
    }
}

fn run_one(cleanup: Cleanup) {
    if let Err(payload) = catch_unwind(AssertUnwindSafe(cleanup)) {
        warn!("transaction cleanup panicked: {:?}", payload);
    }
}

/// Outcome of claiming a registering sync's own transaction together
/// with a queued peer's.
pub(crate) enum PairClaim {
    /// Both transactions are held; the caller transfers the value and
    /// must finalize both with [`Transaction::commit_claimed`].
    Claimed,
    /// The registering sync already has a winner elsewhere.
    SelfDead,
    /// The queued peer is dead and should be discarded.
    PeerDead,
}

/// Claims two transactions for a rendezvous, lower id first.
///
/// Claim chains therefore ascend by id and cannot cycle, which keeps
/// crossed matches on different channels deadlock-free. On failure the
/// held claim, if any, is rolled back.
pub(crate) fn claim_pair(own: &Transaction, peer: &Transaction) -> PairClaim {
    let own_first = own.id < peer.id;
    let (lo, hi) = if own_first { (own, peer) } else { (peer, own) };
    if !lo.claim() {
        return if own_first {
            PairClaim::SelfDead
        } else {
            PairClaim::PeerDead
        };
    }
    if !hi.claim() {
        lo.unclaim();
        return if own_first {
            PairClaim::PeerDead
        } else {
            PairClaim::SelfDead
        };
    }
    PairClaim::Claimed
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test]
    async fn test_commit_wakes_fiber() {
        let txn = Transaction::new();
        let (tx, rx) = oneshot::channel();
        txn.set_waker(tx);

        assert!(txn.try_commit_and_resume());
        assert!(rx.await.is_ok());
        assert!(!txn.is_active());
        assert!(!txn.is_cancelled());
    }

    #[test]
    fn test_commit_at_most_once() {
        let txn = Transaction::new();
        assert!(txn.try_commit_and_resume());
        assert!(!txn.try_commit_and_resume());
        assert!(!txn.try_cancel());
    }

    #[test]
    fn test_cancel_idempotent() {
        let txn = Transaction::new();
        assert!(txn.try_cancel());
        assert!(!txn.try_cancel());
        assert!(txn.is_cancelled());
    }

    #[test]
    fn test_cleanup_runs_once_on_cancel() {
        let txn = Transaction::new();
        let counter = Arc::new(AtomicUsize::new(0));
        let counter_clone = counter.clone();
        txn.add_cleanup(move || {
            counter_clone.fetch_add(1, Ordering::SeqCst);
        });

        assert!(txn.try_cancel());
        assert!(!txn.try_cancel());
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_cleanup_after_terminal_runs_immediately() {
        let txn = Transaction::new();
        assert!(txn.try_commit_and_resume());

        let counter = Arc::new(AtomicUsize::new(0));
        let counter_clone = counter.clone();
        txn.add_cleanup(move || {
            counter_clone.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_cleanup_panic_suppressed() {
        let txn = Transaction::new();
        txn.add_cleanup(|| panic!("intentional"));
        // Should not propagate
        assert!(txn.try_cancel());
    }

    #[test]
    fn test_claim_pair_both_live() {
        let a = Transaction::new();
        let b = Transaction::new();
        match claim_pair(&a, &b) {
            PairClaim::Claimed => {
                a.commit_claimed();
                b.commit_claimed();
            }
            _ => panic!("expected both claims to succeed"),
        }
        assert!(!a.is_active());
        assert!(!b.is_active());
    }

    #[test]
    fn test_claim_pair_self_dead() {
        let own = Transaction::new();
        let peer = Transaction::new();
        assert!(own.try_commit_and_resume());
        assert!(matches!(claim_pair(&own, &peer), PairClaim::SelfDead));
        // The live peer was rolled back, not left claimed
        assert!(peer.is_active());
    }

    #[test]
    fn test_claim_pair_peer_dead() {
        let own = Transaction::new();
        let peer = Transaction::new();
        assert!(peer.try_cancel());
        assert!(matches!(claim_pair(&own, &peer), PairClaim::PeerDead));
        assert!(own.is_active());
    }

    #[test]
    fn test_ids_are_unique() {
        let a = Transaction::new();
        let b = Transaction::new();
        assert_ne!(a.id(), b.id());
    }
}
