//! The fiber layer: spawning, yielding, joining and exiting.
//!
//! A fiber is a tokio task wrapped so that its completion is observable
//! as an event: [`spawn`] enters the fiber in a process-wide registry and
//! arranges for its completion cvar to be set however the task ends,
//! whether by normal return, [`exit`], panic or abort. [`join_evt`] resolves the
//! registry at sync time, so joining a finished (or unknown) fiber is
//! immediately ready.

use crate::cvar::CVar;
use crate::event::{always, guard, Event};
use dashmap::DashMap;
use futures::FutureExt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;
use tracing::trace;

/// Identifier of a spawned fiber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FiberId(u64);

struct FiberRecord {
    done: CVar,
}

static NEXT_FIBER_ID: AtomicU64 = AtomicU64::new(1);

fn registry() -> &'static DashMap<u64, FiberRecord> {
    static REGISTRY: OnceLock<DashMap<u64, FiberRecord>> = OnceLock::new();
    REGISTRY.get_or_init(DashMap::new)
}

/// Payload used by [`exit`] to unwind a fiber.
struct FiberExit;

/// Spawns a fiber running `future`.
///
/// Must be called within a tokio runtime. The returned id can be passed
/// to [`join_evt`] from any fiber.
pub fn spawn<F>(future: F) -> FiberId
where
    F: Future<Output = ()> + Send + 'static,
{
    let id = FiberId(NEXT_FIBER_ID.fetch_add(1, Ordering::Relaxed));
    let done = CVar::new();
    registry().insert(id.0, FiberRecord { done: done.clone() });

    tokio::spawn(async move {
        // Ensures joiners are woken and the registry entry is removed
        // however this task ends, including unwinds and aborts.
        let _completion = FiberCompletion { id, done };
        match AssertUnwindSafe(future).catch_unwind().await {
            Ok(()) => {}
            Err(payload) if payload.is::<FiberExit>() => {
                trace!(fiber = id.0, "fiber exited");
            }
            Err(payload) => std::panic::resume_unwind(payload),
        }
    });
    id
}

struct FiberCompletion {
    id: FiberId,
    done: CVar,
}

impl Drop for FiberCompletion {
    fn drop(&mut self) {
        registry().remove(&self.id.0);
        self.done.set();
    }
}

/// An event enabled once the given fiber has finished.
///
/// A fiber that already finished (or an id that never existed) yields
/// an immediately enabled event.
#[must_use]
pub fn join_evt(fiber: FiberId) -> Event<()> {
    guard(move || match registry().get(&fiber.0) {
        Some(record) => record.done.wait_evt(),
        None => always(()),
    })
}

/// Yields the current fiber back to the scheduler.
pub async fn yield_now() {
    tokio::task::yield_now().await;
}

/// Stops the calling fiber.
///
/// Unwinds with a dedicated payload that [`spawn`]'s wrapper treats as a
/// normal stop: the fiber's `join_evt` becomes ready and no panic is
/// reported. Calling this outside a fiber created by [`spawn`] unwinds
/// the surrounding task like any panic.
pub fn exit() -> ! {
    std::panic::panic_any(FiberExit);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::sync;
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_join_finished_fiber_is_immediate() {
        let id = spawn(async {});
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(sync(join_evt(id)).await, Ok(()));
    }

    #[tokio::test]
    async fn test_join_waits_for_completion() {
        let reached = Arc::new(AtomicBool::new(false));
        let reached_clone = reached.clone();
        let id = spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            reached_clone.store(true, Ordering::SeqCst);
        });
        assert_eq!(sync(join_evt(id)).await, Ok(()));
        assert!(reached.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_exit_makes_join_ready() {
        let after_exit = Arc::new(AtomicBool::new(false));
        let after_exit_clone = after_exit.clone();
        let id = spawn(async move {
            exit();
            #[allow(unreachable_code)]
            {
                after_exit_clone.store(true, Ordering::SeqCst);
            }
        });
        assert_eq!(sync(join_evt(id)).await, Ok(()));
        assert!(!after_exit.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_join_unknown_fiber_is_immediate() {
        // An id from the far future of the counter.
        let bogus = FiberId(u64::MAX);
        assert_eq!(sync(join_evt(bogus)).await, Ok(()));
    }

    #[tokio::test]
    async fn test_panicking_fiber_still_joins() {
        let id = spawn(async {
            panic!("fiber failure");
        });
        assert_eq!(sync(join_evt(id)).await, Ok(()));
    }

    #[tokio::test]
    async fn test_yield_now_returns() {
        yield_now().await;
    }
}
