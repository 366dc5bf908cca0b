//! First-class synchronous events and their combinators.
//!
//! This module provides:
//! - The [`Event`] type: a one-shot, composable synchronization
//!   opportunity
//! - Combinators: [`always`], [`never`], [`guard`], [`wrap`],
//!   [`wrap_handler`], [`choose`], [`with_nack`]
//! - The synchronization engine: [`sync`]
//!
//! Events are consumed by [`sync`], which forces deferred construction
//! (guards), selects exactly one enabled branch across the composed
//! tree, and fires negative acknowledgments for every losing
//! [`with_nack`] branch.

pub(crate) mod group;
mod sync;
#[cfg(test)]
mod sync_tests;

pub use group::{EventStatus, RegisterFn};
pub use sync::sync;

use crate::cvar::CVar;
use crate::errors::EventideError;
use group::{enabled_once, EventGroup, LeafPoll};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

/// A first-class synchronization opportunity.
///
/// Events are inert values until passed to [`sync`]; they are single-use
/// and consumed by it. Composition never blocks and never touches the
/// underlying resources; only sync does.
pub struct Event<T> {
    force: Box<dyn FnOnce() -> EventGroup<T> + Send>,
}

impl<T: Send + 'static> Event<T> {
    /// Builds an event from its force closure.
    pub(crate) fn from_force<F>(force: F) -> Self
    where
        F: FnOnce() -> EventGroup<T> + Send + 'static,
    {
        Self {
            force: Box::new(force),
        }
    }

    /// Builds an event from a single base leaf constructor.
    ///
    /// The leaf is created at force time, so one-shot per-sync state
    /// (done flags, slots) is fresh for the sync that consumes it.
    pub(crate) fn from_leaf<F>(leaf: F) -> Self
    where
        F: FnOnce() -> LeafPoll<T> + Send + 'static,
    {
        Self::from_force(move || EventGroup::Base(vec![leaf()]))
    }

    /// Resolves the event into its group tree.
    pub(crate) fn force(self) -> EventGroup<T> {
        (self.force)()
    }

    /// Applies a transform to the value this event produces.
    ///
    /// Method form of [`wrap`].
    #[must_use]
    pub fn wrap<U, F>(self, transform: F) -> Event<U>
    where
        U: Send + 'static,
        F: Fn(T) -> U + Send + Sync + 'static,
    {
        wrap(self, transform)
    }

    /// Replaces errors (including captured panics) with a handler value.
    ///
    /// Method form of [`wrap_handler`].
    #[must_use]
    pub fn wrap_handler<F>(self, handler: F) -> Self
    where
        F: Fn(EventideError) -> T + Send + Sync + 'static,
    {
        wrap_handler(self, handler)
    }
}

impl<T> std::fmt::Debug for Event<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Event")
    }
}

/// An event that is always immediately enabled with the given value.
///
/// Identity for [`choose`]: an earlier `always` wins the poll fast path.
#[must_use]
pub fn always<T: Send + 'static>(value: T) -> Event<T> {
    Event::from_leaf(move || enabled_once(-1, Ok(value)))
}

/// An event that never becomes enabled.
///
/// Synchronizing on `never` alone suspends forever; inside a [`choose`]
/// it contributes nothing.
#[must_use]
pub fn never<T: Send + 'static>() -> Event<T> {
    Event::from_force(|| EventGroup::Base(Vec::new()))
}

/// Defers event construction to sync time.
///
/// The thunk runs once per sync, at force time: never from a poll, and
/// never at all when an earlier branch of the enclosing [`choose`] is
/// already enabled.
#[must_use]
pub fn guard<T, F>(thunk: F) -> Event<T>
where
    T: Send + 'static,
    F: FnOnce() -> Event<T> + Send + 'static,
{
    Event::from_force(move || EventGroup::Lazy(Box::new(move || thunk().force())))
}

/// Applies `transform` to the value of `event`.
///
/// The transform runs when the leaf becomes enabled; a panic inside it
/// is captured and surfaces from sync as
/// [`EventideError::Panicked`] unless a [`wrap_handler`] intercepts it.
/// Wrapping preserves the event's group shape, so nack propagation is
/// unaffected.
#[must_use]
pub fn wrap<A, B, F>(event: Event<A>, transform: F) -> Event<B>
where
    A: Send + 'static,
    B: Send + 'static,
    F: Fn(A) -> B + Send + Sync + 'static,
{
    let transform = Arc::new(transform);
    Event::from_force(move || {
        event.force().map(move |value| match value {
            Ok(v) => catch_unwind(AssertUnwindSafe(|| transform(v)))
                .map_err(EventideError::from_panic),
            Err(err) => Err(err),
        })
    })
}

/// Intercepts errors with a handler.
///
/// Like [`wrap`], but errors from the inner event (a closed channel, a
/// panicking transform, a panicking guard thunk) are converted into the
/// handler's value instead of surfacing from sync.
#[must_use]
pub fn wrap_handler<T, F>(event: Event<T>, handler: F) -> Event<T>
where
    T: Send + 'static,
    F: Fn(EventideError) -> T + Send + Sync + 'static,
{
    let handler = Arc::new(handler);
    Event::from_force(move || {
        let handler_for_force = handler.clone();
        match catch_unwind(AssertUnwindSafe(|| event.force())) {
            Ok(group) => group.map_protected(move |err| handler(err)),
            Err(payload) => EventGroup::Base(vec![enabled_once(
                -1,
                Ok(handler_for_force(EventideError::from_panic(payload))),
            )]),
        }
    })
}

/// Combines events into one that synchronizes on whichever is ready.
///
/// When several branches are simultaneously enabled, the earliest in
/// source order wins. An empty choose is equivalent to [`never`]; a
/// singleton choose is observationally equivalent to its branch.
#[must_use]
pub fn choose<T: Send + 'static>(events: Vec<Event<T>>) -> Event<T> {
    Event::from_force(move || {
        let mut groups: Vec<EventGroup<T>> = Vec::new();
        for event in events {
            let group = event.force();
            if !group.is_empty() {
                groups.push(group);
            }
        }
        if groups.len() == 1 {
            return groups.remove(0);
        }
        if groups
            .iter()
            .all(|group| matches!(group, EventGroup::Base(_)))
        {
            let mut polls = Vec::new();
            for group in groups {
                if let EventGroup::Base(leaf_polls) = group {
                    polls.extend(leaf_polls);
                }
            }
            return EventGroup::Base(polls);
        }
        EventGroup::Nested(groups)
    })
}

/// Builds an event that is told when it loses.
///
/// At sync time a fresh condition variable is created and its wait event
/// is passed to `build`; if the branch returned by `build` loses the
/// enclosing choose, the cvar is set before sync returns, resuming any
/// fiber synchronizing on the nack event. A winning branch's cvar is
/// never set by the engine.
///
/// Unlike a [`guard`] thunk, `build` runs at force time regardless of
/// which branch of the choose wins: the cvar must exist so a branch that
/// loses to an earlier sibling is still notified.
#[must_use]
pub fn with_nack<T, F>(build: F) -> Event<T>
where
    T: Send + 'static,
    F: FnOnce(Event<()>) -> Event<T> + Send + 'static,
{
    Event::from_force(move || {
        let cvar = CVar::new();
        let inner = build(cvar.wait_evt());
        EventGroup::Nack(cvar, Box::new(inner.force()))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[tokio::test]
    async fn test_always_yields_value() {
        assert_eq!(sync(always(42)).await, Ok(42));
    }

    #[tokio::test]
    async fn test_wrap_applies_transform() {
        // sync(wrap(always(v), f)) == f(v)
        let event = wrap(always(21), |v| v * 2);
        assert_eq!(sync(event).await, Ok(42));
    }

    #[tokio::test]
    async fn test_wrap_composes() {
        let event = always(1).wrap(|v| v + 1).wrap(|v| v * 10);
        assert_eq!(sync(event).await, Ok(20));
    }

    #[tokio::test]
    async fn test_choose_prefers_source_order() {
        // sync(choose(always(v), e)) == v
        let event = choose(vec![always("first"), always("second")]);
        assert_eq!(sync(event).await, Ok("first"));
    }

    #[tokio::test]
    async fn test_singleton_choose_is_transparent() {
        assert_eq!(sync(choose(vec![always(5)])).await, Ok(5));
    }

    #[tokio::test]
    async fn test_choose_skips_never() {
        let event = choose(vec![never(), always(9)]);
        assert_eq!(sync(event).await, Ok(9));
    }

    #[tokio::test]
    async fn test_guard_runs_at_sync_time() {
        let ran = Arc::new(AtomicBool::new(false));
        let ran_clone = ran.clone();
        let event = guard(move || {
            ran_clone.store(true, Ordering::SeqCst);
            always(3)
        });
        assert!(!ran.load(Ordering::SeqCst));
        assert_eq!(sync(event).await, Ok(3));
        assert!(ran.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_guard_laziness_under_choose() {
        // A guard after an already-enabled sibling never runs.
        let ran = Arc::new(AtomicBool::new(false));
        let ran_clone = ran.clone();
        let guarded = guard(move || {
            ran_clone.store(true, Ordering::SeqCst);
            always("g")
        });
        let result = sync(choose(vec![always("x"), guarded])).await;
        assert_eq!(result, Ok("x"));
        assert!(!ran.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_wrap_panic_surfaces_as_error() {
        let event = always(0).wrap(|_| -> i32 { panic!("transform failed") });
        match sync(event).await {
            Err(EventideError::Panicked(msg)) => {
                assert!(msg.contains("transform failed"));
            }
            other => panic!("expected a panicked error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_wrap_handler_replaces_panic() {
        let event = always(0)
            .wrap(|_| -> i32 { panic!("transform failed") })
            .wrap_handler(|_| -7);
        assert_eq!(sync(event).await, Ok(-7));
    }

    #[tokio::test]
    async fn test_wrap_handler_catches_guard_panic() {
        let event: Event<i32> = guard(|| panic!("thunk failed"));
        let handled = event.wrap_handler(|err| match err {
            EventideError::Panicked(_) => 1,
            _ => 2,
        });
        assert_eq!(sync(handled).await, Ok(1));
    }

    #[tokio::test]
    async fn test_deeply_nested_choose() {
        // Twenty levels of nesting with a single always leaf at the
        // bottom still selects it.
        let mut event = always(77);
        for _ in 0..20 {
            event = choose(vec![never(), event]);
        }
        assert_eq!(sync(event).await, Ok(77));
    }
}
