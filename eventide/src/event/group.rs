//! Event groups and the base-event poll protocol.
//!
//! Forcing an [`Event`](super::Event) yields an [`EventGroup`]: a tree of
//! base leaves (poll closures), nested subgroups, nack wrappers and lazy
//! nodes. The sync engine walks this tree in source order; every leaf
//! obeys the poll contract below.
//!
//! Poll contract for a base leaf:
//! 1. once satisfied during this sync, polling again returns `Enabled`
//!    with the stored value (fast-path idempotence);
//! 2. a poll may complete an opportunistic rendezvous with an
//!    already-waiting peer and return `Enabled` directly;
//! 3. otherwise the poll returns `Blocked` with a registration that
//!    enrolls the sync's transaction in the leaf's wait queue and
//!    installs a cleanup removing it again;
//! 4. after the registration has been handed out, further polls return
//!    `Blocked` with a no-op registration, so a wake-phase re-poll can
//!    only observe the leaf's own done state.

use crate::cvar::CVar;
use crate::errors::EventideError;
use crate::transaction::Transaction;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

/// Registration continuation of a blocked base event.
///
/// Enrolls the given transaction into the event's wait queue and installs
/// a cleanup hook that removes the entry when the transaction leaves its
/// active state.
pub type RegisterFn = Box<dyn FnOnce(&Arc<Transaction>) + Send>;

/// Result of polling a base event.
pub enum EventStatus<V> {
    /// The event is immediately ready.
    Enabled {
        /// Advisory old-waiter rank; selection is by source order.
        priority: i64,
        /// The value this leaf produces.
        value: V,
    },
    /// The event is not ready; `register` enrolls a transaction.
    Blocked(RegisterFn),
}

impl<V> EventStatus<V> {
    /// A `Blocked` status whose registration does nothing.
    ///
    /// Used by leaves that already handed out their real registration.
    #[must_use]
    pub fn blocked_noop() -> Self {
        Self::Blocked(Box::new(|_| {}))
    }
}

impl<V> std::fmt::Debug for EventStatus<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Enabled { priority, .. } => f
                .debug_struct("Enabled")
                .field("priority", priority)
                .finish_non_exhaustive(),
            Self::Blocked(_) => f.write_str("Blocked"),
        }
    }
}

/// Poll closure of one base leaf.
///
/// Errors travel through `Enabled` values and surface from sync as `Err`.
pub(crate) type LeafPoll<T> =
    Box<dyn FnMut() -> EventStatus<Result<T, EventideError>> + Send>;

/// A forced event: the tree the sync engine walks.
pub(crate) enum EventGroup<T> {
    /// A list of base leaves.
    Base(Vec<LeafPoll<T>>),
    /// Subgroups, polled depth-first in order.
    Nested(Vec<EventGroup<T>>),
    /// A subgroup whose cvar fires if the subgroup loses the sync.
    Nack(CVar, Box<EventGroup<T>>),
    /// A deferred subtree, expanded only while no branch has won.
    ///
    /// Produced by `guard` so that thunks never run when an earlier
    /// branch is already enabled.
    Lazy(Box<dyn FnOnce() -> EventGroup<T> + Send>),
}

impl<T: Send + 'static> EventGroup<T> {
    /// Whether the group can contribute nothing to a choose.
    ///
    /// Nack and lazy nodes are never considered empty: a nack wrapper is
    /// meaningful even around an empty subgroup, and a lazy node's shape
    /// is unknown until forced.
    pub(crate) fn is_empty(&self) -> bool {
        match self {
            Self::Base(polls) => polls.is_empty(),
            Self::Nested(groups) => groups.iter().all(Self::is_empty),
            Self::Nack(..) | Self::Lazy(_) => false,
        }
    }

    /// Applies a value transform to every leaf, preserving group shape.
    pub(crate) fn map<U, F>(self, transform: F) -> EventGroup<U>
    where
        U: Send + 'static,
        F: Fn(Result<T, EventideError>) -> Result<U, EventideError>
            + Clone
            + Send
            + 'static,
    {
        match self {
            Self::Base(polls) => EventGroup::Base(
                polls
                    .into_iter()
                    .map(|mut poll| {
                        let transform = transform.clone();
                        let mapped: LeafPoll<U> = Box::new(move || match poll() {
                            EventStatus::Enabled { priority, value } => {
                                EventStatus::Enabled {
                                    priority,
                                    value: transform(value),
                                }
                            }
                            EventStatus::Blocked(register) => {
                                EventStatus::Blocked(register)
                            }
                        });
                        mapped
                    })
                    .collect(),
            ),
            Self::Nested(groups) => EventGroup::Nested(
                groups
                    .into_iter()
                    .map(|group| group.map(transform.clone()))
                    .collect(),
            ),
            Self::Nack(cvar, inner) => {
                EventGroup::Nack(cvar, Box::new(inner.map(transform)))
            }
            Self::Lazy(force) => {
                EventGroup::Lazy(Box::new(move || force().map(transform)))
            }
        }
    }

    /// Routes every error through a handler and catches leaf-poll and
    /// lazy-expansion panics, preserving group shape.
    pub(crate) fn map_protected<F>(self, handler: F) -> Self
    where
        F: Fn(EventideError) -> T + Clone + Send + 'static,
    {
        match self {
            Self::Base(polls) => Self::Base(
                polls
                    .into_iter()
                    .map(|mut poll| {
                        let handler = handler.clone();
                        let protected: LeafPoll<T> = Box::new(move || {
                            match catch_unwind(AssertUnwindSafe(&mut poll)) {
                                Ok(EventStatus::Enabled { priority, value }) => {
                                    EventStatus::Enabled {
                                        priority,
                                        value: Ok(value
                                            .unwrap_or_else(|err| handler(err))),
                                    }
                                }
                                Ok(EventStatus::Blocked(register)) => {
                                    EventStatus::Blocked(register)
                                }
                                Err(payload) => EventStatus::Enabled {
                                    priority: -1,
                                    value: Ok(handler(EventideError::from_panic(
                                        payload,
                                    ))),
                                },
                            }
                        });
                        protected
                    })
                    .collect(),
            ),
            Self::Nested(groups) => Self::Nested(
                groups
                    .into_iter()
                    .map(|group| group.map_protected(handler.clone()))
                    .collect(),
            ),
            Self::Nack(cvar, inner) => {
                Self::Nack(cvar, Box::new(inner.map_protected(handler)))
            }
            Self::Lazy(force) => Self::Lazy(Box::new(move || {
                match catch_unwind(AssertUnwindSafe(force)) {
                    Ok(group) => group.map_protected(handler),
                    Err(payload) => Self::Base(vec![enabled_once(
                        -1,
                        Ok(handler(EventideError::from_panic(payload))),
                    )]),
                }
            })),
        }
    }
}

/// A leaf that is enabled exactly once with the given value.
pub(crate) fn enabled_once<T: Send + 'static>(
    priority: i64,
    value: Result<T, EventideError>,
) -> LeafPoll<T> {
    let mut slot = Some(value);
    Box::new(move || match slot.take() {
        Some(value) => EventStatus::Enabled { priority, value },
        None => EventStatus::blocked_noop(),
    })
}
