//! Error types for the eventide runtime.
//!
//! Errors surface from [`sync`](crate::event::sync) as `Err` values;
//! non-blocking polls never error for "not ready" and return sentinels
//! instead.

use std::any::Any;
use thiserror::Error;

/// The error type for event synchronization.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EventideError {
    /// A send or receive event was offered on a closed channel.
    ///
    /// Offers enqueued before the channel was closed are not affected
    /// and continue to completion.
    #[error("channel is closed")]
    Closed,

    /// A second `put` on a write-once cell, or a `put` on a full cell.
    #[error("value already written")]
    AlreadyWritten,

    /// A `wrap` transform or a guard thunk panicked during sync.
    ///
    /// [`wrap_handler`](crate::event::wrap_handler) intercepts this
    /// variant and replaces it with the handler's value.
    #[error("event transform panicked: {0}")]
    Panicked(String),
}

impl EventideError {
    /// Captures a panic payload as a `Panicked` error.
    pub(crate) fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "non-string panic payload".to_string()
        };
        Self::Panicked(message)
    }
}
