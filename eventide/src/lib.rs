//! # Eventide
//!
//! A Concurrent ML style synchronization library for tokio.
//!
//! Eventide makes synchronization first-class: sends, receives, timeouts
//! and completion signals are all values of type [`Event`](event::Event)
//! that can be combined before any of them runs:
//!
//! - **Rendezvous channels**: unbuffered, exactly-one pairing of a send
//!   with a receive
//! - **Selective communication**: `choose` commits exactly one branch of
//!   an arbitrarily composed event tree
//! - **Guards and wrappers**: defer event construction to sync time,
//!   transform results, intercept failures
//! - **Negative acknowledgments**: losing branches are told they lost so
//!   they can release resources
//! - **Derived primitives**: mailboxes, write-once cells, take/put
//!   cells, barriers
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use eventide::prelude::*;
//! use std::time::Duration;
//!
//! let chan = Channel::new();
//! let tx = chan.clone();
//! spawn(async move {
//!     let _ = tx.send(7).await;
//! });
//!
//! // Take whichever happens first: a value or a deadline.
//! let result = sync(choose(vec![
//!     wrap(chan.recv_evt(), |v| Some(v)),
//!     wrap(timeout(Duration::from_millis(10)), |()| None),
//! ]))
//! .await?;
//! ```

#![forbid(unsafe_code)]
#![warn(
    clippy::all,
    clippy::pedantic,
    missing_docs,
    rust_2018_idioms
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

pub mod channel;
pub mod cvar;
pub mod errors;
pub mod event;
pub mod fiber;
pub mod observability;
pub mod prim;
pub mod time;
pub mod transaction;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::channel::Channel;
    pub use crate::cvar::CVar;
    pub use crate::errors::EventideError;
    pub use crate::event::{
        always, choose, guard, never, sync, with_nack, wrap, wrap_handler, Event,
    };
    pub use crate::fiber::{exit, join_evt, spawn, yield_now, FiberId};
    pub use crate::prim::{Barrier, Enrollment, IVar, MVar, Mailbox};
    pub use crate::time::{at_time, timeout};
}
