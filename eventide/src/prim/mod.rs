//! Derived synchronization primitives.
//!
//! This module provides:
//! - [`Mailbox`]: an asynchronous queue whose send never blocks
//! - [`IVar`]: a write-once cell with non-destructive reads
//! - [`MVar`]: a capacity-1 take/put cell with atomic swap
//! - [`Barrier`]: an N-party barrier with enrollments and a state
//!   update function
//!
//! Each is built from the base-event poll protocol and a private
//! mutex-protected queue; none requires anything from the sync engine
//! beyond what channels already use.

mod barrier;
mod ivar;
mod mailbox;
mod mvar;

pub use barrier::{Barrier, Enrollment};
pub use ivar::IVar;
pub use mailbox::Mailbox;
pub use mvar::MVar;
