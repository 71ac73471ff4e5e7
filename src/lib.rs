#![warn(missing_docs, missing_debug_implementations, rust_2018_idioms)]

//! Wait-capable MPMC message-passing fabric.
//!
//! Weft ships two lock-free multi-producer / multi-consumer ticket-ring
//! queues — fixed-capacity [`mpmc::BoundedQueue`] and capped-growth
//! [`mpmc::GrowableQueue`] — plus a closable two-endpoint [`channel::Channel`]
//! built on top of them. Every operation comes in three shapes:
//!
//! * non-blocking `try_push` / `try_pop`,
//! * lazy futures (`push`, `pop`, and the `_until` deadline variants),
//! * detached callback variants (`push_detached`, ...) driven by an internal
//!   wake-driven poller and cancellable through a [`stop::StopToken`].
//!
//! Blocked operations never spin against the ring; they park in a striped
//! turn-notification registry keyed by the `(turn address, expected turn)`
//! pair the ring publishes on every slot, so a publish wakes exactly the
//! waiters that can now make progress.

pub mod channel;
pub mod error;
pub mod mpmc;
pub mod stop;

// Internal utilities - not part of the public API.
mod async_util;
mod internal;
mod notify;
mod sync_util;
mod timer;

pub use error::{ErrorCode, ErrorKind, TryPopError, TryPushError};
pub use stop::{StopSource, StopToken};

// Helper function to check if a type is Send + Sync.
// Useful for static assertions in generic code.
#[allow(dead_code)]
fn assert_send_sync<T: Send + Sync>() {}
