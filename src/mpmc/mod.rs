// src/mpmc/mod.rs

//! Lock-free MPMC ticket-ring queues.
//!
//! Two variants share one slot/turn algorithm: [`BoundedQueue`] allocates
//! its ring once, [`GrowableQueue`] expands the ring by a configured factor
//! up to a hard maximum. Both expose non-blocking `try_` operations, lazy
//! futures, deadline futures and detached callback variants.
//!
//! ```
//! use weft::mpmc::BoundedQueue;
//!
//! let queue = BoundedQueue::new(4);
//! queue.try_push(7).unwrap();
//! assert_eq!(queue.try_pop().unwrap(), 7);
//! ```

mod async_impl;
mod bounded;
pub(crate) mod core;
mod growable;

pub use async_impl::{PopFuture, PopUntilFuture, PushFuture, PushUntilFuture, RingOps};
pub use bounded::BoundedQueue;
pub use growable::{GrowableQueue, GrowthOptions};

use std::sync::Arc;
use std::time::Instant;

use crate::async_util;
use crate::error::ErrorCode;
use crate::stop::StopToken;

macro_rules! impl_detached_ops {
  ($queue:ident) => {
    impl<T: Send + 'static> $queue<T> {
      /// Runs [`push`](Self::push) detached from any executor and invokes
      /// `handler` exactly once with the outcome. A stop observed before or
      /// during the operation reports `Canceled`.
      pub fn push_detached<F>(self: &Arc<Self>, value: T, stop: StopToken, handler: F)
      where
        F: FnOnce(Result<(), ErrorCode>) + Send + 'static,
      {
        let queue = Arc::clone(self);
        async_util::run_detached_with_stop(async move { queue.push(value).await }, stop, handler);
      }

      /// Runs [`pop`](Self::pop) detached from any executor and invokes
      /// `handler` exactly once with the outcome.
      pub fn pop_detached<F>(self: &Arc<Self>, stop: StopToken, handler: F)
      where
        F: FnOnce(Result<T, ErrorCode>) + Send + 'static,
      {
        let queue = Arc::clone(self);
        async_util::run_detached_with_stop(async move { queue.pop().await }, stop, handler);
      }

      /// Detached [`push_until`](Self::push_until).
      pub fn push_until_detached<F>(self: &Arc<Self>, value: T, deadline: Instant, stop: StopToken, handler: F)
      where
        F: FnOnce(Result<(), ErrorCode>) + Send + 'static,
      {
        let queue = Arc::clone(self);
        async_util::run_detached_with_stop(async move { queue.push_until(value, deadline).await }, stop, handler);
      }

      /// Detached [`pop_until`](Self::pop_until).
      pub fn pop_until_detached<F>(self: &Arc<Self>, deadline: Instant, stop: StopToken, handler: F)
      where
        F: FnOnce(Result<T, ErrorCode>) + Send + 'static,
      {
        let queue = Arc::clone(self);
        async_util::run_detached_with_stop(async move { queue.pop_until(deadline).await }, stop, handler);
      }
    }
  };
}

impl_detached_ops!(BoundedQueue);
impl_detached_ops!(GrowableQueue);
