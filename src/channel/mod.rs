// src/channel/mod.rs

//! A closable two-endpoint channel over the bounded ticket ring.
//!
//! [`Channel`] composes a [`BoundedQueue`](crate::mpmc::BoundedQueue) with a
//! dedicated close-notification registry and a close epoch. [`split`]
//! yields cloneable, type-distinct [`Sender`] / [`Receiver`] halves sharing
//! the same state. Closing is one-shot: the winning `close` call bumps the
//! epoch and wakes every party parked on it, so pending pushes fail with
//! `ChannelClosed` while pending pops drain the values published before the
//! close and only then report `ChannelClosed`.
//!
//! [`split`]: Channel::split
//!
//! ```
//! use weft::channel::Channel;
//! use weft::error::TryPopError;
//!
//! let channel = Channel::new(8);
//! let (sender, receiver) = channel.split();
//! sender.try_push(1).unwrap();
//! assert!(sender.close());
//! assert_eq!(receiver.try_pop().unwrap(), 1);
//! assert_eq!(receiver.try_pop(), Err(TryPopError::Closed));
//! ```

mod async_impl;

pub use async_impl::{PopFuture, PopUntilFuture, PushFuture, PushUntilFuture, RecvStream};

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crate::async_util;
use crate::error::{ErrorCode, TryPopError, TryPushError};
use crate::mpmc::BoundedQueue;
use crate::notify::TurnNotifier;
use crate::stop::StopToken;

/// Shared channel state: the ring (which carries the two per-side wait
/// registries), the closure registry, and the close epoch.
pub(crate) struct ChannelCore<T> {
  pub(crate) queue: BoundedQueue<T>,
  pub(crate) close_notify: TurnNotifier,
  pub(crate) close_epoch: AtomicU64,
  pub(crate) closed: AtomicBool,
}

impl<T> ChannelCore<T> {
  fn new(capacity: usize) -> Self {
    ChannelCore {
      queue: BoundedQueue::new(capacity),
      close_notify: TurnNotifier::new(),
      close_epoch: AtomicU64::new(0),
      closed: AtomicBool::new(false),
    }
  }

  fn try_push(&self, value: T) -> Result<(), TryPushError<T>> {
    if self.closed.load(Ordering::Acquire) {
      return Err(TryPushError::Closed(value));
    }
    self.queue.try_push(value)
  }

  fn try_pop(&self) -> Result<T, TryPopError> {
    match self.queue.try_pop() {
      Ok(value) => Ok(value),
      Err(TryPopError::Empty) if self.closed.load(Ordering::Acquire) => Err(TryPopError::Closed),
      Err(other) => Err(other),
    }
  }

  fn close(&self) -> bool {
    if self.closed.swap(true, Ordering::AcqRel) {
      return false;
    }
    let epoch = self.close_epoch.fetch_add(1, Ordering::AcqRel) + 1;
    self.close_notify.notify(&self.close_epoch as *const AtomicU64, epoch);
    true
  }

  fn is_closed(&self) -> bool {
    self.closed.load(Ordering::Acquire)
  }
}

/// A closable MPMC channel handle with both push and pop rights.
pub struct Channel<T> {
  core: Arc<ChannelCore<T>>,
}

/// The push half of a channel. Cloneable; cannot pop.
pub struct Sender<T> {
  core: Arc<ChannelCore<T>>,
}

/// The pop half of a channel. Cloneable; cannot push.
pub struct Receiver<T> {
  core: Arc<ChannelCore<T>>,
}

impl<T> Channel<T> {
  /// Creates a channel over a ring of `capacity` slots.
  ///
  /// # Panics
  /// Panics if `capacity` is zero.
  pub fn new(capacity: usize) -> Self {
    Channel {
      core: Arc::new(ChannelCore::new(capacity)),
    }
  }

  /// Splits off cloneable sender and receiver halves sharing this state.
  pub fn split(&self) -> (Sender<T>, Receiver<T>) {
    (
      Sender {
        core: Arc::clone(&self.core),
      },
      Receiver {
        core: Arc::clone(&self.core),
      },
    )
  }

  /// Attempts to enqueue without blocking; `Closed(value)` after close.
  pub fn try_push(&self, value: T) -> Result<(), TryPushError<T>> {
    self.core.try_push(value)
  }

  /// Attempts to dequeue without blocking; `Closed` once closed and drained.
  pub fn try_pop(&self) -> Result<T, TryPopError> {
    self.core.try_pop()
  }

  /// Closes the channel. Returns true for the winning caller only.
  pub fn close(&self) -> bool {
    self.core.close()
  }

  /// Whether the channel has been closed.
  pub fn is_closed(&self) -> bool {
    self.core.is_closed()
  }

  /// Number of values currently queued, to within concurrent updates.
  pub fn approximate_depth(&self) -> usize {
    self.core.queue.approximate_depth()
  }

  /// The ring capacity this channel was built with.
  pub fn capacity(&self) -> usize {
    self.core.queue.capacity()
  }

  /// Enqueues asynchronously; resolves `ChannelClosed` if the channel
  /// closes first.
  pub fn push(&self, value: T) -> PushFuture<'_, T> {
    PushFuture::new(&self.core, value)
  }

  /// Dequeues asynchronously; resolves `ChannelClosed` only after the
  /// channel is both closed and drained.
  pub fn pop(&self) -> PopFuture<'_, T> {
    PopFuture::new(&self.core)
  }

  /// Like [`push`](Self::push) with a deadline; resolves `Timeout`.
  pub fn push_until(&self, value: T, deadline: Instant) -> PushUntilFuture<'_, T> {
    PushUntilFuture::new(&self.core, value, deadline)
  }

  /// Like [`pop`](Self::pop) with a deadline; resolves `Timeout`.
  pub fn pop_until(&self, deadline: Instant) -> PopUntilFuture<'_, T> {
    PopUntilFuture::new(&self.core, deadline)
  }
}

impl<T: Send + 'static> Channel<T> {
  /// Detached [`push`](Self::push); `handler` runs exactly once.
  pub fn push_detached<F>(&self, value: T, stop: StopToken, handler: F)
  where
    F: FnOnce(Result<(), ErrorCode>) + Send + 'static,
  {
    let core = Arc::clone(&self.core);
    async_util::run_detached_with_stop(
      async move { PushFuture::new(&core, value).await },
      stop,
      handler,
    );
  }

  /// Detached [`pop`](Self::pop); `handler` runs exactly once.
  pub fn pop_detached<F>(&self, stop: StopToken, handler: F)
  where
    F: FnOnce(Result<T, ErrorCode>) + Send + 'static,
  {
    let core = Arc::clone(&self.core);
    async_util::run_detached_with_stop(async move { PopFuture::new(&core).await }, stop, handler);
  }

  /// Detached [`push_until`](Self::push_until).
  pub fn push_until_detached<F>(&self, value: T, deadline: Instant, stop: StopToken, handler: F)
  where
    F: FnOnce(Result<(), ErrorCode>) + Send + 'static,
  {
    let core = Arc::clone(&self.core);
    async_util::run_detached_with_stop(
      async move { PushUntilFuture::new(&core, value, deadline).await },
      stop,
      handler,
    );
  }

  /// Detached [`pop_until`](Self::pop_until).
  pub fn pop_until_detached<F>(&self, deadline: Instant, stop: StopToken, handler: F)
  where
    F: FnOnce(Result<T, ErrorCode>) + Send + 'static,
  {
    let core = Arc::clone(&self.core);
    async_util::run_detached_with_stop(
      async move { PopUntilFuture::new(&core, deadline).await },
      stop,
      handler,
    );
  }
}

impl<T> Sender<T> {
  /// Attempts to enqueue without blocking; `Closed(value)` after close.
  pub fn try_push(&self, value: T) -> Result<(), TryPushError<T>> {
    self.core.try_push(value)
  }

  /// Closes the channel. Returns true for the winning caller only.
  pub fn close(&self) -> bool {
    self.core.close()
  }

  /// Whether the channel has been closed.
  pub fn is_closed(&self) -> bool {
    self.core.is_closed()
  }

  /// Number of values currently queued, to within concurrent updates.
  pub fn approximate_depth(&self) -> usize {
    self.core.queue.approximate_depth()
  }

  /// The ring capacity this channel was built with.
  pub fn capacity(&self) -> usize {
    self.core.queue.capacity()
  }

  /// Enqueues asynchronously.
  pub fn push(&self, value: T) -> PushFuture<'_, T> {
    PushFuture::new(&self.core, value)
  }

  /// Deadline variant of [`push`](Self::push).
  pub fn push_until(&self, value: T, deadline: Instant) -> PushUntilFuture<'_, T> {
    PushUntilFuture::new(&self.core, value, deadline)
  }
}

impl<T: Send + 'static> Sender<T> {
  /// Detached [`push`](Self::push); `handler` runs exactly once.
  pub fn push_detached<F>(&self, value: T, stop: StopToken, handler: F)
  where
    F: FnOnce(Result<(), ErrorCode>) + Send + 'static,
  {
    let core = Arc::clone(&self.core);
    async_util::run_detached_with_stop(
      async move { PushFuture::new(&core, value).await },
      stop,
      handler,
    );
  }

  /// Detached [`push_until`](Self::push_until).
  pub fn push_until_detached<F>(&self, value: T, deadline: Instant, stop: StopToken, handler: F)
  where
    F: FnOnce(Result<(), ErrorCode>) + Send + 'static,
  {
    let core = Arc::clone(&self.core);
    async_util::run_detached_with_stop(
      async move { PushUntilFuture::new(&core, value, deadline).await },
      stop,
      handler,
    );
  }
}

impl<T> Receiver<T> {
  /// Attempts to dequeue without blocking; `Closed` once closed and drained.
  pub fn try_pop(&self) -> Result<T, TryPopError> {
    self.core.try_pop()
  }

  /// Closes the channel. Returns true for the winning caller only.
  pub fn close(&self) -> bool {
    self.core.close()
  }

  /// Whether the channel has been closed.
  pub fn is_closed(&self) -> bool {
    self.core.is_closed()
  }

  /// Number of values currently queued, to within concurrent updates.
  pub fn approximate_depth(&self) -> usize {
    self.core.queue.approximate_depth()
  }

  /// The ring capacity this channel was built with.
  pub fn capacity(&self) -> usize {
    self.core.queue.capacity()
  }

  /// Dequeues asynchronously.
  pub fn pop(&self) -> PopFuture<'_, T> {
    PopFuture::new(&self.core)
  }

  /// Deadline variant of [`pop`](Self::pop).
  pub fn pop_until(&self, deadline: Instant) -> PopUntilFuture<'_, T> {
    PopUntilFuture::new(&self.core, deadline)
  }

  /// A stream of values; ends when the channel is closed and drained.
  pub fn stream(&self) -> RecvStream<'_, T> {
    RecvStream::new(&self.core)
  }
}

impl<T: Send + 'static> Receiver<T> {
  /// Detached [`pop`](Self::pop); `handler` runs exactly once.
  pub fn pop_detached<F>(&self, stop: StopToken, handler: F)
  where
    F: FnOnce(Result<T, ErrorCode>) + Send + 'static,
  {
    let core = Arc::clone(&self.core);
    async_util::run_detached_with_stop(async move { PopFuture::new(&core).await }, stop, handler);
  }

  /// Detached [`pop_until`](Self::pop_until).
  pub fn pop_until_detached<F>(&self, deadline: Instant, stop: StopToken, handler: F)
  where
    F: FnOnce(Result<T, ErrorCode>) + Send + 'static,
  {
    let core = Arc::clone(&self.core);
    async_util::run_detached_with_stop(
      async move { PopUntilFuture::new(&core, deadline).await },
      stop,
      handler,
    );
  }
}

impl<T> Clone for Channel<T> {
  fn clone(&self) -> Self {
    Channel {
      core: Arc::clone(&self.core),
    }
  }
}

impl<T> Clone for Sender<T> {
  fn clone(&self) -> Self {
    Sender {
      core: Arc::clone(&self.core),
    }
  }
}

impl<T> Clone for Receiver<T> {
  fn clone(&self) -> Self {
    Receiver {
      core: Arc::clone(&self.core),
    }
  }
}

impl<T> fmt::Debug for Channel<T> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Channel")
      .field("capacity", &self.capacity())
      .field("closed", &self.is_closed())
      .finish_non_exhaustive()
  }
}

impl<T> fmt::Debug for Sender<T> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Sender")
      .field("capacity", &self.capacity())
      .field("closed", &self.is_closed())
      .finish_non_exhaustive()
  }
}

impl<T> fmt::Debug for Receiver<T> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Receiver")
      .field("capacity", &self.capacity())
      .field("closed", &self.is_closed())
      .finish_non_exhaustive()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  #[should_panic]
  fn zero_capacity_is_a_contract_breach() {
    let _ = Channel::<u32>::new(0);
  }

  #[test]
  fn close_is_one_shot() {
    let channel = Channel::<u32>::new(2);
    assert!(!channel.is_closed());
    assert!(channel.close());
    assert!(!channel.close());
    assert!(channel.is_closed());
  }

  #[test]
  fn push_fails_after_close() {
    let channel = Channel::new(2);
    channel.try_push(1).unwrap();
    assert!(channel.close());
    match channel.try_push(2) {
      Err(TryPushError::Closed(value)) => assert_eq!(value, 2),
      other => panic!("expected Closed, got {:?}", other),
    }
  }

  #[test]
  fn pop_drains_before_reporting_closed() {
    let channel = Channel::new(8);
    channel.try_push(31).unwrap();
    channel.try_push(32).unwrap();
    assert!(channel.close());

    assert_eq!(channel.try_pop().unwrap(), 31);
    assert_eq!(channel.try_pop().unwrap(), 32);
    assert_eq!(channel.try_pop(), Err(TryPopError::Closed));
  }

  #[test]
  fn split_halves_share_state() {
    let channel = Channel::new(4);
    let (sender, receiver) = channel.split();
    let sender2 = sender.clone();

    sender.try_push(10).unwrap();
    sender2.try_push(11).unwrap();
    assert_eq!(receiver.approximate_depth(), 2);
    assert_eq!(receiver.try_pop().unwrap(), 10);

    assert!(receiver.close());
    assert!(sender.is_closed());
    assert!(matches!(sender.try_push(12), Err(TryPushError::Closed(_))));
    assert_eq!(receiver.try_pop().unwrap(), 11);
    assert_eq!(receiver.try_pop(), Err(TryPopError::Closed));
  }

  #[test]
  fn empty_unclosed_pop_reports_empty() {
    let channel = Channel::<u32>::new(1);
    assert_eq!(channel.try_pop(), Err(TryPopError::Empty));
  }
}
