// src/channel/async_impl.rs

//! Composite channel futures: each queue operation races a wait on the
//! channel's close epoch, so closure drains or fails every pending
//! operation instead of leaving it parked forever.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll};
use std::time::Instant;

use super::ChannelCore;
use crate::error::{ErrorCode, TryPopError};
use crate::mpmc::{self, BoundedQueue};
use crate::notify::{TurnNotifier, WaitRegistration, Waiter};
use crate::timer::Sleep;

/// Resolves once the channel is closed. The waiter rendezvouses on the
/// close epoch exactly like ring waiters rendezvous on a slot turn.
struct CloseWait<'a, T> {
  core: &'a ChannelCore<T>,
  waiter: Waiter,
  armed: bool,
}

impl<'a, T> CloseWait<'a, T> {
  fn new(core: &'a ChannelCore<T>) -> Self {
    CloseWait {
      core,
      waiter: Waiter::new(),
      armed: false,
    }
  }

  /// Polls for closure. Never moves the waiter; callers must treat the
  /// containing struct as pinned.
  fn poll_closed(&mut self, cx: &mut Context<'_>) -> Poll<()> {
    loop {
      if self.armed {
        self.core.close_notify.disarm(&self.waiter);
        self.armed = false;
      }

      if self.core.closed.load(Ordering::Acquire) {
        return Poll::Ready(());
      }

      let epoch_ptr = &self.core.close_epoch as *const AtomicU64;
      let expected_turn = self.core.close_epoch.load(Ordering::Acquire) + 1;
      let registration = WaitRegistration {
        turn_ptr: epoch_ptr,
        expected_turn,
        channel_hint: TurnNotifier::suggest_channel_index(epoch_ptr, expected_turn),
      };
      self.waiter.prepare(&registration, cx.waker().clone());
      if self.core.close_notify.arm(&self.waiter) {
        self.armed = true;
        return Poll::Pending;
      }
      // Arm refused: the epoch advanced, so the flag is already set and the
      // next loop iteration observes it.
    }
  }
}

impl<T> Drop for CloseWait<'_, T> {
  fn drop(&mut self) {
    if self.armed {
      self.core.close_notify.disarm(&self.waiter);
    }
  }
}

// --- PushFuture ---

/// A future that completes once the value is in the channel, or with
/// `ChannelClosed` if the channel closes first. A push never succeeds after
/// closure is observed.
#[must_use = "futures do nothing unless you .await or poll them"]
pub struct PushFuture<'a, T> {
  core: &'a ChannelCore<T>,
  push: mpmc::PushFuture<'a, BoundedQueue<T>, T>,
  close: CloseWait<'a, T>,
}

impl<'a, T> PushFuture<'a, T> {
  pub(crate) fn new(core: &'a ChannelCore<T>, value: T) -> Self {
    PushFuture {
      core,
      push: core.queue.push(value),
      close: CloseWait::new(core),
    }
  }
}

impl<'a, T> Future for PushFuture<'a, T> {
  type Output = Result<(), ErrorCode>;

  fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
    // Safety: structural pinning; no field is moved out.
    let this = unsafe { self.get_unchecked_mut() };

    if this.core.closed.load(Ordering::Acquire) {
      return Poll::Ready(Err(ErrorCode::ChannelClosed));
    }

    let push = unsafe { Pin::new_unchecked(&mut this.push) };
    if let Poll::Ready(result) = push.poll(cx) {
      return Poll::Ready(result);
    }
    if this.close.poll_closed(cx).is_ready() {
      return Poll::Ready(Err(ErrorCode::ChannelClosed));
    }
    Poll::Pending
  }
}

impl<T> fmt::Debug for PushFuture<'_, T> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("PushFuture").finish_non_exhaustive()
  }
}

// --- PopFuture ---

/// A future that completes with a value, or with `ChannelClosed` once the
/// channel is closed *and* drained. Values enqueued before the close are
/// never dropped: losing the race to closure triggers one final drain
/// attempt.
#[must_use = "futures do nothing unless you .await or poll them"]
pub struct PopFuture<'a, T> {
  core: &'a ChannelCore<T>,
  pop: mpmc::PopFuture<'a, BoundedQueue<T>, T>,
  close: CloseWait<'a, T>,
}

impl<'a, T> PopFuture<'a, T> {
  pub(crate) fn new(core: &'a ChannelCore<T>) -> Self {
    PopFuture {
      core,
      pop: core.queue.pop(),
      close: CloseWait::new(core),
    }
  }
}

impl<'a, T> Future for PopFuture<'a, T> {
  type Output = Result<T, ErrorCode>;

  fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
    let this = unsafe { self.get_unchecked_mut() };

    let pop = unsafe { Pin::new_unchecked(&mut this.pop) };
    if let Poll::Ready(result) = pop.poll(cx) {
      return Poll::Ready(result);
    }
    if this.close.poll_closed(cx).is_ready() {
      // Closed while we waited; drain anything published before the close.
      return match this.core.queue.try_pop() {
        Ok(value) => Poll::Ready(Ok(value)),
        Err(TryPopError::Empty) => Poll::Ready(Err(ErrorCode::ChannelClosed)),
        Err(other) => Poll::Ready(Err(other.code())),
      };
    }
    Poll::Pending
  }
}

impl<T> fmt::Debug for PopFuture<'_, T> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("PopFuture").finish_non_exhaustive()
  }
}

// --- Deadline variants ---

/// [`PushFuture`] racing a deadline.
#[must_use = "futures do nothing unless you .await or poll them"]
pub struct PushUntilFuture<'a, T> {
  inner: PushFuture<'a, T>,
  sleep: Sleep,
}

impl<'a, T> PushUntilFuture<'a, T> {
  pub(crate) fn new(core: &'a ChannelCore<T>, value: T, deadline: Instant) -> Self {
    PushUntilFuture {
      inner: PushFuture::new(core, value),
      sleep: Sleep::until(deadline),
    }
  }
}

impl<'a, T> Future for PushUntilFuture<'a, T> {
  type Output = Result<(), ErrorCode>;

  fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
    let this = unsafe { self.get_unchecked_mut() };
    let inner = unsafe { Pin::new_unchecked(&mut this.inner) };
    if let Poll::Ready(result) = inner.poll(cx) {
      return Poll::Ready(result);
    }
    if Pin::new(&mut this.sleep).poll(cx).is_ready() {
      return Poll::Ready(Err(ErrorCode::Timeout));
    }
    Poll::Pending
  }
}

impl<T> fmt::Debug for PushUntilFuture<'_, T> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("PushUntilFuture").finish_non_exhaustive()
  }
}

/// [`PopFuture`] racing a deadline.
#[must_use = "futures do nothing unless you .await or poll them"]
pub struct PopUntilFuture<'a, T> {
  inner: PopFuture<'a, T>,
  sleep: Sleep,
}

impl<'a, T> PopUntilFuture<'a, T> {
  pub(crate) fn new(core: &'a ChannelCore<T>, deadline: Instant) -> Self {
    PopUntilFuture {
      inner: PopFuture::new(core),
      sleep: Sleep::until(deadline),
    }
  }
}

impl<'a, T> Future for PopUntilFuture<'a, T> {
  type Output = Result<T, ErrorCode>;

  fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
    let this = unsafe { self.get_unchecked_mut() };
    let inner = unsafe { Pin::new_unchecked(&mut this.inner) };
    if let Poll::Ready(result) = inner.poll(cx) {
      return Poll::Ready(result);
    }
    if Pin::new(&mut this.sleep).poll(cx).is_ready() {
      return Poll::Ready(Err(ErrorCode::Timeout));
    }
    Poll::Pending
  }
}

impl<T> fmt::Debug for PopUntilFuture<'_, T> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("PopUntilFuture").finish_non_exhaustive()
  }
}

// --- Stream adapter ---

/// A [`futures_core::Stream`] over a receiver; ends when the channel is
/// closed and drained.
#[must_use = "streams do nothing unless polled"]
pub struct RecvStream<'a, T> {
  core: &'a ChannelCore<T>,
  inflight: Option<PopFuture<'a, T>>,
}

impl<'a, T> RecvStream<'a, T> {
  pub(crate) fn new(core: &'a ChannelCore<T>) -> Self {
    RecvStream { core, inflight: None }
  }
}

impl<'a, T> futures_core::Stream for RecvStream<'a, T> {
  type Item = T;

  fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<T>> {
    // Safety: the in-flight future is pinned inside `self` and only ever
    // replaced after completing (dropped in place).
    let this = unsafe { self.get_unchecked_mut() };
    if this.inflight.is_none() {
      this.inflight = Some(PopFuture::new(this.core));
    }
    let future = unsafe { Pin::new_unchecked(this.inflight.as_mut().unwrap()) };
    match future.poll(cx) {
      Poll::Ready(Ok(value)) => {
        this.inflight = None;
        Poll::Ready(Some(value))
      }
      Poll::Ready(Err(_)) => {
        this.inflight = None;
        Poll::Ready(None)
      }
      Poll::Pending => Poll::Pending,
    }
  }
}

impl<T> fmt::Debug for RecvStream<'_, T> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("RecvStream")
      .field("inflight", &self.inflight.is_some())
      .finish_non_exhaustive()
  }
}
