// src/mpmc/async_impl.rs

//! The future-based operation state machine shared by both ring variants.
//!
//! Every async operation runs the same loop: a bounded burst of
//! non-blocking attempts, then a wait registration derived from a fresh
//! ticket snapshot, then an `arm` on the owning registry. A refused arm
//! means the ring moved past the expected turn in the meantime, so the loop
//! re-enters the attempt phase. The waiter lives inside the future, which
//! is therefore `!Unpin`; dropping the future disarms, and disarm is the
//! barrier that makes the waiter memory reclaimable. Cancellation is
//! dropping the future.

use std::fmt;
use std::future::Future;
use std::marker::{PhantomData, PhantomPinned};
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Instant;

use crate::error::{ErrorCode, TryPopError, TryPushError};
use crate::notify::{TurnNotifier, WaitRegistration, Waiter};
use crate::sync_util::spin_pause;
use crate::timer::Sleep;

/// Non-blocking attempts before an operation arms its waiter.
const SPIN_ATTEMPTS: u32 = 64;

/// The ring surface the operation state machine drives. Implemented by both
/// queue variants; sealed, with no stable surface of its own.
pub trait RingOps<T>: private::Sealed {
  #[doc(hidden)]
  fn ring_try_push(&self, value: T) -> Result<(), TryPushError<T>>;
  #[doc(hidden)]
  fn ring_try_pop(&self) -> Result<T, TryPopError>;
  #[doc(hidden)]
  fn push_registration(&self) -> WaitRegistration;
  #[doc(hidden)]
  fn pop_registration(&self) -> WaitRegistration;
  #[doc(hidden)]
  fn push_notify(&self) -> &TurnNotifier;
  #[doc(hidden)]
  fn pop_notify(&self) -> &TurnNotifier;
}

mod private {
  pub trait Sealed {}
  impl<T> Sealed for crate::mpmc::BoundedQueue<T> {}
  impl<T> Sealed for crate::mpmc::GrowableQueue<T> {}
}

// --- PushFuture ---

/// A future that completes once the value has been published into the ring.
#[must_use = "futures do nothing unless you .await or poll them"]
pub struct PushFuture<'a, Q: RingOps<T>, T> {
  queue: &'a Q,
  value: Option<T>,
  waiter: Waiter,
  armed: bool,
  _pin: PhantomPinned,
}

impl<'a, Q: RingOps<T>, T> PushFuture<'a, Q, T> {
  pub(crate) fn new(queue: &'a Q, value: T) -> Self {
    PushFuture {
      queue,
      value: Some(value),
      waiter: Waiter::new(),
      armed: false,
      _pin: PhantomPinned,
    }
  }
}

impl<'a, Q: RingOps<T>, T> Future for PushFuture<'a, Q, T> {
  type Output = Result<(), ErrorCode>;

  fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
    // Safety: we never move out of `self`; the waiter stays in place.
    let this = unsafe { self.get_unchecked_mut() };

    loop {
      if this.armed {
        // A wake (or a spurious poll) while armed: disarm first so the
        // waiter can be re-keyed from a fresh ticket snapshot.
        this.queue.push_notify().disarm(&this.waiter);
        this.armed = false;
      }

      // Attempt phase.
      let mut attempts = 0;
      loop {
        let value = match this.value.take() {
          Some(value) => value,
          None => return Poll::Ready(Ok(())), // polled again after completion
        };
        match this.queue.ring_try_push(value) {
          Ok(()) => return Poll::Ready(Ok(())),
          Err(TryPushError::Full(value)) => this.value = Some(value),
          Err(other) => return Poll::Ready(Err(other.code())),
        }
        attempts += 1;
        if attempts >= SPIN_ATTEMPTS {
          break;
        }
        spin_pause();
      }

      // Arm phase. The waker is stored in the waiter before it is linked,
      // so a publisher claiming us immediately still has a waker to fire.
      let registration = this.queue.push_registration();
      this.waiter.prepare(&registration, cx.waker().clone());
      if this.queue.push_notify().arm(&this.waiter) {
        this.armed = true;
        return Poll::Pending;
      }
      // The turn was reached between the attempts and the arm; retry.
    }
  }
}

impl<'a, Q: RingOps<T>, T> Drop for PushFuture<'a, Q, T> {
  fn drop(&mut self) {
    if self.armed {
      self.queue.push_notify().disarm(&self.waiter);
    }
  }
}

impl<'a, Q: RingOps<T>, T> fmt::Debug for PushFuture<'a, Q, T> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("PushFuture").field("armed", &self.armed).finish_non_exhaustive()
  }
}

// --- PopFuture ---

/// A future that completes with a value taken from the ring.
#[must_use = "futures do nothing unless you .await or poll them"]
pub struct PopFuture<'a, Q: RingOps<T>, T> {
  queue: &'a Q,
  waiter: Waiter,
  armed: bool,
  _pin: PhantomPinned,
  _value: PhantomData<fn() -> T>,
}

impl<'a, Q: RingOps<T>, T> PopFuture<'a, Q, T> {
  pub(crate) fn new(queue: &'a Q) -> Self {
    PopFuture {
      queue,
      waiter: Waiter::new(),
      armed: false,
      _pin: PhantomPinned,
      _value: PhantomData,
    }
  }
}

impl<'a, Q: RingOps<T>, T> Future for PopFuture<'a, Q, T> {
  type Output = Result<T, ErrorCode>;

  fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
    let this = unsafe { self.get_unchecked_mut() };

    loop {
      if this.armed {
        this.queue.pop_notify().disarm(&this.waiter);
        this.armed = false;
      }

      let mut attempts = 0;
      loop {
        match this.queue.ring_try_pop() {
          Ok(value) => return Poll::Ready(Ok(value)),
          Err(TryPopError::Empty) => {}
          Err(other) => return Poll::Ready(Err(other.code())),
        }
        attempts += 1;
        if attempts >= SPIN_ATTEMPTS {
          break;
        }
        spin_pause();
      }

      let registration = this.queue.pop_registration();
      this.waiter.prepare(&registration, cx.waker().clone());
      if this.queue.pop_notify().arm(&this.waiter) {
        this.armed = true;
        return Poll::Pending;
      }
    }
  }
}

impl<'a, Q: RingOps<T>, T> Drop for PopFuture<'a, Q, T> {
  fn drop(&mut self) {
    if self.armed {
      self.queue.pop_notify().disarm(&self.waiter);
    }
  }
}

impl<'a, Q: RingOps<T>, T> fmt::Debug for PopFuture<'a, Q, T> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("PopFuture").field("armed", &self.armed).finish_non_exhaustive()
  }
}

// --- Deadline variants ---

/// [`PushFuture`] racing a deadline; resolves `Err(Timeout)` if the
/// deadline arrives first.
#[must_use = "futures do nothing unless you .await or poll them"]
pub struct PushUntilFuture<'a, Q: RingOps<T>, T> {
  inner: PushFuture<'a, Q, T>,
  sleep: Sleep,
}

impl<'a, Q: RingOps<T>, T> PushUntilFuture<'a, Q, T> {
  pub(crate) fn new(queue: &'a Q, value: T, deadline: Instant) -> Self {
    PushUntilFuture {
      inner: PushFuture::new(queue, value),
      sleep: Sleep::until(deadline),
    }
  }
}

impl<'a, Q: RingOps<T>, T> Future for PushUntilFuture<'a, Q, T> {
  type Output = Result<(), ErrorCode>;

  fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
    // Safety: structural pinning of `inner`; `sleep` is Unpin.
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

impl<'a, Q: RingOps<T>, T> fmt::Debug for PushUntilFuture<'a, Q, T> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("PushUntilFuture").finish_non_exhaustive()
  }
}

/// [`PopFuture`] racing a deadline; resolves `Err(Timeout)` if the deadline
/// arrives first.
#[must_use = "futures do nothing unless you .await or poll them"]
pub struct PopUntilFuture<'a, Q: RingOps<T>, T> {
  inner: PopFuture<'a, Q, T>,
  sleep: Sleep,
}

impl<'a, Q: RingOps<T>, T> PopUntilFuture<'a, Q, T> {
  pub(crate) fn new(queue: &'a Q, deadline: Instant) -> Self {
    PopUntilFuture {
      inner: PopFuture::new(queue),
      sleep: Sleep::until(deadline),
    }
  }
}

impl<'a, Q: RingOps<T>, T> Future for PopUntilFuture<'a, Q, T> {
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

impl<'a, Q: RingOps<T>, T> fmt::Debug for PopUntilFuture<'a, Q, T> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("PopUntilFuture").finish_non_exhaustive()
  }
}
