// src/stop.rs

//! Cooperative stop signalling for detached operations.
//!
//! A [`StopSource`] owns the signal; any number of [`StopToken`] clones
//! observe it. Detached callback operations take a token and resolve
//! `Canceled` once a stop is requested. The signal is one-way and sticky.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll, Waker};

use parking_lot::Mutex;

struct StopInner {
  stopped: AtomicBool,
  // Waker slots for pending `Stopped` futures; index-stable so a future can
  // replace its own waker on re-poll.
  wakers: Mutex<Vec<Option<Waker>>>,
}

/// Owner of a stop signal.
pub struct StopSource {
  inner: Arc<StopInner>,
}

/// Observer handle for a stop signal. Cheap to clone; a default-constructed
/// token never fires.
#[derive(Clone, Default)]
pub struct StopToken {
  inner: Option<Arc<StopInner>>,
}

impl StopSource {
  /// Creates a fresh, un-stopped source.
  pub fn new() -> Self {
    StopSource {
      inner: Arc::new(StopInner {
        stopped: AtomicBool::new(false),
        wakers: Mutex::new(Vec::new()),
      }),
    }
  }

  /// Hands out a token observing this source.
  pub fn token(&self) -> StopToken {
    StopToken {
      inner: Some(Arc::clone(&self.inner)),
    }
  }

  /// Requests a stop. Returns true for the first caller; wakes every
  /// pending [`Stopped`] future.
  pub fn request_stop(&self) -> bool {
    if self.inner.stopped.swap(true, Ordering::AcqRel) {
      return false;
    }
    let mut wakers = self.inner.wakers.lock();
    for slot in wakers.iter_mut() {
      if let Some(waker) = slot.take() {
        waker.wake();
      }
    }
    true
  }

  /// Whether a stop has been requested.
  pub fn stop_requested(&self) -> bool {
    self.inner.stopped.load(Ordering::Acquire)
  }
}

impl Default for StopSource {
  fn default() -> Self {
    Self::new()
  }
}

impl StopToken {
  /// A token that never observes a stop.
  pub fn never() -> Self {
    StopToken { inner: None }
  }

  /// Whether a stop has been requested on the owning source.
  pub fn stop_requested(&self) -> bool {
    match &self.inner {
      Some(inner) => inner.stopped.load(Ordering::Acquire),
      None => false,
    }
  }

  /// A future resolving once a stop is requested. Pends forever on a
  /// never-token.
  pub fn stopped(&self) -> Stopped {
    Stopped {
      inner: self.inner.clone(),
      slot: None,
    }
  }
}

/// Future returned by [`StopToken::stopped`].
#[must_use = "futures do nothing unless you .await or poll them"]
pub struct Stopped {
  inner: Option<Arc<StopInner>>,
  slot: Option<usize>,
}

impl Future for Stopped {
  type Output = ();

  fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
    let Some(inner) = self.inner.clone() else {
      return Poll::Pending;
    };
    if inner.stopped.load(Ordering::Acquire) {
      return Poll::Ready(());
    }

    let mut wakers = inner.wakers.lock();
    // Re-check under the lock so a racing request_stop cannot slip between
    // the check and the registration.
    if inner.stopped.load(Ordering::Acquire) {
      return Poll::Ready(());
    }
    match self.slot {
      Some(index) => wakers[index] = Some(cx.waker().clone()),
      None => {
        let index = match wakers.iter().position(|slot| slot.is_none()) {
          Some(free) => free,
          None => {
            wakers.push(None);
            wakers.len() - 1
          }
        };
        wakers[index] = Some(cx.waker().clone());
        drop(wakers);
        self.slot = Some(index);
      }
    }
    Poll::Pending
  }
}

impl Drop for Stopped {
  fn drop(&mut self) {
    if let (Some(inner), Some(index)) = (&self.inner, self.slot) {
      inner.wakers.lock()[index] = None;
    }
  }
}

impl fmt::Debug for StopSource {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("StopSource")
      .field("stop_requested", &self.stop_requested())
      .finish()
  }
}

impl fmt::Debug for StopToken {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("StopToken")
      .field("stop_requested", &self.stop_requested())
      .finish()
  }
}

impl fmt::Debug for Stopped {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Stopped").finish_non_exhaustive()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn first_request_wins() {
    let source = StopSource::new();
    let token = source.token();
    assert!(!token.stop_requested());
    assert!(source.request_stop());
    assert!(!source.request_stop());
    assert!(token.stop_requested());
  }

  #[test]
  fn never_token_never_fires() {
    let token = StopToken::never();
    assert!(!token.stop_requested());
    let cloned = token.clone();
    assert!(!cloned.stop_requested());
  }

  #[test]
  fn tokens_share_the_source() {
    let source = StopSource::new();
    let a = source.token();
    let b = a.clone();
    source.request_stop();
    assert!(a.stop_requested());
    assert!(b.stop_requested());
  }
}
