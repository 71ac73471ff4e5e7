// src/async_util.rs

//! Utilities for asynchronous operations, wakers, and detached execution.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::Context;

use futures_util::future::{select, Either};
use futures_util::pin_mut;
use futures_util::task::{waker_ref, ArcWake};
use parking_lot::Mutex;

use crate::error::ErrorCode;
use crate::stop::StopToken;

/// A detached task polled in place whenever its waker fires.
///
/// The `scheduled`/`running` pair serialises the poll loop: exactly one
/// waker invocation drives the future at a time, and a wake that lands
/// mid-poll is recorded and replayed instead of re-entering.
struct DetachedTask<F> {
  future: Mutex<Option<F>>,
  scheduled: AtomicBool,
  running: AtomicBool,
}

impl<F> DetachedTask<F>
where
  F: Future<Output = ()> + Send + 'static,
{
  fn run(self: &Arc<Self>) {
    self.scheduled.store(true, Ordering::Release);
    if self.running.swap(true, Ordering::AcqRel) {
      // Another wake is driving the loop; it will observe `scheduled`.
      return;
    }

    loop {
      self.scheduled.store(false, Ordering::Release);
      {
        let waker = waker_ref(self);
        let mut cx = Context::from_waker(&waker);
        let mut slot = self.future.lock();
        if let Some(future) = slot.as_mut() {
          // Safety: the future is heap-pinned inside the Arc'd slot and is
          // only ever dropped in place.
          let pinned = unsafe { Pin::new_unchecked(future) };
          if pinned.poll(&mut cx).is_ready() {
            *slot = None;
          }
        }
      }

      self.running.store(false, Ordering::Release);
      if !self.scheduled.load(Ordering::Acquire) || self.running.swap(true, Ordering::AcqRel) {
        return;
      }
    }
  }
}

impl<F> ArcWake for DetachedTask<F>
where
  F: Future<Output = ()> + Send + 'static,
{
  fn wake_by_ref(arc_self: &Arc<Self>) {
    arc_self.run();
  }
}

/// Polls `future` to completion without an executor; progress is driven by
/// whichever thread fires the task's waker.
pub(crate) fn spawn_detached<F>(future: F)
where
  F: Future<Output = ()> + Send + 'static,
{
  let task = Arc::new(DetachedTask {
    future: Mutex::new(Some(future)),
    scheduled: AtomicBool::new(false),
    running: AtomicBool::new(false),
  });
  task.run();
}

/// Drives `operation` detached, racing it against `stop`, and hands the
/// outcome to `handler` exactly once. A stop that wins the race — or that
/// is observed after a successful completion — reports `Canceled`.
pub(crate) fn run_detached_with_stop<F, R, H>(operation: F, stop: StopToken, handler: H)
where
  F: Future<Output = Result<R, ErrorCode>> + Send + 'static,
  R: Send + 'static,
  H: FnOnce(Result<R, ErrorCode>) + Send + 'static,
{
  if stop.stop_requested() {
    handler(Err(ErrorCode::Canceled));
    return;
  }

  spawn_detached(async move {
    let stopped = stop.stopped();
    pin_mut!(operation);
    pin_mut!(stopped);

    let result = match select(operation, stopped).await {
      Either::Left((result, _)) => result,
      Either::Right(((), _)) => Err(ErrorCode::Canceled),
    };
    let result = if stop.stop_requested() && result.is_ok() {
      Err(ErrorCode::Canceled)
    } else {
      result
    };
    handler(result);
  });
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::atomic::AtomicUsize;

  #[test]
  fn detached_task_completes_synchronously_when_ready() {
    let count = Arc::new(AtomicUsize::new(0));
    let observed = Arc::clone(&count);
    spawn_detached(async move {
      observed.fetch_add(1, Ordering::SeqCst);
    });
    assert_eq!(count.load(Ordering::SeqCst), 1);
  }

  #[test]
  fn pre_stopped_token_short_circuits() {
    let source = crate::stop::StopSource::new();
    source.request_stop();

    let outcome = Arc::new(Mutex::new(None));
    let observed = Arc::clone(&outcome);
    run_detached_with_stop(
      async move { Ok::<_, ErrorCode>(5u32) },
      source.token(),
      move |result| {
        *observed.lock() = Some(result);
      },
    );
    assert_eq!(*outcome.lock(), Some(Err(ErrorCode::Canceled)));
  }
}
