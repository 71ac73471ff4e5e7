// src/timer.rs

//! The deadline timer backing the `_until` operation variants.
//!
//! One lazily-started background thread owns a min-heap of deadline
//! entries and wakes each registered waker when its instant arrives. The
//! [`Sleep`] future double-checks the clock on every poll, so a slightly
//! late timer thread only costs latency, never correctness. Entries for
//! dropped sleeps simply expire unobserved.

use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, OnceLock};
use std::task::{Context, Poll, Waker};
use std::thread;
use std::time::Instant;

use parking_lot::{Condvar, Mutex};

struct TimerEntry {
  deadline: Instant,
  waker: Mutex<Option<Waker>>,
}

struct HeapSlot(Arc<TimerEntry>);

impl PartialEq for HeapSlot {
  fn eq(&self, other: &Self) -> bool {
    self.0.deadline == other.0.deadline
  }
}
impl Eq for HeapSlot {}
impl PartialOrd for HeapSlot {
  fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
    Some(self.cmp(other))
  }
}
impl Ord for HeapSlot {
  // Reversed so the std max-heap pops the earliest deadline first.
  fn cmp(&self, other: &Self) -> CmpOrdering {
    other.0.deadline.cmp(&self.0.deadline)
  }
}

struct TimerShared {
  queue: Mutex<BinaryHeap<HeapSlot>>,
  condvar: Condvar,
}

fn timer() -> &'static TimerShared {
  static SHARED: OnceLock<&'static TimerShared> = OnceLock::new();
  *SHARED.get_or_init(|| {
    let shared: &'static TimerShared = Box::leak(Box::new(TimerShared {
      queue: Mutex::new(BinaryHeap::new()),
      condvar: Condvar::new(),
    }));
    thread::Builder::new()
      .name("weft-timer".into())
      .spawn(move || run_timer(shared))
      .expect("failed to spawn timer thread");
    shared
  })
}

fn run_timer(shared: &'static TimerShared) {
  let mut queue = shared.queue.lock();
  loop {
    let now = Instant::now();

    // Fire everything due, waking outside the queue lock.
    let mut due = Vec::new();
    while queue.peek().is_some_and(|slot| slot.0.deadline <= now) {
      due.push(queue.pop().unwrap());
    }
    if !due.is_empty() {
      drop(queue);
      for slot in due {
        if let Some(waker) = slot.0.waker.lock().take() {
          waker.wake();
        }
      }
      queue = shared.queue.lock();
      continue;
    }

    match queue.peek() {
      Some(slot) => {
        let deadline = slot.0.deadline;
        let _ = shared.condvar.wait_until(&mut queue, deadline);
      }
      None => shared.condvar.wait(&mut queue),
    }
  }
}

fn register(entry: Arc<TimerEntry>) {
  let shared = timer();
  let mut queue = shared.queue.lock();
  let is_next = queue.peek().map_or(true, |slot| entry.deadline < slot.0.deadline);
  queue.push(HeapSlot(entry));
  drop(queue);
  if is_next {
    shared.condvar.notify_one();
  }
}

/// A future that resolves at a fixed instant.
#[must_use = "futures do nothing unless you .await or poll them"]
pub(crate) struct Sleep {
  deadline: Instant,
  entry: Option<Arc<TimerEntry>>,
}

impl Sleep {
  pub(crate) fn until(deadline: Instant) -> Self {
    Sleep { deadline, entry: None }
  }
}

impl Future for Sleep {
  type Output = ();

  fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
    if Instant::now() >= self.deadline {
      return Poll::Ready(());
    }

    match &self.entry {
      Some(entry) => {
        *entry.waker.lock() = Some(cx.waker().clone());
      }
      None => {
        let entry = Arc::new(TimerEntry {
          deadline: self.deadline,
          waker: Mutex::new(Some(cx.waker().clone())),
        });
        register(Arc::clone(&entry));
        self.entry = Some(entry);
      }
    }

    // The thread may have fired between the first check and the waker
    // update; the deadline is the source of truth.
    if Instant::now() >= self.deadline {
      Poll::Ready(())
    } else {
      Poll::Pending
    }
  }
}

impl fmt::Debug for Sleep {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Sleep").field("deadline", &self.deadline).finish()
  }
}
