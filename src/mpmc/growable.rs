// src/mpmc/growable.rs

//! The capped-growth ticket-ring queue.
//!
//! Growth swaps in a larger ring under a seqlock while readers keep running
//! against a consistent snapshot. Tickets issued against a retired ring keep
//! working: the retired ring is recorded in a bounded closed list together
//! with the ticket offset at which it was retired, and reads relocate
//! themselves there when their ticket predates the active ring. Retired
//! rings are only freed when the queue is dropped, so any in-flight
//! operation that completes before the queue does is safe; every future this
//! crate hands out borrows the queue, which enforces exactly that.

use std::cell::UnsafeCell;
use std::fmt;
use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicU64, AtomicUsize, Ordering};

use super::async_impl::{PopFuture, PopUntilFuture, PushFuture, PushUntilFuture, RingOps};
use super::core::{self, Slot};
use crate::error::{TryPopError, TryPushError};
use crate::internal::cache_padded::CachePadded;
use crate::notify::{TurnNotifier, WaitRegistration};
use crate::sync_util::spin_pause;
use std::time::Instant;

/// Growth configuration for [`GrowableQueue`].
///
/// A `max_capacity` of zero disables growth beyond the initial capacity;
/// otherwise the effective maximum is never below the initial capacity.
/// Growth factors below 2 are raised to 2.
#[derive(Debug, Clone, Copy)]
pub struct GrowthOptions {
  /// Upper bound the ring may grow to.
  pub max_capacity: usize,
  /// Multiplier applied at each growth step.
  pub growth_factor: usize,
}

impl Default for GrowthOptions {
  fn default() -> Self {
    GrowthOptions {
      max_capacity: 0,
      growth_factor: 2,
    }
  }
}

// The low byte of the state word: a seqlock bit plus the closed-ring count.
const SEQLOCK_BITS: u32 = 8;
const SEQLOCK_MASK: u64 = (1 << SEQLOCK_BITS) - 1;

/// A retired ring plus the ticket offset at which it was retired. Published
/// by the release store of the state word; immutable afterwards.
struct ClosedRing<T> {
  offset: u64,
  slots: *mut Slot<T>,
  capacity: usize,
  stride: u64,
}

/// A consistent view of one ring, produced by a seqlock read.
#[derive(Clone, Copy)]
struct RingView<T> {
  slots: *mut Slot<T>,
  capacity: usize,
  stride: u64,
}

/// A lock-free MPMC queue that expands its ring up to a fixed maximum.
///
/// Semantics match [`BoundedQueue`](super::BoundedQueue), except a producer
/// that finds the active ring full (and was not racing a ticket update)
/// grows the ring instead of failing, until `max_capacity` is reached.
pub struct GrowableQueue<T> {
  max_capacity: usize,
  growth_factor: usize,
  max_closed_rings: usize,
  closed_rings: Box<[UnsafeCell<ClosedRing<T>>]>,

  active_slots: AtomicPtr<Slot<T>>,
  active_capacity: AtomicUsize,
  active_stride: AtomicU64,
  // ticket_offset << 8 | closed_count << 1 | seqlock bit.
  state: AtomicU64,

  push_ticket: CachePadded<AtomicU64>,
  pop_ticket: CachePadded<AtomicU64>,
  pub(crate) push_notify: TurnNotifier,
  pub(crate) pop_notify: TurnNotifier,
}

// Safety: as for BoundedQueue; additionally the ring-swap tuple is guarded
// by the seqlock and closed entries are immutable once published.
unsafe impl<T: Send> Send for GrowableQueue<T> {}
unsafe impl<T: Send> Sync for GrowableQueue<T> {}

impl<T> GrowableQueue<T> {
  /// Creates a queue that starts at `initial_capacity` and may grow by
  /// `growth_factor` steps up to `max_capacity`.
  ///
  /// # Panics
  /// Panics if `initial_capacity` is zero.
  pub fn new(initial_capacity: usize, max_capacity: usize, growth_factor: usize) -> Self {
    Self::with_options(
      initial_capacity,
      GrowthOptions {
        max_capacity,
        growth_factor,
      },
    )
  }

  /// Creates a queue from explicit [`GrowthOptions`].
  ///
  /// # Panics
  /// Panics if `initial_capacity` is zero.
  pub fn with_options(initial_capacity: usize, options: GrowthOptions) -> Self {
    assert!(initial_capacity > 0, "GrowableQueue capacity must be greater than 0");

    let max_capacity = resolve_max_capacity(initial_capacity, options.max_capacity);
    let growth_factor = options.growth_factor.max(2);
    let max_closed_rings = compute_max_closed_rings(initial_capacity, max_capacity, growth_factor);

    let closed_rings = (0..max_closed_rings)
      .map(|_| {
        UnsafeCell::new(ClosedRing {
          offset: 0,
          slots: ptr::null_mut(),
          capacity: 0,
          stride: 1,
        })
      })
      .collect::<Box<[_]>>();

    GrowableQueue {
      max_capacity,
      growth_factor,
      max_closed_rings,
      closed_rings,
      active_slots: AtomicPtr::new(allocate_ring::<T>(initial_capacity)),
      active_capacity: AtomicUsize::new(initial_capacity),
      active_stride: AtomicU64::new(core::compute_stride(initial_capacity)),
      state: AtomicU64::new(0),
      push_ticket: CachePadded::new(AtomicU64::new(0)),
      pop_ticket: CachePadded::new(AtomicU64::new(0)),
      push_notify: TurnNotifier::new(),
      pop_notify: TurnNotifier::new(),
    }
  }

  /// Attempts to enqueue without blocking, growing the ring if the active
  /// one is full and the maximum has not been reached.
  pub fn try_push(&self, value: T) -> Result<(), TryPushError<T>> {
    if self.approximate_depth() >= self.max_capacity {
      return Err(TryPushError::Full(value));
    }

    loop {
      let ticket = self.push_ticket.load(Ordering::Relaxed);

      let Some((state, mut view)) = self.seqlock_read() else {
        spin_pause();
        continue;
      };

      let offset = self.relocate_for_ticket(state, ticket, &mut view);
      let local_ticket = ticket - offset;
      let slot = unsafe { &*view.slots.add(core::slot_index::<T>(local_ticket, view.capacity, view.stride)) };
      let expected_turn = core::producer_turn(local_ticket, view.capacity);

      if slot.turn().load(Ordering::Acquire) == expected_turn {
        if self
          .push_ticket
          .compare_exchange(ticket, ticket + 1, Ordering::Relaxed, Ordering::Relaxed)
          .is_err()
        {
          continue;
        }

        unsafe { slot.write(value) };
        let publish_turn = expected_turn + 1;
        slot.turn().store(publish_turn, Ordering::Release);
        self.pop_notify.notify(slot.turn() as *const AtomicU64, publish_turn);
        return Ok(());
      }

      if ticket != self.push_ticket.load(Ordering::Relaxed) {
        continue;
      }

      // The ring really is full for our ticket. Growing only makes sense
      // when the ticket was issued against the active ring.
      if offset == (state >> SEQLOCK_BITS) && self.try_expand(state, view.capacity) {
        continue;
      }
      return Err(TryPushError::Full(value));
    }
  }

  /// Attempts to dequeue without blocking.
  pub fn try_pop(&self) -> Result<T, TryPopError> {
    loop {
      let ticket = self.pop_ticket.load(Ordering::Relaxed);

      let Some((state, mut view)) = self.seqlock_read() else {
        spin_pause();
        continue;
      };

      let offset = self.relocate_for_ticket(state, ticket, &mut view);
      let local_ticket = ticket - offset;
      let slot = unsafe { &*view.slots.add(core::slot_index::<T>(local_ticket, view.capacity, view.stride)) };
      let expected_turn = core::consumer_turn(local_ticket, view.capacity);

      if slot.turn().load(Ordering::Acquire) != expected_turn {
        return Err(TryPopError::Empty);
      }

      if self
        .pop_ticket
        .compare_exchange(ticket, ticket + 1, Ordering::Relaxed, Ordering::Relaxed)
        .is_err()
      {
        continue;
      }

      let value = unsafe { slot.read() };
      let publish_turn = expected_turn + 1;
      slot.turn().store(publish_turn, Ordering::Release);
      self.push_notify.notify(slot.turn() as *const AtomicU64, publish_turn);
      return Ok(value);
    }
  }

  /// Enqueues asynchronously.
  pub fn push(&self, value: T) -> PushFuture<'_, Self, T> {
    PushFuture::new(self, value)
  }

  /// Dequeues asynchronously.
  pub fn pop(&self) -> PopFuture<'_, Self, T> {
    PopFuture::new(self)
  }

  /// Like [`push`](Self::push), but resolves `Timeout` at `deadline`.
  pub fn push_until(&self, value: T, deadline: Instant) -> PushUntilFuture<'_, Self, T> {
    PushUntilFuture::new(self, value, deadline)
  }

  /// Like [`pop`](Self::pop), but resolves `Timeout` at `deadline`.
  pub fn pop_until(&self, deadline: Instant) -> PopUntilFuture<'_, Self, T> {
    PopUntilFuture::new(self, deadline)
  }

  /// Conservative emptiness probe.
  pub fn is_empty(&self) -> bool {
    self.push_count() == self.pop_count()
  }

  /// Conservative fullness probe against the growth ceiling.
  pub fn is_full(&self) -> bool {
    self.approximate_depth() >= self.max_capacity
  }

  /// Signed depth guess.
  pub fn size_guess(&self) -> i64 {
    self.push_count() as i64 - self.pop_count() as i64
  }

  /// Number of values currently queued, to within concurrent updates.
  pub fn approximate_depth(&self) -> usize {
    (self.push_count().wrapping_sub(self.pop_count())) as usize
  }

  /// Total successful pushes ever claimed.
  pub fn push_count(&self) -> u64 {
    self.push_ticket.load(Ordering::Relaxed)
  }

  /// Total successful pops ever claimed.
  pub fn pop_count(&self) -> u64 {
    self.pop_ticket.load(Ordering::Relaxed)
  }

  /// Capacity of the currently active ring.
  pub fn capacity(&self) -> usize {
    self.active_capacity.load(Ordering::Relaxed)
  }

  /// The growth ceiling.
  pub fn max_capacity(&self) -> usize {
    self.max_capacity
  }

  /// Capacity of the currently active ring.
  pub fn allocated_capacity(&self) -> usize {
    self.active_capacity.load(Ordering::Relaxed)
  }

  /// Always true for this variant.
  pub fn dynamic_growth_enabled(&self) -> bool {
    true
  }

  fn seqlock_read(&self) -> Option<(u64, RingView<T>)> {
    let state = self.state.load(Ordering::Acquire);
    if state & 1 != 0 {
      return None;
    }

    let view = RingView {
      slots: self.active_slots.load(Ordering::Relaxed),
      capacity: self.active_capacity.load(Ordering::Relaxed),
      stride: self.active_stride.load(Ordering::Relaxed),
    };

    std::sync::atomic::fence(Ordering::Acquire);
    if state == self.state.load(Ordering::Relaxed) {
      Some((state, view))
    } else {
      None
    }
  }

  /// Translates `ticket` into the ring it was issued against. Tickets below
  /// the active offset belong to a retired ring; the closed list is scanned
  /// newest to oldest for the ring whose offset covers the ticket.
  fn relocate_for_ticket(&self, state: u64, ticket: u64, view: &mut RingView<T>) -> u64 {
    let offset = state >> SEQLOCK_BITS;
    if ticket >= offset {
      return offset;
    }

    let closed_count = ((state & SEQLOCK_MASK) >> 1) as usize;
    for index in (0..closed_count).rev() {
      let closed = unsafe { &*self.closed_rings[index].get() };
      if closed.offset <= ticket {
        view.slots = closed.slots;
        view.capacity = closed.capacity;
        view.stride = closed.stride;
        return closed.offset;
      }
    }

    unreachable!("ticket predates every recorded ring");
  }

  /// Attempts one growth step. Returns true when the caller should retry
  /// its ring operation (either we grew, or another thread holds the
  /// seqlock); false when the ring cannot grow further.
  fn try_expand(&self, state: u64, capacity: usize) -> bool {
    if capacity >= self.max_capacity {
      return false;
    }

    if self
      .state
      .compare_exchange(state, state + 1, Ordering::AcqRel, Ordering::Relaxed)
      .is_err()
    {
      // Another thread is expanding; let the caller re-read.
      return true;
    }

    let expanded_capacity = self.next_capacity(capacity);
    if expanded_capacity <= capacity {
      self.state.store(state, Ordering::Release);
      return false;
    }

    let closed_index = ((state & SEQLOCK_MASK) >> 1) as usize;
    if closed_index >= self.max_closed_rings {
      self.state.store(state, Ordering::Release);
      return false;
    }

    let new_slots = allocate_ring::<T>(expanded_capacity);

    // Tickets at or below the current extremes stay on the retiring ring.
    let ticket_offset = 1
      + self
        .push_ticket
        .load(Ordering::Relaxed)
        .max(self.pop_ticket.load(Ordering::Relaxed));

    unsafe {
      *self.closed_rings[closed_index].get() = ClosedRing {
        offset: state >> SEQLOCK_BITS,
        slots: self.active_slots.load(Ordering::Relaxed),
        capacity,
        stride: self.active_stride.load(Ordering::Relaxed),
      };
    }

    self.active_slots.store(new_slots, Ordering::Relaxed);
    self.active_capacity.store(expanded_capacity, Ordering::Relaxed);
    self
      .active_stride
      .store(core::compute_stride(expanded_capacity), Ordering::Relaxed);

    let new_state = (ticket_offset << SEQLOCK_BITS) | (2 * (closed_index as u64 + 1));
    self.state.store(new_state, Ordering::Release);
    true
  }

  fn next_capacity(&self, current: usize) -> usize {
    if current >= self.max_capacity {
      return current;
    }

    let grown = if current > self.max_capacity / self.growth_factor {
      self.max_capacity
    } else {
      current * self.growth_factor
    };
    if grown <= current {
      return self.max_capacity;
    }
    grown.min(self.max_capacity)
  }

  fn registration_for_ticket(&self, ticket: u64, producer_wait: bool) -> WaitRegistration {
    loop {
      let Some((state, mut view)) = self.seqlock_read() else {
        spin_pause();
        continue;
      };

      let offset = self.relocate_for_ticket(state, ticket, &mut view);
      let local_ticket = ticket - offset;
      let index = core::slot_index::<T>(local_ticket, view.capacity, view.stride);
      let turn_ptr = unsafe { (*view.slots.add(index)).turn() as *const AtomicU64 };
      let expected_turn = if producer_wait {
        core::producer_turn(local_ticket, view.capacity)
      } else {
        core::consumer_turn(local_ticket, view.capacity)
      };
      return WaitRegistration {
        turn_ptr,
        expected_turn,
        channel_hint: TurnNotifier::suggest_channel_index(turn_ptr, expected_turn),
      };
    }
  }
}

impl<T> RingOps<T> for GrowableQueue<T> {
  fn ring_try_push(&self, value: T) -> Result<(), TryPushError<T>> {
    self.try_push(value)
  }

  fn ring_try_pop(&self) -> Result<T, TryPopError> {
    self.try_pop()
  }

  fn push_registration(&self) -> WaitRegistration {
    let ticket = self.push_ticket.load(Ordering::Relaxed);
    self.registration_for_ticket(ticket, true)
  }

  fn pop_registration(&self) -> WaitRegistration {
    let ticket = self.pop_ticket.load(Ordering::Relaxed);
    self.registration_for_ticket(ticket, false)
  }

  fn push_notify(&self) -> &TurnNotifier {
    &self.push_notify
  }

  fn pop_notify(&self) -> &TurnNotifier {
    &self.pop_notify
  }
}

impl<T> Drop for GrowableQueue<T> {
  fn drop(&mut self) {
    // Drain so queued values run their destructors; draining also empties
    // any retired rings, since pop tickets below the offset route there.
    while self.try_pop().is_ok() {}

    let state = self.state.load(Ordering::Relaxed);
    let closed_count = ((state & SEQLOCK_MASK) >> 1) as usize;
    for index in (0..closed_count).rev() {
      let closed = unsafe { &mut *self.closed_rings[index].get() };
      unsafe { free_ring(closed.slots, closed.capacity) };
      closed.slots = ptr::null_mut();
    }

    let active = self.active_slots.load(Ordering::Relaxed);
    if !active.is_null() {
      unsafe { free_ring(active, self.active_capacity.load(Ordering::Relaxed)) };
      self.active_slots.store(ptr::null_mut(), Ordering::Relaxed);
    }
  }
}

impl<T> fmt::Debug for GrowableQueue<T> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("GrowableQueue")
      .field("capacity", &self.capacity())
      .field("max_capacity", &self.max_capacity)
      .field("growth_factor", &self.growth_factor)
      .field("push_count", &self.push_count())
      .field("pop_count", &self.pop_count())
      .finish_non_exhaustive()
  }
}

fn resolve_max_capacity(initial_capacity: usize, max_capacity: usize) -> usize {
  if max_capacity == 0 {
    initial_capacity
  } else {
    max_capacity.max(initial_capacity)
  }
}

/// Number of growth steps from `initial` to `max`, which is exactly how
/// many retired rings can ever exist.
fn compute_max_closed_rings(initial_capacity: usize, max_capacity: usize, growth_factor: usize) -> usize {
  if initial_capacity >= max_capacity {
    return 0;
  }

  let mut count = 0;
  let mut expanded = initial_capacity;
  while expanded < max_capacity {
    if expanded > max_capacity / growth_factor {
      expanded = max_capacity;
    } else {
      expanded *= growth_factor;
    }
    count += 1;
  }
  count
}

fn allocate_ring<T>(capacity: usize) -> *mut Slot<T> {
  Box::into_raw(core::alloc_slots::<T>(capacity)) as *mut Slot<T>
}

/// # Safety
/// `slots` must have been produced by `allocate_ring::<T>(capacity)` and
/// not freed since; every live element must already have been drained.
unsafe fn free_ring<T>(slots: *mut Slot<T>, capacity: usize) {
  let count = core::slot_count::<T>(capacity);
  drop(unsafe { Box::from_raw(ptr::slice_from_raw_parts_mut(slots, count)) });
}
