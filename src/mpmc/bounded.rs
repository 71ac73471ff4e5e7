// src/mpmc/bounded.rs

//! The fixed-capacity ticket-ring queue.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use super::async_impl::{PopFuture, PopUntilFuture, PushFuture, PushUntilFuture, RingOps};
use super::core::{self, Slot};
use crate::error::{TryPopError, TryPushError};
use crate::internal::cache_padded::CachePadded;
use crate::notify::{TurnNotifier, WaitRegistration};
use std::time::Instant;

/// A lock-free bounded MPMC queue.
///
/// Producers and consumers claim monotonically increasing 64-bit tickets;
/// the ticket selects a slot and an expected turn, and the slot's turn word
/// arbitrates who may act. The fast paths are lock-free; when a side cannot
/// make progress its async operations park in a per-side notification
/// registry keyed by the exact turn they need.
///
/// The ring is allocated once at construction and never reallocated. Any
/// values still queued when the ring is dropped are drained and dropped.
pub struct BoundedQueue<T> {
  capacity: usize,
  stride: u64,
  capacity_is_pow2: bool,
  capacity_mask: u64,
  capacity_shift: u32,
  slots: Box<[Slot<T>]>,
  push_ticket: CachePadded<AtomicU64>,
  pop_ticket: CachePadded<AtomicU64>,
  pub(crate) push_notify: TurnNotifier,
  pub(crate) pop_notify: TurnNotifier,
}

// Safety: slot storage is only touched by the ticket holder whose expected
// turn matched; the turn word's release/acquire pair transfers the element.
unsafe impl<T: Send> Send for BoundedQueue<T> {}
unsafe impl<T: Send> Sync for BoundedQueue<T> {}

impl<T> BoundedQueue<T> {
  /// Creates a queue holding at most `capacity` values.
  ///
  /// # Panics
  /// Panics if `capacity` is zero; that is a caller contract breach, not a
  /// runtime condition.
  pub fn new(capacity: usize) -> Self {
    assert!(capacity > 0, "BoundedQueue capacity must be greater than 0");

    let (capacity_is_pow2, capacity_mask, capacity_shift) = if capacity.is_power_of_two() {
      (true, capacity as u64 - 1, capacity.trailing_zeros())
    } else {
      (false, 0, 0)
    };

    BoundedQueue {
      capacity,
      stride: core::compute_stride(capacity),
      capacity_is_pow2,
      capacity_mask,
      capacity_shift,
      slots: core::alloc_slots(capacity),
      push_ticket: CachePadded::new(AtomicU64::new(0)),
      pop_ticket: CachePadded::new(AtomicU64::new(0)),
      push_notify: TurnNotifier::new(),
      pop_notify: TurnNotifier::new(),
    }
  }

  /// Attempts to enqueue without blocking. On a full ring the value is
  /// handed back in [`TryPushError::Full`].
  pub fn try_push(&self, value: T) -> Result<(), TryPushError<T>> {
    let mut ticket = self.push_ticket.load(Ordering::Relaxed);
    loop {
      let slot = self.slot_for_ticket(ticket);
      let expected_turn = self.producer_turn_for(ticket);

      if slot.turn().load(Ordering::Acquire) != expected_turn {
        // Either the ring is full or another producer took our ticket.
        let observed = ticket;
        ticket = self.push_ticket.load(Ordering::Relaxed);
        if observed == ticket {
          return Err(TryPushError::Full(value));
        }
        continue;
      }

      match self
        .push_ticket
        .compare_exchange_weak(ticket, ticket + 1, Ordering::Relaxed, Ordering::Relaxed)
      {
        Err(current) => {
          ticket = current;
          continue;
        }
        Ok(_) => {
          unsafe { slot.write(value) };
          let publish_turn = expected_turn + 1;
          slot.turn().store(publish_turn, Ordering::Release);
          self.pop_notify.notify(slot.turn() as *const AtomicU64, publish_turn);
          return Ok(());
        }
      }
    }
  }

  /// Attempts to dequeue without blocking.
  pub fn try_pop(&self) -> Result<T, TryPopError> {
    let mut ticket = self.pop_ticket.load(Ordering::Relaxed);
    loop {
      let slot = self.slot_for_ticket(ticket);
      let expected_turn = self.consumer_turn_for(ticket);

      if slot.turn().load(Ordering::Acquire) != expected_turn {
        let observed = ticket;
        ticket = self.pop_ticket.load(Ordering::Relaxed);
        if observed == ticket {
          return Err(TryPopError::Empty);
        }
        continue;
      }

      match self
        .pop_ticket
        .compare_exchange_weak(ticket, ticket + 1, Ordering::Relaxed, Ordering::Relaxed)
      {
        Err(current) => {
          ticket = current;
          continue;
        }
        Ok(_) => {
          let value = unsafe { slot.read() };
          let publish_turn = expected_turn + 1;
          slot.turn().store(publish_turn, Ordering::Release);
          self.push_notify.notify(slot.turn() as *const AtomicU64, publish_turn);
          return Ok(value);
        }
      }
    }
  }

  /// Enqueues asynchronously; the returned future is lazy and completes
  /// once the value has been published.
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

  /// Conservative emptiness probe; correctness never depends on it.
  pub fn is_empty(&self) -> bool {
    self.push_count() == self.pop_count()
  }

  /// Conservative fullness probe; correctness never depends on it.
  pub fn is_full(&self) -> bool {
    self.approximate_depth() >= self.capacity
  }

  /// Signed depth guess; may be momentarily stale under concurrency.
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

  /// The fixed capacity this queue was built with.
  pub fn capacity(&self) -> usize {
    self.capacity
  }

  /// Equal to [`capacity`](Self::capacity) for the bounded variant.
  pub fn max_capacity(&self) -> usize {
    self.capacity
  }

  /// Equal to [`capacity`](Self::capacity) for the bounded variant.
  pub fn allocated_capacity(&self) -> usize {
    self.capacity
  }

  /// Always false; see [`GrowableQueue`](super::GrowableQueue) for the
  /// expanding variant.
  pub fn dynamic_growth_enabled(&self) -> bool {
    false
  }

  #[inline]
  fn producer_turn_for(&self, ticket: u64) -> u64 {
    if self.capacity_is_pow2 {
      (ticket >> self.capacity_shift) << 1
    } else {
      (ticket / self.capacity as u64) * 2
    }
  }

  #[inline]
  fn consumer_turn_for(&self, ticket: u64) -> u64 {
    self.producer_turn_for(ticket) + 1
  }

  #[inline]
  fn slot_index_for(&self, ticket: u64) -> usize {
    let scaled = ticket.wrapping_mul(self.stride);
    let base = if self.capacity_is_pow2 {
      (scaled & self.capacity_mask) as usize
    } else {
      (scaled % self.capacity as u64) as usize
    };
    base + core::slot_padding::<T>()
  }

  #[inline]
  fn slot_for_ticket(&self, ticket: u64) -> &Slot<T> {
    &self.slots[self.slot_index_for(ticket)]
  }
}

impl<T> RingOps<T> for BoundedQueue<T> {
  fn ring_try_push(&self, value: T) -> Result<(), TryPushError<T>> {
    self.try_push(value)
  }

  fn ring_try_pop(&self) -> Result<T, TryPopError> {
    self.try_pop()
  }

  fn push_registration(&self) -> WaitRegistration {
    let ticket = self.push_ticket.load(Ordering::Relaxed);
    let slot = self.slot_for_ticket(ticket);
    let expected_turn = self.producer_turn_for(ticket);
    let turn_ptr = slot.turn() as *const AtomicU64;
    WaitRegistration {
      turn_ptr,
      expected_turn,
      channel_hint: TurnNotifier::suggest_channel_index(turn_ptr, expected_turn),
    }
  }

  fn pop_registration(&self) -> WaitRegistration {
    let ticket = self.pop_ticket.load(Ordering::Relaxed);
    let slot = self.slot_for_ticket(ticket);
    let expected_turn = self.consumer_turn_for(ticket);
    let turn_ptr = slot.turn() as *const AtomicU64;
    WaitRegistration {
      turn_ptr,
      expected_turn,
      channel_hint: TurnNotifier::suggest_channel_index(turn_ptr, expected_turn),
    }
  }

  fn push_notify(&self) -> &TurnNotifier {
    &self.push_notify
  }

  fn pop_notify(&self) -> &TurnNotifier {
    &self.pop_notify
  }
}

impl<T> Drop for BoundedQueue<T> {
  fn drop(&mut self) {
    // Drain so queued values run their destructors.
    while self.try_pop().is_ok() {}
  }
}

impl<T> fmt::Debug for BoundedQueue<T> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("BoundedQueue")
      .field("capacity", &self.capacity)
      .field("stride", &self.stride)
      .field("push_count", &self.push_count())
      .field("pop_count", &self.pop_count())
      .finish_non_exhaustive()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  #[should_panic]
  fn zero_capacity_is_a_contract_breach() {
    let _ = BoundedQueue::<u32>::new(0);
  }

  #[test]
  fn fill_then_drain_capacity_four() {
    let queue = BoundedQueue::new(4);
    for value in 1..=4 {
      queue.try_push(value).unwrap();
    }
    match queue.try_push(5) {
      Err(TryPushError::Full(value)) => assert_eq!(value, 5),
      other => panic!("expected Full, got {:?}", other),
    }

    for expected in 1..=4 {
      assert_eq!(queue.try_pop().unwrap(), expected);
    }
    assert_eq!(queue.try_pop(), Err(TryPopError::Empty));
  }

  #[test]
  fn round_trip_on_empty_queue() {
    let queue = BoundedQueue::new(2);
    queue.try_push("v").unwrap();
    assert_eq!(queue.try_pop().unwrap(), "v");
  }

  #[test]
  fn observers_track_tickets() {
    let queue = BoundedQueue::new(3);
    assert!(queue.is_empty());
    assert!(!queue.is_full());
    assert!(!queue.dynamic_growth_enabled());
    assert_eq!(queue.capacity(), 3);
    assert_eq!(queue.allocated_capacity(), 3);

    queue.try_push(1).unwrap();
    queue.try_push(2).unwrap();
    assert_eq!(queue.approximate_depth(), 2);
    assert_eq!(queue.size_guess(), 2);
    assert_eq!(queue.push_count(), 2);
    assert_eq!(queue.pop_count(), 0);

    queue.try_pop().unwrap();
    queue.try_pop().unwrap();
    queue.try_push(3).unwrap();
    queue.try_push(4).unwrap();
    queue.try_push(5).unwrap();
    assert!(queue.is_full());
    assert_eq!(queue.push_count(), 5);
    assert_eq!(queue.pop_count(), 2);
  }

  #[test]
  fn depth_never_exceeds_capacity_across_laps() {
    let queue = BoundedQueue::new(2);
    for lap in 0..10 {
      queue.try_push(lap * 2).unwrap();
      queue.try_push(lap * 2 + 1).unwrap();
      assert!(queue.try_push(999).is_err());
      assert!(queue.approximate_depth() <= queue.capacity());
      assert_eq!(queue.try_pop().unwrap(), lap * 2);
      assert_eq!(queue.try_pop().unwrap(), lap * 2 + 1);
    }
  }

  #[test]
  fn dropping_the_queue_drops_queued_values() {
    use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
    static DROP_COUNT: AtomicUsize = AtomicUsize::new(0);

    struct Droppable;
    impl Drop for Droppable {
      fn drop(&mut self) {
        DROP_COUNT.fetch_add(1, AtomicOrdering::SeqCst);
      }
    }

    DROP_COUNT.store(0, AtomicOrdering::SeqCst);
    let queue = BoundedQueue::new(4);
    queue.try_push(Droppable).unwrap();
    queue.try_push(Droppable).unwrap();
    queue.try_push(Droppable).unwrap();
    drop(queue.try_pop().unwrap());
    assert_eq!(DROP_COUNT.load(AtomicOrdering::SeqCst), 1);

    drop(queue);
    assert_eq!(DROP_COUNT.load(AtomicOrdering::SeqCst), 3);
  }
}
