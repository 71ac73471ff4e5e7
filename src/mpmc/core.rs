// src/mpmc/core.rs

//! The slot/turn algorithm shared by both ticket-ring variants.
//!
//! Each slot carries a monotonic 64-bit `turn`: even means empty and ready
//! for a producer, odd means full and ready for a consumer. A slot's turn
//! advances by exactly one per event, so one full trip of the ring advances
//! it by two. The turn word is the single source of truth for element
//! liveness; the raw storage next to it is only ever read or written by the
//! ticket holder whose expected turn matches.

use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::sync::atomic::AtomicU64;

use crate::internal::cache_padded::CACHE_LINE_SIZE;

/// One ring slot: the turn word plus raw storage for the element.
#[repr(align(64))]
pub(crate) struct Slot<T> {
  turn: AtomicU64,
  storage: UnsafeCell<MaybeUninit<T>>,
}

impl<T> Slot<T> {
  pub(crate) fn new() -> Self {
    Slot {
      turn: AtomicU64::new(0),
      storage: UnsafeCell::new(MaybeUninit::uninit()),
    }
  }

  #[inline]
  pub(crate) fn turn(&self) -> &AtomicU64 {
    &self.turn
  }

  /// Writes the element.
  ///
  /// # Safety
  /// Caller must hold the producer ticket for this slot (turn matched and
  /// the ticket CAS won), so no other party touches the storage.
  #[inline]
  pub(crate) unsafe fn write(&self, value: T) {
    unsafe { (*self.storage.get()).write(value) };
  }

  /// Moves the element out, leaving the storage uninitialized.
  ///
  /// # Safety
  /// Caller must hold the consumer ticket for this slot (turn matched and
  /// the ticket CAS won), and the slot must contain a live element.
  #[inline]
  pub(crate) unsafe fn read(&self) -> T {
    unsafe { (*self.storage.get()).assume_init_read() }
  }
}

/// Slots of leading and trailing padding that keep the hot ticket counters
/// off the cache lines of live slots. `Slot` is cache-line aligned, so this
/// is one slot on common targets; the formula tolerates exotic layouts.
pub(crate) const fn slot_padding<T>() -> usize {
  (CACHE_LINE_SIZE - 1) / std::mem::size_of::<Slot<T>>() + 1
}

/// Total allocation length for a ring of `capacity` live slots.
pub(crate) const fn slot_count<T>(capacity: usize) -> usize {
  capacity + 2 * slot_padding::<T>()
}

/// Allocates a ring with every turn at zero (first producer lap).
pub(crate) fn alloc_slots<T>(capacity: usize) -> Box<[Slot<T>]> {
  let count = slot_count::<T>(capacity);
  let mut slots = Vec::with_capacity(count);
  slots.resize_with(count, Slot::new);
  slots.into_boxed_slice()
}

/// Picks a small prime coprime to `capacity` maximising the ring distance
/// between consecutive tickets, so adjacent producers land on different
/// cache lines. Falls back to 1 when nothing qualifies (tiny capacities).
pub(crate) fn compute_stride(capacity: usize) -> u64 {
  const SMALL_PRIMES: [u64; 9] = [2, 3, 5, 7, 11, 13, 17, 19, 23];

  let mut best_stride = 1u64;
  let mut best_separation = 1usize;

  for &stride in &SMALL_PRIMES {
    let candidate = stride as usize;
    if candidate % capacity == 0 || capacity % candidate == 0 {
      continue;
    }

    let separation = candidate % capacity;
    let separation = separation.min(capacity - separation);
    if separation > best_separation {
      best_stride = stride;
      best_separation = separation;
    }
  }

  best_stride
}

/// The turn a producer with this local ticket waits for.
#[inline]
pub(crate) fn producer_turn(local_ticket: u64, capacity: usize) -> u64 {
  if capacity.is_power_of_two() {
    (local_ticket >> capacity.trailing_zeros()) << 1
  } else {
    (local_ticket / capacity as u64) * 2
  }
}

/// The turn a consumer with this local ticket waits for.
#[inline]
pub(crate) fn consumer_turn(local_ticket: u64, capacity: usize) -> u64 {
  producer_turn(local_ticket, capacity) + 1
}

/// Maps a local ticket to its slot index, stride-decorrelated and offset
/// past the leading padding.
#[inline]
pub(crate) fn slot_index<T>(local_ticket: u64, capacity: usize, stride: u64) -> usize {
  let scaled = local_ticket.wrapping_mul(stride);
  let base = if capacity.is_power_of_two() {
    (scaled & (capacity as u64 - 1)) as usize
  } else {
    (scaled % capacity as u64) as usize
  };
  base + slot_padding::<T>()
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn stride_is_coprime_to_capacity() {
    for capacity in 1..=64usize {
      let stride = compute_stride(capacity) as usize;
      assert_eq!(gcd(stride, capacity), 1, "capacity {}", capacity);
    }
  }

  #[test]
  fn turns_alternate_parity_per_lap() {
    let capacity = 4;
    for lap in 0..3u64 {
      for offset in 0..capacity as u64 {
        let ticket = lap * capacity as u64 + offset;
        assert_eq!(producer_turn(ticket, capacity), 2 * lap);
        assert_eq!(consumer_turn(ticket, capacity), 2 * lap + 1);
      }
    }
  }

  #[test]
  fn pow2_and_division_turns_agree() {
    for capacity in [1usize, 2, 4, 8, 64] {
      for ticket in 0..(capacity as u64 * 3) {
        assert_eq!(producer_turn(ticket, capacity), (ticket / capacity as u64) * 2);
      }
    }
  }

  #[test]
  fn slot_index_covers_every_slot_each_lap() {
    for capacity in [3usize, 4, 7, 16] {
      let stride = compute_stride(capacity);
      let mut seen = vec![false; capacity];
      for ticket in 0..capacity as u64 {
        let index = slot_index::<u64>(ticket, capacity, stride) - slot_padding::<u64>();
        assert!(!seen[index], "ticket {} collided at {}", ticket, index);
        seen[index] = true;
      }
      assert!(seen.iter().all(|&hit| hit));
    }
  }

  #[test]
  fn padding_is_at_least_one_slot() {
    assert!(slot_padding::<u8>() >= 1);
    assert!(slot_padding::<[u8; 1024]>() >= 1);
    assert_eq!(slot_count::<u64>(8), 8 + 2 * slot_padding::<u64>());
  }

  fn gcd(a: usize, b: usize) -> usize {
    if b == 0 {
      a
    } else {
      gcd(b, a % b)
    }
  }
}
