// src/notify.rs

//! The turn-notification registry that bridges the lock-free ring to
//! suspended tasks.
//!
//! Blocked operations park a caller-owned [`Waiter`] here, keyed by the
//! `(turn address, expected turn)` pair the ring publishes on every slot.
//! The registry stripes waiters over 1024 cache-padded buckets, each with
//! its own test-and-set spin lock, so `arm`/`disarm`/`notify` touch one
//! bucket and never allocate.
//!
//! ### Lifecycle protocol
//!
//! A waiter carries a cloned task [`Waker`] and two atomic bits:
//!
//! * `armed` — set while the waiter is eligible for exactly one wake.
//!   `notify` claims a waiter by swapping `armed` to false and taking its
//!   waker; `disarm` clears the bit so a later `notify` skips the waiter.
//! * `linked` — mirrors bucket-list membership; only mutated under the
//!   owning bucket's lock.
//!
//! The bucket lock is the reclamation barrier: once `disarm` has unlinked
//! the waiter (or observed it already unlinked), the registry holds no
//! reference into the waiter's memory. A `notify` that claimed the waiter
//! earlier holds only the taken waker, which is refcounted and safe to wake
//! after the waiter itself is gone. Wakes run *outside* the bucket lock so
//! a woken task polled inline may re-enter the registry without
//! deadlocking.

use std::cell::Cell;
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::task::Waker;

use crate::internal::cache_padded::CachePadded;
use crate::sync_util::spin_pause;

/// Sentinel for "waiter is not resident in any bucket".
pub(crate) const INVALID_CHANNEL_INDEX: u16 = u16::MAX;

const WAIT_CHANNEL_COUNT: usize = 1024;
const WAIT_CHANNEL_MASK: usize = WAIT_CHANNEL_COUNT - 1;
const MIN_PROBE_WINDOW: usize = 8;
const MAX_PROBE_WINDOW: usize = 256;
const INITIAL_PROBE_WINDOW: usize = 16;
/// Wakers claimed per bucket-lock acquisition in `notify`.
const NOTIFY_BATCH: usize = 32;

// The bucket count must be a power of two and index into a u16.
const _: () = assert!(WAIT_CHANNEL_COUNT.is_power_of_two());
const _: () = assert!(WAIT_CHANNEL_COUNT <= u16::MAX as usize);

/// The key a blocked operation waits on, plus the bucket hint the ring
/// caches so `arm` can skip the hash probe.
#[derive(Debug, Clone, Copy)]
pub(crate) struct WaitRegistration {
  pub(crate) turn_ptr: *const AtomicU64,
  pub(crate) expected_turn: u64,
  pub(crate) channel_hint: u16,
}

/// A caller-owned record representing one pending operation.
///
/// The registry never owns a waiter; it threads borrowed waiters onto
/// intrusive per-bucket lists. The owner must keep the waiter pinned in
/// memory from a successful `arm` until `disarm` returns, which the async
/// operation state machines guarantee by embedding the waiter in a `!Unpin`
/// future and disarming on drop.
pub(crate) struct Waiter {
  turn_ptr: Cell<*const AtomicU64>,
  expected_turn: Cell<u64>,
  // Intrusive links; only touched under the owning bucket's lock.
  next: Cell<*const Waiter>,
  prev: Cell<*const Waiter>,
  // Written by the owner before `arm`, taken by `notify` under the lock.
  waker: Cell<Option<Waker>>,
  armed: AtomicBool,
  linked: AtomicBool,
  channel_hint: Cell<u16>,
  channel_index: AtomicU16,
}

// Safety: the Cell fields are written by the owner before `arm` publishes
// the waiter, and afterwards only under the owning bucket's spin lock. The
// atomics carry all cross-thread transitions.
unsafe impl Send for Waiter {}
unsafe impl Sync for Waiter {}

impl Waiter {
  pub(crate) fn new() -> Self {
    Waiter {
      turn_ptr: Cell::new(ptr::null()),
      expected_turn: Cell::new(0),
      next: Cell::new(ptr::null()),
      prev: Cell::new(ptr::null()),
      waker: Cell::new(None),
      armed: AtomicBool::new(false),
      linked: AtomicBool::new(false),
      channel_hint: Cell::new(INVALID_CHANNEL_INDEX),
      channel_index: AtomicU16::new(INVALID_CHANNEL_INDEX),
    }
  }

  /// Fills the waiter for a fresh `arm`. Must not be called while the
  /// waiter is linked.
  pub(crate) fn prepare(&self, registration: &WaitRegistration, waker: Waker) {
    debug_assert!(!self.linked.load(Ordering::Relaxed));
    self.turn_ptr.set(registration.turn_ptr);
    self.expected_turn.set(registration.expected_turn);
    self.channel_hint.set(registration.channel_hint);
    self.channel_index.store(INVALID_CHANNEL_INDEX, Ordering::Relaxed);
    self.waker.set(Some(waker));
    self.next.set(ptr::null());
    self.prev.set(ptr::null());
  }
}

/// One stripe of the registry: a spin lock, the key it currently guards
/// (`key_tag` of zero means empty) and an intrusive waiter list.
struct WaitChannel {
  lock: AtomicBool,
  key_tag: AtomicU64,
  // Guarded by `lock`.
  turn_ptr: Cell<*const AtomicU64>,
  expected_turn: Cell<u64>,
  head: Cell<*const Waiter>,
  len: Cell<usize>,
}

impl WaitChannel {
  fn new() -> Self {
    WaitChannel {
      lock: AtomicBool::new(false),
      key_tag: AtomicU64::new(0),
      turn_ptr: Cell::new(ptr::null()),
      expected_turn: Cell::new(0),
      head: Cell::new(ptr::null()),
      len: Cell::new(0),
    }
  }
}

/// The registry. One instance serves one wait direction of one ring (or a
/// channel's close events); there is no cross-registry ordering.
pub(crate) struct TurnNotifier {
  occupied_channel_count: AtomicU32,
  probe_window: AtomicUsize,
  channels: Box<[CachePadded<WaitChannel>]>,
}

// Safety: bucket state is guarded by the per-bucket spin lock; waiters are
// Send + Sync under the protocol documented on `Waiter`.
unsafe impl Send for TurnNotifier {}
unsafe impl Sync for TurnNotifier {}

impl TurnNotifier {
  pub(crate) fn new() -> Self {
    let channels = (0..WAIT_CHANNEL_COUNT)
      .map(|_| CachePadded::new(WaitChannel::new()))
      .collect::<Box<[_]>>();
    TurnNotifier {
      occupied_channel_count: AtomicU32::new(0),
      probe_window: AtomicUsize::new(INITIAL_PROBE_WINDOW),
      channels,
    }
  }

  /// Conservative fast check used by hot paths before paying for a probe.
  #[inline]
  pub(crate) fn has_waiters(&self) -> bool {
    self.occupied_channel_count.load(Ordering::Relaxed) != 0
  }

  /// The bucket a matching `arm` will likely land in. Pure; the ring caches
  /// the result in the registration so `arm` can try it first.
  #[inline]
  pub(crate) fn suggest_channel_index(turn_ptr: *const AtomicU64, expected_turn: u64) -> u16 {
    hash_key(turn_ptr, expected_turn) as u16
  }

  /// Links `waiter` so a future `notify` for its key wakes it exactly once.
  ///
  /// Returns `false` without linking when the turn has already been reached
  /// — the caller must retry the ring operation instead of waiting. The
  /// turn is re-checked under the bucket lock after linking, which is what
  /// makes a lost wakeup impossible: either this `arm` observes the
  /// published turn, or the publisher's `notify` observes the linked waiter.
  pub(crate) fn arm(&self, waiter: &Waiter) -> bool {
    let turn_ptr = waiter.turn_ptr.get();
    debug_assert!(!turn_ptr.is_null());
    let expected_turn = waiter.expected_turn.get();

    if turn_reached(unsafe { (*turn_ptr).load(Ordering::Acquire) }, expected_turn) {
      return false;
    }

    let key_tag = mix_key(turn_ptr, expected_turn);
    let Some((channel, channel_index)) = self.find_or_reserve_channel(waiter, turn_ptr, expected_turn, key_tag)
    else {
      return false;
    };

    if turn_reached(unsafe { (*turn_ptr).load(Ordering::Acquire) }, expected_turn) {
      clear_channel_if_empty(channel);
      unlock_channel(channel);
      return false;
    }

    waiter.armed.store(true, Ordering::Release);
    waiter.linked.store(true, Ordering::Relaxed);
    waiter.channel_index.store(channel_index as u16, Ordering::Relaxed);
    waiter.prev.set(ptr::null());
    let head = channel.head.get();
    waiter.next.set(head);
    if !head.is_null() {
      unsafe { (*head).prev.set(waiter as *const Waiter) };
    }
    let was_empty = channel.len.get() == 0;
    channel.head.set(waiter as *const Waiter);
    channel.len.set(channel.len.get() + 1);
    if was_empty {
      self.occupied_channel_count.fetch_add(1, Ordering::Relaxed);
    }

    // Arm-after-publish race: the publisher may have stored the turn after
    // our first two checks but before we linked.
    if turn_reached(unsafe { (*turn_ptr).load(Ordering::Acquire) }, expected_turn) {
      waiter.armed.store(false, Ordering::Release);
      self.remove_waiter_from_channel(channel, waiter);
      unlock_channel(channel);
      return false;
    }

    unlock_channel(channel);
    true
  }

  /// Unlinks `waiter` if it is still resident. Idempotent. After this
  /// returns the registry holds no reference into the waiter, so its memory
  /// may be reclaimed; a `notify` that already claimed the waiter holds
  /// only the refcounted waker it took.
  pub(crate) fn disarm(&self, waiter: &Waiter) {
    waiter.armed.store(false, Ordering::Release);

    let channel_index = waiter.channel_index.load(Ordering::Relaxed);
    if channel_index != INVALID_CHANNEL_INDEX {
      let channel = &*self.channels[channel_index as usize & WAIT_CHANNEL_MASK];
      lock_channel(channel);
      if waiter.linked.load(Ordering::Relaxed) {
        self.remove_waiter_from_channel(channel, waiter);
      }
      unlock_channel(channel);
    }
  }

  /// Wakes every waiter registered for `(turn_ptr, turn_value)`.
  ///
  /// Waiters are claimed in bounded batches under the bucket lock (the
  /// event already happened, so every resident waiter is eligible); their
  /// wakers run after the lock is released, so a task polled inline by its
  /// waker may re-enter this registry freely.
  pub(crate) fn notify(&self, turn_ptr: *const AtomicU64, turn_value: u64) {
    debug_assert!(!turn_ptr.is_null());

    if !self.has_waiters() {
      return;
    }

    loop {
      let Some((channel, _)) = self.lock_existing_channel(turn_ptr, turn_value) else {
        return;
      };

      let mut batch: [Option<Waker>; NOTIFY_BATCH] = std::array::from_fn(|_| None);
      let mut batch_len = 0;

      while batch_len < NOTIFY_BATCH {
        let head = channel.head.get();
        if head.is_null() {
          break;
        }
        let waiter = unsafe { &*head };
        // Claim before unlinking: clearing `channel_index` (inside the
        // unlink) is what lets a concurrent `disarm` return and the owner
        // reclaim the waiter, so it must be the last touch.
        if waiter.armed.swap(false, Ordering::AcqRel) {
          if let Some(waker) = waiter.waker.take() {
            batch[batch_len] = Some(waker);
            batch_len += 1;
          }
        }
        self.remove_waiter_from_channel(channel, waiter);
      }

      let emptied = channel.head.get().is_null();
      unlock_channel(channel);

      for slot in batch.iter_mut().take(batch_len) {
        if let Some(waker) = slot.take() {
          waker.wake();
        }
      }

      if emptied {
        return;
      }
      // More waiters than one batch; the bucket still holds our key.
    }
  }

  fn probe_window(&self) -> usize {
    self
      .probe_window
      .load(Ordering::Relaxed)
      .clamp(MIN_PROBE_WINDOW, MAX_PROBE_WINDOW)
  }

  fn maybe_grow_probe_window(&self, current: usize) {
    if current >= MAX_PROBE_WINDOW {
      return;
    }
    let target = (current * 2).min(MAX_PROBE_WINDOW);
    let _ = self
      .probe_window
      .compare_exchange_weak(current, target, Ordering::Relaxed, Ordering::Relaxed);
  }

  /// Probes `span` buckets from `start` for one already keyed to
  /// `(turn_ptr, expected_turn)`, returning it locked.
  fn lock_matching_channel(
    &self,
    turn_ptr: *const AtomicU64,
    expected_turn: u64,
    key_tag: u64,
    start: usize,
    span: usize,
  ) -> Option<(&WaitChannel, usize)> {
    for offset in 0..span {
      let index = (start + offset) & WAIT_CHANNEL_MASK;
      let channel = &*self.channels[index];
      if channel.key_tag.load(Ordering::Relaxed) != key_tag {
        continue;
      }
      lock_channel(channel);
      if ptr::eq(channel.turn_ptr.get(), turn_ptr) && channel.expected_turn.get() == expected_turn {
        return Some((channel, index));
      }
      unlock_channel(channel);
    }
    None
  }

  /// Probes `span` buckets from `start` for an empty one, returning it
  /// locked. The `key_tag` is re-checked under the lock.
  fn lock_empty_channel(&self, start: usize, span: usize) -> Option<(&WaitChannel, usize)> {
    for offset in 0..span {
      let index = (start + offset) & WAIT_CHANNEL_MASK;
      let channel = &*self.channels[index];
      if channel.key_tag.load(Ordering::Relaxed) != 0 {
        continue;
      }
      lock_channel(channel);
      if channel.len.get() == 0 && channel.key_tag.load(Ordering::Relaxed) == 0 {
        return Some((channel, index));
      }
      unlock_channel(channel);
    }
    None
  }

  fn lock_channel_by_hint(&self, hint: u16, key_tag: u64) -> Option<(&WaitChannel, usize)> {
    if hint == INVALID_CHANNEL_INDEX {
      return None;
    }
    let index = hint as usize & WAIT_CHANNEL_MASK;
    let channel = &*self.channels[index];
    let observed_tag = channel.key_tag.load(Ordering::Relaxed);
    if observed_tag != 0 && observed_tag != key_tag {
      return None;
    }
    lock_channel(channel);
    Some((channel, index))
  }

  fn lock_existing_channel(&self, turn_ptr: *const AtomicU64, expected_turn: u64) -> Option<(&WaitChannel, usize)> {
    let key_tag = mix_key(turn_ptr, expected_turn);
    let start = hash_key(turn_ptr, expected_turn);
    let span = self.probe_window();

    if let Some(found) = self.lock_matching_channel(turn_ptr, expected_turn, key_tag, start, span) {
      return Some(found);
    }
    self.lock_matching_channel(turn_ptr, expected_turn, key_tag, start, WAIT_CHANNEL_COUNT)
  }

  /// Finds the bucket for the waiter's key: the hinted bucket, then up to
  /// three rounds of windowed probing, then a full-table scan. A matching
  /// bucket is preferred; otherwise an empty one is seized and keyed.
  fn find_or_reserve_channel(
    &self,
    waiter: &Waiter,
    turn_ptr: *const AtomicU64,
    expected_turn: u64,
    key_tag: u64,
  ) -> Option<(&WaitChannel, usize)> {
    if let Some((hinted, index)) = self.lock_channel_by_hint(waiter.channel_hint.get(), key_tag) {
      if ptr::eq(hinted.turn_ptr.get(), turn_ptr) && hinted.expected_turn.get() == expected_turn {
        return Some((hinted, index));
      }
      if hinted.len.get() == 0 {
        hinted.turn_ptr.set(turn_ptr);
        hinted.expected_turn.set(expected_turn);
        hinted.key_tag.store(key_tag, Ordering::Relaxed);
        return Some((hinted, index));
      }
      unlock_channel(hinted);
    }

    let start = hash_key(turn_ptr, expected_turn);
    for _attempt in 0..3 {
      let span = self.probe_window();

      if let Some(found) = self.lock_matching_channel(turn_ptr, expected_turn, key_tag, start, span) {
        return Some(found);
      }
      if let Some((channel, index)) = self.lock_empty_channel(start, span) {
        channel.turn_ptr.set(turn_ptr);
        channel.expected_turn.set(expected_turn);
        channel.key_tag.store(key_tag, Ordering::Relaxed);
        return Some((channel, index));
      }
      self.maybe_grow_probe_window(span);
    }

    if let Some(found) = self.lock_matching_channel(turn_ptr, expected_turn, key_tag, start, WAIT_CHANNEL_COUNT) {
      return Some(found);
    }
    if let Some((channel, index)) = self.lock_empty_channel(start, WAIT_CHANNEL_COUNT) {
      channel.turn_ptr.set(turn_ptr);
      channel.expected_turn.set(expected_turn);
      channel.key_tag.store(key_tag, Ordering::Relaxed);
      return Some((channel, index));
    }
    None
  }

  /// Unlinks a resident waiter. Caller holds the bucket lock.
  fn remove_waiter_from_channel(&self, channel: &WaitChannel, waiter: &Waiter) {
    if !waiter.linked.load(Ordering::Relaxed) {
      return;
    }

    let prev = waiter.prev.get();
    let next = waiter.next.get();

    if !prev.is_null() {
      unsafe { (*prev).next.set(next) };
    } else {
      channel.head.set(next);
    }
    if !next.is_null() {
      unsafe { (*next).prev.set(prev) };
    }

    waiter.next.set(ptr::null());
    waiter.prev.set(ptr::null());
    waiter.linked.store(false, Ordering::Relaxed);
    waiter.channel_index.store(INVALID_CHANNEL_INDEX, Ordering::Relaxed);
    if channel.len.get() > 0 {
      channel.len.set(channel.len.get() - 1);
      if channel.len.get() == 0 {
        self.occupied_channel_count.fetch_sub(1, Ordering::Relaxed);
      }
    }
    clear_channel_if_empty(channel);
  }
}

#[inline]
fn lock_channel(channel: &WaitChannel) {
  while channel.lock.swap(true, Ordering::Acquire) {
    spin_pause();
  }
}

#[inline]
fn unlock_channel(channel: &WaitChannel) {
  channel.lock.store(false, Ordering::Release);
}

fn clear_channel_if_empty(channel: &WaitChannel) {
  if channel.len.get() == 0 {
    channel.head.set(ptr::null());
    channel.turn_ptr.set(ptr::null());
    channel.expected_turn.set(0);
    channel.key_tag.store(0, Ordering::Relaxed);
  }
}

/// Whether `current_turn` has caught up with `expected_turn`, robust to the
/// (practically unreachable) 64-bit wraparound.
#[inline]
fn turn_reached(current_turn: u64, expected_turn: u64) -> bool {
  current_turn.wrapping_sub(expected_turn) as i64 >= 0
}

/// SplitMix64-style finalizer over the key pair. The low bit is forced so
/// zero stays reserved for "empty bucket".
fn mix_key(turn_ptr: *const AtomicU64, expected_turn: u64) -> u64 {
  let mut mixed = (turn_ptr as usize as u64) >> 6;
  mixed ^= expected_turn
    .wrapping_add(0x9e37_79b9_7f4a_7c15)
    .wrapping_add(mixed << 6)
    .wrapping_add(mixed >> 2);
  mixed ^= mixed >> 30;
  mixed = mixed.wrapping_mul(0xbf58_476d_1ce4_e5b9);
  mixed ^= mixed >> 27;
  mixed = mixed.wrapping_mul(0x94d0_49bb_1331_11eb);
  mixed ^= mixed >> 31;
  mixed | 1
}

#[inline]
fn hash_key(turn_ptr: *const AtomicU64, expected_turn: u64) -> usize {
  mix_key(turn_ptr, expected_turn) as usize & WAIT_CHANNEL_MASK
}
