//! Spin-wait helpers shared by the ring fast paths and the notifier's
//! bucket locks. All waiting in this crate is either a bounded spin or an
//! async suspension; nothing here touches the kernel.

/// Emits a CPU instruction that signals the processor that it is in a spin loop.
#[inline(always)]
pub(crate) fn spin_pause() {
  std::hint::spin_loop();
}
