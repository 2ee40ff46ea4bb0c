//! The process-wide frame pool.
//!
//! One [`BuddyFrameAlloc`] instance behind a `SyncOnceCell<SpinLock<_>>`:
//! initialized at most once from the boot path, then shared by every
//! kernel component. The lock is taken with interrupts disabled so
//! interrupt-context allocations cannot deadlock against a preempted
//! holder; on the single-CPU build it never spins.

use crate::{BuddyFrameAlloc, FrameAllocStats};
use kernel_addresses::PhysicalAddress;
use kernel_sync::{SpinLock, SyncOnceCell};
use kernel_vmem::PhysMapper;

static FRAME_POOL: SyncOnceCell<SpinLock<BuddyFrameAlloc>> = SyncOnceCell::new();

/// Bring the pool up over the boot memory region.
///
/// At-most-once: a second call (or an unusable region) is a logged no-op
/// returning `false`.
pub fn init<M: PhysMapper>(mapper: &M, region_start: PhysicalAddress, region_size: u64) -> bool {
    let pool = match BuddyFrameAlloc::init(mapper, region_start, region_size) {
        Ok(pool) => pool,
        Err(err) => {
            log::warn!("frame pool rejected: {err}");
            return false;
        }
    };
    if FRAME_POOL.set(SpinLock::new(pool)).is_err() {
        log::warn!("frame pool already initialized; ignoring second init");
        return false;
    }
    true
}

/// Run `f` against the pool, or `None` before [`init`].
pub fn with<R>(f: impl FnOnce(&mut BuddyFrameAlloc) -> R) -> Option<R> {
    let lock = FRAME_POOL.get()?;
    let mut guard = lock.lock_irq();
    Some(f(&mut guard))
}

/// Allocate a block of `2^order` frames from the pool.
#[must_use]
pub fn alloc(order: usize) -> Option<PhysicalAddress> {
    with(|pool| pool.alloc(order)).flatten()
}

/// Release a block of `2^order` frames back to the pool.
pub fn free(addr: PhysicalAddress, order: usize) {
    with(|pool| pool.free(addr, order));
}

/// Allocate a single frame.
#[must_use]
pub fn alloc_page() -> Option<PhysicalAddress> {
    with(BuddyFrameAlloc::alloc_page).flatten()
}

/// Drop one reference to a single frame.
pub fn free_page(addr: PhysicalAddress) {
    with(|pool| pool.free_page(addr));
}

/// Add a reference to an allocated frame.
pub fn retain(addr: PhysicalAddress) {
    with(|pool| pool.retain(addr));
}

/// Pool counters, or `None` before [`init`].
#[must_use]
pub fn stats() -> Option<FrameAllocStats> {
    with(|pool| pool.stats())
}
