use crate::frame_info::{FREE_LIST_END, FrameFlags, FrameInfo};
use core::ptr::NonNull;
use kernel_addresses::{PAGE_SHIFT, PAGE_SIZE, PhysicalAddress, align_down};
use kernel_vmem::{FrameAlloc, PhysMapper};

/// Number of buddy orders: blocks span `2^0 ..= 2^(MAX_ORDER-1)` frames,
/// so the largest allocation is 4 MiB.
pub const MAX_ORDER: usize = 11;

/// Pool counters reported by [`BuddyFrameAlloc::stats`].
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct FrameAllocStats {
    /// Every frame of the managed region, reserved metadata included.
    pub total_frames: u64,
    /// Frames currently sitting on a free list.
    pub free_frames: u64,
}

/// The managed region cannot host a working pool.
#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum FrameAllocError {
    /// After alignment, the region has no frames left beyond its own
    /// metadata.
    #[error("memory region too small for a frame pool")]
    RegionTooSmall,
}

/// Buddy allocator over one contiguous physical region.
///
/// The per-frame metadata array lives in the first frames of the region
/// itself; `init` marks those reserved. All block arithmetic uses frame
/// indices relative to the (page-aligned) region base, so buddy pairing is
/// a pure XOR on the index.
///
/// The allocator never blocks and never panics on exhaustion or misuse:
/// allocation failure is `None`, and a free that does not match a live
/// allocation is a logged no-op that leaves the free lists intact.
pub struct BuddyFrameAlloc {
    /// Metadata array (one record per frame), resident in the region.
    frames: NonNull<FrameInfo>,
    frame_count: usize,
    /// Page-aligned base of the managed region; frame index 0.
    base: PhysicalAddress,
    /// Head frame index per order, [`FREE_LIST_END`]-terminated.
    free_lists: [u32; MAX_ORDER],
    free_frames: u64,
}

// Safety: the metadata region is exclusively owned by this value; callers
// serialize access through the global lock.
unsafe impl Send for BuddyFrameAlloc {}

impl BuddyFrameAlloc {
    /// Build a pool over `[region_start, region_start + region_size)`.
    ///
    /// The start is aligned up to a page and the size rounded down to
    /// whole frames. The metadata array is placed at the low end and its
    /// frames reserved; every remaining frame enters the order-0 free list
    /// and one coalescing pass per order brings the lists to canonical
    /// form (no two buddies of the same order both free).
    ///
    /// `mapper` must present the region as one linearly mapped, writable
    /// range (identity or higher-half direct map).
    ///
    /// # Errors
    /// [`FrameAllocError::RegionTooSmall`] when nothing remains after
    /// alignment and metadata placement.
    pub fn init<M: PhysMapper>(
        mapper: &M,
        region_start: PhysicalAddress,
        region_size: u64,
    ) -> Result<Self, FrameAllocError> {
        let base = region_start.align_up_4k();
        let alignment_loss = base.as_u64() - region_start.as_u64();
        let usable = align_down(region_size.saturating_sub(alignment_loss), PAGE_SIZE);
        let frame_count = (usable / PAGE_SIZE) as usize;
        if frame_count == 0 {
            return Err(FrameAllocError::RegionTooSmall);
        }

        let meta_bytes = frame_count * size_of::<FrameInfo>();
        let meta_frames = meta_bytes.div_ceil(PAGE_SIZE as usize);
        if meta_frames >= frame_count {
            return Err(FrameAllocError::RegionTooSmall);
        }

        // The metadata array occupies the first frames of the region.
        let first: &mut FrameInfo = unsafe { mapper.phys_to_mut(base) };
        let mut pool = Self {
            frames: NonNull::from(first),
            frame_count,
            base,
            free_lists: [FREE_LIST_END; MAX_ORDER],
            free_frames: 0,
        };

        {
            let table = pool.table_mut();
            for info in table.iter_mut() {
                *info = FrameInfo::unused();
            }
            for info in table.iter_mut().take(meta_frames) {
                info.flags.set_reserved(true);
            }
        }

        for idx in meta_frames..frame_count {
            pool.push_front(0, idx);
        }
        pool.free_frames = (frame_count - meta_frames) as u64;
        pool.coalesce_all();

        log::info!(
            "frame pool at {base}: {frame_count} frames, {meta_frames} reserved for metadata"
        );
        Ok(pool)
    }

    /// Allocate a block of `2^order` contiguous frames.
    ///
    /// Splits the smallest sufficient block downwards, returning the upper
    /// half of every split to the next lower order. The block's head frame
    /// starts with a reference count of 1.
    ///
    /// Returns `None` on exhaustion or an out-of-range order.
    pub fn alloc(&mut self, order: usize) -> Option<PhysicalAddress> {
        if order >= MAX_ORDER {
            log::warn!("frame allocation with order {order} out of range");
            return None;
        }
        let found = (order..MAX_ORDER).find(|&k| self.free_lists[k] != FREE_LIST_END)?;
        let idx = self.pop_front(found)?;

        let mut split = found;
        while split > order {
            split -= 1;
            self.push_front(split, idx + (1 << split));
        }

        let info = &mut self.table_mut()[idx];
        info.order = order as u8;
        info.ref_count = 1;
        self.free_frames -= 1 << order;
        Some(self.frame_address(idx))
    }

    /// Release a block previously returned by [`alloc`](Self::alloc) with
    /// exactly this `order`.
    ///
    /// Clears the reference count, then merges with the buddy while the
    /// buddy is a free block head of matching order, stopping at the top
    /// order. A double free or an order mismatch is a logged no-op.
    pub fn free(&mut self, addr: PhysicalAddress, order: usize) {
        if order >= MAX_ORDER {
            log::warn!("frame free with order {order} out of range");
            return;
        }
        let Some(idx) = self.frame_index(addr) else {
            log::warn!("frame free outside the pool: {addr}");
            return;
        };
        let info = self.table()[idx];
        if info.flags.reserved() {
            log::warn!("frame free of reserved frame {addr}");
            return;
        }
        if info.ref_count == 0 {
            log::warn!("double free of frame {addr}");
            return;
        }
        if usize::from(info.order) != order {
            log::warn!(
                "frame free order mismatch at {addr}: allocated {}, freed {order}",
                info.order
            );
            return;
        }

        let info = &mut self.table_mut()[idx];
        info.ref_count = 0;
        info.flags = FrameFlags::new();
        self.free_frames += 1 << order;
        self.insert_and_coalesce(idx, order);
    }

    /// Allocate one frame (order 0).
    #[inline]
    pub fn alloc_page(&mut self) -> Option<PhysicalAddress> {
        self.alloc(0)
    }

    /// Drop one reference to a single frame, returning it to the pool when
    /// the count reaches zero.
    pub fn free_page(&mut self, addr: PhysicalAddress) {
        let Some(idx) = self.frame_index(addr) else {
            log::warn!("page free outside the pool: {addr}");
            return;
        };
        let info = self.table()[idx];
        if info.flags.reserved() || info.flags.free_head() || info.ref_count == 0 {
            log::warn!("page free of unallocated frame {addr}");
            return;
        }
        if info.ref_count > 1 {
            self.table_mut()[idx].ref_count -= 1;
            return;
        }
        if info.order != 0 {
            log::warn!(
                "page free of frame {addr} allocated at order {}",
                info.order
            );
            return;
        }

        let info = &mut self.table_mut()[idx];
        info.ref_count = 0;
        info.flags = FrameFlags::new();
        self.free_frames += 1;
        self.insert_and_coalesce(idx, 0);
    }

    /// Add a reference to an allocated frame (shared-page / copy-on-write
    /// bookkeeping). A no-op on anything that is not currently allocated.
    pub fn retain(&mut self, addr: PhysicalAddress) {
        let Some(idx) = self.frame_index(addr) else {
            log::warn!("retain outside the pool: {addr}");
            return;
        };
        let info = &mut self.table_mut()[idx];
        if info.ref_count == 0 || info.flags.reserved() {
            log::warn!("retain of unallocated frame {addr}");
            return;
        }
        info.ref_count = info.ref_count.saturating_add(1);
    }

    /// Current reference count of the frame containing `addr` (0 when free,
    /// reserved or out of range).
    #[must_use]
    pub fn ref_count(&self, addr: PhysicalAddress) -> u16 {
        self.frame_index(addr)
            .map_or(0, |idx| self.table()[idx].ref_count)
    }

    /// Status bits of the frame containing `addr`.
    #[must_use]
    pub fn frame_flags(&self, addr: PhysicalAddress) -> Option<FrameFlags> {
        self.frame_index(addr).map(|idx| self.table()[idx].flags)
    }

    /// Pool counters.
    #[must_use]
    pub fn stats(&self) -> FrameAllocStats {
        FrameAllocStats {
            total_frames: self.frame_count as u64,
            free_frames: self.free_frames,
        }
    }

    #[inline]
    fn frame_address(&self, idx: usize) -> PhysicalAddress {
        self.base + ((idx as u64) << PAGE_SHIFT)
    }

    /// Frame index of `addr`, if it is a page-aligned address inside the
    /// pool.
    fn frame_index(&self, addr: PhysicalAddress) -> Option<usize> {
        if !addr.is_page_aligned() || addr.as_u64() < self.base.as_u64() {
            return None;
        }
        let idx = ((addr.as_u64() - self.base.as_u64()) >> PAGE_SHIFT) as usize;
        (idx < self.frame_count).then_some(idx)
    }

    #[inline]
    fn table(&self) -> &[FrameInfo] {
        // SAFETY: `frames` points at `frame_count` records placed by init;
        // the region outlives the allocator by contract.
        unsafe { core::slice::from_raw_parts(self.frames.as_ptr(), self.frame_count) }
    }

    #[inline]
    fn table_mut(&mut self) -> &mut [FrameInfo] {
        // SAFETY: as for `table`, plus `&mut self` gives exclusivity.
        unsafe { core::slice::from_raw_parts_mut(self.frames.as_ptr(), self.frame_count) }
    }

    /// Link `idx` as the head of the order-`order` free list.
    fn push_front(&mut self, order: usize, idx: usize) {
        let head = self.free_lists[order];
        let info = &mut self.table_mut()[idx];
        info.next_free = head;
        info.order = order as u8;
        info.flags.set_free_head(true);
        self.free_lists[order] = idx as u32;
    }

    /// Detach and return the head of the order-`order` free list.
    fn pop_front(&mut self, order: usize) -> Option<usize> {
        let head = self.free_lists[order];
        if head == FREE_LIST_END {
            return None;
        }
        let idx = head as usize;
        let info = &mut self.table_mut()[idx];
        let next_free = info.next_free;
        info.next_free = FREE_LIST_END;
        info.flags.set_free_head(false);
        self.free_lists[order] = next_free;
        Some(idx)
    }

    /// Unlink `idx` from the order-`order` free list. Returns whether it
    /// was present.
    fn remove(&mut self, order: usize, idx: usize) -> bool {
        let mut prev: Option<usize> = None;
        let mut cur = self.free_lists[order];
        while cur != FREE_LIST_END {
            let cur_idx = cur as usize;
            let next = self.table()[cur_idx].next_free;
            if cur_idx == idx {
                match prev {
                    Some(p) => self.table_mut()[p].next_free = next,
                    None => self.free_lists[order] = next,
                }
                let info = &mut self.table_mut()[idx];
                info.next_free = FREE_LIST_END;
                info.flags.set_free_head(false);
                return true;
            }
            prev = Some(cur_idx);
            cur = next;
        }
        false
    }

    /// Link a just-freed block and merge upwards while its buddy is free
    /// at the same order. The lower-index member heads each merged block.
    fn insert_and_coalesce(&mut self, mut idx: usize, mut order: usize) {
        while order + 1 < MAX_ORDER {
            let buddy = idx ^ (1 << order);
            if buddy >= self.frame_count {
                break;
            }
            let info = self.table()[buddy];
            if !info.flags.free_head() || usize::from(info.order) != order {
                break;
            }
            let removed = self.remove(order, buddy);
            debug_assert!(removed);
            idx = idx.min(buddy);
            order += 1;
        }
        self.push_front(order, idx);
    }

    /// One pass over orders 0..MAX_ORDER-2 merging every free buddy pair;
    /// brings the lists to canonical form after init's bulk insertion.
    fn coalesce_all(&mut self) {
        for order in 0..MAX_ORDER - 1 {
            let block = 1usize << order;
            let mut lower = 0;
            while lower + 2 * block <= self.frame_count {
                let upper = lower + block;
                let lo = self.table()[lower];
                let hi = self.table()[upper];
                if lo.flags.free_head()
                    && usize::from(lo.order) == order
                    && hi.flags.free_head()
                    && usize::from(hi.order) == order
                {
                    self.remove(order, lower);
                    self.remove(order, upper);
                    self.push_front(order + 1, lower);
                }
                lower += 2 * block;
            }
        }
    }
}

impl FrameAlloc for BuddyFrameAlloc {
    fn alloc_4k(&mut self) -> Option<PhysicalAddress> {
        self.alloc_page()
    }

    fn free_4k(&mut self, frame: PhysicalAddress) {
        self.free_page(frame);
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::PhysMapper;
    use kernel_addresses::{PAGE_SIZE, PhysicalAddress};

    /// Identity mapper: in hosted tests a "physical" address is a host
    /// pointer into the test region.
    pub struct HostMapper;

    impl PhysMapper for HostMapper {
        unsafe fn phys_to_mut<'a, T>(&self, pa: PhysicalAddress) -> &'a mut T {
            unsafe { &mut *(pa.as_u64() as *mut T) }
        }
    }

    #[repr(align(4096))]
    pub struct Aligned4K(#[allow(dead_code)] [u8; 4096]);

    /// A page-aligned chunk of host memory standing in for physical RAM.
    pub struct TestRegion {
        frames: Vec<Aligned4K>,
    }

    impl TestRegion {
        pub fn new(frame_count: usize) -> Self {
            let mut frames = Vec::with_capacity(frame_count);
            for _ in 0..frame_count {
                frames.push(Aligned4K([0u8; 4096]));
            }
            Self { frames }
        }

        pub fn start(&self) -> PhysicalAddress {
            PhysicalAddress::new(self.frames.as_ptr() as u64)
        }

        pub fn size(&self) -> u64 {
            self.frames.len() as u64 * PAGE_SIZE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::{HostMapper, TestRegion};
    use super::*;
    use std::collections::BTreeSet;

    /// Frames (64 MiB worth would be overkill; 1024 frames = 4 MiB covers
    /// every order).
    const POOL_FRAMES: usize = 1024;

    fn pool(region: &TestRegion) -> BuddyFrameAlloc {
        BuddyFrameAlloc::init(&HostMapper, region.start(), region.size()).expect("init")
    }

    impl BuddyFrameAlloc {
        /// All free block heads at `order`.
        fn free_heads(&self, order: usize) -> BTreeSet<usize> {
            let mut heads = BTreeSet::new();
            let mut cur = self.free_lists[order];
            while cur != FREE_LIST_END {
                heads.insert(cur as usize);
                cur = self.table()[cur as usize].next_free;
            }
            heads
        }

        /// Free lists per order, as comparable sets.
        fn snapshot(&self) -> Vec<BTreeSet<usize>> {
            (0..MAX_ORDER).map(|k| self.free_heads(k)).collect()
        }

        /// Check the buddy invariant and the free-frame accounting.
        fn assert_canonical(&self) {
            let mut counted = 0u64;
            for order in 0..MAX_ORDER {
                let heads = self.free_heads(order);
                counted += heads.len() as u64 * (1 << order);
                if order + 1 < MAX_ORDER {
                    for &h in &heads {
                        let buddy = h ^ (1 << order);
                        assert!(
                            !heads.contains(&buddy),
                            "buddies {h} and {buddy} both free at order {order}"
                        );
                    }
                }
            }
            assert_eq!(counted, self.free_frames, "free-list accounting drifted");
        }
    }

    #[test]
    fn init_reserves_metadata_and_reports_stats() {
        // 16 MiB worth of frames: 4096 frames, 8 of them metadata
        // (4096 records * 8 bytes = 32 KiB).
        let region = TestRegion::new(4096);
        let mut pool = pool(&region);

        let stats = pool.stats();
        assert_eq!(stats.total_frames, 4096);
        assert_eq!(stats.free_frames, 4096 - 8);

        // Metadata frames are flagged reserved and refuse to be freed.
        let flags = pool.frame_flags(region.start()).expect("in pool");
        assert!(flags.reserved());
        pool.free_page(region.start());
        assert_eq!(pool.stats(), stats);
        pool.assert_canonical();
    }

    #[test]
    fn alloc_and_free_restore_stats() {
        let region = TestRegion::new(POOL_FRAMES);
        let mut pool = pool(&region);
        let baseline = pool.stats().free_frames;

        let mut pages = Vec::new();
        for _ in 0..10 {
            pages.push(pool.alloc_page().expect("page"));
        }
        let run = pool.alloc(2).expect("order-2 block");
        assert_eq!(pool.stats().free_frames, baseline - 10 - 4);

        pool.free(run, 2);
        for pa in pages {
            pool.free_page(pa);
        }
        assert_eq!(pool.stats().free_frames, baseline);
        pool.assert_canonical();
    }

    #[test]
    fn split_then_free_restores_exact_state() {
        let region = TestRegion::new(POOL_FRAMES);
        let mut pool = pool(&region);

        for order in [0usize, 1, 3, 7] {
            let before = pool.snapshot();
            let pa = pool.alloc(order).expect("block");
            pool.free(pa, order);
            assert_eq!(pool.snapshot(), before, "order {order} round trip");
            pool.assert_canonical();
        }
    }

    #[test]
    fn invariant_holds_across_interleavings() {
        let region = TestRegion::new(POOL_FRAMES);
        let mut pool = pool(&region);
        let baseline = pool.stats().free_frames;

        let mut live: Vec<(PhysicalAddress, usize)> = Vec::new();
        // A deterministic interleaving touching several orders.
        for step in 0..64usize {
            let order = step % 4;
            if step % 3 == 0 && !live.is_empty() {
                let (pa, k) = live.remove(step % live.len());
                pool.free(pa, k);
            } else if let Some(pa) = pool.alloc(order) {
                live.push((pa, order));
            }
            pool.assert_canonical();
            let held: u64 = live.iter().map(|(_, k)| 1u64 << k).sum();
            assert_eq!(pool.stats().free_frames, baseline - held);
        }
        for (pa, k) in live {
            pool.free(pa, k);
        }
        assert_eq!(pool.stats().free_frames, baseline);
    }

    #[test]
    fn exhaustion_and_symmetric_release() {
        let region = TestRegion::new(128);
        let mut pool = pool(&region);
        let baseline = pool.stats().free_frames;

        let mut pages = Vec::new();
        while let Some(pa) = pool.alloc_page() {
            pages.push(pa);
        }
        assert_eq!(pages.len() as u64, baseline);
        assert_eq!(pool.stats().free_frames, 0);
        assert!(pool.alloc_page().is_none());

        for pa in pages {
            pool.free_page(pa);
        }
        assert_eq!(pool.stats().free_frames, baseline);
        pool.assert_canonical();
    }

    #[test]
    fn max_order_needs_a_contiguous_run() {
        let region = TestRegion::new(4096);
        let mut pool = pool(&region);

        // 4088 free frames contain aligned 1024-frame runs.
        let big = pool.alloc(MAX_ORDER - 1).expect("max-order block");
        pool.free(big, MAX_ORDER - 1);
        assert!(pool.alloc(MAX_ORDER - 1).is_some());

        // A 128-frame pool can never satisfy order 10.
        let small_region = TestRegion::new(128);
        let mut small = BuddyFrameAlloc::init(
            &HostMapper,
            small_region.start(),
            small_region.size(),
        )
        .expect("init");
        assert!(small.alloc(MAX_ORDER - 1).is_none());
    }

    #[test]
    fn misuse_is_a_guarded_no_op() {
        let region = TestRegion::new(POOL_FRAMES);
        let mut pool = pool(&region);
        let baseline = pool.stats();

        // Out-of-range order.
        assert!(pool.alloc(MAX_ORDER).is_none());

        let pa = pool.alloc(1).expect("block");

        // Wrong order on free: nothing happens.
        pool.free(pa, 2);
        assert_eq!(pool.stats().free_frames, baseline.free_frames - 2);

        // Correct free, then a double free that must not corrupt anything.
        pool.free(pa, 1);
        pool.free(pa, 1);
        assert_eq!(pool.stats(), baseline);
        pool.assert_canonical();

        // Frees outside the pool are ignored.
        pool.free_page(PhysicalAddress::new(0x10));
        pool.free(PhysicalAddress::new(0), 0);
        assert_eq!(pool.stats(), baseline);
    }

    #[test]
    fn reference_counts_defer_release() {
        let region = TestRegion::new(POOL_FRAMES);
        let mut pool = pool(&region);
        let baseline = pool.stats().free_frames;

        let pa = pool.alloc_page().expect("page");
        assert_eq!(pool.ref_count(pa), 1);

        pool.retain(pa);
        assert_eq!(pool.ref_count(pa), 2);

        // First release only drops the count.
        pool.free_page(pa);
        assert_eq!(pool.ref_count(pa), 1);
        assert_eq!(pool.stats().free_frames, baseline - 1);

        // Second release returns the frame.
        pool.free_page(pa);
        assert_eq!(pool.ref_count(pa), 0);
        assert_eq!(pool.stats().free_frames, baseline);

        // Retaining a free frame is refused.
        pool.retain(pa);
        assert_eq!(pool.ref_count(pa), 0);
    }

    #[test]
    fn region_alignment_is_normalized() {
        // Hand the pool a start address 123 bytes into a page; it must
        // align up and still come out consistent.
        let region = TestRegion::new(64);
        let start = PhysicalAddress::new(region.start().as_u64() + 123);
        let pool = BuddyFrameAlloc::init(&HostMapper, start, region.size() - 123)
            .expect("init");
        // One frame is lost to alignment.
        assert_eq!(pool.stats().total_frames, 63);
        pool.assert_canonical();
    }

    #[test]
    fn tiny_regions_are_rejected() {
        let region = TestRegion::new(1);
        // One frame cannot hold metadata plus a free frame.
        let err = BuddyFrameAlloc::init(&HostMapper, region.start(), region.size());
        assert_eq!(err.err(), Some(FrameAllocError::RegionTooSmall));

        let err = BuddyFrameAlloc::init(&HostMapper, region.start(), 100);
        assert_eq!(err.err(), Some(FrameAllocError::RegionTooSmall));
    }
}
