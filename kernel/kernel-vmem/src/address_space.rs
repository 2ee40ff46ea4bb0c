//! A single PML4-rooted address space and the operations that edit it.
//!
//! This type owns no memory itself: the tree lives in physical frames
//! delivered by a [`FrameAlloc`] and reached through a [`PhysMapper`]. TLB
//! maintenance is **not** performed here; the
//! [`AddressSpaceManager`](crate::AddressSpaceManager) layers it on for
//! edits to the active space.

use crate::table::{ENTRY_COUNT, KERNEL_HALF_START, TableIndex, split_indices};
use crate::{FrameAlloc, MapError, PageEntryBits, PhysMapper, get_table};
use kernel_addresses::{PhysicalAddress, VirtualAddress};

/// Handle to a single, concrete address space.
pub struct AddressSpace<'m, M: PhysMapper> {
    /// Physical address of the PML4 frame, as loaded into CR3.
    root: PhysicalAddress,
    mapper: &'m M,
}

impl<'m, M: PhysMapper> AddressSpace<'m, M> {
    /// View the tree rooted at `root` (the PML4 frame's physical address).
    #[inline]
    pub const fn from_root(mapper: &'m M, root: PhysicalAddress) -> Self {
        Self { root, mapper }
    }

    /// Physical address of the PML4 frame.
    #[inline]
    #[must_use]
    pub const fn root(&self) -> PhysicalAddress {
        self.root
    }

    /// Copy the kernel half of the root table (entries 256..512) from
    /// `src`. Called once at creation; the kernel half is never edited
    /// per-space afterwards.
    pub(crate) fn copy_kernel_entries_from(&self, src: PhysicalAddress) {
        let dst_root = unsafe { get_table(self.mapper, self.root) };
        let src_root = unsafe { get_table(self.mapper, src) };
        for i in KERNEL_HALF_START..ENTRY_COUNT {
            let idx = TableIndex::new(i as u16);
            dst_root.set_entry(idx, src_root.entry(idx));
        }
    }

    /// Map one 4 KiB page at `va → pa` with `flags`.
    ///
    /// Missing intermediate tables are allocated (zeroed) on demand and
    /// linked present+writable+user so per-page restrictions are enforced
    /// at the leaf. The present bit is ORed into `flags`, so callers pass
    /// only semantic flags.
    ///
    /// # Errors
    /// [`MapError::OutOfMemory`] when an intermediate table cannot be
    /// allocated.
    pub fn map_one<A: FrameAlloc>(
        &self,
        alloc: &mut A,
        va: VirtualAddress,
        pa: PhysicalAddress,
        flags: PageEntryBits,
    ) -> Result<(), MapError> {
        debug_assert!(va.is_page_aligned(), "virtual address not aligned");
        debug_assert!(pa.is_page_aligned(), "physical address not aligned");

        let (i4, i3, i2, i1) = split_indices(va);

        let pdpt = self.ensure_next(alloc, self.root, i4)?;
        let pd = self.ensure_next(alloc, pdpt, i3)?;
        let pt = self.ensure_next(alloc, pd, i2)?;

        let leaf = flags.with_present(true).with_physical_address(pa);
        let table = unsafe { get_table(self.mapper, pt) };
        table.set_entry(i1, leaf);
        Ok(())
    }

    /// Walk one level: return the table linked at `index` of the table at
    /// `table_pa`, allocating and linking a zeroed one if absent.
    fn ensure_next<A: FrameAlloc>(
        &self,
        alloc: &mut A,
        table_pa: PhysicalAddress,
        index: TableIndex,
    ) -> Result<PhysicalAddress, MapError> {
        let table = unsafe { get_table(self.mapper, table_pa) };
        let entry = table.entry(index);
        if entry.present() {
            debug_assert!(!entry.large_page(), "4 KiB walk hit a huge-page leaf");
            return Ok(entry.physical_address());
        }

        let frame = alloc.alloc_4k().ok_or(MapError::OutOfMemory)?;
        debug_assert!(frame.is_page_aligned());
        unsafe { get_table(self.mapper, frame) }.zero();
        table.set_entry(
            index,
            PageEntryBits::intermediate().with_physical_address(frame),
        );
        Ok(frame)
    }

    /// Clear the leaf entry for `va` if present.
    ///
    /// Returns whether a mapping was removed; unmapping an unmapped address
    /// is benign. Empty leaf tables are left in place — reclaiming them
    /// happens wholesale in [`release_frames`](Self::release_frames).
    pub fn unmap_one(&self, va: VirtualAddress) -> bool {
        let (_, _, _, i1) = split_indices(va);
        let Some(pt) = self.leaf_table(va) else {
            return false;
        };
        let table = unsafe { get_table(self.mapper, pt) };
        if !table.entry(i1).present() {
            return false;
        }
        table.set_entry(i1, PageEntryBits::new());
        true
    }

    /// Translate `va` to a physical address if mapped.
    ///
    /// Handles 1 GiB and 2 MiB leaves by adding the appropriate in-page
    /// offset, even though this space never installs them itself.
    #[must_use]
    pub fn translate(&self, va: VirtualAddress) -> Option<PhysicalAddress> {
        let (i4, i3, i2, i1) = split_indices(va);

        let root = unsafe { get_table(self.mapper, self.root) };
        let e4 = root.entry(i4);
        if !e4.present() {
            return None;
        }

        let pdpt = unsafe { get_table(self.mapper, e4.physical_address()) };
        let e3 = pdpt.entry(i3);
        if !e3.present() {
            return None;
        }
        if e3.large_page() {
            let off = va.as_u64() & ((1 << 30) - 1);
            return Some(e3.physical_address() + off);
        }

        let pd = unsafe { get_table(self.mapper, e3.physical_address()) };
        let e2 = pd.entry(i2);
        if !e2.present() {
            return None;
        }
        if e2.large_page() {
            let off = va.as_u64() & ((1 << 21) - 1);
            return Some(e2.physical_address() + off);
        }

        let pt = unsafe { get_table(self.mapper, e2.physical_address()) };
        let e1 = pt.entry(i1);
        if !e1.present() {
            return None;
        }
        Some(e1.physical_address() + va.page_offset())
    }

    /// Whether `va` currently resolves to a physical address.
    #[inline]
    #[must_use]
    pub fn is_mapped(&self, va: VirtualAddress) -> bool {
        self.translate(va).is_some()
    }

    /// The low flag bits of the leaf entry for `va`, if mapped as a 4 KiB
    /// page.
    #[must_use]
    pub fn page_flags(&self, va: VirtualAddress) -> Option<PageEntryBits> {
        let e = self.leaf_entry(va)?;
        Some(PageEntryBits::from_bits(e.low_flags()))
    }

    /// OR the low flag bits of `flags` into the leaf entry for `va`.
    ///
    /// Returns whether the entry existed.
    pub fn set_page_flags(&self, va: VirtualAddress, flags: PageEntryBits) -> bool {
        self.update_leaf(va, |e| e.union_low_flags(flags))
    }

    /// Clear the low flag bits of `flags` from the leaf entry for `va`
    /// (AND-NOT). The present bit can be cleared this way; the frame field
    /// is never touched.
    ///
    /// Returns whether the entry existed.
    pub fn clear_page_flags(&self, va: VirtualAddress, flags: PageEntryBits) -> bool {
        self.update_leaf(va, |e| e.clear_low_flags(flags))
    }

    /// Walk to the leaf page table for `va` (present non-huge chain only).
    fn leaf_table(&self, va: VirtualAddress) -> Option<PhysicalAddress> {
        let (i4, i3, i2, _) = split_indices(va);

        let root = unsafe { get_table(self.mapper, self.root) };
        let e4 = root.entry(i4);
        if !e4.present() {
            return None;
        }
        let pdpt = unsafe { get_table(self.mapper, e4.physical_address()) };
        let e3 = pdpt.entry(i3);
        if !e3.present() || e3.large_page() {
            return None;
        }
        let pd = unsafe { get_table(self.mapper, e3.physical_address()) };
        let e2 = pd.entry(i2);
        if !e2.present() || e2.large_page() {
            return None;
        }
        Some(e2.physical_address())
    }

    /// The raw leaf entry for `va`, if present.
    fn leaf_entry(&self, va: VirtualAddress) -> Option<PageEntryBits> {
        let (_, _, _, i1) = split_indices(va);
        let pt = self.leaf_table(va)?;
        let e = unsafe { get_table(self.mapper, pt) }.entry(i1);
        e.present().then_some(e)
    }

    fn update_leaf(
        &self,
        va: VirtualAddress,
        f: impl FnOnce(PageEntryBits) -> PageEntryBits,
    ) -> bool {
        let (_, _, _, i1) = split_indices(va);
        let Some(pt) = self.leaf_table(va) else {
            return false;
        };
        let table = unsafe { get_table(self.mapper, pt) };
        let e = table.entry(i1);
        if !e.present() {
            return false;
        }
        table.set_entry(i1, f(e));
        true
    }

    /// Tear the user half of the tree down: return every present 4 KiB
    /// leaf frame, then the page-table frames bottom-up, then the root
    /// itself, all through `alloc`.
    ///
    /// Frames go back through [`FrameAlloc::free_4k`], so shared leaf
    /// frames with a remaining reference survive. The kernel half is left
    /// alone — its tables are shared with every other space.
    pub(crate) fn release_frames<A: FrameAlloc>(self, alloc: &mut A) {
        let root = unsafe { get_table(self.mapper, self.root) };
        for i4 in 0..KERNEL_HALF_START {
            let e4 = root.entry(TableIndex::new(i4 as u16));
            if !e4.present() {
                continue;
            }
            let pdpt_pa = e4.physical_address();
            let pdpt = unsafe { get_table(self.mapper, pdpt_pa) };
            for i3 in 0..ENTRY_COUNT {
                let e3 = pdpt.entry(TableIndex::new(i3 as u16));
                if !e3.present() || e3.large_page() {
                    debug_assert!(!e3.large_page(), "huge leaf in managed space");
                    continue;
                }
                let pd_pa = e3.physical_address();
                let pd = unsafe { get_table(self.mapper, pd_pa) };
                for i2 in 0..ENTRY_COUNT {
                    let e2 = pd.entry(TableIndex::new(i2 as u16));
                    if !e2.present() || e2.large_page() {
                        debug_assert!(!e2.large_page(), "huge leaf in managed space");
                        continue;
                    }
                    let pt_pa = e2.physical_address();
                    let pt = unsafe { get_table(self.mapper, pt_pa) };
                    for i1 in 0..ENTRY_COUNT {
                        let e1 = pt.entry(TableIndex::new(i1 as u16));
                        if e1.present() {
                            alloc.free_4k(e1.physical_address());
                        }
                    }
                    alloc.free_4k(pt_pa);
                }
                alloc.free_4k(pd_pa);
            }
            alloc.free_4k(pdpt_pa);
        }
        alloc.free_4k(self.root);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{TestAlloc, TestPhys};

    const FRAMES: usize = 64;

    fn fresh_space<'m>(
        phys: &'m TestPhys,
        alloc: &mut TestAlloc,
    ) -> AddressSpace<'m, TestPhys> {
        let root = alloc.alloc_4k().expect("root frame");
        let space = AddressSpace::from_root(phys, root);
        unsafe { crate::get_table(phys, root) }.zero();
        space
    }

    #[test]
    fn map_one_creates_tables_and_leaf() {
        let phys = TestPhys::with_frames(FRAMES);
        let mut alloc = TestAlloc::new(0, FRAMES as u64);
        let space = fresh_space(&phys, &mut alloc);

        let va = VirtualAddress::new(0x0000_4000_0000_0000);
        let pa = PhysicalAddress::new(0x0000_0000_0030_0000);
        space
            .map_one(
                &mut alloc,
                va,
                pa,
                PageEntryBits::new().with_writable(true).with_global(true),
            )
            .expect("map_one");

        // Root + three intermediate levels were allocated.
        assert_eq!(alloc.live(), 4);

        // Walk the tables and verify entries were created and look sane.
        let (i4, i3, i2, i1) = split_indices(va);
        let root = unsafe { get_table(&phys, space.root()) };
        let e4 = root.entry(i4);
        assert!(e4.present());
        assert!(e4.writable());
        assert!(e4.user());

        let pdpt = unsafe { get_table(&phys, e4.physical_address()) };
        let e3 = pdpt.entry(i3);
        assert!(e3.present());
        assert!(!e3.large_page());

        let pd = unsafe { get_table(&phys, e3.physical_address()) };
        let e2 = pd.entry(i2);
        assert!(e2.present());
        assert!(!e2.large_page());

        let pt = unsafe { get_table(&phys, e2.physical_address()) };
        let e1 = pt.entry(i1);
        assert!(e1.present());
        assert!(e1.writable());
        assert!(e1.global());
        assert_eq!(e1.physical_address(), pa);
    }

    #[test]
    fn translate_round_trip_with_offset() {
        let phys = TestPhys::with_frames(FRAMES);
        let mut alloc = TestAlloc::new(0, FRAMES as u64);
        let space = fresh_space(&phys, &mut alloc);

        let va = VirtualAddress::new(0x4000_0000);
        let pa = PhysicalAddress::new(0x0001_0000);
        space
            .map_one(&mut alloc, va, pa, PageEntryBits::new().with_writable(true))
            .expect("map_one");

        let probe = VirtualAddress::new(0x4000_0123);
        assert_eq!(space.translate(probe).unwrap().as_u64(), 0x0001_0123);

        assert!(space.unmap_one(va));
        assert_eq!(space.translate(probe), None);
        assert!(!space.is_mapped(va));

        // Unmapping again is benign.
        assert!(!space.unmap_one(va));
    }

    #[test]
    fn present_is_implied_never_passed() {
        let phys = TestPhys::with_frames(FRAMES);
        let mut alloc = TestAlloc::new(0, FRAMES as u64);
        let space = fresh_space(&phys, &mut alloc);

        let va = VirtualAddress::new(0x7000_0000);
        space
            .map_one(
                &mut alloc,
                va,
                PhysicalAddress::new(0x9000),
                PageEntryBits::new(),
            )
            .expect("map_one");
        assert!(space.is_mapped(va));
    }

    #[test]
    fn flag_edits_keep_frame_and_use_or_andnot() {
        let phys = TestPhys::with_frames(FRAMES);
        let mut alloc = TestAlloc::new(0, FRAMES as u64);
        let space = fresh_space(&phys, &mut alloc);

        let va = VirtualAddress::new(0x4000_0000);
        let pa = PhysicalAddress::new(0x0001_0000);
        let rw = PageEntryBits::new().with_writable(true).with_user(true);
        space.map_one(&mut alloc, va, pa, rw).expect("map_one");

        let flags = space.page_flags(va).unwrap();
        assert!(flags.present() && flags.writable() && flags.user());

        // Revoke write access; the mapping itself stays intact.
        assert!(space.clear_page_flags(va, PageEntryBits::new().with_writable(true)));
        let flags = space.page_flags(va).unwrap();
        assert!(flags.present() && !flags.writable() && flags.user());
        assert_eq!(space.translate(va).unwrap(), pa);

        // And grant it back.
        assert!(space.set_page_flags(va, PageEntryBits::new().with_writable(true)));
        assert!(space.page_flags(va).unwrap().writable());

        // Editing an unmapped page reports absence.
        let other = VirtualAddress::new(0x5000_0000);
        assert!(!space.set_page_flags(other, PageEntryBits::new().with_writable(true)));
        assert!(space.page_flags(other).is_none());
    }

    #[test]
    fn kernel_half_copy_shares_high_mappings() {
        let phys = TestPhys::with_frames(FRAMES);
        let mut alloc = TestAlloc::new(0, FRAMES as u64);
        let kernel = fresh_space(&phys, &mut alloc);

        let kva = VirtualAddress::new(0xFFFF_FFFF_8000_0000);
        let kpa = PhysicalAddress::new(0x0020_0000);
        kernel
            .map_one(&mut alloc, kva, kpa, PageEntryBits::new().with_writable(true))
            .expect("kernel map");

        let user = fresh_space(&phys, &mut alloc);
        user.copy_kernel_entries_from(kernel.root());

        // The kernel mapping resolves identically through the new root.
        assert_eq!(user.translate(kva), Some(kpa));
        // The user half stays empty.
        assert!(!user.is_mapped(VirtualAddress::new(0x40_0000)));
    }

    #[test]
    fn release_returns_every_owned_frame() {
        let phys = TestPhys::with_frames(FRAMES);
        let mut alloc = TestAlloc::new(0, FRAMES as u64);
        let space = fresh_space(&phys, &mut alloc);

        // Two mappings in separate PDPT subtrees plus one sharing a PT,
        // each backed by a frame from the same allocator.
        for va in [
            0x0000_0000_4000_0000u64,
            0x0000_0000_4000_1000,
            0x0000_4000_0000_0000,
        ] {
            let leaf = alloc.alloc_4k().expect("leaf frame");
            space
                .map_one(
                    &mut alloc,
                    VirtualAddress::new(va),
                    leaf,
                    PageEntryBits::new().with_writable(true),
                )
                .expect("map_one");
        }

        assert!(alloc.live() > 0);

        // Teardown walks leaves first, then tables bottom-up, then the
        // root; nothing may remain outstanding.
        space.release_frames(&mut alloc);
        assert_eq!(alloc.live(), 0);
    }
}
