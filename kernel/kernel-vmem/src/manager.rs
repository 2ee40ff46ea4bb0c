//! Address-space lifecycle and the edit surface higher layers call.
//!
//! The manager owns the kernel root and the "current space" slot. Every
//! edit that lands in the active tree is followed by a single-address TLB
//! invalidation **before the call returns**, so subsequent accesses on the
//! issuing CPU observe the new mapping. Switching spaces rewrites CR3,
//! which self-invalidates all non-global entries.

use crate::address_space::AddressSpace;
use crate::{FrameAlloc, PageEntryBits, PhysMapper, get_table, tlb};
use kernel_addresses::{PAGE_SIZE, PhysicalAddress, VirtualAddress, align_up};

#[cfg(target_os = "none")]
use kernel_registers::{Cr3, StoreRegisterUnsafe};

/// A created address space, identified by its root table frame.
///
/// Cheap to copy; the tree itself lives in frames owned by the frame
/// allocator. Destroying a space invalidates every copy of its handle.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct Space {
    root: PhysicalAddress,
}

impl Space {
    /// Physical address of the root table, as loaded into CR3.
    #[inline]
    #[must_use]
    pub const fn root(&self) -> PhysicalAddress {
        self.root
    }
}

/// Mapping failed.
#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum MapError {
    /// No frame available for an intermediate page table.
    #[error("out of memory")]
    OutOfMemory,
}

/// Region allocation failed. Partial work has been rolled back.
#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum RegionError {
    /// No frame available for a backing page or a page table.
    #[error("out of memory")]
    OutOfMemory,
}

/// The space cannot be destroyed in its current role.
#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum DestroyError {
    /// The kernel address space is permanent.
    #[error("refusing to destroy the kernel address space")]
    KernelSpace,
    /// The caller must switch away first.
    #[error("refusing to destroy the active address space")]
    ActiveSpace,
}

/// Builds and edits address spaces, tracks which one is active, and keeps
/// the TLB coherent on the issuing CPU.
pub struct AddressSpaceManager<'m, M: PhysMapper, A: FrameAlloc> {
    mapper: &'m M,
    alloc: &'m mut A,
    kernel: Space,
    current: Space,
}

impl<'m, M: PhysMapper, A: FrameAlloc> AddressSpaceManager<'m, M, A> {
    /// Wrap an existing kernel root (built by the boot path). The kernel
    /// space starts out current.
    pub fn new(mapper: &'m M, alloc: &'m mut A, kernel_root: PhysicalAddress) -> Self {
        debug_assert!(kernel_root.is_page_aligned());
        let kernel = Space { root: kernel_root };
        Self {
            mapper,
            alloc,
            kernel,
            current: kernel,
        }
    }

    /// The permanent kernel address space.
    #[inline]
    #[must_use]
    pub const fn kernel_space(&self) -> Space {
        self.kernel
    }

    /// The space whose root is currently loaded.
    #[inline]
    #[must_use]
    pub const fn current_space(&self) -> Space {
        self.current
    }

    #[inline]
    fn is_current(&self, space: Space) -> bool {
        space == self.current
    }

    #[inline]
    fn tree(&self, space: Space) -> AddressSpace<'m, M> {
        AddressSpace::from_root(self.mapper, space.root)
    }

    /// Create a fresh address space: a zeroed root with the kernel half
    /// copied from the kernel root. `None` on allocation failure.
    pub fn create(&mut self) -> Option<Space> {
        let root = self.alloc.alloc_4k()?;
        unsafe { get_table(self.mapper, root) }.zero();

        let space = Space { root };
        self.tree(space).copy_kernel_entries_from(self.kernel.root);
        log::debug!("created address space with root {root}");
        Some(space)
    }

    /// Destroy `space`, returning every frame it owns to the allocator.
    ///
    /// Leaf frames go back through the allocator's reference-count path, so
    /// frames shared with another space survive. The kernel space and the
    /// currently loaded space are refused; global state is untouched in
    /// that case.
    ///
    /// # Errors
    /// [`DestroyError::KernelSpace`] / [`DestroyError::ActiveSpace`].
    pub fn destroy(&mut self, space: Space) -> Result<(), DestroyError> {
        if space == self.kernel {
            log::warn!("attempt to destroy the kernel address space");
            return Err(DestroyError::KernelSpace);
        }
        if self.is_current(space) {
            log::warn!("attempt to destroy the active address space");
            return Err(DestroyError::ActiveSpace);
        }
        self.tree(space).release_frames(self.alloc);
        log::debug!("destroyed address space with root {}", space.root());
        Ok(())
    }

    /// Load `space`'s root into CR3 and record it as current.
    ///
    /// The register write itself invalidates all non-global TLB entries;
    /// no further flush is required.
    ///
    /// # Safety
    /// `space` must map the currently executing code and stack (the kernel
    /// half guarantees this for spaces created here, provided the kernel
    /// root was complete at creation time).
    pub unsafe fn switch_to(&mut self, space: Space) {
        self.current = space;
        #[cfg(target_os = "none")]
        unsafe {
            Cr3::from_root_phys(space.root()).store_unsafe();
        }
    }

    /// Map one 4 KiB page at `va → pa` in `space`.
    ///
    /// Callers pass only semantic flags; the present bit is implied.
    /// Edits to the active space invalidate the TLB entry for `va` before
    /// returning.
    ///
    /// # Errors
    /// [`MapError::OutOfMemory`] when a page table cannot be allocated.
    pub fn map(
        &mut self,
        space: Space,
        va: VirtualAddress,
        pa: PhysicalAddress,
        flags: PageEntryBits,
    ) -> Result<(), MapError> {
        self.tree(space).map_one(self.alloc, va, pa, flags)?;
        if self.is_current(space) {
            tlb::invalidate_page(va);
        }
        Ok(())
    }

    /// Remove the 4 KiB mapping at `va` in `space`, if any.
    ///
    /// Returns whether a mapping was removed; unmapping an unmapped
    /// address is benign. Empty leaf tables are kept for reuse.
    pub fn unmap(&mut self, space: Space, va: VirtualAddress) -> bool {
        let removed = self.tree(space).unmap_one(va);
        if removed && self.is_current(space) {
            tlb::invalidate_page(va);
        }
        removed
    }

    /// Translate `va` in `space`, or `None` when any level is non-present.
    #[must_use]
    pub fn translate(&self, space: Space, va: VirtualAddress) -> Option<PhysicalAddress> {
        self.tree(space).translate(va)
    }

    /// Whether `va` resolves in `space`.
    #[inline]
    #[must_use]
    pub fn is_mapped(&self, space: Space, va: VirtualAddress) -> bool {
        self.translate(space, va).is_some()
    }

    /// The low flag bits of the leaf entry for `va`, if mapped.
    #[must_use]
    pub fn page_flags(&self, space: Space, va: VirtualAddress) -> Option<PageEntryBits> {
        self.tree(space).page_flags(va)
    }

    /// OR `flags` into the leaf entry for `va` (low 12 bits only), then
    /// invalidate the TLB entry if `space` is active.
    ///
    /// Returns whether the entry existed.
    pub fn set_page_flags(
        &mut self,
        space: Space,
        va: VirtualAddress,
        flags: PageEntryBits,
    ) -> bool {
        let edited = self.tree(space).set_page_flags(va, flags);
        if edited && self.is_current(space) {
            tlb::invalidate_page(va);
        }
        edited
    }

    /// Clear `flags` from the leaf entry for `va` (AND-NOT on the low 12
    /// bits), then invalidate the TLB entry if `space` is active.
    ///
    /// Returns whether the entry existed.
    pub fn clear_page_flags(
        &mut self,
        space: Space,
        va: VirtualAddress,
        flags: PageEntryBits,
    ) -> bool {
        let edited = self.tree(space).clear_page_flags(va, flags);
        if edited && self.is_current(space) {
            tlb::invalidate_page(va);
        }
        edited
    }

    /// Back `[va, va + size)` with freshly allocated frames mapped at
    /// `flags` and return the page-aligned base.
    ///
    /// The request is page-aligned outwards (base down, end up). On any
    /// failure every frame and mapping created so far is rolled back before
    /// the error is reported, so nothing leaks.
    ///
    /// # Errors
    /// [`RegionError::OutOfMemory`] when a backing frame or page table
    /// cannot be allocated.
    pub fn alloc_region(
        &mut self,
        space: Space,
        va: VirtualAddress,
        size: u64,
        flags: PageEntryBits,
    ) -> Result<VirtualAddress, RegionError> {
        let base = va.align_down_4k();
        let span = align_up(size + (va.as_u64() - base.as_u64()), PAGE_SIZE);
        let pages = span / PAGE_SIZE;

        for i in 0..pages {
            let page_va = base + i * PAGE_SIZE;
            let Some(frame) = self.alloc.alloc_4k() else {
                self.rollback_region(space, base, i);
                return Err(RegionError::OutOfMemory);
            };
            if self.map(space, page_va, frame, flags).is_err() {
                self.alloc.free_4k(frame);
                self.rollback_region(space, base, i);
                return Err(RegionError::OutOfMemory);
            }
        }
        Ok(base)
    }

    /// Free the first `pages` pages of a partially built region.
    fn rollback_region(&mut self, space: Space, base: VirtualAddress, pages: u64) {
        log::debug!("rolling back region at {base} after {pages} page(s)");
        for i in 0..pages {
            let page_va = base + i * PAGE_SIZE;
            if let Some(pa) = self.translate(space, page_va) {
                self.unmap(space, page_va);
                self.alloc.free_4k(pa.align_down_4k());
            }
        }
    }

    /// Release `[va, va + size)`: translate each page, return its frame to
    /// the allocator, and unmap it. Holes in the range are skipped.
    pub fn free_region(&mut self, space: Space, va: VirtualAddress, size: u64) {
        let base = va.align_down_4k();
        let span = align_up(size + (va.as_u64() - base.as_u64()), PAGE_SIZE);
        let pages = span / PAGE_SIZE;

        for i in 0..pages {
            let page_va = base + i * PAGE_SIZE;
            if let Some(pa) = self.translate(space, page_va) {
                self.alloc.free_4k(pa.align_down_4k());
                self.unmap(space, page_va);
            }
        }
    }
}
