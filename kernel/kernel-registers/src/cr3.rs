use bitfield_struct::bitfield;
use kernel_addresses::PhysicalAddress;

#[cfg(feature = "asm")]
use crate::{LoadRegisterUnsafe, StoreRegisterUnsafe};

/// CR3 — top-level page-table base register (IA-32e, PCID disabled).
///
/// Holds the physical base address of the root page table and cache-control
/// flags for root-table walks. Assumes standard 4 KiB alignment and no PCID
/// (CR4.PCIDE = 0). Writing it replaces the active address space and
/// self-invalidates all non-global TLB entries.
#[bitfield(u64)]
pub struct Cr3 {
    /// Bits 0–2 — Reserved (must be 0).
    #[bits(3)]
    pub reserved0: u8,

    /// Bit 3 — PWT: Page-level Write-Through for the root table.
    pub pwt: bool,

    /// Bit 4 — PCD: Page-level Cache Disable for the root table.
    pub pcd: bool,

    /// Bits 5–11 — Reserved (must be 0 when written).
    #[bits(7)]
    pub reserved1: u8,

    /// Bits 12–51 — root-table physical base >> 12.
    ///
    /// The full physical address is `root_base_4k << 12` (4 KiB alignment).
    #[bits(40)]
    root_base_4k: u64,

    /// Bits 52–63 — Reserved.
    #[bits(12)]
    pub reserved2: u16,
}

impl Cr3 {
    /// Create a `Cr3` value from a root-table physical base address.
    ///
    /// `root_phys` must be 4 KiB-aligned.
    #[must_use]
    pub fn from_root_phys(root_phys: PhysicalAddress) -> Self {
        debug_assert!(root_phys.is_page_aligned(), "root table must be 4K-aligned");
        Self::new().with_root_base_4k(root_phys.as_u64() >> 12)
    }

    /// Return the full physical address of the root-table base.
    #[must_use]
    pub fn root_phys(&self) -> PhysicalAddress {
        PhysicalAddress::new(self.root_base_4k() << 12)
    }
}

#[cfg(feature = "asm")]
impl LoadRegisterUnsafe for Cr3 {
    unsafe fn load_unsafe() -> Self {
        let cr3: u64;
        unsafe {
            core::arch::asm!("mov {}, cr3", out(reg) cr3, options(nomem, nostack, preserves_flags));
        }
        Self::from_bits(cr3)
    }
}

#[cfg(feature = "asm")]
impl StoreRegisterUnsafe for Cr3 {
    unsafe fn store_unsafe(self) {
        let cr3 = self.into_bits();
        unsafe {
            core::arch::asm!("mov cr3, {}", in(reg) cr3, options(nostack, preserves_flags));
        }
    }
}
