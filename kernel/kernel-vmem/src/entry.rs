use bitfield_struct::bitfield;
use kernel_addresses::PhysicalAddress;

/// A single 64-bit x86-64 page-table entry in its raw bitfield form.
///
/// This models the **common superset** of fields found in all four paging
/// levels (PML4E, PDPTE, PDE, PTE). A present entry either points to the
/// next-level table or, with `large_page` set at PDPT/PD level, directly
/// maps a huge physical page.
///
/// ### Bit layout
///
/// | Bits  | Name              | Meaning |
/// |-------|-------------------|----------|
/// | 0     | `P` (present)     | Valid entry if set |
/// | 1     | `RW`              | Writable if set |
/// | 2     | `US`              | User-mode accessible if set |
/// | 3     | `PWT`             | Write-through caching |
/// | 4     | `PCD`             | Disable caching |
/// | 5     | `A`               | Accessed |
/// | 6     | `D`               | Dirty (leaf only) |
/// | 7     | `PS`              | Large page flag |
/// | 8     | `G`               | Global (leaf only) |
/// | 9     | `COW`             | OS-defined: copy-on-write candidate |
/// | 10–11 | OS avail low      | Reserved for OS use |
/// | 12–51 | `addr`            | Physical frame bits [51:12] |
/// | 52–62 | OS avail high     | Reserved for OS use |
/// | 63    | `NX`              | Execute disable |
///
/// ### Notes
/// - If `present` is clear, every other bit is meaningless.
/// - `copy_on_write` (bit 9, an OS-available bit) is reserved for a future
///   copy-on-write fault path; nothing sets it yet, but flag editing keeps
///   it intact.
/// - The physical address field omits the low 12 bits, which are implicitly
///   zero due to alignment.
///
/// ### Example
/// ```rust
/// # use kernel_addresses::PhysicalAddress;
/// # use kernel_vmem::PageEntryBits;
/// let mut e = PageEntryBits::new();
/// e.set_present(true);
/// e.set_writable(true);
/// e.set_physical_address(PhysicalAddress::new(0x12000));
/// assert!(e.present());
/// assert_eq!(e.physical_address().as_u64(), 0x12000);
/// ```
#[bitfield(u64)]
pub struct PageEntryBits {
    /// Present (P, bit 0).
    pub present: bool,

    /// Writable (RW, bit 1). Clear for read-only.
    pub writable: bool,

    /// User/Supervisor (US, bit 2). Set to allow user-mode access.
    pub user: bool,

    /// Page-level write-through (PWT, bit 3).
    pub write_through: bool,

    /// Page-level cache disable (PCD, bit 4).
    pub cache_disable: bool,

    /// Accessed (A, bit 5). Set by the processor on first access.
    pub accessed: bool,

    /// Dirty (D, bit 6). Set by the processor on first write; leaf only.
    pub dirty: bool,

    /// Page size (PS, bit 7). Leaf at PDPT (1 GiB) or PD (2 MiB) level.
    pub large_page: bool,

    /// Global (G, bit 8). Survives CR3 reloads when CR4.PGE is set.
    pub global: bool,

    /// OS-defined copy-on-write marker (bit 9, architecturally ignored).
    pub copy_on_write: bool,

    /// Remaining OS-available low bits (10–11).
    #[bits(2)]
    pub os_avail: u8,

    /// Physical frame base >> 12 (bits 12–51).
    #[bits(40)]
    frame_base_4k: u64,

    /// OS-available high bits (52–62).
    #[bits(11)]
    pub os_avail_high: u16,

    /// No-execute (NX, bit 63). Requires EFER.NXE.
    pub no_execute: bool,
}

/// The low 12 bits of an entry: the per-page protection/status flags edited
/// by the flag operations.
pub(crate) const LOW_FLAGS_MASK: u64 = 0xFFF;

impl PageEntryBits {
    /// The mapped physical base address (low 12 bits zero).
    #[inline]
    #[must_use]
    pub const fn physical_address(self) -> PhysicalAddress {
        PhysicalAddress::new(self.frame_base_4k() << 12)
    }

    /// Store a physical base address (must be 4 KiB aligned).
    #[inline]
    pub fn set_physical_address(&mut self, pa: PhysicalAddress) {
        debug_assert!(pa.is_page_aligned());
        self.set_frame_base_4k(pa.as_u64() >> 12);
    }

    /// Builder form of [`set_physical_address`](Self::set_physical_address).
    #[inline]
    #[must_use]
    pub const fn with_physical_address(self, pa: PhysicalAddress) -> Self {
        debug_assert!(pa.is_page_aligned());
        self.with_frame_base_4k(pa.as_u64() >> 12)
    }

    /// The low flag bits (bits 0–11) as a raw value.
    #[inline]
    #[must_use]
    pub const fn low_flags(self) -> u64 {
        self.into_bits() & LOW_FLAGS_MASK
    }

    /// OR the low flag bits of `flags` into this entry.
    #[inline]
    #[must_use]
    pub const fn union_low_flags(self, flags: Self) -> Self {
        Self::from_bits(self.into_bits() | (flags.into_bits() & LOW_FLAGS_MASK))
    }

    /// Clear the low flag bits of `flags` from this entry (AND-NOT).
    #[inline]
    #[must_use]
    pub const fn clear_low_flags(self, flags: Self) -> Self {
        Self::from_bits(self.into_bits() & !(flags.into_bits() & LOW_FLAGS_MASK))
    }

    /// The standard link flags for a non-leaf entry: present, writable and
    /// user-accessible, so per-page restrictions are enforced at the leaf.
    #[inline]
    #[must_use]
    pub const fn intermediate() -> Self {
        Self::new().with_present(true).with_writable(true).with_user(true)
    }
}
