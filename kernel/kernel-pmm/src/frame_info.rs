use bitfield_struct::bitfield;

/// Sentinel terminating a free list (no valid frame index).
pub(crate) const FREE_LIST_END: u32 = u32::MAX;

/// Status bits of one physical frame.
#[bitfield(u8)]
pub struct FrameFlags {
    /// The frame heads a block currently linked on a free list.
    pub free_head: bool,

    /// The frame backs allocator metadata (or firmware memory) and is
    /// never handed out.
    pub reserved: bool,

    /// Pinned: must not be paged out or migrated.
    pub locked: bool,

    /// Software dirty marker maintained by higher layers.
    pub dirty: bool,

    /// Software accessed marker maintained by higher layers.
    pub accessed: bool,

    #[bits(3)]
    __: u8,
}

/// Per-frame metadata record.
///
/// One of these exists for every frame of the managed region, in an array
/// occupying the region's first (reserved) frames. A frame is in exactly
/// one of three states:
///
/// - *reserved*: `flags.reserved`, never on a free list, never allocated;
/// - *free*: `ref_count == 0`; if it heads a free block, `flags.free_head`
///   is set and `order` is the block's order;
/// - *allocated*: `ref_count >= 1`; `order` records the order it was
///   allocated at (the whole block shares the head's accounting).
#[repr(C)]
#[derive(Copy, Clone)]
pub(crate) struct FrameInfo {
    /// Index of the next free block head of the same order, or
    /// [`FREE_LIST_END`].
    pub next_free: u32,
    /// Number of owners while allocated; 0 when free.
    pub ref_count: u16,
    /// Buddy order of the block this frame heads (meaningful for free
    /// heads and allocated heads).
    pub order: u8,
    pub flags: FrameFlags,
}

impl FrameInfo {
    pub(crate) const fn unused() -> Self {
        Self {
            next_free: FREE_LIST_END,
            ref_count: 0,
            order: 0,
            flags: FrameFlags::new(),
        }
    }
}

// The metadata array is sized as frames * sizeof(FrameInfo); keep the
// record at one machine word.
const _: () = assert!(size_of::<FrameInfo>() == 8);
