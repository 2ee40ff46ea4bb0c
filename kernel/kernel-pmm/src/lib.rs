//! # Physical Frame Allocation
//!
//! A buddy allocator over one contiguous region of physical memory,
//! serving 4 KiB frames and power-of-two runs up to 4 MiB.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │           Virtual Memory Manager (kernel-vmem)      │
//! │    • page tables and regions draw 4 KiB frames      │
//! │      through the FrameAlloc seam                    │
//! └─────────────────┬───────────────────────────────────┘
//!                   │
//! ┌─────────────────▼───────────────────────────────────┐
//! │           Buddy Frame Allocator (this crate)        │
//! │    • free lists for orders 0..=10                   │
//! │    • per-frame metadata at the low end of the pool  │
//! │    • reference counts for shared frames             │
//! └─────────────────────────────────────────────────────┘
//! ```
//!
//! ## Buddy scheme
//!
//! A block of order `k` is `2^k` contiguous frames whose head frame number
//! is a multiple of `2^k` (relative to the pool base). Its buddy is the
//! block whose head differs in exactly bit `k`. Allocation splits the
//! smallest sufficient block downwards; freeing merges with the buddy as
//! long as it is wholly free at the same order. After initialization and
//! after every free, no two buddies of the same order are both free.
//!
//! ## Bookkeeping
//!
//! The per-frame metadata array ([`FrameInfo`]) lives in the first frames
//! of the managed region itself; those frames are marked reserved and are
//! never handed out. Frames carry a reference count so higher layers can
//! share pages (and, later, implement copy-on-write): [`BuddyFrameAlloc::free_page`]
//! only returns a frame to the pool once the count drops to zero.
//!
//! ## Process-wide pool
//!
//! [`global`] wraps one allocator instance in a `SyncOnceCell<SpinLock<_>>`
//! with at-most-once initialization — the shape every kernel singleton in
//! this workspace uses. A second `init` is a logged no-op.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

mod buddy;
mod frame_info;
pub mod global;

pub use buddy::{BuddyFrameAlloc, FrameAllocError, FrameAllocStats, MAX_ORDER};
pub use frame_info::FrameFlags;
