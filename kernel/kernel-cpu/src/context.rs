//! Kernel-thread context records and the switch between them.
//!
//! A [`KernelContext`] is the minimum snapshot needed to resume a thread
//! where it yielded: the full general-purpose register file, stack and
//! instruction pointers, RFLAGS, and the page-table root active at save
//! time. Records live in single frames drawn from the frame allocator
//! ([`prepare_kernel_thread`] for new threads, lazily inside
//! [`switch_context`] for first-time saves) and are returned at thread
//! teardown through [`release_context`].
//!
//! From this module's perspective a thread moves through:
//!
//! ```text
//! prepared ──first switch──► running ──switch out──► saved
//!     ▲                                                │
//!     └────────────── destroyed ◄──────────────────────┴─(switch in ⇢ running)
//! ```
//!
//! The scheduler driving these transitions lives in a higher layer.

use crate::arch;
use core::mem::offset_of;
use core::ptr::NonNull;
use kernel_addresses::{PhysicalAddress, VirtualAddress};
use kernel_registers::Rflags;
use kernel_vmem::{FrameAlloc, PhysMapper};

/// Entry point of a kernel thread. Receives the argument passed to
/// [`prepare_kernel_thread`] and must never return: the prepared stack
/// carries a zero return address, so falling off the end jumps to address
/// zero and faults deterministically.
pub type ThreadEntry = extern "C" fn(u64) -> !;

/// The register snapshot of one kernel thread.
///
/// Layout is `#[repr(C)]` and mirrored by the assembly in [`arch`]; the
/// constants below pin every offset.
#[repr(C)]
#[derive(Debug)]
pub struct KernelContext {
    pub rax: u64,
    pub rbx: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub rbp: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
    pub rsp: u64,
    pub rip: u64,
    pub rflags: u64,
    /// Page-table root to activate with this thread; 0 keeps the live one.
    pub cr3: u64,
    /// Backing frame of this record when allocator-owned; 0 for records in
    /// caller-provided storage. Not architectural state.
    frame: u64,
}

const _: () = {
    assert!(offset_of!(KernelContext, rax) == 0x00);
    assert!(offset_of!(KernelContext, rbx) == 0x08);
    assert!(offset_of!(KernelContext, rcx) == 0x10);
    assert!(offset_of!(KernelContext, rdx) == 0x18);
    assert!(offset_of!(KernelContext, rsi) == 0x20);
    assert!(offset_of!(KernelContext, rdi) == 0x28);
    assert!(offset_of!(KernelContext, rbp) == 0x30);
    assert!(offset_of!(KernelContext, r8) == 0x38);
    assert!(offset_of!(KernelContext, r9) == 0x40);
    assert!(offset_of!(KernelContext, r10) == 0x48);
    assert!(offset_of!(KernelContext, r11) == 0x50);
    assert!(offset_of!(KernelContext, r12) == 0x58);
    assert!(offset_of!(KernelContext, r13) == 0x60);
    assert!(offset_of!(KernelContext, r14) == 0x68);
    assert!(offset_of!(KernelContext, r15) == 0x70);
    assert!(offset_of!(KernelContext, rsp) == 0x78);
    assert!(offset_of!(KernelContext, rip) == 0x80);
    assert!(offset_of!(KernelContext, rflags) == 0x88);
    assert!(offset_of!(KernelContext, cr3) == 0x90);
    assert!(size_of::<KernelContext>() <= 4096);
};

impl KernelContext {
    /// An all-zero record in caller-provided storage.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            rax: 0,
            rbx: 0,
            rcx: 0,
            rdx: 0,
            rsi: 0,
            rdi: 0,
            rbp: 0,
            r8: 0,
            r9: 0,
            r10: 0,
            r11: 0,
            r12: 0,
            r13: 0,
            r14: 0,
            r15: 0,
            rsp: 0,
            rip: 0,
            rflags: 0,
            cr3: 0,
            frame: 0,
        }
    }
}

impl Default for KernelContext {
    fn default() -> Self {
        Self::new()
    }
}

/// Build the initial context of a kernel thread.
///
/// - `arg` lands in RDI, the first integer-argument register of the ABI.
/// - The stack pointer starts at `stack_top - 8` with a zero sentinel
///   return address written there; RBP gets the same value.
/// - RFLAGS is the minimal interrupts-enabled state.
/// - The current page-table root is captured, so the thread runs in the
///   address space active right now; amend `cr3` before the first switch
///   to start it elsewhere.
///
/// Returns `None` when no frame is available for the record.
///
/// # Safety
/// - `stack_top` must be the exclusive top of a writable, mapped stack in
///   the current address space, 8-byte aligned, with at least one usable
///   word below it.
/// - `mapper` must map allocator frames writable (see [`PhysMapper`]).
pub unsafe fn prepare_kernel_thread<M: PhysMapper, A: FrameAlloc>(
    mapper: &M,
    alloc: &mut A,
    entry: ThreadEntry,
    arg: u64,
    stack_top: VirtualAddress,
) -> Option<NonNull<KernelContext>> {
    debug_assert!(stack_top.as_u64() % 8 == 0, "stack top must be aligned");

    let frame = alloc.alloc_4k()?;
    let ctx: &mut KernelContext = unsafe { mapper.phys_to_mut(frame) };
    *ctx = KernelContext::new();
    ctx.frame = frame.as_u64();

    let rsp = stack_top.as_u64() - size_of::<u64>() as u64;
    // Sentinel return address: an accidental return halts at address zero
    // instead of running off into whatever follows the stack.
    unsafe { core::ptr::write(rsp as *mut u64, 0) };

    ctx.rdi = arg;
    ctx.rsp = rsp;
    ctx.rbp = rsp;
    ctx.rip = entry as usize as u64;
    ctx.rflags = Rflags::kernel_thread_default().into_bits();
    ctx.cr3 = arch::read_cr3();
    Some(NonNull::from(ctx))
}

/// Yield to `new`, saving the current thread into `*old_slot`.
///
/// Semantics:
/// - `new == None` is a no-op (which also covers the all-null call).
/// - `old_slot == None` is a **first switch**: nothing is saved and the
///   call never returns.
/// - An empty slot is filled with a freshly allocated zeroed record; if
///   that allocation fails the switch is aborted without touching the
///   running thread.
///
/// The caller must hold interrupts disabled across the call; the switch
/// does not mask them itself. Control returns (with the old thread's
/// registers restored exactly) when some later switch resumes the saved
/// record.
///
/// # Safety
/// - `new` must point to a valid prepared or saved [`KernelContext`]
///   whose stack and instruction pointer are live in the address space
///   that will be active after the switch.
/// - The record behind `*old_slot` must stay allocated until the thread
///   is resumed or released.
pub unsafe fn switch_context<M: PhysMapper, A: FrameAlloc>(
    mapper: &M,
    alloc: &mut A,
    old_slot: Option<&mut Option<NonNull<KernelContext>>>,
    new: Option<NonNull<KernelContext>>,
) {
    let Some(new) = new else {
        return;
    };

    match old_slot {
        None => {
            // First switch: nothing to save.
            unsafe { arch::switch_stacks_and_regs(core::ptr::null_mut(), new.as_ptr()) };
        }
        Some(slot) => {
            if slot.is_none() {
                let Some(frame) = alloc.alloc_4k() else {
                    log::warn!("no frame for a context record; switch aborted");
                    return;
                };
                let ctx: &mut KernelContext = unsafe { mapper.phys_to_mut(frame) };
                *ctx = KernelContext::new();
                ctx.frame = frame.as_u64();
                *slot = Some(NonNull::from(ctx));
            }
            let old = slot.expect("slot filled above").as_ptr();
            unsafe { arch::switch_stacks_and_regs(old, new.as_ptr()) };
        }
    }
}

/// Return a context record's frame to the allocator at thread teardown.
///
/// Records in caller-provided storage (never allocator-owned) are left
/// alone.
///
/// # Safety
/// `ctx` must not be used again: the thread it belonged to is gone.
pub unsafe fn release_context<A: FrameAlloc>(alloc: &mut A, ctx: NonNull<KernelContext>) {
    let frame = unsafe { ctx.as_ref() }.frame;
    if frame != 0 {
        alloc.free_4k(PhysicalAddress::new(frame));
    }
}
