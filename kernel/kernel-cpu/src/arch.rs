//! The unsafe bottom of the CPU core: CR3 access and the register-file
//! switch routine. Everything above this module is platform-independent.
//!
//! ## The switch routine
//!
//! `__context_switch(old, new)` saves the caller's full register file,
//! RFLAGS, return RIP and stack pointer into `old` (unless `old` is null:
//! a first switch has nothing to save), then restores `new` and jumps to
//! its recorded instruction pointer. CR3 is reloaded only when `new`
//! carries a root that differs from the live one — a reload would flush
//! the TLB even for a same-space switch. A zero root skips the privileged
//! CR3 accesses entirely; that is both the "stay in the current space"
//! encoding and what lets the hosted test suite drive real switches in
//! user mode.
//!
//! The caller holds interrupts disabled across the switch; this routine
//! does not mask them itself.

use crate::context::KernelContext;

/// Physical address of the live page-table root, or 0 where CR3 cannot be
/// read (hosted builds).
#[inline]
#[must_use]
pub fn read_cr3() -> u64 {
    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    {
        let v: u64;
        unsafe {
            core::arch::asm!("mov {}, cr3", out(reg) v, options(nomem, nostack, preserves_flags));
        }
        v
    }
    #[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
    {
        0
    }
}

/// Load `root` into CR3, replacing the active address space.
///
/// # Safety
/// `root` must be the page-aligned physical address of a valid top-level
/// page table that maps the executing code and stack. Requires ring 0.
#[inline]
pub unsafe fn write_cr3(root: u64) {
    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    unsafe {
        core::arch::asm!("mov cr3, {}", in(reg) root, options(nostack, preserves_flags));
    }
    #[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
    let _ = root;
}

#[cfg(target_arch = "x86_64")]
unsafe extern "C" {
    fn __context_switch(old: *mut KernelContext, new: *const KernelContext);
}

/// Save the current register file into `old` (when non-null) and resume
/// `new`.
///
/// Control returns to the caller only when some later switch restores the
/// record saved in `old`.
///
/// # Safety
/// - `new` must point to a valid, fully initialized [`KernelContext`]
///   whose stack and instruction pointer are live in the address space
///   that will be active after the switch.
/// - `old`, when non-null, must point to a writable [`KernelContext`].
/// - The caller must have interrupts disabled.
#[inline]
pub unsafe fn switch_stacks_and_regs(old: *mut KernelContext, new: *const KernelContext) {
    #[cfg(target_arch = "x86_64")]
    unsafe {
        __context_switch(old, new);
    }
    #[cfg(not(target_arch = "x86_64"))]
    {
        let _ = (old, new);
        unimplemented!("context switch is x86-64 only");
    }
}

// Register-file offsets inside `KernelContext`; kept in lockstep with the
// struct by the const assertions in `context`.
#[cfg(target_arch = "x86_64")]
core::arch::global_asm!(
    ".global __context_switch",
    "__context_switch:",
    // rdi = old (may be null), rsi = new.
    "test rdi, rdi",
    "jz 2f",
    // Save the caller's register file. rax/rcx become scratch afterwards;
    // their entry values are already in the record.
    "mov [rdi + 0x00], rax",
    "mov [rdi + 0x08], rbx",
    "mov [rdi + 0x10], rcx",
    "mov [rdi + 0x18], rdx",
    "mov [rdi + 0x20], rsi",
    "mov [rdi + 0x28], rdi",
    "mov [rdi + 0x30], rbp",
    "mov [rdi + 0x38], r8",
    "mov [rdi + 0x40], r9",
    "mov [rdi + 0x48], r10",
    "mov [rdi + 0x50], r11",
    "mov [rdi + 0x58], r12",
    "mov [rdi + 0x60], r13",
    "mov [rdi + 0x68], r14",
    "mov [rdi + 0x70], r15",
    // Resume state: the stack as it will be after our return address is
    // popped, and that return address as the resume RIP.
    "lea rax, [rsp + 8]",
    "mov [rdi + 0x78], rax",
    "mov rax, [rsp]",
    "mov [rdi + 0x80], rax",
    "pushfq",
    "pop rax",
    "mov [rdi + 0x88], rax",
    // Record the live root and reload CR3 only on a real space change.
    // A zero root in `new` skips the privileged accesses.
    "mov rax, [rsi + 0x90]",
    "test rax, rax",
    "jz 3f",
    "mov rcx, cr3",
    "mov [rdi + 0x90], rcx",
    "cmp rax, rcx",
    "je 3f",
    "mov cr3, rax",
    "jmp 3f",
    // First switch: nothing to save, but the target root still needs to be
    // honored.
    "2:",
    "mov rax, [rsi + 0x90]",
    "test rax, rax",
    "jz 3f",
    "mov rcx, cr3",
    "cmp rax, rcx",
    "je 3f",
    "mov cr3, rax",
    // Restore the target register file and jump to its resume point.
    "3:",
    "mov rsp, [rsi + 0x78]",
    "mov rax, [rsi + 0x80]",
    "push rax",
    "mov rax, [rsi + 0x88]",
    "push rax",
    "popfq",
    "mov rax, [rsi + 0x00]",
    "mov rbx, [rsi + 0x08]",
    "mov rcx, [rsi + 0x10]",
    "mov rdx, [rsi + 0x18]",
    "mov rbp, [rsi + 0x30]",
    "mov r8,  [rsi + 0x38]",
    "mov r9,  [rsi + 0x40]",
    "mov r10, [rsi + 0x48]",
    "mov r11, [rsi + 0x50]",
    "mov r12, [rsi + 0x58]",
    "mov r13, [rsi + 0x60]",
    "mov r14, [rsi + 0x68]",
    "mov r15, [rsi + 0x70]",
    "mov rdi, [rsi + 0x28]",
    "mov rsi, [rsi + 0x20]",
    "ret",
);
