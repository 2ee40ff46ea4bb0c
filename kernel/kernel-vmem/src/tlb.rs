//! TLB maintenance primitives.
//!
//! A single-address `invlpg` follows every edit to the active space; a
//! full flush is reserved for the rare cases where a range is unknown.
//! Address-space switches do not come through here — the CR3 write itself
//! drops all non-global entries.
//!
//! On hosted builds (the test suite) both operations compile to no-ops:
//! there is no TLB to maintain and the instructions are privileged.

use kernel_addresses::VirtualAddress;

/// Evict the cached translation for the page containing `va` on this CPU.
#[inline]
pub fn invalidate_page(va: VirtualAddress) {
    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    unsafe {
        core::arch::asm!("invlpg [{}]", in(reg) va.as_u64(), options(nostack, preserves_flags));
    }
    #[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
    let _ = va;
}

/// Flush the entire TLB (non-global entries) by reloading CR3.
#[inline]
pub fn flush_all() {
    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    unsafe {
        let cr3: u64;
        core::arch::asm!("mov {}, cr3", out(reg) cr3, options(nomem, nostack, preserves_flags));
        core::arch::asm!("mov cr3, {}", in(reg) cr3, options(nostack, preserves_flags));
    }
}
