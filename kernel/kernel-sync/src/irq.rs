//! Interrupt save/disable/restore.
//!
//! `cli`/`sti` require ring 0, so the toggles are only emitted for bare
//! metal (`target_os = "none"`); hosted test builds get no-ops, which keeps
//! guard logic exercisable from the test suite.

/// Disables hardware interrupts (`cli`).
#[inline]
pub fn disable() {
    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    unsafe {
        core::arch::asm!("cli", options(nomem, nostack, preserves_flags));
    }
}

/// Enables hardware interrupts (`sti`).
#[inline]
pub fn enable() {
    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    unsafe {
        core::arch::asm!("sti", options(nomem, nostack, preserves_flags));
    }
}

/// Returns the current `RFLAGS` value (via `pushfq`/`pop`).
///
/// Bit 9 (`IF`) indicates whether interrupts are enabled. Reading flags is
/// unprivileged, so this also works in hosted builds.
#[inline]
#[must_use]
pub fn read_rflags() -> u64 {
    #[cfg(target_arch = "x86_64")]
    {
        let r: u64;
        unsafe {
            core::arch::asm!("pushfq; pop {}", out(reg) r, options(nostack, preserves_flags));
        }
        r
    }
    #[cfg(not(target_arch = "x86_64"))]
    {
        0
    }
}

/// Whether maskable interrupts are currently enabled (IF=1).
#[inline]
#[must_use]
pub fn are_enabled() -> bool {
    read_rflags() & (1 << 9) != 0
}

/// RAII guard that disables interrupts on creation and restores them on
/// drop.
///
/// The guard snapshots the `IF` bit; on drop it executes `sti` **only** if
/// interrupts were previously enabled, preserving the original state across
/// nested guards.
pub struct IrqGuard {
    /// Whether interrupts were enabled (IF=1) when the guard was created.
    were_enabled: bool,
}

impl Default for IrqGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl IrqGuard {
    /// Disables interrupts if they are currently enabled and remembers the
    /// state.
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        let enabled = are_enabled();
        if enabled {
            disable();
        }
        Self {
            were_enabled: enabled,
        }
    }
}

impl Drop for IrqGuard {
    /// Restores interrupts (`sti`) only if they were previously enabled.
    fn drop(&mut self) {
        if self.were_enabled {
            enable();
        }
    }
}
