//! Interrupt masking, the vector dispatch table, and the seam to the
//! externally owned interrupt controller.
//!
//! The execution core does not program the IDT, the local APIC or the
//! IO-APIC itself — those belong to the platform layer of the embedding
//! kernel. What lives here is the contract both sides agree on:
//!
//! - entry thunks push an [`InterruptFrame`] and call [`dispatch`];
//! - higher layers attach per-vector handlers with [`register_handler`];
//! - controller operations (mask/unmask, end-of-interrupt, periodic
//!   timer) are thin pass-through wrappers over the [`PlatformHooks`]
//!   registered once at boot. Before registration they are logged no-ops.

use kernel_sync::{SpinLock, SyncOnceCell};

/// Enable maskable interrupts (`sti`). Idempotent.
#[inline]
pub fn enable() {
    kernel_sync::irq::enable();
}

/// Disable maskable interrupts (`cli`). Idempotent.
#[inline]
pub fn disable() {
    kernel_sync::irq::disable();
}

/// Whether maskable interrupts are enabled (IF=1).
#[inline]
#[must_use]
pub fn are_enabled() -> bool {
    kernel_sync::irq::are_enabled()
}

/// Halt until the next interrupt.
#[inline]
pub fn halt() {
    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    unsafe {
        core::arch::asm!("hlt", options(nomem, nostack, preserves_flags));
    }
}

/// The stack image an interrupt entry thunk hands to [`dispatch`]: the
/// software-pushed vector and error code, followed by the hardware frame.
#[repr(C)]
#[derive(Debug, Copy, Clone)]
pub struct InterruptFrame {
    pub vector: u64,
    /// Zero for vectors without a hardware error code.
    pub error_code: u64,
    pub rip: u64,
    pub cs: u64,
    pub rflags: u64,
    pub rsp: u64,
    pub ss: u64,
}

/// A per-vector handler. Runs with interrupts disabled on the interrupted
/// context's kernel stack; issuing the end-of-interrupt is the handler's
/// job (via [`end_of_interrupt`]) for controller-delivered vectors.
pub type VectorHandler = fn(&mut InterruptFrame);

const VECTOR_COUNT: usize = 256;

static HANDLERS: SpinLock<[Option<VectorHandler>; VECTOR_COUNT]> =
    SpinLock::new([None; VECTOR_COUNT]);

/// Attach `handler` to `vector`, returning the previous handler.
pub fn register_handler(vector: u8, handler: VectorHandler) -> Option<VectorHandler> {
    let mut table = HANDLERS.lock_irq();
    table[vector as usize].replace(handler)
}

/// Detach the handler for `vector`, returning it.
pub fn unregister_handler(vector: u8) -> Option<VectorHandler> {
    let mut table = HANDLERS.lock_irq();
    table[vector as usize].take()
}

/// Route one interrupt or exception to its handler.
///
/// Called from the entry thunks with interrupts disabled. An unhandled
/// vector is logged and otherwise ignored; faults that need mandatory
/// handling must have handlers installed before interrupts are enabled.
pub fn dispatch(frame: &mut InterruptFrame) {
    let vector = frame.vector as usize & 0xFF;
    let handler = {
        let table = HANDLERS.lock();
        table[vector]
    };
    match handler {
        Some(handler) => handler(frame),
        None => log::warn!(
            "unhandled vector {vector} at rip {:#x} (error code {:#x})",
            frame.rip,
            frame.error_code
        ),
    }
}

/// Controller operations implemented by the platform layer.
///
/// Registered once at boot; every wrapper below forwards to it.
pub trait PlatformHooks: Sync {
    /// Bring up the IDT/APIC/IO-APIC complex.
    fn init_interrupt_controller(&self);
    /// Mask one controller input line.
    fn mask_irq(&self, irq: u8);
    /// Unmask one controller input line.
    fn unmask_irq(&self, irq: u8);
    /// Signal completion of the in-service interrupt.
    fn end_of_interrupt(&self, vector: u8);
    /// Program the platform timer for a periodic interrupt at `hz`.
    fn set_timer_periodic(&self, hz: u32);
}

static HOOKS: SyncOnceCell<&'static dyn PlatformHooks> = SyncOnceCell::new();

/// Register the platform's controller implementation. At-most-once; a
/// second registration is refused.
pub fn set_platform_hooks(hooks: &'static dyn PlatformHooks) -> bool {
    HOOKS.set(hooks).is_ok()
}

/// Initialize the interrupt controller through the platform hooks.
pub fn init_interrupt_controller() {
    match HOOKS.get() {
        Some(h) => h.init_interrupt_controller(),
        None => log::trace!("interrupt controller init requested before hooks"),
    }
}

/// Mask `irq` at the controller.
pub fn mask_irq(irq: u8) {
    match HOOKS.get() {
        Some(h) => h.mask_irq(irq),
        None => log::trace!("mask irq {irq} requested before hooks"),
    }
}

/// Unmask `irq` at the controller.
pub fn unmask_irq(irq: u8) {
    match HOOKS.get() {
        Some(h) => h.unmask_irq(irq),
        None => log::trace!("unmask irq {irq} requested before hooks"),
    }
}

/// Signal end-of-interrupt for `vector`.
pub fn end_of_interrupt(vector: u8) {
    match HOOKS.get() {
        Some(h) => h.end_of_interrupt(vector),
        None => log::trace!("eoi for vector {vector} requested before hooks"),
    }
}

/// Program the platform timer for a periodic interrupt at `hz`.
pub fn set_timer_periodic(hz: u32) {
    match HOOKS.get() {
        Some(h) => h.set_timer_periodic(hz),
        None => log::trace!("periodic timer at {hz} Hz requested before hooks"),
    }
}
