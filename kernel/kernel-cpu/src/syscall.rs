//! System-call entry glue.
//!
//! The entry thunk (installed by the platform layer next to the IDT)
//! gathers the call number and arguments into [`SyscallArgs`] and funnels
//! them through [`on_syscall`] into the handler the kernel proper
//! registered. The core defines only this contract; the syscall table
//! itself lives in higher layers.

use kernel_sync::SyncOnceCell;

/// Unknown or unhandled system calls answer with all bits set.
pub const SYSCALL_FAILED: u64 = u64::MAX;

/// The register-file view of one system call: the call number plus the six
/// argument slots of the SysV calling convention.
#[derive(Debug, Copy, Clone)]
pub struct SyscallArgs {
    pub nr: u64,
    pub args: [u64; 6],
}

/// The kernel-side handler: receives the argument record, returns the
/// value placed in RAX on exit.
pub type SyscallHandler = fn(&SyscallArgs) -> u64;

static HANDLER: SyncOnceCell<SyscallHandler> = SyncOnceCell::new();

/// Register the kernel's syscall handler. At-most-once; a second
/// registration is refused.
pub fn set_syscall_handler(handler: SyscallHandler) -> bool {
    HANDLER.set(handler).is_ok()
}

/// Entry point called by the syscall thunk.
///
/// Returns [`SYSCALL_FAILED`] while no handler is registered.
#[must_use]
pub fn on_syscall(args: &SyscallArgs) -> u64 {
    match HANDLER.get() {
        Some(handler) => handler(args),
        None => {
            log::warn!("syscall {} before a handler was registered", args.nr);
            SYSCALL_FAILED
        }
    }
}
