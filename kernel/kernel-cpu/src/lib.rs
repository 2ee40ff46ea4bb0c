//! # CPU Core
//!
//! Architecture-dependent primitives for the kernel execution core:
//!
//! - [`cpuid`]: raw access to the identification instruction plus typed
//!   views of the interesting leaves.
//! - [`info`]: the cached description of CPU 0 (vendor, family/model/
//!   stepping, SIMD capability bits, brand string, nominal TSC rate).
//! - [`time`]: timestamp-counter reads and nominal-frequency estimation.
//! - [`interrupts`]: interrupt masking, halt, the vector dispatch table,
//!   and pass-through wrappers over the externally provided interrupt
//!   controller.
//! - [`syscall`]: the glue between the syscall entry thunk and the
//!   higher-layer handler.
//! - [`context`]: kernel-thread context records, bootstrap of new threads
//!   and the save/restore switch.
//! - [`arch`]: the unsafe bottom — CR3 access and the register-file switch
//!   routine. Everything above it is platform-independent code.
//!
//! Until SMP bring-up exists the crate reports exactly one CPU and all
//! per-CPU state is the state of CPU 0.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

pub mod arch;
pub mod context;
pub mod cpuid;
pub mod info;
pub mod interrupts;
pub mod syscall;
pub mod time;

pub use context::{KernelContext, ThreadEntry, prepare_kernel_thread, release_context, switch_context};
pub use info::{CpuError, CpuFeatures, CpuInfo, cpu_count, cpu_id, cpu_info};
pub use time::{read_timestamp, timer_ticks};
