//! # Kernel synchronization primitives
//!
//! The execution core is single-CPU cooperative, but its process-wide
//! singletons (the frame allocator, the cached CPU record) still need a
//! once-initialization story and a lock that the SMP extension can later
//! make real. [`SpinLock`] and [`SyncOnceCell`] provide exactly that, and
//! [`irq`] adds an interrupt save/disable/restore guard for critical
//! sections that may race interrupt handlers.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

pub mod irq;
mod spin_lock;
mod sync_once_cell;

pub use irq::IrqGuard;
pub use spin_lock::{IrqSpinGuard, SpinLock, SpinLockGuard};
pub use sync_once_cell::SyncOnceCell;
