//! # Typed `x86_64` Registers
//!
//! Bitfield models for the control and flags registers the execution core
//! touches: `CR3` (page-table root, written on address-space switch) and
//! `RFLAGS` (saved and restored around kernel-thread context switches).

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

#[cfg(feature = "cr3")]
pub mod cr3;

#[cfg(feature = "rflags")]
pub mod rflags;

#[cfg(feature = "cr3")]
pub use cr3::Cr3;

#[cfg(feature = "rflags")]
pub use rflags::Rflags;

pub trait LoadRegisterUnsafe {
    /// # Safety
    /// The caller must uphold the implementation-specific safety requirements.
    /// For example, the register access might be privileged and require kernel mode (Ring 0).
    unsafe fn load_unsafe() -> Self;
}

pub trait StoreRegisterUnsafe {
    /// # Safety
    /// The caller must uphold the implementation-specific safety requirements.
    /// For example, the register access might be privileged and require kernel mode (Ring 0).
    unsafe fn store_unsafe(self);
}
