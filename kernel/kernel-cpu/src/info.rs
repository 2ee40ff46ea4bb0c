//! The cached description of CPU 0.
//!
//! Populated once by [`init`] (or lazily on first query) and immutable
//! afterwards. Exactly one CPU is reported until SMP bring-up exists.

use crate::cpuid::{BrandString, CpuVendor, CpuidRanges, Leaf01h, Leaf07h};
use crate::time;
use bitfield_struct::bitfield;
use kernel_sync::SyncOnceCell;

/// SIMD capability bits recorded at detection time.
#[bitfield(u32)]
#[derive(PartialEq)]
pub struct CpuFeatures {
    pub sse: bool,
    pub sse2: bool,
    pub sse3: bool,
    pub avx: bool,
    pub avx2: bool,
    pub avx512f: bool,
    #[bits(26)]
    __: u32,
}

/// Everything the kernel remembers about a CPU.
#[derive(Debug, PartialEq)]
pub struct CpuInfo {
    vendor: CpuVendor,
    vendor_string: [u8; 12],
    brand: [u8; 48],
    pub family: u16,
    pub model: u8,
    pub stepping: u8,
    pub features: CpuFeatures,
    /// Nominal TSC rate in Hz; 0 when the processor does not report one.
    pub nominal_tsc_hz: u64,
}

impl CpuInfo {
    /// Identify the executing CPU via the identification instruction.
    unsafe fn detect() -> Self {
        let ranges = unsafe { CpuidRanges::read() };

        let mut vendor_string = [0u8; 12];
        vendor_string.copy_from_slice(ranges.vendor_str().as_bytes());

        let leaf1 = unsafe { Leaf01h::read(&ranges) };
        let leaf7 = unsafe { Leaf07h::read(&ranges) };

        let mut features = CpuFeatures::new();
        let (family, model, stepping) = if let Some(l1) = leaf1 {
            features.set_sse(l1.edx.sse());
            features.set_sse2(l1.edx.sse2());
            features.set_sse3(l1.ecx.sse3());
            features.set_avx(l1.avx_usable());
            (l1.family(), l1.model(), l1.stepping())
        } else {
            (0, 0, 0)
        };
        if let Some(l7) = leaf7 {
            // The 256/512-bit extensions imply the AVX state the OS check
            // in leaf 1 already validated.
            features.set_avx2(features.avx() && l7.ebx.avx2());
            features.set_avx512f(features.avx() && l7.ebx.avx512f());
        }

        let mut brand = [0u8; 48];
        if let Some(b) = unsafe { BrandString::read(&ranges) } {
            brand.copy_from_slice(b.raw());
        }

        let nominal_tsc_hz = unsafe { time::estimate_nominal_hz(&ranges) };

        Self {
            vendor: ranges.vendor,
            vendor_string,
            brand,
            family,
            model,
            stepping,
            features,
            nominal_tsc_hz,
        }
    }

    #[inline]
    #[must_use]
    pub const fn vendor(&self) -> CpuVendor {
        self.vendor
    }

    /// The 12-byte vendor identification string, e.g. `GenuineIntel`.
    #[must_use]
    pub fn vendor_str(&self) -> &str {
        core::str::from_utf8(&self.vendor_string).unwrap_or("")
    }

    /// The trimmed processor brand string; empty when not reported.
    #[must_use]
    pub fn brand(&self) -> &str {
        core::str::from_utf8(&self.brand)
            .unwrap_or("")
            .trim_matches(|c| c == ' ' || c == '\0')
    }
}

/// A CPU query was out of range.
#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum CpuError {
    #[error("cpu id {0} out of range")]
    InvalidCpu(usize),
}

static CPU0: SyncOnceCell<CpuInfo> = SyncOnceCell::new();

/// Identify CPU 0 and cache the record. Idempotent; later calls return the
/// cached value.
pub fn init() -> &'static CpuInfo {
    CPU0.get_or_init(|| {
        // SAFETY: every x86-64 processor implements CPUID.
        let info = unsafe { CpuInfo::detect() };
        log::info!(
            "cpu 0: {} family {:#x} model {:#x} stepping {:#x}, {}",
            info.vendor_str(),
            info.family,
            info.model,
            info.stepping,
            if info.brand().is_empty() {
                "no brand string"
            } else {
                info.brand()
            },
        );
        info
    })
}

/// Number of online CPUs. One until SMP bring-up exists.
#[inline]
#[must_use]
pub const fn cpu_count() -> usize {
    1
}

/// The executing CPU's id. Zero on the single-CPU build.
#[inline]
#[must_use]
pub const fn cpu_id() -> usize {
    0
}

/// The cached record for `id`.
///
/// # Errors
/// [`CpuError::InvalidCpu`] when `id >= cpu_count()`.
pub fn cpu_info(id: usize) -> Result<&'static CpuInfo, CpuError> {
    if id >= cpu_count() {
        return Err(CpuError::InvalidCpu(id));
    }
    Ok(init())
}
