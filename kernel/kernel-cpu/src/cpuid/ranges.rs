use crate::cpuid::cpuid;

const LEAF_00H: u32 = 0x00;
const LEAF_MAX_EXTENDED: u32 = 0x8000_0000;

/// Result of CPUID.00H / CPUID.80000000H: which leaves exist, and who made
/// the processor.
#[derive(Copy, Clone)]
pub struct CpuidRanges {
    pub max_basic: u32,
    pub max_extended: u32,
    pub vendor: CpuVendor,
    vendor_string: [u8; 12],
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum CpuVendor {
    Intel,
    Amd,
    Other,
}

impl CpuidRanges {
    /// # Safety
    /// CPUID must be available (always true on x86-64).
    pub unsafe fn read() -> Self {
        let b0 = unsafe { cpuid(LEAF_00H, 0) };
        let max_basic = b0.eax;

        // e.g., "GenuineIntel", "AuthenticAMD"
        let regs = [b0.ebx, b0.edx, b0.ecx];
        let mut vendor_string = [0u8; 12];
        for (i, reg) in regs.iter().enumerate() {
            vendor_string[i * 4..i * 4 + 4].copy_from_slice(&reg.to_le_bytes());
        }

        let vendor = match &vendor_string {
            b"GenuineIntel" => CpuVendor::Intel,
            b"AuthenticAMD" => CpuVendor::Amd,
            _ => CpuVendor::Other,
        };

        let e0 = unsafe { cpuid(LEAF_MAX_EXTENDED, 0) };
        let max_extended = e0.eax;

        Self {
            max_basic,
            max_extended,
            vendor,
            vendor_string,
        }
    }

    /// The 12-byte vendor identification string.
    #[inline]
    #[must_use]
    pub fn vendor_str(&self) -> &str {
        core::str::from_utf8(&self.vendor_string).unwrap_or("????????????")
    }

    #[inline]
    #[must_use]
    pub const fn has_basic(&self, leaf: u32) -> bool {
        leaf <= self.max_basic
    }

    #[inline]
    #[must_use]
    pub const fn has_ext(&self, leaf: u32) -> bool {
        leaf >= LEAF_MAX_EXTENDED && leaf <= self.max_extended
    }
}

impl CpuVendor {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Intel => "Intel",
            Self::Amd => "AMD",
            Self::Other => "Other",
        }
    }
}
