use crate::cpuid::{CpuidRanges, cpuid};

const LEAF_BRAND_0: u32 = 0x8000_0002;
const LEAF_BRAND_2: u32 = 0x8000_0004;

/// The 48-byte processor brand string from the extended brand leaves.
///
/// Vendors pad with spaces (sometimes leading); [`as_str`](Self::as_str)
/// returns the trimmed text.
#[derive(Copy, Clone)]
pub struct BrandString {
    bytes: [u8; 48],
}

impl BrandString {
    /// Read leaves 80000002H..80000004H if present.
    ///
    /// # Safety
    /// CPUID must be available.
    pub unsafe fn read(ranges: &CpuidRanges) -> Option<Self> {
        if !ranges.has_ext(LEAF_BRAND_2) {
            return None;
        }
        let mut bytes = [0u8; 48];
        for (i, leaf) in (LEAF_BRAND_0..=LEAF_BRAND_2).enumerate() {
            let r = unsafe { cpuid(leaf, 0) };
            for (j, reg) in [r.eax, r.ebx, r.ecx, r.edx].into_iter().enumerate() {
                let at = i * 16 + j * 4;
                bytes[at..at + 4].copy_from_slice(&reg.to_le_bytes());
            }
        }
        Some(Self { bytes })
    }

    /// The brand text with padding spaces and NUL bytes trimmed.
    #[must_use]
    pub fn as_str(&self) -> &str {
        core::str::from_utf8(&self.bytes)
            .unwrap_or("")
            .trim_matches(|c| c == ' ' || c == '\0')
    }

    /// The raw 48 bytes as delivered by the processor.
    #[must_use]
    pub const fn raw(&self) -> &[u8; 48] {
        &self.bytes
    }
}
