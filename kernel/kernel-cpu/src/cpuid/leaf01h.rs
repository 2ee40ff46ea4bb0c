use crate::cpuid::{CpuidRanges, CpuidResult, cpuid};
use bitfield_struct::bitfield;

pub const LEAF_01H: u32 = 0x01;

/// CPUID.01H — Feature Information.
///
/// Returns processor version info (EAX) and the classic feature flags
/// (ECX/EDX). The version fields need the extended-field fix-ups below to
/// yield the display family and model.
///
/// Reference: Intel SDM Vol. 2A, "CPUID—CPU Identification", leaf 01H.
#[derive(Copy, Clone, Debug)]
pub struct Leaf01h {
    pub eax: Leaf1Eax,
    pub ecx: Leaf1Ecx,
    pub edx: Leaf1Edx,
}

impl Leaf01h {
    /// Query CPUID.01H if supported; returns `None` if `ranges` says leaf 1
    /// is absent.
    ///
    /// # Safety
    /// CPUID must be available.
    #[inline]
    pub unsafe fn read(ranges: &CpuidRanges) -> Option<Self> {
        if !ranges.has_basic(LEAF_01H) {
            return None;
        }
        let r = unsafe { cpuid(LEAF_01H, 0) };
        Some(Self::from(r))
    }

    const fn from(r: CpuidResult) -> Self {
        Self {
            eax: Leaf1Eax::from_bits(r.eax),
            ecx: Leaf1Ecx::from_bits(r.ecx),
            edx: Leaf1Edx::from_bits(r.edx),
        }
    }

    #[inline]
    #[must_use]
    pub const fn family(&self) -> u16 {
        self.eax.effective_family()
    }

    #[inline]
    #[must_use]
    pub const fn model(&self) -> u8 {
        self.eax.effective_model()
    }

    #[inline]
    #[must_use]
    pub const fn stepping(&self) -> u8 {
        self.eax.stepping()
    }

    /// AVX is usable only when the OS has enabled XSAVE state management.
    #[inline]
    #[must_use]
    pub const fn avx_usable(&self) -> bool {
        self.ecx.avx() && self.ecx.xsave() && self.ecx.osxsave()
    }
}

/// CPUID.01H:EAX — Version Information.
///
/// Raw fields as defined by the SDM; helpers compute the *effective*
/// model/family.
#[bitfield(u32)]
pub struct Leaf1Eax {
    /// Stepping ID (bits 3:0).
    #[bits(4)]
    stepping: u8,
    /// Base model (bits 7:4).
    #[bits(4)]
    base_model: u8,
    /// Base family (bits 11:8).
    #[bits(4)]
    base_family: u8,
    /// Processor type (bits 13:12).
    #[bits(2)]
    processor_type: u8,
    /// Reserved (bits 15:14).
    #[bits(2)]
    _rsv14_15: u8,
    /// Extended model (bits 19:16).
    #[bits(4)]
    ext_model: u8,
    /// Extended family (bits 27:20).
    #[bits(8)]
    ext_family: u8,
    /// Reserved (bits 31:28).
    #[bits(4)]
    _rsv28_31: u8,
}

impl Leaf1Eax {
    /// Display family: base family, plus the extended field when the base
    /// saturates at 0xF.
    #[must_use]
    pub const fn effective_family(&self) -> u16 {
        let base = self.base_family() as u16;
        if base == 0xF {
            base + self.ext_family() as u16
        } else {
            base
        }
    }

    /// Display model: the extended field extends the base for families 6
    /// and 0xF.
    #[must_use]
    pub const fn effective_model(&self) -> u8 {
        let base = self.base_model();
        match self.base_family() {
            0x6 | 0xF => (self.ext_model() << 4) | base,
            _ => base,
        }
    }
}

/// CPUID.01H:ECX — feature flags (the subset this kernel inspects).
#[bitfield(u32)]
pub struct Leaf1Ecx {
    /// SSE3 (bit 0).
    pub sse3: bool,
    /// Bits 25:1 — features this kernel does not inspect.
    #[bits(25)]
    _rsv1_25: u32,
    /// XSAVE (bit 26).
    pub xsave: bool,
    /// OSXSAVE (bit 27): the OS enabled XSAVE.
    pub osxsave: bool,
    /// AVX (bit 28).
    pub avx: bool,
    /// Bits 31:29 — features this kernel does not inspect.
    #[bits(3)]
    _rsv29_31: u8,
}

/// CPUID.01H:EDX — feature flags (the subset this kernel inspects).
#[bitfield(u32)]
pub struct Leaf1Edx {
    /// Bits 24:0 — legacy features this kernel does not inspect.
    #[bits(25)]
    _rsv0_24: u32,
    /// SSE (bit 25).
    pub sse: bool,
    /// SSE2 (bit 26).
    pub sse2: bool,
    /// Bits 31:27 — legacy features this kernel does not inspect.
    #[bits(5)]
    _rsv27_31: u8,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extended_family_fixup() {
        // family 0xF, ext family 0x6 → display family 0x15 (an AMD Bulldozer id).
        let eax = Leaf1Eax::new()
            .with_base_family(0xF)
            .with_ext_family(0x6)
            .with_base_model(0x2)
            .with_ext_model(0x0);
        assert_eq!(eax.effective_family(), 0x15);
        // family 0xF also takes the extended model path.
        assert_eq!(eax.effective_model(), 0x02);
    }

    #[test]
    fn family6_uses_extended_model() {
        // family 6, ext model 0x9, base model 0xE → model 0x9E (Kaby Lake).
        let eax = Leaf1Eax::new()
            .with_base_family(0x6)
            .with_ext_model(0x9)
            .with_base_model(0xE);
        assert_eq!(eax.effective_family(), 0x6);
        assert_eq!(eax.effective_model(), 0x9E);
    }

    #[test]
    fn low_families_ignore_extended_fields() {
        let eax = Leaf1Eax::new()
            .with_base_family(0x5)
            .with_ext_model(0x9)
            .with_base_model(0x3);
        assert_eq!(eax.effective_model(), 0x3);
    }
}
