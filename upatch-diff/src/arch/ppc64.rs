use goblin::elf::header::EM_PPC64;
use int_enum::IntEnum;

use crate::arch::ArchRules;

#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntEnum)]
#[allow(non_camel_case_types)]
pub enum Ppc64RelocationType {
    R_PPC64_NONE = 0,
    R_PPC64_ADDR32 = 1,
    R_PPC64_ADDR24 = 2,
    R_PPC64_ADDR16 = 3,
    R_PPC64_ADDR16_LO = 4,
    R_PPC64_ADDR16_HI = 5,
    R_PPC64_ADDR16_HA = 6,
    R_PPC64_ADDR14 = 7,
    R_PPC64_REL24 = 10,
    R_PPC64_REL14 = 11,
    R_PPC64_REL32 = 26,
    R_PPC64_ADDR64 = 38,
    R_PPC64_REL64 = 44,
    R_PPC64_TOC16 = 47,
    R_PPC64_TOC16_LO = 48,
    R_PPC64_TOC16_HI = 49,
    R_PPC64_TOC16_HA = 50,
    R_PPC64_TOC = 51,
    R_PPC64_TOC16_DS = 63,
    R_PPC64_TOC16_LO_DS = 64,
    R_PPC64_ENTRY = 118,
}

type Ppc64RelTy = Ppc64RelocationType;

/// `STO_PPC64_LOCAL` lives in the top three bits of `st_other`.
const STO_PPC64_LOCAL_BIT: u8 = 5;
const STO_PPC64_LOCAL_MASK: u8 = 0xe0;

pub struct Ppc64Rules;

impl ArchRules for Ppc64Rules {
    fn machine(&self) -> u16 {
        EM_PPC64
    }

    fn insn_offset(&self, _rtype: u32) -> i64 {
        0
    }

    fn is_abs(&self, rtype: u32) -> bool {
        matches!(
            Ppc64RelocationType::try_from(rtype),
            Ok(Ppc64RelTy::R_PPC64_ADDR64) | Ok(Ppc64RelTy::R_PPC64_ADDR32)
        )
    }

    fn abs64_type(&self) -> u32 {
        Ppc64RelTy::R_PPC64_ADDR64 as u32
    }

    /// ELFv2 ABI local entry point offset, encoded as a power of two in the
    /// top bits of `st_other`.
    fn local_entry_offset(&self, st_other: u8) -> u64 {
        let encoded = (st_other & STO_PPC64_LOCAL_MASK) >> STO_PPC64_LOCAL_BIT;
        ((1u64 << encoded) >> 2) << 2
    }

    fn descriptor(&self, le: bool) -> (&'static str, Vec<u8>) {
        let mut data = Vec::with_capacity(8);
        let version = upatch_meta::FORMAT_VERSION;
        let machine = EM_PPC64 as u32;
        for v in [version, machine] {
            let b = if le { v.to_le_bytes() } else { v.to_be_bytes() };
            data.extend_from_slice(&b);
        }
        ("ppc64", data)
    }
}
