use goblin::elf::header::EM_AARCH64;
use int_enum::IntEnum;

use crate::arch::ArchRules;

#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntEnum)]
#[allow(non_camel_case_types)]
pub enum Aarch64RelocationType {
    R_AARCH64_NONE = 256,
    // Data
    R_AARCH64_ABS64 = 257,
    R_AARCH64_ABS32 = 258,
    R_AARCH64_ABS16 = 259,
    R_AARCH64_PREL64 = 260,
    R_AARCH64_PREL32 = 261,
    R_AARCH64_PREL16 = 262,
    // Instructions
    R_AARCH64_MOVW_UABS_G0 = 263,
    R_AARCH64_MOVW_UABS_G0_NC = 264,
    R_AARCH64_MOVW_UABS_G1 = 265,
    R_AARCH64_MOVW_UABS_G1_NC = 266,
    R_AARCH64_MOVW_UABS_G2 = 267,
    R_AARCH64_MOVW_UABS_G2_NC = 268,
    R_AARCH64_MOVW_UABS_G3 = 269,
    R_AARCH64_LD_PREL_LO19 = 273,
    R_AARCH64_ADR_PREL_LO21 = 274,
    R_AARCH64_ADR_PREL_PG_HI21 = 275,
    R_AARCH64_ADR_PREL_PG_HI21_NC = 276,
    R_AARCH64_ADD_ABS_LO12_NC = 277,
    R_AARCH64_LDST8_ABS_LO12_NC = 278,
    R_AARCH64_TSTBR14 = 279,
    R_AARCH64_CONDBR19 = 280,
    R_AARCH64_JUMP26 = 282,
    R_AARCH64_CALL26 = 283,
    R_AARCH64_LDST16_ABS_LO12_NC = 284,
    R_AARCH64_LDST32_ABS_LO12_NC = 285,
    R_AARCH64_LDST64_ABS_LO12_NC = 286,
    R_AARCH64_LDST128_ABS_LO12_NC = 299,
    R_AARCH64_ADR_GOT_PAGE = 311,
    R_AARCH64_LD64_GOT_LO12_NC = 312,
}

type Arm64RelTy = Aarch64RelocationType;

pub struct Aarch64Rules;

impl ArchRules for Aarch64Rules {
    fn machine(&self) -> u16 {
        EM_AARCH64
    }

    /// AArch64 addends encode the target offset directly; no instruction
    /// bias applies.
    fn insn_offset(&self, _rtype: u32) -> i64 {
        0
    }

    fn is_abs(&self, rtype: u32) -> bool {
        matches!(
            Aarch64RelocationType::try_from(rtype),
            Ok(Arm64RelTy::R_AARCH64_ABS64) | Ok(Arm64RelTy::R_AARCH64_ABS32)
        )
    }

    fn abs64_type(&self) -> u32 {
        Arm64RelTy::R_AARCH64_ABS64 as u32
    }

    fn descriptor(&self, le: bool) -> (&'static str, Vec<u8>) {
        let mut data = Vec::with_capacity(8);
        let version = upatch_meta::FORMAT_VERSION;
        let machine = EM_AARCH64 as u32;
        for v in [version, machine] {
            let b = if le { v.to_le_bytes() } else { v.to_be_bytes() };
            data.extend_from_slice(&b);
        }
        ("aarch64", data)
    }
}
