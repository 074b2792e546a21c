use goblin::elf::header::EM_X86_64;
use int_enum::IntEnum;

use crate::arch::ArchRules;

#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntEnum)]
#[allow(non_camel_case_types)]
pub enum X86_64RelocationType {
    /// No reloc
    R_X86_64_NONE = 0,
    /// Direct 64 bit
    R_X86_64_64 = 1,
    /// PC relative 32 bit signed
    R_X86_64_PC32 = 2,
    /// 32 bit GOT entry
    R_X86_64_GOT32 = 3,
    /// 32 bit PLT address
    R_X86_64_PLT32 = 4,
    /// Copy symbol at runtime
    R_X86_64_COPY = 5,
    /// Create GOT entry
    R_X86_64_GLOB_DAT = 6,
    /// Create PLT entry
    R_X86_64_JUMP_SLOT = 7,
    /// Adjust by program base
    R_X86_64_RELATIVE = 8,
    /// 32 bit signed pc relative offset to GOT
    R_X86_64_GOTPCREL = 9,
    /// Direct 32 bit zero extended
    R_X86_64_32 = 10,
    /// Direct 32 bit sign extended
    R_X86_64_32S = 11,
    /// Direct 16 bit zero extended
    R_X86_64_16 = 12,
    /// 16 bit sign extended pc relative
    R_X86_64_PC16 = 13,
    /// Direct 8 bit sign extended
    R_X86_64_8 = 14,
    /// 8 bit sign extended pc relative
    R_X86_64_PC8 = 15,
    /// Place relative 64-bit signed
    R_X86_64_PC64 = 24,
    /// Load from GOT, relaxable
    R_X86_64_GOTPCRELX = 41,
    /// Load from GOT with REX prefix, relaxable
    R_X86_64_REX_GOTPCRELX = 42,
}

type X64RelTy = X86_64RelocationType;

pub struct X86_64Rules;

impl ArchRules for X86_64Rules {
    fn machine(&self) -> u16 {
        EM_X86_64
    }

    /// PC-relative addends on x86-64 are biased by the 4 bytes between the
    /// fixup and the end of the instruction.
    fn insn_offset(&self, rtype: u32) -> i64 {
        match X86_64RelocationType::try_from(rtype) {
            Ok(X64RelTy::R_X86_64_PC32)
            | Ok(X64RelTy::R_X86_64_PLT32)
            | Ok(X64RelTy::R_X86_64_GOTPCREL)
            | Ok(X64RelTy::R_X86_64_GOTPCRELX)
            | Ok(X64RelTy::R_X86_64_REX_GOTPCRELX) => 4,
            _ => 0,
        }
    }

    fn is_abs(&self, rtype: u32) -> bool {
        matches!(
            X86_64RelocationType::try_from(rtype),
            Ok(X64RelTy::R_X86_64_64) | Ok(X64RelTy::R_X86_64_32) | Ok(X64RelTy::R_X86_64_32S)
        )
    }

    fn abs64_type(&self) -> u32 {
        X64RelTy::R_X86_64_64 as u32
    }

    fn descriptor(&self, le: bool) -> (&'static str, Vec<u8>) {
        let mut data = Vec::with_capacity(8);
        let version = upatch_meta::FORMAT_VERSION;
        let machine = EM_X86_64 as u32;
        for v in [version, machine] {
            let b = if le { v.to_le_bytes() } else { v.to_be_bytes() };
            data.extend_from_slice(&b);
        }
        ("x86_64", data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pc_relative_bias() {
        let rules = X86_64Rules;
        assert_eq!(rules.insn_offset(X64RelTy::R_X86_64_PC32 as u32), 4);
        assert_eq!(rules.insn_offset(X64RelTy::R_X86_64_PLT32 as u32), 4);
        assert_eq!(rules.insn_offset(X64RelTy::R_X86_64_64 as u32), 0);
        assert_eq!(rules.insn_offset(X64RelTy::R_X86_64_32S as u32), 0);
        // Unknown types fall back to no bias rather than panicking.
        assert_eq!(rules.insn_offset(0xdead), 0);
    }

    #[test]
    fn test_abs_classification() {
        let rules = X86_64Rules;
        assert!(rules.is_abs(X64RelTy::R_X86_64_64 as u32));
        assert!(rules.is_abs(X64RelTy::R_X86_64_32S as u32));
        assert!(!rules.is_abs(X64RelTy::R_X86_64_PC32 as u32));
        assert_eq!(rules.local_entry_offset(0xff), 0);
    }
}
