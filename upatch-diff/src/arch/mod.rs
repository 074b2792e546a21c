//! Per-architecture relocation knowledge.
//!
//! Everything the core needs to know about a target architecture is behind
//! [`ArchRules`]; the right implementation is picked once at graph
//! construction time from `e_machine`.

mod aarch64;
mod ppc64;
mod x86_64;

pub use aarch64::Aarch64RelocationType;
pub use ppc64::Ppc64RelocationType;
pub use x86_64::X86_64RelocationType;

use goblin::elf::header::{EM_AARCH64, EM_PPC64, EM_X86_64};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arch {
    X86_64,
    Aarch64,
    Ppc64,
}

impl Arch {
    pub fn from_machine(e_machine: u16) -> Option<Arch> {
        match e_machine {
            EM_X86_64 => Some(Arch::X86_64),
            EM_AARCH64 => Some(Arch::Aarch64),
            EM_PPC64 => Some(Arch::Ppc64),
            _ => None,
        }
    }

    pub fn rules(self) -> &'static dyn ArchRules {
        match self {
            Arch::X86_64 => &x86_64::X86_64Rules,
            Arch::Aarch64 => &aarch64::Aarch64Rules,
            Arch::Ppc64 => &ppc64::Ppc64Rules,
        }
    }
}

/// Architecture capability consulted by the rewriter, the bundler and the
/// metadata builder.
pub trait ArchRules: Sync {
    fn machine(&self) -> u16;

    /// Correction added to a relocation's addend to obtain the target
    /// offset inside the referenced section. Non-zero only for
    /// PC-relative types whose addend bakes in the instruction tail.
    fn insn_offset(&self, rtype: u32) -> i64;

    /// Whether the type stores an absolute address of pointer or
    /// half-pointer width. Used by the end-of-section miscompile check.
    fn is_abs(&self, rtype: u32) -> bool;

    /// The plain 64-bit absolute relocation, used for the synthesized
    /// metadata relocations.
    fn abs64_type(&self) -> u32;

    /// Offset of a function's local entry point encoded in `st_other`.
    /// Zero everywhere except PPC64 ABIv2.
    fn local_entry_offset(&self, _st_other: u8) -> u64 {
        0
    }

    /// Name suffix and payload of the architecture descriptor section.
    fn descriptor(&self, le: bool) -> (&'static str, Vec<u8>);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_machine_mapping() {
        assert_eq!(Arch::from_machine(EM_X86_64), Some(Arch::X86_64));
        assert_eq!(Arch::from_machine(EM_AARCH64), Some(Arch::Aarch64));
        assert_eq!(Arch::from_machine(EM_PPC64), Some(Arch::Ppc64));
        assert_eq!(Arch::from_machine(0xffff), None);
        for arch in [Arch::X86_64, Arch::Aarch64, Arch::Ppc64] {
            assert_eq!(Arch::from_machine(arch.rules().machine()), Some(arch));
        }
    }
}
