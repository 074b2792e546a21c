//! Replacing section-based relocations with symbol-based equivalents.
//!
//! After this pass no relocation targets a raw STT_SECTION symbol unless
//! the referenced section has no symbol covering the target offset and is
//! one of the tolerated data/string sections. Running the pass twice is a
//! no-op: every rewritten relocation now points at a non-section symbol.

use goblin::elf::sym::{STT_FUNC, STT_OBJECT, STT_SECTION};

use crate::arch::ArchRules;
use crate::elf::{is_string_literal_section, ObjectFile, Rela, SecId};
use crate::{DiffError, Result};

pub fn replace_section_syms(obj: &mut ObjectFile, arch: &dyn ArchRules) -> Result<()> {
    for sec_index in 0..obj.sections.len() {
        if !obj.sections[sec_index].is_rela() {
            continue;
        }
        // Take the list out so the symbol arena can be searched while
        // entries are rewritten in place.
        let mut relocs = std::mem::take(&mut obj.sections[sec_index].relocs);
        for rela in &mut relocs {
            rewrite_rela(obj, SecId(sec_index), rela, arch)?;
        }
        obj.sections[sec_index].relocs = relocs;
    }
    Ok(())
}

fn rewrite_rela(
    obj: &ObjectFile,
    rela_sec: SecId,
    rela: &mut Rela,
    arch: &dyn ArchRules,
) -> Result<()> {
    let referent = &obj.symbols[rela.sym.0];
    if referent.kind != STT_SECTION {
        return Ok(());
    }
    let Some(target_sec) = referent.sec else {
        return Ok(());
    };
    let tsec = &obj.sections[target_sec.0];

    let target_off = rela.addend + arch.insn_offset(rela.ty);

    // A bundled section is its owner; anything but a reference to the
    // owner's entry is a malformed relocation.
    let owner = tsec
        .sym
        .filter(|id| obj.symbols[id.0].kind != STT_SECTION);
    if let Some(owner_id) = owner {
        let owner_sym = &obj.symbols[owner_id.0];
        if target_off != owner_sym.value as i64 {
            return Err(DiffError::BadRelocation {
                sec: obj.sections[rela_sec.0].name.clone(),
                offset: rela.offset,
                msg: format!(
                    "references bundled section {} at offset {:#x}",
                    tsec.name, target_off
                ),
            });
        }
        rela.addend -= owner_sym.value as i64;
        rela.sym = owner_id;
        return Ok(());
    }

    // Otherwise find the symbol whose value range covers the target offset.
    if target_off >= 0 {
        let off = target_off as u64;
        let covering = obj.symbols.iter().enumerate().find(|(_, s)| {
            matches!(s.kind, STT_FUNC | STT_OBJECT)
                && s.sec == Some(target_sec)
                && off >= s.value
                && off < s.value + s.size
        });
        if let Some((index, s)) = covering {
            rela.addend -= s.value as i64;
            rela.sym = crate::elf::SymId(index);
            return Ok(());
        }
    }

    // A text-to-data relocation that lands exactly on the end of the data
    // section with an absolute type is a known miscompile shape; refuse it
    // before it turns into a silently wrong patch.
    let base_is_text = obj.sections[rela_sec.0]
        .base
        .map(|b| obj.sections[b.0].is_text())
        .unwrap_or(false);
    if target_off as u64 == tsec.size && !tsec.is_text() && base_is_text && arch.is_abs(rela.ty) {
        return Err(DiffError::BadRelocation {
            sec: obj.sections[rela_sec.0].name.clone(),
            offset: rela.offset,
            msg: format!("references the end of data section {}", tsec.name),
        });
    }

    // Anonymous constants stay section-relative.
    if tsec.name == ".rodata" || tsec.name == ".data" || is_string_literal_section(&tsec.name) {
        return Ok(());
    }

    Err(DiffError::BadRelocation {
        sec: obj.sections[rela_sec.0].name.clone(),
        offset: rela.offset,
        msg: format!(
            "no symbol covers offset {:#x} of section {}",
            target_off, tsec.name
        ),
    })
}
