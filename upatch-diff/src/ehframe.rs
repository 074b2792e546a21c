//! Debug-info pruning and `.eh_frame` rebuild.
//!
//! Debug sections travel wholesale: their payload is kept as-is and only
//! relocations against entities missing from the output are dropped.
//! `.eh_frame` needs real surgery, since every FDE covering a function that
//! did not make it into the patch must disappear and the CIE back-pointers
//! of the survivors shift with the bytes.

use crate::elf::{get_u32, is_debug_section, put_u32, ObjectFile, Rela};
use crate::{DiffError, Result};

/// Include `.debug_*` and `.eh_frame` wholesale, together with their rela
/// sections, without running the inclusion closure over the referents.
pub fn include_debug_sections(p: &mut ObjectFile) {
    for i in 0..p.sections.len() {
        let name = p.sections[i].name.clone();
        if !(name.starts_with(".debug_") || name == ".eh_frame") {
            continue;
        }
        p.sections[i].include = true;
        if let Some(ssym) = p.sections[i].section_sym {
            p.symbols[ssym.0].include = true;
        }
        if let Some(rela) = p.sections[i].rela {
            p.sections[rela.0].include = true;
        }
    }
}

/// Drop debug relocations whose referent is not part of the patch.
pub fn prune_debug_relas(p: &mut ObjectFile) {
    for i in 0..p.sections.len() {
        if !p.sections[i].include || !p.sections[i].is_rela() {
            continue;
        }
        let Some(base) = p.sections[i].base else { continue };
        if !is_debug_section(&p.sections[base.0].name) {
            continue;
        }
        let mut relocs = std::mem::take(&mut p.sections[i].relocs);
        let before = relocs.len();
        relocs.retain(|r| p.symbols[r.sym.0].include);
        if relocs.len() != before {
            log::debug!(
                "[{}] pruned {} relocations from {}",
                p.name,
                before - relocs.len(),
                p.sections[i].name
            );
        }
        p.sections[i].relocs = relocs;
    }
}

struct FrameRecord {
    start: usize,
    /// Total byte length including the length field itself.
    total: usize,
    is_cie: bool,
    keep: bool,
}

/// Walk the FDE list, drop entries whose covered function is excluded or a
/// placeholder, and rebuild the payload and relocation offsets.
pub fn rebuild_eh_frame(p: &mut ObjectFile) -> Result<()> {
    let Some(eh_id) = p.section_by_name(".eh_frame") else {
        return Ok(());
    };
    if !p.sections[eh_id.0].include {
        return Ok(());
    }
    let le = p.is_le();
    let old_relocs: Vec<Rela> = match p.sections[eh_id.0].rela {
        Some(rela) => p.sections[rela.0].relocs.clone(),
        None => Vec::new(),
    };

    let data = &p.sections[eh_id.0].data;
    let mut records = Vec::new();
    let mut off = 0;
    while off + 4 <= data.len() {
        let len = get_u32(data, off, le) as usize;
        if len == 0 {
            break;
        }
        if len == 0xffff_ffff {
            return Err(DiffError::InvalidElf(format!(
                "{}: extended-length .eh_frame entries are not supported",
                p.name
            )));
        }
        let total = 4 + len;
        if off + total > data.len() {
            return Err(DiffError::InvalidElf(format!(
                "{}: truncated .eh_frame entry at {:#x}",
                p.name, off
            )));
        }
        let is_cie = get_u32(data, off + 4, le) == 0;
        records.push(FrameRecord {
            start: off,
            total,
            is_cie,
            keep: true,
        });
        off += total;
    }

    for rec in &mut records {
        if rec.is_cie {
            continue;
        }
        // The relocation on the initial-location field names the covered
        // function.
        let func = old_relocs
            .iter()
            .find(|r| r.offset == (rec.start + 8) as u64)
            .map(|r| r.sym);
        let Some(func) = func else {
            return Err(DiffError::BadRelocation {
                sec: ".eh_frame".to_string(),
                offset: rec.start as u64,
                msg: "FDE has no relocation on its initial location".to_string(),
            });
        };
        let sym = &p.symbols[func.0];
        rec.keep = sym.include && !sym.placeholder;
        if !rec.keep {
            log::debug!(
                "[{}] dropping FDE for {}",
                p.name,
                sym.display_name()
            );
        }
    }

    // Rebuild the payload and compute the offset mapping.
    let mut new_data = Vec::with_capacity(data.len());
    let mut new_start = vec![None; records.len()];
    for (i, rec) in records.iter().enumerate() {
        if rec.keep {
            new_start[i] = Some(new_data.len());
            new_data.extend_from_slice(&data[rec.start..rec.start + rec.total]);
        }
    }

    // Retarget the CIE pointers of surviving FDEs: the field holds the
    // distance from itself back to its CIE.
    for (i, rec) in records.iter().enumerate() {
        if rec.is_cie || !rec.keep {
            continue;
        }
        let old_field = rec.start + 4;
        let distance = get_u32(data, old_field, le) as usize;
        let old_cie_start = old_field - distance;
        let cie_index = records
            .iter()
            .position(|r| r.is_cie && r.start == old_cie_start)
            .ok_or_else(|| {
                DiffError::InvalidElf(format!(
                    "{}: FDE at {:#x} points at a missing CIE",
                    p.name, rec.start
                ))
            })?;
        let new_field = new_start[i].unwrap() + 4;
        let new_distance = new_field - new_start[cie_index].unwrap();
        put_u32(&mut new_data, new_field, new_distance as u32, le);
    }

    // Carry surviving relocations over, shifted to the new record offsets.
    let mut new_relocs = Vec::with_capacity(old_relocs.len());
    for r in &old_relocs {
        let Some((i, rec)) = records
            .iter()
            .enumerate()
            .find(|(_, rec)| {
                (r.offset as usize) >= rec.start && (r.offset as usize) < rec.start + rec.total
            })
        else {
            continue;
        };
        if !rec.keep {
            continue;
        }
        let mut moved = *r;
        moved.offset = (r.offset as usize - rec.start + new_start[i].unwrap()) as u64;
        new_relocs.push(moved);
    }

    let dropped = records.iter().filter(|r| !r.is_cie && !r.keep).count();
    log::debug!(
        "[{}] .eh_frame rebuilt, {} of {} FDEs dropped",
        p.name,
        dropped,
        records.iter().filter(|r| !r.is_cie).count()
    );

    let size = new_data.len() as u64;
    p.sections[eh_id.0].data = new_data;
    p.sections[eh_id.0].size = size;
    if let Some(rela) = p.sections[eh_id.0].rela {
        p.sections[rela.0].relocs = new_relocs;
    }
    Ok(())
}
