//! Classifying correlated entities as SAME, CHANGED or NEW.

use goblin::elf::sym::STT_FUNC;

use crate::elf::{ObjectFile, SectionKind, Status};

/// `.discard*` sections carry build-time annotations that must never end up
/// in a patch; exclude them from both comparison and validation.
pub fn mark_ignored_sections(obj: &mut ObjectFile) {
    for sec in &mut obj.sections {
        if sec.name.starts_with(".discard") || sec.name.starts_with(".rela.discard") {
            sec.ignore = true;
        }
    }
}

/// Compare every correlated section and symbol pair and record the verdict
/// on both twins. Uncorrelated entities on the patched side keep their NEW
/// status.
pub fn compare_correlated(orig: &mut ObjectFile, patched: &mut ObjectFile) {
    compare_sections(orig, patched);
    compare_symbols(orig, patched);
    propagate_child_status(patched);
    propagate_child_status(orig);

    for sec in patched.sections.iter().filter(|s| s.status == Status::Changed) {
        log::debug!("[{}] section {} changed", patched.name, sec.name);
    }
}

fn compare_sections(orig: &mut ObjectFile, patched: &mut ObjectFile) {
    for pi in 0..patched.sections.len() {
        let Some(twin) = patched.sections[pi].twin else {
            continue;
        };
        let status = compare_section_pair(orig, patched, twin.0, pi);
        patched.sections[pi].status = status;
        orig.sections[twin.0].status = status;
    }
}

fn compare_section_pair(
    orig: &ObjectFile,
    patched: &ObjectFile,
    oi: usize,
    pi: usize,
) -> Status {
    let osec = &orig.sections[oi];
    let psec = &patched.sections[pi];

    if osec.ignore || psec.ignore {
        return Status::Same;
    }
    if osec.size != psec.size || osec.sh_flags != psec.sh_flags {
        return Status::Changed;
    }
    if psec.kind == SectionKind::Rela {
        if osec.relocs.len() != psec.relocs.len() {
            return Status::Changed;
        }
        for (o, p) in osec.relocs.iter().zip(&psec.relocs) {
            if o.offset != p.offset || o.ty != p.ty || o.addend != p.addend {
                return Status::Changed;
            }
            // Referent equality is equality of correlated twins, so a
            // mangled-suffix rename of the same static local stays SAME.
            if orig.symbols[o.sym.0].twin != Some(p.sym) {
                return Status::Changed;
            }
        }
        return Status::Same;
    }
    if psec.kind != SectionKind::Nobits && osec.data != psec.data {
        return Status::Changed;
    }
    // A byte-identical section whose relocations changed is still a
    // different section.
    match (osec.rela, psec.rela) {
        (None, None) => Status::Same,
        (Some(orela), Some(prela)) => {
            if patched.sections[prela.0].twin != Some(orela) {
                return Status::Changed;
            }
            if compare_section_pair(orig, patched, orela.0, prela.0) == Status::Changed {
                Status::Changed
            } else {
                Status::Same
            }
        }
        _ => Status::Changed,
    }
}

fn compare_symbols(orig: &mut ObjectFile, patched: &mut ObjectFile) {
    for pi in 0..patched.symbols.len() {
        let psym = &patched.symbols[pi];
        let Some(twin) = psym.twin else { continue };
        let osym = &orig.symbols[twin.0];

        let mut status = Status::Same;
        if osym.kind != psym.kind || osym.bind != psym.bind || osym.size != psym.size {
            status = Status::Changed;
        }
        if let Some(sec) = psym.sec {
            if patched.sections[sec.0].status == Status::Changed {
                status = Status::Changed;
            }
        }
        let psym_kind = psym.kind;
        patched.symbols[pi].status = status;
        orig.symbols[twin.0].status = status;

        if status == Status::Changed && psym_kind == STT_FUNC {
            log::debug!(
                "[{}] changed function {}",
                patched.name,
                patched.symbols[pi].display_name()
            );
        }
    }
}

/// Parents and their `.cold`/`.part` children are patched as a unit: a
/// change on either side of the link taints the other.
fn propagate_child_status(obj: &mut ObjectFile) {
    loop {
        let mut progressed = false;
        for i in 0..obj.symbols.len() {
            if obj.symbols[i].status != Status::Changed {
                continue;
            }
            if let Some(parent) = obj.symbols[i].parent {
                if obj.symbols[parent.0].status == Status::Same {
                    obj.symbols[parent.0].status = Status::Changed;
                    progressed = true;
                }
            }
            for ci in 0..obj.symbols[i].children.len() {
                let child = obj.symbols[i].children[ci];
                if obj.symbols[child.0].status == Status::Same {
                    obj.symbols[child.0].status = Status::Changed;
                    progressed = true;
                }
            }
        }
        if !progressed {
            break;
        }
    }
}

