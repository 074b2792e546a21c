//! Selecting the sub-graph that must appear in the output object.
//!
//! Seeds go in, the transitive closure over the "depends-on" relation
//! defined by relocations comes out. Unchanged local functions reached only
//! through references survive as placeholders: body zeroed, resolved in the
//! target process at load time.

use goblin::elf::sym::{STB_GLOBAL, STT_FUNC, STT_SECTION};

use crate::elf::{
    is_debug_section, is_eh_section, is_string_literal_section, ObjectFile, SecId, SectionKind,
    Status, Strip, SymId,
};
use crate::{DiffError, Result};

enum Item {
    Sym(SymId),
    Sec(SecId),
}

fn run_closure(p: &mut ObjectFile, mut work: Vec<Item>) {
    while let Some(item) = work.pop() {
        match item {
            Item::Sym(id) => {
                if p.symbols[id.0].include {
                    continue;
                }
                p.symbols[id.0].include = true;

                let sym = &p.symbols[id.0];
                if sym.kind == STT_FUNC && sym.is_local() && sym.status == Status::Same {
                    // Placeholder: carry the section for its layout but
                    // not its relocations; the body will be zeroed.
                    p.symbols[id.0].placeholder = true;
                    log::debug!(
                        "[{}] keeping {} as a placeholder",
                        p.name,
                        p.symbols[id.0].display_name()
                    );
                    if let Some(sec) = p.symbols[id.0].sec {
                        p.sections[sec.0].include = true;
                        if let Some(ssym) = p.sections[sec.0].section_sym {
                            p.symbols[ssym.0].include = true;
                        }
                    }
                    continue;
                }
                let sym = &p.symbols[id.0];
                if let Some(sec) = sym.sec {
                    if sym.status != Status::Same || sym.kind == STT_SECTION {
                        work.push(Item::Sec(sec));
                    }
                }
            }
            Item::Sec(id) => {
                if p.sections[id.0].include {
                    continue;
                }
                p.sections[id.0].include = true;
                if let Some(ssym) = p.sections[id.0].section_sym {
                    p.symbols[ssym.0].include = true;
                }
                if let Some(rela) = p.sections[id.0].rela {
                    if !p.sections[rela.0].include {
                        p.sections[rela.0].include = true;
                        for r in &p.sections[rela.0].relocs {
                            work.push(Item::Sym(r.sym));
                        }
                    }
                }
            }
        }
    }
}

pub fn include_symbol(p: &mut ObjectFile, id: SymId) {
    run_closure(p, vec![Item::Sym(id)]);
}

pub fn include_section(p: &mut ObjectFile, id: SecId) {
    run_closure(p, vec![Item::Sec(id)]);
}

/// The skeleton every patch needs: string/symbol tables, read-only
/// constants, the NULL symbol and the source-file markers.
pub fn include_standard_elements(p: &mut ObjectFile) {
    let seeds: Vec<SecId> = p
        .sections
        .iter()
        .enumerate()
        .filter(|(_, s)| {
            matches!(s.name.as_str(), ".shstrtab" | ".strtab" | ".symtab" | ".rodata")
                || is_string_literal_section(&s.name)
        })
        .map(|(i, _)| SecId(i))
        .collect();
    for id in seeds {
        include_section(p, id);
    }
    if let Some(null) = p.symbols.first_mut() {
        null.include = true;
        null.strip = Strip::Keep;
    }
    for sym in &mut p.symbols {
        if sym.is_file_sym() {
            sym.include = true;
        }
    }
}

/// Seed every changed function and every changed exception-handling
/// section symbol; returns the number of changed functions (subfunctions
/// excluded).
pub fn include_changed_functions(p: &mut ObjectFile) -> usize {
    let mut count = 0;
    for i in 0..p.symbols.len() {
        let sym = &p.symbols[i];
        if sym.status != Status::Changed {
            continue;
        }
        let is_changed_func = sym.kind == STT_FUNC;
        let is_changed_eh = sym.kind == STT_SECTION
            && sym
                .sec
                .map(|s| is_eh_section(&p.sections[s.0].name))
                .unwrap_or(false);
        if !is_changed_func && !is_changed_eh {
            continue;
        }
        if is_changed_func && sym.parent.is_none() {
            count += 1;
        }
        include_symbol(p, SymId(i));
    }
    count
}

pub fn include_new_globals(p: &mut ObjectFile) -> usize {
    let mut count = 0;
    for i in 0..p.symbols.len() {
        let sym = &p.symbols[i];
        if sym.bind == STB_GLOBAL && sym.status == Status::New && sym.sec.is_some() {
            count += 1;
            include_symbol(p, SymId(i));
        }
    }
    count
}

/// Refuse the patch shapes the runtime cannot apply. Errors are enumerated
/// before aborting so the log shows the whole damage, not just the first
/// hit.
pub fn validate_patchability(p: &ObjectFile) -> Result<()> {
    let mut errors = 0;
    for sec in &p.sections {
        if sec.ignore
            || is_debug_section(&sec.name)
            || sec.name == ".eh_frame"
            || sec.name == ".rela.eh_frame"
        {
            continue;
        }
        if sec.status == Status::Changed && !sec.include {
            log::error!("[{}] changed section {} not included", p.name, sec.name);
            errors += 1;
        }
        if sec.status != Status::Same && (sec.kind == SectionKind::Group || sec.grouped) {
            log::error!(
                "[{}] changed or new grouped section {} cannot be patched",
                p.name,
                sec.name
            );
            errors += 1;
        }
        if sec.include
            && sec.status != Status::New
            && (sec.name.starts_with(".data") || sec.name.starts_with(".bss"))
            && sec.name != ".data.unlikely"
            && sec.name != ".data.once"
        {
            log::error!("[{}] data section {} selected for inclusion", p.name, sec.name);
            errors += 1;
        }
    }
    if errors != 0 {
        return Err(DiffError::Unpatchable(errors));
    }
    Ok(())
}
