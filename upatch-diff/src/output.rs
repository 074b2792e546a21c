//! Migration of the included sub-graph into a fresh object, metadata
//! synthesis, symbol reordering, stripping and final index fixup.

use goblin::elf::section_header::SHT_PROGBITS;
use goblin::elf::sym::{STB_LOCAL, STB_WEAK, STT_NOTYPE, STT_SECTION};

use upatch_meta::{
    FuncFlags, PatchFunc, PatchInfo, PatchSymbol, ARCH_SECTION_PREFIX, FUNCS_SECTION,
    INFO_SECTION, STRINGS_SECTION, SYMBOLS_SECTION, SYM_OTHER_PLACEHOLDER,
};

use crate::arch::ArchRules;
use crate::elf::{ObjectFile, Rela, SecId, Section, Status, Strip, SymId, Symbol};
use crate::running::{RunningImage, RunningSym};
use crate::{DiffError, Result};

/// Turn the patched object's included sub-graph into the output object.
pub fn build_output(
    p: ObjectFile,
    running: &RunningImage,
    arch: &dyn ArchRules,
) -> Result<ObjectFile> {
    let mut u = migrate(p);
    create_patch_metadata(&mut u, running, arch)?;
    reorder_symbols(&mut u);
    strip_unneeded(&mut u);
    Ok(u)
}

/// Move every included section and symbol into a fresh graph, rewriting all
/// cross references to the new contiguous ids. Placeholder bodies are
/// zeroed and their symbols gain the marker bit; symbols whose section was
/// left behind become undefined.
fn migrate(mut p: ObjectFile) -> ObjectFile {
    let mut sec_map: Vec<Option<SecId>> = vec![None; p.sections.len()];
    let mut next = 0;
    for (i, sec) in p.sections.iter().enumerate() {
        if sec.include {
            sec_map[i] = Some(SecId(next));
            next += 1;
        }
    }
    let mut sym_map: Vec<Option<SymId>> = vec![None; p.symbols.len()];
    let mut next = 0;
    for (i, sym) in p.symbols.iter().enumerate() {
        if sym.include {
            sym_map[i] = Some(SymId(next));
            next += 1;
        }
    }

    let placeholder_secs: Vec<SecId> = p
        .symbols
        .iter()
        .filter(|s| s.placeholder)
        .filter_map(|s| s.sec)
        .collect();
    for sec in placeholder_secs {
        for byte in &mut p.sections[sec.0].data {
            *byte = 0;
        }
    }

    let sections: Vec<Section> = p
        .sections
        .into_iter()
        .filter(|s| s.include)
        .enumerate()
        .map(|(new_index, mut s)| {
            s.index = new_index;
            s.base = s.base.and_then(|b| sec_map[b.0]);
            s.rela = s.rela.and_then(|r| sec_map[r.0]);
            s.section_sym = s.section_sym.and_then(|y| sym_map[y.0]);
            s.sym = s.sym.and_then(|y| sym_map[y.0]);
            s.twin = None;
            s.relocs = s
                .relocs
                .into_iter()
                .filter_map(|mut r| {
                    r.sym = sym_map[r.sym.0]?;
                    Some(r)
                })
                .collect();
            s
        })
        .collect();

    let symbols: Vec<Symbol> = p
        .symbols
        .into_iter()
        .filter(|s| s.include)
        .enumerate()
        .map(|(new_index, mut s)| {
            let had_sec = s.sec.is_some();
            s.index = new_index;
            s.sec = s.sec.and_then(|c| sec_map[c.0]);
            if had_sec && s.sec.is_none() {
                // The section stayed behind; the symbol is now external.
                s.shndx = 0;
            }
            if s.placeholder {
                s.st_other |= SYM_OTHER_PLACEHOLDER;
            }
            s.twin = None;
            s.parent = s.parent.and_then(|x| sym_map[x.0]);
            s.children = s.children.iter().filter_map(|c| sym_map[c.0]).collect();
            s
        })
        .collect();

    log::debug!(
        "[{}] migrated {} sections, {} symbols into the patch",
        p.name,
        sections.len(),
        symbols.len()
    );

    ObjectFile {
        name: p.name,
        header: p.header,
        arch: p.arch,
        sections,
        symbols,
    }
}

struct StringPool {
    data: Vec<u8>,
}

impl StringPool {
    fn new() -> Self {
        StringPool { data: vec![0] }
    }

    fn intern(&mut self, s: &str) -> u64 {
        let off = self.data.len() as u64;
        self.data.extend_from_slice(s.as_bytes());
        self.data.push(0);
        off
    }
}

fn resolve_in_running<'r>(
    running: &'r RunningImage,
    sym: &Symbol,
) -> Result<&'r RunningSym> {
    let found = if sym.is_local() {
        sym.running_file
            .and_then(|block| running.lookup_local(block, &sym.name))
    } else {
        running.lookup_global(&sym.name)
    };
    found.ok_or_else(|| DiffError::UnresolvedSymbol(sym.name.clone()))
}

/// Synthesize the `.upatch.*` sections: per-function records, external
/// symbol records, the shared string pool, the patch header and the
/// architecture descriptor.
fn create_patch_metadata(
    u: &mut ObjectFile,
    running: &RunningImage,
    arch: &dyn ArchRules,
) -> Result<()> {
    let le = u.is_le();
    let mut pool = StringPool::new();

    // Per-function records for every changed, non-child function.
    let mut func_records: Vec<(SymId, PatchFunc)> = Vec::new();
    for (i, sym) in u.symbols.iter().enumerate() {
        if !sym.is_func()
            || sym.status != Status::Changed
            || sym.placeholder
            || sym.parent.is_some()
        {
            continue;
        }
        let old = resolve_in_running(running, sym)?;
        log::info!(
            "[{}] changed function {}, running address {:#x}",
            u.name,
            sym.display_name(),
            old.value
        );
        func_records.push((
            SymId(i),
            PatchFunc {
                new_addr: 0,
                new_size: sym.size,
                old_addr: old.value,
                old_size: old.size,
                flags: FuncFlags::new().with_has_children(!sym.children.is_empty()),
                name: pool.intern(&sym.name),
            },
        ));
    }

    // External records: undefined symbols and placeholders, resolved
    // against the running binary. Weak externals may legitimately be
    // absent.
    let mut sym_records: Vec<(SymId, PatchSymbol)> = Vec::new();
    for (i, sym) in u.symbols.iter().enumerate() {
        if i == 0 || sym.is_file_sym() || sym.is_section_sym() {
            continue;
        }
        let external = sym.placeholder || (sym.sec.is_none() && sym.shndx == 0);
        if !external {
            continue;
        }
        let addr = match resolve_in_running(running, sym) {
            Ok(found) => found.value,
            Err(_) if sym.bind == STB_WEAK => {
                log::warn!(
                    "[{}] unresolved weak symbol {}",
                    u.name,
                    sym.display_name()
                );
                0
            }
            Err(err) => return Err(err),
        };
        log::debug!(
            "[{}] resolved external {} to {:#x}",
            u.name,
            sym.display_name(),
            addr
        );
        sym_records.push((
            SymId(i),
            PatchSymbol {
                addr,
                name: pool.intern(&sym.name),
            },
        ));
    }

    // The string pool section and its section symbol, which the record
    // name fields are relocated against.
    let strings_sec = SecId(u.sections.len());
    u.sections.push(Section::synthetic(
        STRINGS_SECTION,
        SHT_PROGBITS,
        0,
        1,
        pool.data,
    ));
    let strings_sym = SymId(u.symbols.len());
    u.symbols.push(Symbol::synthetic(
        STRINGS_SECTION,
        STT_SECTION,
        STB_LOCAL,
        Some(strings_sec),
    ));
    u.sections[strings_sec.0].section_sym = Some(strings_sym);

    // `.upatch.funcs` with relocations on new_addr and name.
    let mut funcs_data = Vec::with_capacity(func_records.len() * PatchFunc::SIZE);
    let mut funcs_relocs = Vec::new();
    for (slot, (sym_id, record)) in func_records.iter().enumerate() {
        funcs_data.extend_from_slice(&record.to_bytes(le));
        funcs_relocs.push(Rela {
            offset: (slot * PatchFunc::SIZE + PatchFunc::NEW_ADDR_OFFSET) as u64,
            ty: arch.abs64_type(),
            sym: *sym_id,
            addend: 0,
        });
        funcs_relocs.push(Rela {
            offset: (slot * PatchFunc::SIZE + PatchFunc::NAME_OFFSET) as u64,
            ty: arch.abs64_type(),
            sym: strings_sym,
            addend: record.name as i64,
        });
    }
    let mut funcs_sec = Section::synthetic(FUNCS_SECTION, SHT_PROGBITS, 0, 8, funcs_data);
    funcs_sec.sh_entsize = PatchFunc::SIZE as u64;
    push_with_rela(u, funcs_sec, funcs_relocs);

    // `.upatch.symbols`: addresses are known now and stored verbatim, only
    // the names need relocations.
    let mut syms_data = Vec::with_capacity(sym_records.len() * PatchSymbol::SIZE);
    let mut syms_relocs = Vec::new();
    for (slot, (_, record)) in sym_records.iter().enumerate() {
        syms_data.extend_from_slice(&record.to_bytes(le));
        syms_relocs.push(Rela {
            offset: (slot * PatchSymbol::SIZE + PatchSymbol::NAME_OFFSET) as u64,
            ty: arch.abs64_type(),
            sym: strings_sym,
            addend: record.name as i64,
        });
    }
    let mut syms_sec = Section::synthetic(SYMBOLS_SECTION, SHT_PROGBITS, 0, 8, syms_data);
    syms_sec.sh_entsize = PatchSymbol::SIZE as u64;
    push_with_rela(u, syms_sec, syms_relocs);

    // Patch header and the architecture descriptor.
    let info = PatchInfo::new(
        arch.machine() as u32,
        func_records.len() as u32,
        sym_records.len() as u32,
    );
    u.sections.push(Section::synthetic(
        INFO_SECTION,
        SHT_PROGBITS,
        0,
        4,
        info.to_bytes(le).to_vec(),
    ));
    let (suffix, descriptor) = arch.descriptor(le);
    u.sections.push(Section::synthetic(
        format!("{}{}", ARCH_SECTION_PREFIX, suffix),
        SHT_PROGBITS,
        0,
        4,
        descriptor,
    ));

    log::info!(
        "[{}] {} function record(s), {} external record(s)",
        u.name,
        info.nr_funcs,
        info.nr_symbols
    );
    Ok(())
}

fn push_with_rela(u: &mut ObjectFile, sec: Section, relocs: Vec<Rela>) {
    let base = SecId(u.sections.len());
    u.sections.push(sec);
    let rela_id = SecId(u.sections.len());
    let mut rela = Section::synthetic(
        format!(".rela{}", u.sections[base.0].name),
        goblin::elf::section_header::SHT_RELA,
        0,
        8,
        Vec::new(),
    );
    rela.base = Some(base);
    rela.relocs = relocs;
    u.sections.push(rela);
    u.sections[base.0].rela = Some(rela_id);
}

/// Linker-compliant symbol order: the NULL symbol, locals (section symbols,
/// then file symbols, then the rest), then globals and weaks with the
/// undefined ones first.
fn reorder_symbols(u: &mut ObjectFile) {
    fn rank(index: usize, sym: &Symbol) -> u8 {
        if index == 0 {
            0
        } else if sym.is_local() {
            match sym.kind {
                STT_SECTION => 1,
                k if k == goblin::elf::sym::STT_FILE => 2,
                _ => 3,
            }
        } else if sym.sec.is_none() && sym.shndx == 0 {
            4
        } else {
            5
        }
    }

    let mut order: Vec<usize> = (0..u.symbols.len()).collect();
    order.sort_by_key(|&i| rank(i, &u.symbols[i]));

    let mut map = vec![0usize; u.symbols.len()];
    for (new_index, &old_index) in order.iter().enumerate() {
        map[old_index] = new_index;
    }

    let mut slots: Vec<Option<Symbol>> = u.symbols.drain(..).map(Some).collect();
    u.symbols = order
        .iter()
        .map(|&old_index| slots[old_index].take().unwrap())
        .collect();
    for (i, sym) in u.symbols.iter_mut().enumerate() {
        sym.index = i;
    }

    remap_symbol_refs(u, |id| Some(SymId(map[id.0])));
}

/// Remove symbols nothing needs: unreferenced NOTYPE entries and section
/// symbols whose section did not survive.
fn strip_unneeded(u: &mut ObjectFile) {
    let mut used = vec![false; u.symbols.len()];
    for sec in &u.sections {
        for r in &sec.relocs {
            used[r.sym.0] = true;
        }
    }

    let keep: Vec<bool> = u
        .symbols
        .iter()
        .enumerate()
        .map(|(i, sym)| {
            if i == 0 || sym.strip == Strip::Keep || sym.is_file_sym() {
                return true;
            }
            match sym.kind {
                STT_NOTYPE => used[i],
                STT_SECTION => sym.sec.is_some() || used[i],
                _ => true,
            }
        })
        .collect();

    let mut map: Vec<Option<SymId>> = vec![None; u.symbols.len()];
    let mut next = 0;
    for (i, &kept) in keep.iter().enumerate() {
        if kept {
            map[i] = Some(SymId(next));
            next += 1;
        }
    }
    if next == u.symbols.len() {
        return;
    }
    log::debug!(
        "[{}] stripped {} unneeded symbol(s)",
        u.name,
        u.symbols.len() - next
    );

    let mut index = 0;
    u.symbols.retain(|_| {
        let kept = keep[index];
        index += 1;
        kept
    });
    for (i, sym) in u.symbols.iter_mut().enumerate() {
        sym.index = i;
    }

    remap_symbol_refs(u, |id| map[id.0]);
}

fn remap_symbol_refs(u: &mut ObjectFile, map: impl Fn(SymId) -> Option<SymId>) {
    for sec in &mut u.sections {
        sec.section_sym = sec.section_sym.and_then(&map);
        sec.sym = sec.sym.and_then(&map);
        for r in &mut sec.relocs {
            // Referenced symbols are never stripped; the rules above keep
            // anything in the used set.
            if let Some(new_id) = map(r.sym) {
                r.sym = new_id;
            }
        }
    }
    for sym in &mut u.symbols {
        sym.parent = sym.parent.and_then(&map);
        sym.children = sym.children.iter().filter_map(|c| map(*c)).collect();
    }
}
