//! Parsing relocatable objects into the arena graph.

use std::fs::File;
use std::path::Path;

use goblin::elf::header::ET_REL;
use goblin::elf::section_header::{self, SHN_UNDEF};
use goblin::elf::sym::STT_SECTION;
use goblin::elf::Elf;
use memmap2::Mmap;

use crate::arch::Arch;
use crate::elf::{
    get_u32, ObjectFile, Rela, SecId, Section, SectionKind, Status, Strip, SymId, Symbol,
};
use crate::{DiffError, Result};

fn basename(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

impl ObjectFile {
    /// Parse a relocatable object file into an owned graph.
    ///
    /// Inputs with program headers are rejected; only `ET_REL` objects can
    /// be diffed.
    pub fn parse(path: &Path) -> Result<ObjectFile> {
        let name = basename(path);
        let file = File::open(path).map_err(|source| DiffError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let map = unsafe { Mmap::map(&file) }.map_err(|source| DiffError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let elf = Elf::parse(&map)?;

        if !elf.is_64 {
            return Err(DiffError::InvalidElf(format!(
                "{}: only 64-bit objects are supported",
                name
            )));
        }
        if elf.header.e_type != ET_REL {
            return Err(DiffError::InvalidElf(format!(
                "{}: not a relocatable object",
                name
            )));
        }
        if elf.header.e_phnum != 0 {
            return Err(DiffError::InvalidElf(format!(
                "{}: program headers present, refusing to diff",
                name
            )));
        }
        let arch = Arch::from_machine(elf.header.e_machine)
            .ok_or(DiffError::UnsupportedMachine(elf.header.e_machine))?;

        let le = elf.little_endian;

        // Sections, skipping the leading SHT_NULL entry. The map from input
        // index to arena id stays alive for symbol and relocation fixups.
        let mut sections = Vec::new();
        let mut sec_map: Vec<Option<SecId>> = vec![None; elf.section_headers.len()];
        for (index, shdr) in elf.section_headers.iter().enumerate() {
            if shdr.sh_type == section_header::SHT_NULL {
                continue;
            }
            let sec_name = elf
                .shdr_strtab
                .get_at(shdr.sh_name)
                .unwrap_or("")
                .to_string();
            let kind = SectionKind::from_sh_type(shdr.sh_type);
            let data = if kind == SectionKind::Nobits || shdr.sh_size == 0 {
                Vec::new()
            } else {
                let start = shdr.sh_offset as usize;
                let end = start + shdr.sh_size as usize;
                map.get(start..end)
                    .ok_or_else(|| {
                        DiffError::InvalidElf(format!(
                            "{}: section {} extends past end of file",
                            name, sec_name
                        ))
                    })?
                    .to_vec()
            };
            sec_map[index] = Some(SecId(sections.len()));
            sections.push(Section {
                name: sec_name,
                index,
                kind,
                sh_type: shdr.sh_type,
                sh_flags: shdr.sh_flags,
                sh_addralign: shdr.sh_addralign,
                sh_entsize: shdr.sh_entsize,
                size: shdr.sh_size,
                data,
                relocs: Vec::new(),
                base: None,
                rela: None,
                section_sym: None,
                sym: None,
                include: false,
                ignore: false,
                grouped: false,
                status: Status::New,
                twin: None,
            });
        }

        // Companion links: a rela section applies to the section named by its
        // sh_info, and every base section has at most one rela companion.
        for (index, shdr) in elf.section_headers.iter().enumerate() {
            if shdr.sh_type != section_header::SHT_RELA {
                continue;
            }
            let rela_id = sec_map[index].unwrap();
            let base_id = sec_map
                .get(shdr.sh_info as usize)
                .copied()
                .flatten()
                .ok_or_else(|| {
                    DiffError::InvalidElf(format!(
                        "{}: rela section {} has no base section",
                        name, sections[rela_id.0].name
                    ))
                })?;
            sections[rela_id.0].base = Some(base_id);
            sections[base_id.0].rela = Some(rela_id);
        }

        // COMDAT group members keep a flag so the differ can refuse grouped
        // changes later.
        for (index, shdr) in elf.section_headers.iter().enumerate() {
            if shdr.sh_type != section_header::SHT_GROUP {
                continue;
            }
            let group_id = sec_map[index].unwrap();
            let data = &sections[group_id.0].data;
            let mut members = Vec::new();
            let mut off = 4;
            while off + 4 <= data.len() {
                members.push(get_u32(data, off, le) as usize);
                off += 4;
            }
            for member in members {
                if let Some(Some(id)) = sec_map.get(member) {
                    sections[id.0].grouped = true;
                }
            }
        }

        // Symbols, preserving symtab order so relocation entries can keep
        // their raw symbol indices.
        let mut symbols = Vec::new();
        for (index, s) in elf.syms.iter().enumerate() {
            let sec = match s.st_shndx {
                n if n == SHN_UNDEF as usize => None,
                n if n >= section_header::SHN_LORESERVE as usize => None,
                n => sec_map.get(n).copied().flatten(),
            };
            let mut sym_name = elf.strtab.get_at(s.st_name).unwrap_or("").to_string();
            // Section symbols carry no name of their own; borrow the
            // section's so diagnostics and correlation have something to go
            // on.
            if s.st_type() == STT_SECTION {
                if let Some(id) = sec {
                    sym_name = sections[id.0].name.clone();
                    sections[id.0].section_sym = Some(SymId(index));
                }
            }
            symbols.push(Symbol {
                name: sym_name,
                index,
                bind: s.st_bind(),
                kind: s.st_type(),
                st_other: s.st_other,
                value: s.st_value,
                size: s.st_size,
                shndx: s.st_shndx,
                sec,
                include: false,
                placeholder: false,
                strip: Strip::Default,
                status: Status::New,
                twin: None,
                parent: None,
                children: Vec::new(),
                running_file: None,
            });
        }

        // Relocation entries into their owning rela sections, in input order.
        for (index, rs) in &elf.shdr_relocs {
            let Some(sec_id) = sec_map.get(*index).copied().flatten() else {
                continue;
            };
            if sections[sec_id.0].kind != SectionKind::Rela {
                continue;
            }
            let mut relocs = Vec::with_capacity(rs.len());
            for r in rs.iter() {
                if r.r_sym >= symbols.len() {
                    return Err(DiffError::InvalidElf(format!(
                        "{}: relocation in {} references symbol {} out of range",
                        name, sections[sec_id.0].name, r.r_sym
                    )));
                }
                relocs.push(Rela {
                    offset: r.r_offset,
                    ty: r.r_type,
                    sym: SymId(r.r_sym),
                    addend: r.r_addend.unwrap_or(0),
                });
            }
            sections[sec_id.0].relocs = relocs;
        }

        log::debug!(
            "[{}] parsed {} sections, {} symbols ({:?})",
            name,
            sections.len(),
            symbols.len(),
            arch
        );

        Ok(ObjectFile {
            name,
            header: elf.header,
            arch,
            sections,
            symbols,
        })
    }
}

/// The original and patched objects must come from the same compiler
/// invocation shape; any drift in the identity fields makes the diff
/// meaningless.
pub fn check_headers(orig: &ObjectFile, patched: &ObjectFile) -> Result<()> {
    let a = &orig.header;
    let b = &patched.header;
    let fields: [(&'static str, bool); 10] = [
        ("e_ident", a.e_ident == b.e_ident),
        ("e_type", a.e_type == b.e_type),
        ("e_machine", a.e_machine == b.e_machine),
        ("e_version", a.e_version == b.e_version),
        ("e_entry", a.e_entry == b.e_entry),
        ("e_phoff", a.e_phoff == b.e_phoff),
        ("e_flags", a.e_flags == b.e_flags),
        ("e_ehsize", a.e_ehsize == b.e_ehsize),
        ("e_phentsize", a.e_phentsize == b.e_phentsize),
        ("e_shentsize", a.e_shentsize == b.e_shentsize),
    ];
    for (field, equal) in fields {
        if !equal {
            return Err(DiffError::HeaderMismatch(field));
        }
    }
    Ok(())
}
