//! Serializing the output graph back into an ELF64 relocatable file.
//!
//! The writer regenerates `.symtab`, `.strtab` and `.shstrtab` from the
//! arenas, lays the remaining payloads out in arena order and finishes with
//! the section header table. The file is written to a sibling temp path and
//! renamed into place so a failed build never leaves a partial patch.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use goblin::elf::header::ET_REL;
use goblin::elf::section_header::SHN_LORESERVE;

use crate::elf::{Emitter, ObjectFile, SectionKind};
use crate::{DiffError, Result};

const EHDR_SIZE: usize = 64;
const SHDR_SIZE: usize = 64;
const SYM_SIZE: usize = 24;
const RELA_SIZE: usize = 24;

pub fn write_object(obj: &ObjectFile, path: &Path) -> Result<()> {
    let image = build_image(obj)?;

    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let tmp = path.with_file_name(format!("{}.tmp", file_name));
    let io_err = |source| DiffError::Io {
        path: path.to_path_buf(),
        source,
    };
    fs::write(&tmp, &image).map_err(io_err)?;
    fs::set_permissions(&tmp, fs::Permissions::from_mode(0o664)).map_err(io_err)?;
    fs::rename(&tmp, path).map_err(io_err)?;
    log::debug!("[{}] wrote {} bytes to {}", obj.name, image.len(), path.display());
    Ok(())
}

fn build_image(obj: &ObjectFile) -> Result<Vec<u8>> {
    let le = obj.is_le();

    let symtab_idx = obj
        .sections
        .iter()
        .position(|s| s.kind == SectionKind::Symtab)
        .ok_or_else(|| DiffError::InvalidElf(format!("{}: no .symtab in output", obj.name)))?;
    let strtab_idx = obj
        .sections
        .iter()
        .position(|s| s.kind == SectionKind::Strtab && s.name == ".strtab")
        .ok_or_else(|| DiffError::InvalidElf(format!("{}: no .strtab in output", obj.name)))?;
    let shstrtab_idx = obj
        .sections
        .iter()
        .position(|s| s.kind == SectionKind::Strtab && s.name == ".shstrtab")
        .ok_or_else(|| DiffError::InvalidElf(format!("{}: no .shstrtab in output", obj.name)))?;

    // Symbol name pool. Section symbols write st_name 0, like the assembler
    // does.
    let mut strtab = vec![0u8];
    let mut st_names = Vec::with_capacity(obj.symbols.len());
    for sym in &obj.symbols {
        if sym.name.is_empty() || sym.is_section_sym() {
            st_names.push(0u32);
        } else {
            st_names.push(strtab.len() as u32);
            strtab.extend_from_slice(sym.name.as_bytes());
            strtab.push(0);
        }
    }

    let first_nonlocal = obj
        .symbols
        .iter()
        .position(|s| !s.is_local())
        .unwrap_or(obj.symbols.len());

    let mut symtab = Emitter::new(le);
    for (i, sym) in obj.symbols.iter().enumerate() {
        let shndx: u16 = match sym.sec {
            Some(id) => (id.0 + 1) as u16,
            None if sym.shndx >= SHN_LORESERVE as usize => sym.shndx as u16,
            None => 0,
        };
        symtab.u32(st_names[i]);
        symtab.u8((sym.bind << 4) | (sym.kind & 0xf));
        symtab.u8(sym.st_other);
        symtab.u16(shndx);
        symtab.u64(sym.value);
        symtab.u64(sym.size);
    }

    // Section name pool.
    let mut shstrtab = vec![0u8];
    let mut sh_names = Vec::with_capacity(obj.sections.len());
    for sec in &obj.sections {
        sh_names.push(shstrtab.len() as u32);
        shstrtab.extend_from_slice(sec.name.as_bytes());
        shstrtab.push(0);
    }

    // Regenerated payloads; everything else is written from the section
    // data verbatim.
    let mut payloads: Vec<Option<Vec<u8>>> = Vec::with_capacity(obj.sections.len());
    for (i, sec) in obj.sections.iter().enumerate() {
        let payload = match sec.kind {
            SectionKind::Symtab => Some(symtab.buf.clone()),
            SectionKind::Strtab if i == strtab_idx => Some(strtab.clone()),
            SectionKind::Strtab if i == shstrtab_idx => Some(shstrtab.clone()),
            SectionKind::Rela => {
                let mut e = Emitter::new(le);
                for r in &sec.relocs {
                    e.u64(r.offset);
                    e.u64(((r.sym.0 as u64) << 32) | r.ty as u64);
                    e.i64(r.addend);
                }
                Some(e.buf)
            }
            _ => None,
        };
        payloads.push(payload);
    }

    // Single forward pass: header, padded payloads, section header table.
    let mut out = Emitter::new(le);
    out.bytes(&[0u8; EHDR_SIZE]);

    let mut sh_offsets = Vec::with_capacity(obj.sections.len());
    let mut sh_sizes = Vec::with_capacity(obj.sections.len());
    for (i, sec) in obj.sections.iter().enumerate() {
        let align = section_align(sec.kind, sec.sh_addralign);
        out.pad_to(align);
        sh_offsets.push(out.len() as u64);
        let size = match (&payloads[i], sec.kind) {
            (_, SectionKind::Nobits) => sec.size,
            (Some(p), _) => {
                out.bytes(p);
                p.len() as u64
            }
            (None, _) => {
                out.bytes(&sec.data);
                sec.data.len() as u64
            }
        };
        sh_sizes.push(size);
    }

    out.pad_to(8);
    let shoff = out.len() as u64;

    // NULL section header.
    out.bytes(&[0u8; SHDR_SIZE]);
    for (i, sec) in obj.sections.iter().enumerate() {
        let (sh_link, sh_info) = match sec.kind {
            SectionKind::Rela => {
                let base = sec.base.ok_or_else(|| {
                    DiffError::InvalidElf(format!(
                        "{}: rela section {} lost its base section",
                        obj.name, sec.name
                    ))
                })?;
                ((symtab_idx + 1) as u32, (base.0 + 1) as u32)
            }
            SectionKind::Symtab => ((strtab_idx + 1) as u32, first_nonlocal as u32),
            _ => (0, 0),
        };
        let sh_entsize = match sec.kind {
            SectionKind::Rela => RELA_SIZE as u64,
            SectionKind::Symtab => SYM_SIZE as u64,
            _ => sec.sh_entsize,
        };
        out.u32(sh_names[i]);
        out.u32(sec.sh_type);
        out.u64(sec.sh_flags);
        out.u64(0); // sh_addr
        out.u64(sh_offsets[i]);
        out.u64(sh_sizes[i]);
        out.u32(sh_link);
        out.u32(sh_info);
        out.u64(section_align(sec.kind, sec.sh_addralign) as u64);
        out.u64(sh_entsize);
    }

    // Back-patch the ELF header now that the layout is final.
    let mut ehdr = Emitter::new(le);
    ehdr.bytes(&obj.header.e_ident);
    ehdr.u16(ET_REL);
    ehdr.u16(obj.header.e_machine);
    ehdr.u32(obj.header.e_version);
    ehdr.u64(0); // e_entry
    ehdr.u64(0); // e_phoff
    ehdr.u64(shoff);
    ehdr.u32(obj.header.e_flags);
    ehdr.u16(EHDR_SIZE as u16);
    ehdr.u16(0); // e_phentsize
    ehdr.u16(0); // e_phnum
    ehdr.u16(SHDR_SIZE as u16);
    ehdr.u16((obj.sections.len() + 1) as u16);
    ehdr.u16((shstrtab_idx + 1) as u16);
    debug_assert_eq!(ehdr.len(), EHDR_SIZE);
    out.buf[..EHDR_SIZE].copy_from_slice(&ehdr.buf);

    Ok(out.buf)
}

fn section_align(kind: SectionKind, sh_addralign: u64) -> usize {
    match kind {
        SectionKind::Symtab | SectionKind::Rela => 8,
        _ => (sh_addralign as usize).max(1),
    }
}
