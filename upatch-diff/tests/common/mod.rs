//! Fixtures: synthesize small relocatable objects and running binaries
//! through the crate's own graph and writer.

use std::fs;
use std::path::PathBuf;

use goblin::container::{Container, Ctx, Endian};
use goblin::elf::header::{self, Header};
use goblin::elf::section_header::{
    SHF_ALLOC, SHF_EXECINSTR, SHF_WRITE, SHT_NOBITS, SHT_PROGBITS, SHT_RELA,
};
use goblin::elf::sym::{STB_LOCAL, STT_FILE, STT_FUNC, STT_NOTYPE, STT_OBJECT, STT_SECTION};

use upatch_diff::elf::{write_object, ObjectFile, Rela, SecId, Section, Symbol, SymId};

pub fn test_dir(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("upatch-diff-{}-{}", std::process::id(), name));
    fs::create_dir_all(&dir).unwrap();
    dir
}

fn rel_header() -> Header {
    let mut h = Header::new(Ctx::new(Container::Big, Endian::Little));
    h.e_type = header::ET_REL;
    h.e_machine = header::EM_X86_64;
    h.e_version = 1;
    h
}

struct Entity {
    name: String,
    sec: SecId,
    kind: u8,
    bind: u8,
    value: u64,
    size: u64,
}

struct RelaSpec {
    base: String,
    entries: Vec<(u64, u32, String, i64)>,
}

/// Builds a relocatable object the way a compiler would lay it out:
/// NULL symbol, file symbol, section symbols, locals, then globals.
pub struct ObjBuilder {
    sections: Vec<Section>,
    file_sym: Option<String>,
    entities: Vec<Entity>,
    relas: Vec<RelaSpec>,
}

impl ObjBuilder {
    pub fn new() -> Self {
        ObjBuilder {
            sections: Vec::new(),
            file_sym: None,
            entities: Vec::new(),
            relas: Vec::new(),
        }
    }

    pub fn file(mut self, name: &str) -> Self {
        self.file_sym = Some(name.to_string());
        self
    }

    pub fn raw_section(
        mut self,
        name: &str,
        sh_type: u32,
        sh_flags: u64,
        align: u64,
        data: Vec<u8>,
    ) -> Self {
        let mut sec = Section::synthetic(name, sh_type, sh_flags, align, data);
        sec.include = false;
        self.sections.push(sec);
        self
    }

    fn find_section(&self, name: &str) -> SecId {
        SecId(
            self.sections
                .iter()
                .position(|s| s.name == name)
                .unwrap_or_else(|| panic!("no fixture section {}", name)),
        )
    }

    fn entity(mut self, name: &str, sec: SecId, kind: u8, bind: u8, value: u64, size: u64) -> Self {
        self.entities.push(Entity {
            name: name.to_string(),
            sec,
            kind,
            bind,
            value,
            size,
        });
        self
    }

    /// A function in its own `.text.<name>` section.
    pub fn func(self, name: &str, bind: u8, bytes: &[u8]) -> Self {
        let size = bytes.len() as u64;
        let sec_name = format!(".text.{}", name);
        let with_sec = self.raw_section(
            &sec_name,
            SHT_PROGBITS,
            (SHF_ALLOC | SHF_EXECINSTR) as u64,
            16,
            bytes.to_vec(),
        );
        let sec = with_sec.find_section(&sec_name);
        with_sec.entity(name, sec, STT_FUNC, bind, 0, size)
    }

    /// A function placed in an explicitly named section.
    pub fn func_in(self, sec_name: &str, name: &str, bind: u8, bytes: &[u8]) -> Self {
        let size = bytes.len() as u64;
        let with_sec = self.raw_section(
            sec_name,
            SHT_PROGBITS,
            (SHF_ALLOC | SHF_EXECINSTR) as u64,
            16,
            bytes.to_vec(),
        );
        let sec = with_sec.find_section(sec_name);
        with_sec.entity(name, sec, STT_FUNC, bind, 0, size)
    }

    /// An object symbol inside an existing data section.
    pub fn object_in(self, sec_name: &str, name: &str, bind: u8, value: u64, size: u64) -> Self {
        let sec = self.find_section(sec_name);
        self.entity(name, sec, STT_OBJECT, bind, value, size)
    }

    /// A zero-initialized object in its own `.bss.<name>` section.
    pub fn bss_object(self, name: &str, bind: u8, size: u64) -> Self {
        let sec_name = format!(".bss.{}", name);
        let mut with_sec = self.raw_section(
            &sec_name,
            SHT_NOBITS,
            (SHF_ALLOC | SHF_WRITE) as u64,
            8,
            Vec::new(),
        );
        with_sec.sections.last_mut().unwrap().size = size;
        let sec = with_sec.find_section(&sec_name);
        with_sec.entity(name, sec, STT_OBJECT, bind, 0, size)
    }

    pub fn rela(mut self, base: &str, entries: &[(u64, u32, &str, i64)]) -> Self {
        self.relas.push(RelaSpec {
            base: base.to_string(),
            entries: entries
                .iter()
                .map(|(off, ty, sym, addend)| (*off, *ty, sym.to_string(), *addend))
                .collect(),
        });
        self
    }

    pub fn write(self, dir: &std::path::Path, file_name: &str) -> PathBuf {
        let mut obj = ObjectFile {
            name: file_name.to_string(),
            header: rel_header(),
            arch: upatch_diff::arch::Arch::X86_64,
            sections: self.sections,
            symbols: Vec::new(),
        };

        obj.symbols
            .push(Symbol::synthetic("", STT_NOTYPE, STB_LOCAL, None));
        if let Some(file) = &self.file_sym {
            let mut sym = Symbol::synthetic(file.clone(), STT_FILE, STB_LOCAL, None);
            sym.shndx = 0xfff1; // SHN_ABS
            obj.symbols.push(sym);
        }
        for i in 0..obj.sections.len() {
            if obj.sections[i].is_rela() {
                continue;
            }
            let id = SymId(obj.symbols.len());
            obj.symbols.push(Symbol::synthetic(
                obj.sections[i].name.clone(),
                STT_SECTION,
                STB_LOCAL,
                Some(SecId(i)),
            ));
            obj.sections[i].section_sym = Some(id);
        }
        for pass_local in [true, false] {
            for e in &self.entities {
                if (e.bind == STB_LOCAL) != pass_local {
                    continue;
                }
                let mut sym = Symbol::synthetic(e.name.clone(), e.kind, e.bind, Some(e.sec));
                sym.value = e.value;
                sym.size = e.size;
                obj.symbols.push(sym);
            }
        }

        for spec in &self.relas {
            let base = SecId(
                obj.sections
                    .iter()
                    .position(|s| s.name == spec.base)
                    .unwrap_or_else(|| panic!("no fixture section {}", spec.base)),
            );
            let relocs = spec
                .entries
                .iter()
                .map(|(offset, ty, sym_name, addend)| Rela {
                    offset: *offset,
                    ty: *ty,
                    sym: obj
                        .symbol_by_name(sym_name)
                        .unwrap_or_else(|| panic!("no fixture symbol {}", sym_name)),
                    addend: *addend,
                })
                .collect();
            let rela_id = SecId(obj.sections.len());
            let mut rela =
                Section::synthetic(format!(".rela{}", spec.base), SHT_RELA, 0, 8, Vec::new());
            rela.base = Some(base);
            rela.relocs = relocs;
            obj.sections.push(rela);
            obj.sections[base.0].rela = Some(rela_id);
        }

        obj.sections.push(Section::synthetic(
            ".symtab",
            goblin::elf::section_header::SHT_SYMTAB,
            0,
            8,
            Vec::new(),
        ));
        obj.sections.push(Section::synthetic(
            ".strtab",
            goblin::elf::section_header::SHT_STRTAB,
            0,
            1,
            Vec::new(),
        ));
        obj.sections.push(Section::synthetic(
            ".shstrtab",
            goblin::elf::section_header::SHT_STRTAB,
            0,
            1,
            Vec::new(),
        ));

        let path = dir.join(file_name);
        write_object(&obj, &path).unwrap();
        path
    }
}

/// Builds a running binary: symbols appear in exactly the given order so
/// `STT_FILE` blocks can be interleaved.
pub struct RunBuilder {
    syms: Vec<(String, u8, u8, u64, u64)>,
}

impl RunBuilder {
    pub fn new() -> Self {
        RunBuilder { syms: Vec::new() }
    }

    pub fn file(mut self, name: &str) -> Self {
        self.syms
            .push((name.to_string(), STT_FILE, STB_LOCAL, 0, 0));
        self
    }

    pub fn sym(mut self, name: &str, kind: u8, bind: u8, value: u64, size: u64) -> Self {
        self.syms.push((name.to_string(), kind, bind, value, size));
        self
    }

    pub fn write(self, dir: &std::path::Path, file_name: &str) -> PathBuf {
        let mut obj = ObjectFile {
            name: file_name.to_string(),
            header: rel_header(),
            arch: upatch_diff::arch::Arch::X86_64,
            sections: Vec::new(),
            symbols: Vec::new(),
        };
        obj.sections.push(Section::synthetic(
            ".text",
            SHT_PROGBITS,
            (SHF_ALLOC | SHF_EXECINSTR) as u64,
            16,
            vec![0x90; 16],
        ));
        obj.symbols
            .push(Symbol::synthetic("", STT_NOTYPE, STB_LOCAL, None));
        for (name, kind, bind, value, size) in &self.syms {
            let sec = if *kind == STT_FILE { None } else { Some(SecId(0)) };
            let mut sym = Symbol::synthetic(name.clone(), *kind, *bind, sec);
            if *kind == STT_FILE {
                sym.shndx = 0xfff1;
            }
            sym.value = *value;
            sym.size = *size;
            obj.symbols.push(sym);
        }
        obj.sections.push(Section::synthetic(
            ".symtab",
            goblin::elf::section_header::SHT_SYMTAB,
            0,
            8,
            Vec::new(),
        ));
        obj.sections.push(Section::synthetic(
            ".strtab",
            goblin::elf::section_header::SHT_STRTAB,
            0,
            1,
            Vec::new(),
        ));
        obj.sections.push(Section::synthetic(
            ".shstrtab",
            goblin::elf::section_header::SHT_STRTAB,
            0,
            1,
            Vec::new(),
        ));
        let path = dir.join(file_name);
        write_object(&obj, &path).unwrap();
        path
    }
}
