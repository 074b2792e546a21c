//! In-memory object graph for relocatable ELF files.
//!
//! Sections, symbols and relocations live in parallel arenas owned by
//! [`ObjectFile`]; cross references are typed indices into those arenas, so
//! the graph can be mutated, moved between objects and reindexed without
//! chasing pointers.

mod read;
mod write;

pub use read::check_headers;
pub use write::write_object;

use bitflags::bitflags;
use goblin::elf::header::{Header, EI_DATA, ELFDATA2LSB};
use goblin::elf::section_header;
use goblin::elf::sym;

use crate::arch::Arch;

/// Index of a [`Section`] in its owning [`ObjectFile`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SecId(pub usize);

/// Index of a [`Symbol`] in its owning [`ObjectFile`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SymId(pub usize);

/// Diff classification shared by sections and symbols.
///
/// Everything starts out `New`; correlation plus comparison refine the
/// status of paired entities to `Same` or `Changed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    New,
    Changed,
    Same,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SectionKind {
    Progbits,
    Nobits,
    Rela,
    Symtab,
    Strtab,
    Group,
    Note,
    Other,
}

impl SectionKind {
    pub fn from_sh_type(sh_type: u32) -> Self {
        match sh_type {
            section_header::SHT_PROGBITS => SectionKind::Progbits,
            section_header::SHT_NOBITS => SectionKind::Nobits,
            section_header::SHT_RELA => SectionKind::Rela,
            section_header::SHT_SYMTAB => SectionKind::Symtab,
            section_header::SHT_STRTAB => SectionKind::Strtab,
            section_header::SHT_GROUP => SectionKind::Group,
            section_header::SHT_NOTE => SectionKind::Note,
            _ => SectionKind::Other,
        }
    }
}

bitflags! {
    /// The subset of `SHF_*` bits the differ and writer care about.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ShFlags: u64 {
        const WRITE = section_header::SHF_WRITE as u64;
        const ALLOC = section_header::SHF_ALLOC as u64;
        const EXECINSTR = section_header::SHF_EXECINSTR as u64;
        const MERGE = section_header::SHF_MERGE as u64;
        const STRINGS = section_header::SHF_STRINGS as u64;
        const GROUP = section_header::SHF_GROUP as u64;
        const INFO_LINK = section_header::SHF_INFO_LINK as u64;
    }
}

/// One relocation entry, owned by its rela section in input order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rela {
    pub offset: u64,
    pub ty: u32,
    pub sym: SymId,
    pub addend: i64,
}

#[derive(Debug)]
pub struct Section {
    pub name: String,
    /// Index in the source ELF's section header table.
    pub index: usize,
    pub kind: SectionKind,
    pub sh_type: u32,
    pub sh_flags: u64,
    pub sh_addralign: u64,
    pub sh_entsize: u64,
    /// Logical size; equals `data.len()` except for SHT_NOBITS.
    pub size: u64,
    pub data: Vec<u8>,
    /// Relocation entries, non-empty only for `SectionKind::Rela`.
    pub relocs: Vec<Rela>,
    /// For a rela section, the section it applies to.
    pub base: Option<SecId>,
    /// For a base section, its companion rela section.
    pub rela: Option<SecId>,
    /// The STT_SECTION symbol of this section, if the symtab carries one.
    pub section_sym: Option<SymId>,
    /// The bundled owner: the FUNC/OBJECT this section exists for, or the
    /// section symbol itself for exception-handling sections.
    pub sym: Option<SymId>,
    pub include: bool,
    pub ignore: bool,
    pub grouped: bool,
    pub status: Status,
    /// The paired section in the other object graph.
    pub twin: Option<SecId>,
}

impl Section {
    /// Fresh section with no companions or correlation, marked for
    /// inclusion. Used for synthesized output sections and test fixtures.
    pub fn synthetic(
        name: impl Into<String>,
        sh_type: u32,
        sh_flags: u64,
        sh_addralign: u64,
        data: Vec<u8>,
    ) -> Section {
        Section {
            name: name.into(),
            index: 0,
            kind: SectionKind::from_sh_type(sh_type),
            sh_type,
            sh_flags,
            sh_addralign,
            sh_entsize: 0,
            size: data.len() as u64,
            data,
            relocs: Vec::new(),
            base: None,
            rela: None,
            section_sym: None,
            sym: None,
            include: true,
            ignore: false,
            grouped: false,
            status: Status::New,
            twin: None,
        }
    }

    pub fn flags(&self) -> ShFlags {
        ShFlags::from_bits_truncate(self.sh_flags)
    }

    pub fn is_text(&self) -> bool {
        self.flags().contains(ShFlags::EXECINSTR)
    }

    pub fn is_rela(&self) -> bool {
        self.kind == SectionKind::Rela
    }
}

/// Symbol strip policy applied by the output synthesizer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strip {
    Default,
    Keep,
}

#[derive(Debug)]
pub struct Symbol {
    pub name: String,
    /// Index in the source ELF's symbol table.
    pub index: usize,
    pub bind: u8,
    pub kind: u8,
    pub st_other: u8,
    pub value: u64,
    pub size: u64,
    /// Raw `st_shndx` from the input, kept for UNDEF/ABS specials.
    pub shndx: usize,
    pub sec: Option<SecId>,
    pub include: bool,
    /// Unchanged local function kept only to satisfy references; payload is
    /// zeroed and the runtime resolves it in the target process.
    pub placeholder: bool,
    pub strip: Strip,
    pub status: Status,
    pub twin: Option<SymId>,
    pub parent: Option<SymId>,
    pub children: Vec<SymId>,
    /// Index of the matched STT_FILE block in the running binary, used to
    /// disambiguate static locals during final resolution.
    pub running_file: Option<usize>,
}

impl Symbol {
    /// Fresh symbol with no correlation state, marked for inclusion. Used
    /// for synthesized output symbols and test fixtures.
    pub fn synthetic(name: impl Into<String>, kind: u8, bind: u8, sec: Option<SecId>) -> Symbol {
        Symbol {
            name: name.into(),
            index: 0,
            bind,
            kind,
            st_other: 0,
            value: 0,
            size: 0,
            shndx: 0,
            sec,
            include: true,
            placeholder: false,
            strip: Strip::Default,
            status: Status::New,
            twin: None,
            parent: None,
            children: Vec::new(),
            running_file: None,
        }
    }

    pub fn is_func(&self) -> bool {
        self.kind == sym::STT_FUNC
    }

    pub fn is_object(&self) -> bool {
        self.kind == sym::STT_OBJECT
    }

    pub fn is_section_sym(&self) -> bool {
        self.kind == sym::STT_SECTION
    }

    pub fn is_file_sym(&self) -> bool {
        self.kind == sym::STT_FILE
    }

    pub fn is_local(&self) -> bool {
        self.bind == sym::STB_LOCAL
    }

    pub fn is_null(&self) -> bool {
        self.index == 0 && self.name.is_empty() && self.kind == sym::STT_NOTYPE
    }

    /// Display form for diagnostics; demangles Rust/C++ names.
    pub fn display_name(&self) -> String {
        format!("{:#}", rustc_demangle::demangle(&self.name))
    }
}

/// Parsed relocatable object: the three arenas plus the retained header.
#[derive(Debug)]
pub struct ObjectFile {
    /// Basename of the input path, used as the diagnostic prefix.
    pub name: String,
    pub header: Header,
    pub arch: Arch,
    pub sections: Vec<Section>,
    pub symbols: Vec<Symbol>,
}

impl ObjectFile {
    pub fn is_le(&self) -> bool {
        self.header.e_ident[EI_DATA] == ELFDATA2LSB
    }

    pub fn section_by_name(&self, name: &str) -> Option<SecId> {
        self.sections
            .iter()
            .position(|s| s.name == name)
            .map(SecId)
    }

    pub fn symbol_by_name(&self, name: &str) -> Option<SymId> {
        self.symbols
            .iter()
            .position(|s| s.name == name)
            .map(SymId)
    }

    pub fn sec(&self, id: SecId) -> &Section {
        &self.sections[id.0]
    }

    pub fn sec_mut(&mut self, id: SecId) -> &mut Section {
        &mut self.sections[id.0]
    }

    pub fn sym(&self, id: SymId) -> &Symbol {
        &self.symbols[id.0]
    }

    pub fn sym_mut(&mut self, id: SymId) -> &mut Symbol {
        &mut self.symbols[id.0]
    }
}

/// `.rodata.str1.*` and friends: mergeable string-literal sections.
pub fn is_string_literal_section(name: &str) -> bool {
    name.contains(".str1.")
}

pub fn is_debug_section(name: &str) -> bool {
    name.starts_with(".debug_") || name.starts_with(".rela.debug_")
}

pub fn is_eh_section(name: &str) -> bool {
    name == ".eh_frame"
        || name.starts_with(".gcc_except_table")
        || name.starts_with(".ARM.extab")
}

pub(crate) fn get_u32(buf: &[u8], off: usize, le: bool) -> u32 {
    let bytes: [u8; 4] = buf[off..off + 4].try_into().unwrap();
    if le {
        u32::from_le_bytes(bytes)
    } else {
        u32::from_be_bytes(bytes)
    }
}

pub(crate) fn put_u32(buf: &mut [u8], off: usize, v: u32, le: bool) {
    let bytes = if le { v.to_le_bytes() } else { v.to_be_bytes() };
    buf[off..off + 4].copy_from_slice(&bytes);
}

/// Endian-aware byte sink used by the writer and the metadata builders.
pub(crate) struct Emitter {
    pub buf: Vec<u8>,
    le: bool,
}

impl Emitter {
    pub fn new(le: bool) -> Self {
        Emitter {
            buf: Vec::new(),
            le,
        }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    pub fn u16(&mut self, v: u16) {
        let b = if self.le { v.to_le_bytes() } else { v.to_be_bytes() };
        self.buf.extend_from_slice(&b);
    }

    pub fn u32(&mut self, v: u32) {
        let b = if self.le { v.to_le_bytes() } else { v.to_be_bytes() };
        self.buf.extend_from_slice(&b);
    }

    pub fn u64(&mut self, v: u64) {
        let b = if self.le { v.to_le_bytes() } else { v.to_be_bytes() };
        self.buf.extend_from_slice(&b);
    }

    pub fn i64(&mut self, v: i64) {
        let b = if self.le { v.to_le_bytes() } else { v.to_be_bytes() };
        self.buf.extend_from_slice(&b);
    }

    pub fn bytes(&mut self, b: &[u8]) {
        self.buf.extend_from_slice(b);
    }

    pub fn pad_to(&mut self, align: usize) {
        if align > 1 {
            while self.buf.len() % align != 0 {
                self.buf.push(0);
            }
        }
    }
}
