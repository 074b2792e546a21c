//! Symbol index of the running binary.
//!
//! The running ELF is only consulted for addresses: globals by name, locals
//! through the `STT_FILE` block that owns them. The symbol table is kept as
//! a flat ordered list partitioned into per-source-file blocks.

use std::fs::File;
use std::path::Path;

use goblin::elf::section_header::SHN_UNDEF;
use goblin::elf::sym::{STB_GLOBAL, STB_LOCAL, STT_FILE, STT_FUNC, STT_OBJECT, STT_SECTION};
use goblin::elf::Elf;
use memmap2::Mmap;

use crate::{DiffError, Result};

#[derive(Debug, Clone)]
pub struct RunningSym {
    pub name: String,
    pub kind: u8,
    pub bind: u8,
    pub value: u64,
    pub size: u64,
}

/// Symbols between one `STT_FILE` marker and the next.
#[derive(Debug, Clone)]
pub struct FileBlock {
    pub file_name: String,
    /// Range into [`RunningImage::syms`].
    pub start: usize,
    pub end: usize,
}

#[derive(Debug)]
pub struct RunningImage {
    pub name: String,
    pub syms: Vec<RunningSym>,
    pub blocks: Vec<FileBlock>,
}

impl RunningImage {
    /// Index any ELF with a usable symbol table; `.symtab` is preferred,
    /// `.dynsym` is the stripped-binary fallback.
    pub fn parse(path: &Path) -> Result<RunningImage> {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        let file = File::open(path).map_err(|source| DiffError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let map = unsafe { Mmap::map(&file) }.map_err(|source| DiffError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let elf = Elf::parse(&map)?;

        let (table, strings) = if !elf.syms.is_empty() {
            (&elf.syms, &elf.strtab)
        } else if !elf.dynsyms.is_empty() {
            (&elf.dynsyms, &elf.dynstrtab)
        } else {
            return Err(DiffError::InvalidElf(format!(
                "{}: no symbol table",
                name
            )));
        };

        let mut syms = Vec::new();
        let mut blocks: Vec<FileBlock> = Vec::new();
        for s in table.iter() {
            let sym_name = strings.get_at(s.st_name).unwrap_or("").to_string();
            if s.st_type() == STT_FILE {
                if let Some(open) = blocks.last_mut() {
                    open.end = syms.len();
                }
                blocks.push(FileBlock {
                    file_name: sym_name,
                    start: syms.len(),
                    end: syms.len(),
                });
                continue;
            }
            // Only defined FUNC/OBJECT/SECTION symbols with local or global
            // binding can ever be matched or resolved.
            let retained = matches!(s.st_type(), STT_FUNC | STT_OBJECT | STT_SECTION)
                && matches!(s.st_bind(), STB_LOCAL | STB_GLOBAL)
                && s.st_shndx != SHN_UNDEF as usize;
            if !retained {
                continue;
            }
            syms.push(RunningSym {
                name: sym_name,
                kind: s.st_type(),
                bind: s.st_bind(),
                value: s.st_value,
                size: s.st_size,
            });
        }
        if let Some(open) = blocks.last_mut() {
            open.end = syms.len();
        }

        log::debug!(
            "[{}] indexed {} symbols in {} file blocks",
            name,
            syms.len(),
            blocks.len()
        );
        Ok(RunningImage { name, syms, blocks })
    }

    pub fn lookup_global(&self, name: &str) -> Option<&RunningSym> {
        self.syms
            .iter()
            .find(|s| s.bind == STB_GLOBAL && s.name == name)
    }

    /// Look up a local symbol inside a previously matched file block.
    pub fn lookup_local(&self, block: usize, name: &str) -> Option<&RunningSym> {
        let block = self.blocks.get(block)?;
        self.syms[block.start..block.end]
            .iter()
            .find(|s| s.bind == STB_LOCAL && s.name == name)
    }

    /// Find the unique file block whose local FUNC/OBJECT symbols set-match
    /// `locals` (name and type, both directions). More than one match is
    /// fatal: the address of a static local would be ambiguous.
    pub fn match_block(&self, file_name: &str, locals: &[(String, u8)]) -> Result<Option<usize>> {
        let mut found = None;
        for (index, block) in self.blocks.iter().enumerate() {
            if !self.block_matches(block, locals) {
                continue;
            }
            if found.is_some() {
                return Err(DiffError::DuplicateFileMatch(file_name.to_string()));
            }
            found = Some(index);
        }
        Ok(found)
    }

    fn block_matches(&self, block: &FileBlock, locals: &[(String, u8)]) -> bool {
        let block_locals: Vec<&RunningSym> = self.syms[block.start..block.end]
            .iter()
            .filter(|s| s.bind == STB_LOCAL && matches!(s.kind, STT_FUNC | STT_OBJECT))
            .collect();
        if block_locals.len() != locals.len() {
            return false;
        }
        locals.iter().all(|(name, kind)| {
            block_locals
                .iter()
                .any(|s| s.name == *name && s.kind == *kind)
        }) && block_locals
            .iter()
            .all(|s| locals.iter().any(|(name, kind)| s.name == *name && s.kind == *kind))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn image(blocks: &[(&str, &[(&str, u8, u8, u64)])]) -> RunningImage {
        let mut img = RunningImage {
            name: "fake".to_string(),
            syms: Vec::new(),
            blocks: Vec::new(),
        };
        for (file, syms) in blocks {
            let start = img.syms.len();
            for (name, kind, bind, value) in *syms {
                img.syms.push(RunningSym {
                    name: name.to_string(),
                    kind: *kind,
                    bind: *bind,
                    value: *value,
                    size: 0x10,
                });
            }
            img.blocks.push(FileBlock {
                file_name: file.to_string(),
                start,
                end: img.syms.len(),
            });
        }
        img
    }

    #[test]
    fn test_unique_block_match() {
        let img = image(&[
            (
                "a.c",
                &[
                    ("counter", STT_OBJECT, STB_LOCAL, 0x601000),
                    ("helper", STT_FUNC, STB_LOCAL, 0x400800),
                ],
            ),
            ("b.c", &[("counter", STT_OBJECT, STB_LOCAL, 0x601040)]),
        ]);
        let locals = vec![("counter".to_string(), STT_OBJECT)];
        let block = img.match_block("b.c", &locals).unwrap();
        assert_eq!(block, Some(1));
        let sym = img.lookup_local(1, "counter").unwrap();
        assert_eq!(sym.value, 0x601040);
    }

    #[test]
    fn test_duplicate_block_match_aborts() {
        let img = image(&[
            ("a.c", &[("counter", STT_OBJECT, STB_LOCAL, 0x601000)]),
            ("b.c", &[("counter", STT_OBJECT, STB_LOCAL, 0x601040)]),
        ]);
        let locals = vec![("counter".to_string(), STT_OBJECT)];
        let err = img.match_block("b.c", &locals).unwrap_err();
        assert!(err.to_string().contains("duplicate matches"));
    }

    #[test]
    fn test_block_match_is_exact_both_ways() {
        let img = image(&[(
            "a.c",
            &[
                ("counter", STT_OBJECT, STB_LOCAL, 0x601000),
                ("helper", STT_FUNC, STB_LOCAL, 0x400800),
            ],
        )]);
        // Subset of the block's locals must not match.
        let locals = vec![("counter".to_string(), STT_OBJECT)];
        assert_eq!(img.match_block("a.c", &locals).unwrap(), None);
    }

    #[test]
    fn test_global_lookup() {
        let img = image(&[("a.c", &[("f", STT_FUNC, STB_GLOBAL, 0x400500)])]);
        assert_eq!(img.lookup_global("f").unwrap().value, 0x400500);
        assert!(img.lookup_global("g").is_none());
    }
}
