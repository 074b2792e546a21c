//! Bundled-symbol attachment and `.cold`/`.part` child detection.
//!
//! Objects compiled with `-ffunction-sections`/`-fdata-sections` place each
//! function and object in a dedicated section; such a section "is" its
//! symbol, and the rest of the pipeline treats the pair as one node.

use goblin::elf::sym::{STT_FUNC, STT_OBJECT, STT_SECTION};

use crate::arch::ArchRules;
use crate::elf::{is_eh_section, ObjectFile, SymId};
use crate::{DiffError, Result};

const FUNC_PREFIXES: [&str; 3] = [".text.unlikely.", ".text.hot.", ".text."];
const OBJECT_PREFIXES: [&str; 5] = [
    ".data.rel.ro.",
    ".data.rel.",
    ".data.",
    ".rodata.",
    ".bss.",
];

fn is_bundleable(sec_name: &str, sym_name: &str, sym_kind: u8) -> bool {
    let prefixes: &[&str] = match sym_kind {
        STT_FUNC => &FUNC_PREFIXES,
        STT_OBJECT => &OBJECT_PREFIXES,
        _ => return false,
    };
    if prefixes.iter().any(|p| {
        sec_name.len() == p.len() + sym_name.len()
            && sec_name.starts_with(p)
            && sec_name.ends_with(sym_name)
    }) {
        return true;
    }
    // gcc sometimes names the split section after the parent while the
    // symbol keeps a numbered suffix, e.g. `foo.cold.3` living in
    // `.text.unlikely.foo.cold`.
    sym_kind == STT_FUNC
        && sym_name.contains(".cold")
        && sec_name.starts_with(".text.unlikely.")
        && sec_name.ends_with(sym_name)
}

/// Attach every bundled symbol to its dedicated section and treat the
/// section symbols of exception-handling sections the same way.
pub fn bundle_symbols(obj: &mut ObjectFile, arch: &dyn ArchRules) -> Result<()> {
    for index in 0..obj.symbols.len() {
        let sym = &obj.symbols[index];
        let Some(sec_id) = sym.sec else { continue };

        if sym.kind == STT_SECTION {
            if is_eh_section(&obj.sections[sec_id.0].name) {
                obj.sections[sec_id.0].sym = Some(SymId(index));
            }
            continue;
        }

        if !is_bundleable(&obj.sections[sec_id.0].name, &sym.name, sym.kind) {
            continue;
        }
        let expected = arch.local_entry_offset(sym.st_other);
        if sym.value != 0 && sym.value != expected {
            return Err(DiffError::InvalidElf(format!(
                "{}: symbol {} at offset {:#x} within its section",
                obj.name, sym.name, sym.value
            )));
        }
        obj.sections[sec_id.0].sym = Some(SymId(index));
    }
    Ok(())
}

/// Link compiler-split subfunctions (`foo.cold`, `foo.part.1`) to their
/// parent so parent and child travel together through the diff.
pub fn detect_child_functions(obj: &mut ObjectFile) -> Result<()> {
    for index in 0..obj.symbols.len() {
        let sym = &obj.symbols[index];
        if sym.kind != STT_FUNC {
            continue;
        }
        let Some(marker) = [".cold", ".part"]
            .iter()
            .filter_map(|m| sym.name.find(m))
            .min()
        else {
            continue;
        };
        if marker == 0 {
            continue;
        }
        let parent_name = sym.name[..marker].to_string();
        let Some(parent) = obj.symbol_by_name(&parent_name) else {
            return Err(DiffError::InvalidElf(format!(
                "{}: no parent function {} for {}",
                obj.name, parent_name, obj.symbols[index].name
            )));
        };
        if !obj.symbols[parent.0].is_func() {
            continue;
        }
        log::debug!(
            "[{}] child function {} -> {}",
            obj.name,
            obj.symbols[index].name,
            parent_name
        );
        obj.symbols[index].parent = Some(parent);
        obj.symbols[parent.0].children.push(SymId(index));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use goblin::elf::sym::STT_NOTYPE;

    #[test]
    fn test_bundleable_prefixes() {
        let cases = [
            (".text.foo", "foo", STT_FUNC, true),
            (".text.hot.foo", "foo", STT_FUNC, true),
            (".text.unlikely.foo", "foo", STT_FUNC, true),
            (".data.g", "g", STT_OBJECT, true),
            (".bss.counter", "counter", STT_OBJECT, true),
            (".rodata.tbl", "tbl", STT_OBJECT, true),
            (".data.rel.ro.v", "v", STT_OBJECT, true),
            // Name must match the suffix exactly.
            (".text.foobar", "foo", STT_FUNC, false),
            (".text.foo", "foobar", STT_FUNC, false),
            // Shared sections are never bundled.
            (".text", "foo", STT_FUNC, false),
            (".data", "g", STT_OBJECT, false),
            // Type table is respected.
            (".text.foo", "foo", STT_OBJECT, false),
            (".data.g", "g", STT_FUNC, false),
            (".text.foo", "foo", STT_NOTYPE, false),
            // Numbered cold symbol in the parent's unlikely section.
            (".text.unlikely.foo.cold", "foo.cold", STT_FUNC, true),
            (".text.unlikely.foo.cold", "cold", STT_FUNC, false),
        ];
        for (sec, sym, kind, expect) in cases {
            assert_eq!(
                is_bundleable(sec, sym, kind),
                expect,
                "section {} symbol {}",
                sec,
                sym
            );
        }
    }
}
