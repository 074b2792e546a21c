//! End-to-end builds over synthesized objects, checked by re-parsing the
//! emitted patch with goblin.

mod common;

use std::fs;

use common::{test_dir, ObjBuilder, RunBuilder};
use goblin::elf::sym::{STB_GLOBAL, STB_LOCAL, STT_FUNC, STT_OBJECT};
use goblin::elf::Elf;
use upatch_diff::arch::X86_64RelocationType as X64;
use upatch_diff::{build_patch, BuildOutcome, Config, DiffError};
use upatch_meta::{PatchFunc, PatchInfo, PatchSymbol};

const RET_1: &[u8] = &[0xb8, 0x01, 0x00, 0x00, 0x00, 0xc3];
const RET_2: &[u8] = &[0xb8, 0x02, 0x00, 0x00, 0x00, 0xc3];

const PC32: u32 = X64::R_X86_64_PC32 as u32;
const PLT32: u32 = X64::R_X86_64_PLT32 as u32;

fn section_data<'a>(elf: &Elf, image: &'a [u8], name: &str) -> Option<&'a [u8]> {
    elf.section_headers.iter().find_map(|sh| {
        if elf.shdr_strtab.get_at(sh.sh_name) != Some(name) {
            return None;
        }
        let start = sh.sh_offset as usize;
        image.get(start..start + sh.sh_size as usize)
    })
}

fn symbol_names(elf: &Elf) -> Vec<String> {
    elf.syms
        .iter()
        .map(|s| elf.strtab.get_at(s.st_name).unwrap_or("").to_string())
        .collect()
}

#[test]
fn test_identical_objects_produce_no_patch() {
    let dir = test_dir("identical");
    let build = || {
        ObjBuilder::new()
            .file("t.c")
            .func("f", STB_GLOBAL, RET_1)
    };
    let source = build().write(&dir, "orig.o");
    let patched = build().write(&dir, "patched.o");
    let running = RunBuilder::new()
        .sym("f", STT_FUNC, STB_GLOBAL, 0x400500, 6)
        .write(&dir, "running");

    let output = dir.join("patch.o");
    let _ = fs::remove_file(&output);
    let outcome = build_patch(&Config {
        source,
        patched,
        running,
        output: output.clone(),
    })
    .unwrap();

    assert_eq!(outcome, BuildOutcome::NoChanges);
    assert!(!output.exists());
}

#[test]
fn test_one_changed_function() {
    let dir = test_dir("changed-func");
    let source = ObjBuilder::new()
        .file("t.c")
        .func("f", STB_GLOBAL, RET_1)
        .write(&dir, "orig.o");
    let patched = ObjBuilder::new()
        .file("t.c")
        .func("f", STB_GLOBAL, RET_2)
        .write(&dir, "patched.o");
    let running = RunBuilder::new()
        .sym("f", STT_FUNC, STB_GLOBAL, 0x400500, 6)
        .write(&dir, "running");

    let output = dir.join("patch.o");
    let outcome = build_patch(&Config {
        source,
        patched: patched.clone(),
        running,
        output: output.clone(),
    })
    .unwrap();
    assert_eq!(
        outcome,
        BuildOutcome::Patched {
            changed_functions: 1,
            new_globals: 0
        }
    );

    let image = fs::read(&output).unwrap();
    let elf = Elf::parse(&image).unwrap();
    let patched_image = fs::read(&patched).unwrap();
    let patched_elf = Elf::parse(&patched_image).unwrap();

    // Header preservation.
    assert_eq!(elf.header.e_ident, patched_elf.header.e_ident);
    assert_eq!(elf.header.e_machine, patched_elf.header.e_machine);
    assert_eq!(elf.header.e_type, goblin::elf::header::ET_REL);

    // The changed function came through with its patched body.
    let f = elf
        .syms
        .iter()
        .find(|s| elf.strtab.get_at(s.st_name) == Some("f"))
        .expect("f missing");
    assert_eq!(f.st_type(), STT_FUNC);
    assert_eq!(f.st_bind(), STB_GLOBAL);
    assert_ne!(f.st_shndx, 0);
    let text = section_data(&elf, &image, ".text.f").unwrap();
    assert_eq!(text, RET_2);

    // One record, resolved against the running binary.
    let funcs = section_data(&elf, &image, ".upatch.funcs").unwrap();
    assert_eq!(funcs.len(), PatchFunc::SIZE);
    let record = PatchFunc::from_bytes(funcs, true).unwrap();
    assert_eq!(record.old_addr, 0x400500);
    assert_eq!(record.old_size, 6);
    assert_eq!(record.new_size, 6);

    let info = section_data(&elf, &image, ".upatch.info").unwrap();
    let info = PatchInfo::from_bytes(info, true).unwrap();
    assert_eq!(info.nr_funcs, 1);
    assert_eq!(info.arch, u32::from(goblin::elf::header::EM_X86_64));

    // The record's new_addr field is relocated against `f` itself, with no
    // addend on top of the symbol.
    let f_index = elf
        .syms
        .iter()
        .position(|s| elf.strtab.get_at(s.st_name) == Some("f"))
        .unwrap();
    let funcs_rela = elf
        .shdr_relocs
        .iter()
        .find(|(idx, _)| {
            elf.shdr_strtab
                .get_at(elf.section_headers[*idx].sh_name)
                == Some(".rela.upatch.funcs")
        })
        .map(|(_, rs)| rs.iter().collect::<Vec<_>>())
        .unwrap();
    let new_addr_rela = funcs_rela
        .iter()
        .find(|r| r.r_offset == 0 && r.r_sym == f_index)
        .expect("no relocation on the new_addr field");
    assert_eq!(new_addr_rela.r_addend, Some(0));
}

#[test]
fn test_static_local_resolves_through_file_block() {
    let dir = test_dir("static-local");
    let build = |bytes: &[u8]| {
        ObjBuilder::new()
            .file("b.c")
            .bss_object("counter", STB_LOCAL, 4)
            .func("usecnt", STB_GLOBAL, bytes)
            .rela(".text.usecnt", &[(2, PC32, "counter", -4)])
    };
    let source = build(RET_1).write(&dir, "orig.o");
    let patched = build(RET_2).write(&dir, "patched.o");
    // Two translation units both define `static int counter`; only the
    // block whose locals set-match b.c's may win.
    let running = RunBuilder::new()
        .file("a.c")
        .sym("counter", STT_OBJECT, STB_LOCAL, 0x601000, 4)
        .sym("helper", STT_FUNC, STB_LOCAL, 0x400800, 0x10)
        .file("b.c")
        .sym("counter", STT_OBJECT, STB_LOCAL, 0x601040, 4)
        .sym("usecnt", STT_FUNC, STB_GLOBAL, 0x400900, 6)
        .write(&dir, "running");

    let output = dir.join("patch.o");
    build_patch(&Config {
        source,
        patched,
        running,
        output: output.clone(),
    })
    .unwrap();

    let image = fs::read(&output).unwrap();
    let elf = Elf::parse(&image).unwrap();

    let info = PatchInfo::from_bytes(section_data(&elf, &image, ".upatch.info").unwrap(), true)
        .unwrap();
    assert_eq!(info.nr_funcs, 1);
    assert_eq!(info.nr_symbols, 1);

    // The external record carries the second translation unit's counter.
    let syms = section_data(&elf, &image, ".upatch.symbols").unwrap();
    let record = PatchSymbol::from_bytes(syms, true).unwrap();
    assert_eq!(record.addr, 0x601040);

    let funcs = PatchFunc::from_bytes(section_data(&elf, &image, ".upatch.funcs").unwrap(), true)
        .unwrap();
    assert_eq!(funcs.old_addr, 0x400900);

    // counter stays in the symbol table as an undefined reference.
    let counter = elf
        .syms
        .iter()
        .find(|s| elf.strtab.get_at(s.st_name) == Some("counter"))
        .expect("counter missing");
    assert_eq!(counter.st_shndx, 0);
}

#[test]
fn test_ambiguous_static_local_aborts() {
    let dir = test_dir("ambiguous-local");
    let build = |bytes: &[u8]| {
        ObjBuilder::new()
            .file("b.c")
            .bss_object("counter", STB_LOCAL, 4)
            .func("usecnt", STB_GLOBAL, bytes)
            .rela(".text.usecnt", &[(2, PC32, "counter", -4)])
    };
    let source = build(RET_1).write(&dir, "orig.o");
    let patched = build(RET_2).write(&dir, "patched.o");
    // Both blocks are set-equal to b.c's locals.
    let running = RunBuilder::new()
        .file("a.c")
        .sym("counter", STT_OBJECT, STB_LOCAL, 0x601000, 4)
        .file("b.c")
        .sym("counter", STT_OBJECT, STB_LOCAL, 0x601040, 4)
        .sym("usecnt", STT_FUNC, STB_GLOBAL, 0x400900, 6)
        .write(&dir, "running");

    let err = build_patch(&Config {
        source,
        patched,
        running,
        output: dir.join("patch.o"),
    })
    .unwrap_err();
    assert!(err.to_string().contains("duplicate matches"));
}

#[test]
fn test_changed_data_section_refused() {
    let dir = test_dir("changed-data");
    let build = |init: u8, bytes: &[u8]| {
        ObjBuilder::new()
            .file("t.c")
            .raw_section(
                ".data",
                goblin::elf::section_header::SHT_PROGBITS,
                (goblin::elf::section_header::SHF_ALLOC | goblin::elf::section_header::SHF_WRITE)
                    as u64,
                8,
                vec![init, 0, 0, 0],
            )
            .object_in(".data", "g", STB_GLOBAL, 0, 4)
            .func("f", STB_GLOBAL, bytes)
            .rela(".text.f", &[(2, PC32, "g", -4)])
    };
    let source = build(1, RET_1).write(&dir, "orig.o");
    let patched = build(2, RET_2).write(&dir, "patched.o");
    let running = RunBuilder::new()
        .sym("f", STT_FUNC, STB_GLOBAL, 0x400500, 6)
        .sym("g", STT_OBJECT, STB_GLOBAL, 0x601000, 4)
        .write(&dir, "running");

    let output = dir.join("patch.o");
    let _ = fs::remove_file(&output);
    let err = build_patch(&Config {
        source,
        patched,
        running,
        output: output.clone(),
    })
    .unwrap_err();
    assert!(matches!(err, DiffError::Unpatchable(1)));
    assert!(!output.exists());
}

#[test]
fn test_new_global_is_carried() {
    let dir = test_dir("new-global");
    let source = ObjBuilder::new()
        .file("t.c")
        .func("f", STB_GLOBAL, RET_1)
        .write(&dir, "orig.o");
    let patched = ObjBuilder::new()
        .file("t.c")
        .func("f", STB_GLOBAL, RET_1)
        .func("newfunc", STB_GLOBAL, &[0x31, 0xc0, 0xc3])
        .write(&dir, "patched.o");
    let running = RunBuilder::new()
        .sym("f", STT_FUNC, STB_GLOBAL, 0x400500, 6)
        .write(&dir, "running");

    let output = dir.join("patch.o");
    let outcome = build_patch(&Config {
        source,
        patched,
        running,
        output: output.clone(),
    })
    .unwrap();
    assert_eq!(
        outcome,
        BuildOutcome::Patched {
            changed_functions: 0,
            new_globals: 1
        }
    );

    let image = fs::read(&output).unwrap();
    let elf = Elf::parse(&image).unwrap();
    let names = symbol_names(&elf);
    assert!(names.iter().any(|n| n == "newfunc"));
    // f is unchanged and unreferenced; minimality keeps it out.
    assert!(!names.iter().any(|n| n == "f"));

    let info = PatchInfo::from_bytes(section_data(&elf, &image, ".upatch.info").unwrap(), true)
        .unwrap();
    assert_eq!(info.nr_funcs, 0);
}

#[test]
fn test_cold_child_travels_with_changed_parent() {
    let dir = test_dir("cold-child");
    let source = ObjBuilder::new()
        .file("t.c")
        .func("foo", STB_GLOBAL, RET_1)
        .write(&dir, "orig.o");
    let patched = ObjBuilder::new()
        .file("t.c")
        .func("foo", STB_GLOBAL, RET_2)
        .func_in(
            ".text.unlikely.foo.cold",
            "foo.cold",
            STB_LOCAL,
            &[0x0f, 0x0b],
        )
        .rela(".text.foo", &[(1, PLT32, "foo.cold", -4)])
        .write(&dir, "patched.o");
    let running = RunBuilder::new()
        .sym("foo", STT_FUNC, STB_GLOBAL, 0x400600, 6)
        .write(&dir, "running");

    let output = dir.join("patch.o");
    build_patch(&Config {
        source,
        patched,
        running,
        output: output.clone(),
    })
    .unwrap();

    let image = fs::read(&output).unwrap();
    let elf = Elf::parse(&image).unwrap();
    let names = symbol_names(&elf);
    assert!(names.iter().any(|n| n == "foo"));
    assert!(names.iter().any(|n| n == "foo.cold"));

    let funcs = section_data(&elf, &image, ".upatch.funcs").unwrap();
    assert_eq!(funcs.len(), PatchFunc::SIZE);
    let record = PatchFunc::from_bytes(funcs, true).unwrap();
    assert_eq!(record.old_addr, 0x400600);
    assert!(record.flags.has_children());
}

/// Closure soundness: every relocation in the patch either points at a
/// defined symbol or at an external with a resolution record.
#[test]
fn test_every_referent_is_defined_or_resolved() {
    let dir = test_dir("closure");
    let build = |bytes: &[u8]| {
        ObjBuilder::new()
            .file("b.c")
            .bss_object("counter", STB_LOCAL, 4)
            .func("usecnt", STB_GLOBAL, bytes)
            .rela(".text.usecnt", &[(2, PC32, "counter", -4)])
    };
    let source = build(RET_1).write(&dir, "orig.o");
    let patched = build(RET_2).write(&dir, "patched.o");
    let running = RunBuilder::new()
        .file("b.c")
        .sym("counter", STT_OBJECT, STB_LOCAL, 0x601040, 4)
        .sym("usecnt", STT_FUNC, STB_GLOBAL, 0x400900, 6)
        .write(&dir, "running");

    let output = dir.join("patch.o");
    build_patch(&Config {
        source,
        patched,
        running,
        output: output.clone(),
    })
    .unwrap();

    let image = fs::read(&output).unwrap();
    let elf = Elf::parse(&image).unwrap();
    let info = PatchInfo::from_bytes(section_data(&elf, &image, ".upatch.info").unwrap(), true)
        .unwrap();

    let syms: Vec<_> = elf.syms.iter().collect();
    for (_, rs) in &elf.shdr_relocs {
        for r in rs.iter() {
            let sym = &syms[r.r_sym];
            let defined = sym.st_shndx != 0;
            let name = elf.strtab.get_at(sym.st_name).unwrap_or("");
            let resolved = name == "counter" && info.nr_symbols > 0;
            assert!(
                defined || resolved,
                "relocation referent {} is neither defined nor resolved",
                name
            );
        }
    }
}
