//! Differential ELF object builder for userspace live patching.
//!
//! Given an original object, a patched object built from the same source
//! unit and the running binary they were linked into, [`build_patch`] emits
//! a relocatable object containing only the changed functions, the data
//! they drag along and the `.upatch.*` metadata the runtime injector needs
//! to wire the patch into a live process.

pub mod arch;
pub mod bundle;
pub mod correlate;
pub mod diff;
pub mod ehframe;
pub mod elf;
pub mod include;
pub mod output;
pub mod rewrite;
pub mod running;

use std::path::PathBuf;

use thiserror::Error;

use crate::elf::ObjectFile;
use crate::running::RunningImage;

#[derive(Debug, Error)]
pub enum DiffError {
    #[error("{path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse ELF: {0}")]
    Parse(#[from] goblin::error::Error),
    #[error("{0}")]
    InvalidElf(String),
    #[error("header mismatch between original and patched object: {0}")]
    HeaderMismatch(&'static str),
    #[error("unsupported machine {0:#x}")]
    UnsupportedMachine(u16),
    #[error("{sec}+{offset:#x}: relocation {msg}")]
    BadRelocation {
        sec: String,
        offset: u64,
        msg: String,
    },
    #[error("duplicate matches for file symbol {0}")]
    DuplicateFileMatch(String),
    #[error("cannot resolve symbol {0} in running binary")]
    UnresolvedSymbol(String),
    #[error("{0} unsupported section change(s)")]
    Unpatchable(usize),
}

pub type Result<T> = std::result::Result<T, DiffError>;

/// The four paths every build needs.
#[derive(Debug, Clone)]
pub struct Config {
    pub source: PathBuf,
    pub patched: PathBuf,
    pub running: PathBuf,
    pub output: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildOutcome {
    /// Nothing changed; no output file was written.
    NoChanges,
    Patched {
        changed_functions: usize,
        new_globals: usize,
    },
}

/// Run the whole pipeline: parse, bundle, rewrite, correlate, diff,
/// include, rebuild EH data and synthesize the output object.
pub fn build_patch(cfg: &Config) -> Result<BuildOutcome> {
    let mut orig = ObjectFile::parse(&cfg.source)?;
    let mut patched = ObjectFile::parse(&cfg.patched)?;
    elf::check_headers(&orig, &patched)?;
    let arch = patched.arch.rules();
    let running = RunningImage::parse(&cfg.running)?;

    for obj in [&mut orig, &mut patched] {
        bundle::bundle_symbols(obj, arch)?;
        bundle::detect_child_functions(obj)?;
        diff::mark_ignored_sections(obj);
        rewrite::replace_section_syms(obj, arch)?;
    }

    correlate::correlate_objects(&mut orig, &mut patched);
    correlate::match_file_symbols(&mut orig, &running)?;
    correlate::correlate_static_locals(&mut orig, &mut patched);
    correlate::propagate_running_files(&orig, &mut patched);

    diff::compare_correlated(&mut orig, &mut patched);
    drop(orig);

    include::include_standard_elements(&mut patched);
    let changed_functions = include::include_changed_functions(&mut patched);
    let new_globals = include::include_new_globals(&mut patched);
    include::validate_patchability(&patched)?;

    if changed_functions == 0 && new_globals == 0 {
        log::info!("[{}] no changed functions", patched.name);
        return Ok(BuildOutcome::NoChanges);
    }
    log::info!(
        "[{}] {} changed function(s), {} new global(s)",
        patched.name,
        changed_functions,
        new_globals
    );

    ehframe::include_debug_sections(&mut patched);
    ehframe::prune_debug_relas(&mut patched);
    ehframe::rebuild_eh_frame(&mut patched)?;
    // CIE personality routines survive the rebuild; carry their symbols as
    // externals.
    if let Some(eh_rela) = patched
        .section_by_name(".eh_frame")
        .and_then(|id| patched.sections[id.0].rela)
    {
        let referents: Vec<_> = patched.sections[eh_rela.0]
            .relocs
            .iter()
            .map(|r| r.sym)
            .collect();
        for sym in referents {
            include::include_symbol(&mut patched, sym);
        }
    }

    let u = output::build_output(patched, &running, arch)?;
    elf::write_object(&u, &cfg.output)?;
    Ok(BuildOutcome::Patched {
        changed_functions,
        new_globals,
    })
}
