//! Pairing entities of the original and patched objects, and matching the
//! original's `STT_FILE` blocks against the running binary.

use std::collections::HashMap;

use goblin::elf::sym::{STT_FUNC, STT_OBJECT};

use crate::elf::{ObjectFile, SecId, SymId};
use crate::running::RunningImage;
use crate::Result;

/// Phase 1 and 2: pair sections by name, then symbols by name and
/// `(type, binding)` within paired sections.
pub fn correlate_objects(orig: &mut ObjectFile, patched: &mut ObjectFile) {
    correlate_sections(orig, patched);
    correlate_symbols(orig, patched);
}

fn correlate_sections(orig: &mut ObjectFile, patched: &mut ObjectFile) {
    let mut by_name: HashMap<&str, Vec<usize>> = HashMap::new();
    for (pi, sec) in patched.sections.iter().enumerate().rev() {
        by_name.entry(sec.name.as_str()).or_default().push(pi);
    }
    let mut pairs = Vec::new();
    for (oi, sec) in orig.sections.iter().enumerate() {
        if let Some(stack) = by_name.get_mut(sec.name.as_str()) {
            if let Some(pi) = stack.pop() {
                pairs.push((oi, pi));
            }
        }
    }
    for (oi, pi) in pairs {
        orig.sections[oi].twin = Some(SecId(pi));
        patched.sections[pi].twin = Some(SecId(oi));
    }
}

fn correlate_symbols(orig: &mut ObjectFile, patched: &mut ObjectFile) {
    let mut by_name: HashMap<&str, Vec<usize>> = HashMap::new();
    for (pi, sym) in patched.symbols.iter().enumerate().rev() {
        by_name.entry(sym.name.as_str()).or_default().push(pi);
    }
    let mut pairs = Vec::new();
    for (oi, osym) in orig.symbols.iter().enumerate() {
        let Some(candidates) = by_name.get_mut(osym.name.as_str()) else {
            continue;
        };
        let matched = candidates.iter().rposition(|&pi| {
            let psym = &patched.symbols[pi];
            if psym.kind != osym.kind || psym.bind != osym.bind {
                return false;
            }
            match (osym.sec, psym.sec) {
                (None, None) => true,
                (Some(os), Some(ps)) => orig.sections[os.0].twin == Some(ps),
                _ => false,
            }
        });
        if let Some(pos) = matched {
            let pi = candidates.remove(pos);
            pairs.push((oi, pi));
        }
    }
    for (oi, pi) in pairs {
        orig.symbols[oi].twin = Some(SymId(pi));
        patched.symbols[pi].twin = Some(SymId(oi));
    }
}

/// Match each `STT_FILE` block of the original object against the running
/// binary's block sequence. The winning block index is stored on every
/// local symbol of the block; a duplicate match aborts the build.
pub fn match_file_symbols(orig: &mut ObjectFile, running: &RunningImage) -> Result<()> {
    let len = orig.symbols.len();
    let mut i = 0;
    while i < len {
        if !orig.symbols[i].is_file_sym() {
            i += 1;
            continue;
        }
        let mut locals = Vec::new();
        let mut j = i + 1;
        while j < len && !orig.symbols[j].is_file_sym() && orig.symbols[j].is_local() {
            let sym = &orig.symbols[j];
            if matches!(sym.kind, STT_FUNC | STT_OBJECT) && sym.sec.is_some() {
                locals.push((sym.name.clone(), sym.kind));
            }
            j += 1;
        }
        if !locals.is_empty() {
            let file_name = orig.symbols[i].name.clone();
            match running.match_block(&file_name, &locals)? {
                Some(block) => {
                    log::debug!(
                        "[{}] file {} matched running block {}",
                        orig.name,
                        file_name,
                        block
                    );
                    for sym in &mut orig.symbols[i..j] {
                        if sym.is_local() {
                            sym.running_file = Some(block);
                        }
                    }
                }
                None => {
                    log::warn!(
                        "[{}] no matching block in {} for file {}",
                        orig.name,
                        running.name,
                        file_name
                    );
                }
            }
        }
        i = j.max(i + 1);
    }
    Ok(())
}

/// The name up to the compiler-mangled suffix, e.g. `counter` for
/// `counter.1234`.
fn mangled_base(name: &str) -> Option<&str> {
    let pos = name.find('.')?;
    (pos > 0).then(|| &name[..pos])
}

/// Drop a trailing numeric component, e.g. `.bss.counter.1234` becomes
/// `.bss.counter`.
fn strip_numeric_suffix(name: &str) -> &str {
    if let Some(pos) = name.rfind('.') {
        let tail = &name[pos + 1..];
        if !tail.is_empty() && tail.chars().all(|c| c.is_ascii_digit()) {
            return &name[..pos];
        }
    }
    name
}

/// Static locals carry compiler-chosen numeric suffixes that differ between
/// builds. Pair the leftovers on the stable part of the name when their
/// bundled sections agree structurally, and twin those sections too.
pub fn correlate_static_locals(orig: &mut ObjectFile, patched: &mut ObjectFile) {
    let mut sym_pairs = Vec::new();
    let mut taken = vec![false; patched.symbols.len()];
    for (oi, osym) in orig.symbols.iter().enumerate() {
        if osym.twin.is_some()
            || !osym.is_local()
            || !matches!(osym.kind, STT_FUNC | STT_OBJECT)
        {
            continue;
        }
        let (Some(obase), Some(osec)) = (mangled_base(&osym.name), osym.sec) else {
            continue;
        };
        let osec_name = strip_numeric_suffix(&orig.sections[osec.0].name);
        let found = patched.symbols.iter().enumerate().position(|(pi, psym)| {
            !taken[pi]
                && psym.twin.is_none()
                && psym.is_local()
                && psym.kind == osym.kind
                && mangled_base(&psym.name) == Some(obase)
                && psym
                    .sec
                    .map(|ps| strip_numeric_suffix(&patched.sections[ps.0].name) == osec_name)
                    .unwrap_or(false)
        });
        if let Some(pi) = found {
            taken[pi] = true;
            sym_pairs.push((oi, pi));
        }
    }

    for (oi, pi) in sym_pairs {
        log::debug!(
            "[{}] correlated static local {} with {}",
            orig.name,
            orig.symbols[oi].name,
            patched.symbols[pi].name
        );
        orig.symbols[oi].twin = Some(SymId(pi));
        patched.symbols[pi].twin = Some(SymId(oi));

        let (Some(os), Some(ps)) = (orig.symbols[oi].sec, patched.symbols[pi].sec) else {
            continue;
        };
        if orig.sections[os.0].twin.is_none() && patched.sections[ps.0].twin.is_none() {
            orig.sections[os.0].twin = Some(ps);
            patched.sections[ps.0].twin = Some(os);
            if let (Some(orela), Some(prela)) =
                (orig.sections[os.0].rela, patched.sections[ps.0].rela)
            {
                orig.sections[orela.0].twin = Some(prela);
                patched.sections[prela.0].twin = Some(orela);
            }
        }
    }
}

/// Resolution happens on the output graph, which descends from the patched
/// object; carry the matched block indices across the correlation.
pub fn propagate_running_files(orig: &ObjectFile, patched: &mut ObjectFile) {
    for osym in &orig.symbols {
        let (Some(block), Some(twin)) = (osym.running_file, osym.twin) else {
            continue;
        };
        patched.symbols[twin.0].running_file = Some(block);
    }
}
