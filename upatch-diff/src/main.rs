use std::env;
use std::path::PathBuf;
use std::process;

use getopts::Options;

use upatch_diff::{build_patch, BuildOutcome, Config};

fn usage(program: &str, opts: &Options) -> String {
    let brief = format!(
        "Usage: {} -s SOURCE -p PATCHED -r RUNNING -o OUTPUT [-d]",
        program
    );
    opts.usage(&brief)
}

fn main() {
    let args: Vec<String> = env::args().collect();
    let program = args[0].clone();

    let mut opts = Options::new();
    opts.optopt("s", "source", "original object file", "FILE");
    opts.optopt("p", "patched", "patched object file", "FILE");
    opts.optopt("r", "running", "running ELF to resolve against", "FILE");
    opts.optopt("o", "output", "output patch object", "FILE");
    opts.optflag("d", "debug", "enable debug logging");
    opts.optflag("h", "help", "print this help");

    let matches = match opts.parse(&args[1..]) {
        Ok(m) => m,
        Err(err) => {
            eprintln!("{}", err);
            eprintln!("{}", usage(&program, &opts));
            process::exit(2);
        }
    };
    if matches.opt_present("h") {
        println!("{}", usage(&program, &opts));
        return;
    }

    let level = if matches.opt_present("d") {
        log::LevelFilter::Debug
    } else {
        log::LevelFilter::Info
    };
    env_logger::builder()
        .filter_level(level)
        .format_timestamp(None)
        .init();

    let required = ["source", "patched", "running", "output"];
    let mut paths = Vec::with_capacity(required.len());
    for name in required {
        match matches.opt_str(name) {
            Some(value) => paths.push(PathBuf::from(value)),
            None => {
                eprintln!("missing required option --{}", name);
                eprintln!("{}", usage(&program, &opts));
                process::exit(2);
            }
        }
    }
    let mut paths = paths.into_iter();
    let cfg = Config {
        source: paths.next().unwrap(),
        patched: paths.next().unwrap(),
        running: paths.next().unwrap(),
        output: paths.next().unwrap(),
    };

    match build_patch(&cfg) {
        Ok(BuildOutcome::NoChanges) => {
            println!("no changed functions, no patch generated");
        }
        Ok(BuildOutcome::Patched {
            changed_functions,
            new_globals,
        }) => {
            log::info!(
                "patch written to {} ({} changed, {} new)",
                cfg.output.display(),
                changed_functions,
                new_globals
            );
        }
        Err(err) => {
            log::error!("{}", err);
            process::exit(1);
        }
    }
}
