//! seqvm - compile and run Seq-style stack programs.
//!
//! Usage:
//!   seqvm program.seq              # run one or more files in sequence
//!   seqvm -e "2 3 +"                # evaluate a string, print the result
//!   seqvm -r                        # interactive REPL
//!   seqvm - -r                      # REPL seeded with stdin

use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser as ClapParser;
use tracing::{error, info};

use svm_compiler::{eval, EvalError};
use svm_runtime::{Vm, VmConfig};

#[derive(ClapParser)]
#[command(name = "seqvm")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Seq VM - bytecode compiler and interpreter", long_about = None)]
struct Cli {
    /// Source files to run, in order. A lone "-" reads from stdin.
    files: Vec<PathBuf>,

    /// Drop into an interactive REPL after any files finish.
    #[arg(short, long)]
    repl: bool,

    /// Evaluate a single expression instead of (or in addition to) files.
    #[arg(short, long, value_name = "STRING")]
    eval: Option<String>,
}

/// Exit codes (spec §6): 0 clean, 1 compile error, 2 runtime error, 3 I/O
/// failure (a source file couldn't be read).
fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let mut vm = Vm::new(VmConfig::default());
    let mut want_repl = cli.repl;

    if let Some(source) = &cli.eval {
        match run_chunk(&mut vm, source, "<eval>") {
            Ok(()) => {}
            Err(code) => return code,
        }
    }

    for path in &cli.files {
        if path.as_os_str() == "-" {
            want_repl = true;
            continue;
        }
        info!(file = %path.display(), "running source file");
        let source = match std::fs::read_to_string(path) {
            Ok(s) => s,
            Err(e) => {
                error!(file = %path.display(), error = %e, "failed to read source file");
                eprintln!("seqvm: {}: {e}", path.display());
                return ExitCode::from(3);
            }
        };
        match run_chunk(&mut vm, &source, &path.display().to_string()) {
            Ok(()) => {}
            Err(code) => return code,
        }
    }

    if want_repl || (cli.files.is_empty() && cli.eval.is_none()) {
        return repl(&mut vm);
    }

    ExitCode::SUCCESS
}

/// Run one chunk (a whole file, or `-e`'s argument) to completion. Prints
/// the resulting stack (spec §6's "a file's top-level stack contents print
/// on exit") and maps a failure onto the matching exit code.
fn run_chunk(vm: &mut Vm, source: &str, label: &str) -> Result<(), ExitCode> {
    match eval(vm, source) {
        Ok(()) => {
            print_stack(vm);
            Ok(())
        }
        Err(EvalError::Compile(e)) => {
            eprintln!("{label}: {e}");
            Err(ExitCode::from(1))
        }
        Err(EvalError::Runtime(e)) => {
            eprintln!("{label}: {e}");
            Err(ExitCode::from(2))
        }
    }
}

fn print_stack(vm: &Vm) {
    let snapshot = vm.stack_snapshot();
    if !snapshot.0.is_empty() {
        println!("{snapshot}");
    }
}

/// Read-eval-print loop: one chunk per line, errors recovered per spec §7
/// (`eval` already does the dictionary/code rollback or register reset;
/// here we only print the message and keep going).
fn repl(vm: &mut Vm) -> ExitCode {
    println!("seqvm {} - interactive session, ^D to exit", env!("CARGO_PKG_VERSION"));
    let stdin = io::stdin();
    loop {
        print!("> ");
        if io::stdout().flush().is_err() {
            break;
        }
        let mut line = String::new();
        match stdin.lock().read_line(&mut line) {
            Ok(0) => break,
            Ok(_) => {}
            Err(e) => {
                error!(error = %e, "failed to read a line from stdin");
                break;
            }
        }
        if line.trim().is_empty() {
            continue;
        }
        match eval(vm, &line) {
            Ok(()) => print_stack(vm),
            Err(EvalError::Compile(e)) => println!("compile error: {e}"),
            Err(EvalError::Runtime(e)) => println!("runtime error: {e}"),
        }
    }
    ExitCode::SUCCESS
}
