//! Front end: tokenizer, single-pass compiler, and the `eval` entry point
//! an embedder (or the `seqvm` binary) drives a session through.

pub mod lexer;
pub mod parser;

use svm_runtime::{Vm, VmError};

pub use parser::compile_str;

/// A failure from one `eval` call, phase-tagged so a caller can map it onto
/// the two distinct exit codes spec.md's CLI section asks for (compile
/// errors and runtime errors are not the same failure class: a compile
/// error means nothing new entered the dictionary, a runtime error means
/// it did, but running it blew up).
#[derive(Debug, Clone, PartialEq)]
pub enum EvalError {
    Compile(VmError),
    Runtime(VmError),
}

impl std::fmt::Display for EvalError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EvalError::Compile(e) => write!(f, "{e}"),
            EvalError::Runtime(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for EvalError {}

/// Compile and run one chunk of source against a live `Vm`, with the
/// recovery policy a REPL needs (spec §7): a failed compile rolls back the
/// dictionary and code segment to before this chunk started, so a broken
/// partial definition is never left reachable; a failed run only resets
/// the registers (SP/RP/BP/IP) — whatever compiled successfully up to and
/// including this chunk's definitions stays in the dictionary.
pub fn eval(vm: &mut Vm, source: &str) -> Result<(), EvalError> {
    let mark = vm.dict.mark();
    let checkpoint = vm.code_pos();

    let entry = match parser::compile_str(vm, source) {
        Ok(entry) => entry,
        Err(kind) => {
            let stack = vm.stack_snapshot();
            vm.dict.forget(mark);
            vm.rewind_code(checkpoint);
            return Err(EvalError::Compile(VmError { kind, stack }));
        }
    };

    if let Err(err) = vm.run(entry) {
        vm.reset_registers();
        return Err(EvalError::Runtime(err));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use svm_runtime::VmConfig;

    #[test]
    fn runtime_error_leaves_dictionary_entry_usable() {
        let mut vm = Vm::new(VmConfig::default());
        eval(&mut vm, ": boom dup ;").unwrap();
        // `dup` on an empty stack underflows; the word itself stays defined.
        let err = eval(&mut vm, "boom").unwrap_err();
        assert!(matches!(err, EvalError::Runtime(_)));
        assert!(vm.dict.is_defined("boom"));
    }

    #[test]
    fn compile_error_rolls_back_partial_definition() {
        let mut vm = Vm::new(VmConfig::default());
        let before = vm.code_pos();
        let err = eval(&mut vm, ": broken not-a-word ;").unwrap_err();
        assert!(matches!(err, EvalError::Compile(_)));
        assert!(!vm.dict.is_defined("broken"));
        assert_eq!(vm.code_pos(), before);
    }

    #[test]
    fn successful_eval_leaves_a_result_on_the_stack() {
        let mut vm = Vm::new(VmConfig::default());
        eval(&mut vm, "2 3 +").unwrap();
        assert_eq!(vm.pop().unwrap().as_float(), 5.0);
    }
}
