//! Typed runtime error surface.
//!
//! Every error the VM can raise is one of these variants. Propagation is
//! never recovered inside the core (spec §7): raising one of these always
//! halts the dispatch loop and hands the embedder a snapshot of the data
//! stack at the moment of failure.

use svm_core::value::{Tag, TaggedValue};
use svm_core::CoreError;

/// A bounded, human-readable snapshot of the data stack taken at the moment
/// an error was raised.
#[derive(Debug, Clone, PartialEq)]
pub struct StackSnapshot(pub Vec<String>);

impl std::fmt::Display for StackSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}]", self.0.join(", "))
    }
}

/// All error kinds the VM, dictionary, compiler, and list model can raise.
#[derive(Debug, Clone, PartialEq)]
pub enum RuntimeError {
    StackUnderflow { context: &'static str },
    StackOverflow { context: &'static str },
    TypeError { context: &'static str, got: String },
    ValueRangeError { context: &'static str },
    DivByZero,
    UndefinedWord { name: String },
    DictionaryFull,
    StringSegmentFull,
    CodeSegmentFull,
    InvalidStringId { id: u16 },
    MalformedList { context: &'static str },
    ParseError { message: String, line: usize, col: usize },
    CompileError { message: String, line: usize, col: usize },
    Abort { message: String },
}

/// An error paired with the stack contents at the moment it was raised, as
/// required for the "typed name + message + stack" user-visible format of
/// spec §7.
#[derive(Debug, Clone, PartialEq)]
pub struct VmError {
    pub kind: RuntimeError,
    pub stack: StackSnapshot,
}

impl std::fmt::Display for VmError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}\nstack: {}", self.kind, self.stack)
    }
}

impl std::error::Error for VmError {}

impl std::fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RuntimeError::StackUnderflow { context } => {
                write!(f, "StackUnderflow: {context}")
            }
            RuntimeError::StackOverflow { context } => {
                write!(f, "StackOverflow: {context}")
            }
            RuntimeError::TypeError { context, got } => {
                write!(f, "TypeError: {context} (got {got})")
            }
            RuntimeError::ValueRangeError { context } => {
                write!(f, "ValueRangeError: {context}")
            }
            RuntimeError::DivByZero => write!(f, "DivByZero: division by zero"),
            RuntimeError::UndefinedWord { name } => {
                write!(f, "UndefinedWord: '{name}' is not defined")
            }
            RuntimeError::DictionaryFull => write!(f, "DictionaryFull: no room for new entries"),
            RuntimeError::StringSegmentFull => {
                write!(f, "StringSegmentFull: string digest exhausted")
            }
            RuntimeError::CodeSegmentFull => write!(f, "CodeSegmentFull: code segment exhausted"),
            RuntimeError::InvalidStringId { id } => {
                write!(f, "InvalidStringId: no string interned with id {id}")
            }
            RuntimeError::MalformedList { context } => {
                write!(f, "MalformedList: {context}")
            }
            RuntimeError::ParseError { message, line, col } => {
                write!(f, "ParseError: {message} at {line}:{col}")
            }
            RuntimeError::CompileError { message, line, col } => {
                write!(f, "CompileError: {message} at {line}:{col}")
            }
            RuntimeError::Abort { message } => write!(f, "Abort: {message}"),
        }
    }
}

impl std::error::Error for RuntimeError {}

/// Map a low-level segment/codec error onto the richer runtime taxonomy.
/// `context` names the operation that triggered the access, since a single
/// `CoreError::OutOfBounds` can mean "stack overflowed" or "code segment is
/// full" depending on who asked.
pub fn from_core_error(err: CoreError, as_overflow: RuntimeError) -> RuntimeError {
    match err {
        CoreError::OutOfBounds { .. } | CoreError::Misaligned { .. } => as_overflow,
        CoreError::ValueRange { context, .. } => RuntimeError::ValueRangeError { context },
    }
}

/// Render a single cell for a stack-trace snapshot, matching the
/// `stack: [3, 4, LIST:2]` format of spec §7.
pub fn display_cell(cell: TaggedValue) -> String {
    if cell.is_number() {
        let f = cell.as_float();
        if f.fract() == 0.0 && f.is_finite() {
            format!("{}", f as i64)
        } else {
            format!("{f}")
        }
    } else {
        match cell.tag() {
            Tag::Integer => format!("{}", cell.as_integer()),
            Tag::List => format!("LIST:{}", cell.payload()),
            Tag::Code => format!("CODE:{}", cell.payload()),
            Tag::String => format!("STRING:{}", cell.payload()),
            Tag::Local => format!("LOCAL:{}", cell.payload()),
            Tag::Builtin => format!("BUILTIN:{}", cell.payload()),
            Tag::Sentinel => format!("SENTINEL:{}", cell.payload()),
            Tag::Number => unreachable!(),
        }
    }
}
