//! Segment-level primitives for a stack-based bytecode VM.
//!
//! This crate knows nothing about opcodes, the dictionary, or source syntax.
//! It provides exactly two things: a NaN-boxed 32-bit tagged-value codec
//! (`value`) and a segmented byte-buffer memory model (`segments`) that the
//! runtime crate builds the VM, dictionary, and built-ins on top of.

pub mod error;
pub mod segments;
pub mod value;

pub use error::CoreError;
pub use segments::{Memory, Segment};
pub use value::{Tag, TaggedValue, NIL};
