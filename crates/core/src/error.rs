//! Low-level error type for the tagged-value codec and segmented memory.
//!
//! Higher layers (the dictionary, the VM dispatch loop, the list model) wrap
//! or re-map these into the richer `RuntimeError` taxonomy of `svm-runtime`;
//! this crate only needs to describe the handful of ways a raw cell or a raw
//! byte-buffer access can go wrong.

use crate::segments::Segment;

/// Errors raised by `svm-core`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CoreError {
    /// A payload or integer value fell outside its representable range.
    ValueRange { value: i64, context: &'static str },
    /// An access (read or write) fell outside the bounds of a segment.
    OutOfBounds {
        segment: Segment,
        offset: usize,
        len: usize,
    },
    /// A cell access was not 4-byte aligned relative to its segment base.
    Misaligned { segment: Segment, offset: usize },
}

impl std::fmt::Display for CoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CoreError::ValueRange { value, context } => {
                write!(f, "value {value} out of range ({context})")
            }
            CoreError::OutOfBounds {
                segment,
                offset,
                len,
            } => write!(
                f,
                "access at offset {offset} (len {len}) is out of bounds for segment {segment:?}"
            ),
            CoreError::Misaligned { segment, offset } => write!(
                f,
                "unaligned cell access at offset {offset} in segment {segment:?}"
            ),
        }
    }
}

impl std::error::Error for CoreError {}
