//! String Digest
//!
//! An append-only, deduplicated store of UTF-8 string literals in the
//! STRING segment. Each string is prefixed by a one-byte length followed by
//! its bytes (no NUL terminator). A side `HashMap` keyed by string content
//! gives O(1) dedup on `intern` without having to rescan the segment; the
//! segment itself remains the source of truth that `lookup` reads back
//! from, so `lookup(intern(s)) == s` by construction rather than by cache
//! coherence.

use std::collections::HashMap;

use svm_core::segments::{Memory, Segment};

use crate::error::RuntimeError;

pub struct StringDigest {
    /// Byte offset of the next free slot in the STRING segment.
    used: usize,
    /// content -> id, for O(1) intern of a repeated literal.
    ids_by_content: HashMap<String, u16>,
    /// id -> (offset, len) so `lookup` doesn't have to rescan the segment.
    entries: Vec<(usize, u8)>,
}

impl StringDigest {
    pub fn new() -> Self {
        StringDigest {
            used: 0,
            ids_by_content: HashMap::new(),
            entries: Vec::new(),
        }
    }

    /// Insert `s`, returning its (possibly pre-existing) identifier.
    pub fn intern(&mut self, mem: &mut Memory, s: &str) -> Result<u16, RuntimeError> {
        if let Some(&id) = self.ids_by_content.get(s) {
            return Ok(id);
        }
        if s.len() > u8::MAX as usize {
            return Err(RuntimeError::ValueRangeError {
                context: "string literal exceeds 255 bytes",
            });
        }
        if self.entries.len() >= u16::MAX as usize {
            return Err(RuntimeError::StringSegmentFull);
        }

        let mut framed = Vec::with_capacity(1 + s.len());
        framed.push(s.len() as u8);
        framed.extend_from_slice(s.as_bytes());

        let offset = mem
            .append_bytes(Segment::String, self.used, &framed)
            .map_err(|_| RuntimeError::StringSegmentFull)?;

        self.used += framed.len();
        let id = self.entries.len() as u16;
        self.entries.push((offset, s.len() as u8));
        self.ids_by_content.insert(s.to_string(), id);
        Ok(id)
    }

    /// Look up the string stored under `id`.
    pub fn lookup(&self, mem: &Memory, id: u16) -> Result<String, RuntimeError> {
        let (offset, len) = *self
            .entries
            .get(id as usize)
            .ok_or(RuntimeError::InvalidStringId { id })?;
        // Skip the length-prefix byte; it's redundant with the table we
        // already consulted, but it's what's actually stored in the segment.
        let bytes = mem
            .read_bytes(Segment::String, offset + 1, len as usize)
            .map_err(|_| RuntimeError::InvalidStringId { id })?;
        Ok(String::from_utf8_lossy(bytes).into_owned())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for StringDigest {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use svm_core::segments::SegmentSizes;

    fn mem() -> Memory {
        Memory::new(SegmentSizes {
            stack: 256,
            rstack: 256,
            code: 256,
            string: 256,
        })
    }

    #[test]
    fn intern_dedups() {
        let mut mem = mem();
        let mut digest = StringDigest::new();
        let a = digest.intern(&mut mem, "hello").unwrap();
        let b = digest.intern(&mut mem, "hello").unwrap();
        let c = digest.intern(&mut mem, "world").unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(digest.len(), 2);
    }

    #[test]
    fn lookup_roundtrips() {
        let mut mem = mem();
        let mut digest = StringDigest::new();
        let id = digest.intern(&mut mem, "round trip").unwrap();
        assert_eq!(digest.lookup(&mem, id).unwrap(), "round trip");
    }

    #[test]
    fn invalid_id_errors() {
        let mem = mem();
        let digest = StringDigest::new();
        assert!(matches!(
            digest.lookup(&mem, 0),
            Err(RuntimeError::InvalidStringId { id: 0 })
        ));
    }

    #[test]
    fn segment_exhaustion_errors() {
        let mut mem = Memory::new(SegmentSizes {
            stack: 16,
            rstack: 16,
            code: 16,
            string: 4,
        });
        let mut digest = StringDigest::new();
        assert!(digest.intern(&mut mem, "too long for four bytes").is_err());
    }
}
