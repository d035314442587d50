//! Symbol Dictionary
//!
//! Name -> (opcode | bytecode address) bindings with scoped shadowing. This
//! is deliberately a linked-list-shadowing design (a flat `HashMap` would
//! lose the ability to `forget` back to an earlier mark while an outer
//! binding of the same name is still reachable underneath): each `define`
//! pushes a fresh entry in front of whatever used to answer that name, and
//! `forget` simply truncates the entry list, letting shadowed bindings
//! resurface.
//!
//! Dictionary entries conceptually live in the GLOBAL segment (spec §3);
//! in this implementation they're an ordinary `Vec<DictEntry>` owned by the
//! `Dictionary`, tagged `Segment::Global` only where an address needs to
//! name which table it points into.

use crate::error::RuntimeError;

/// What a dictionary entry is bound to: the unified code-reference model
/// that lets the parser treat built-ins and user words identically.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Binding {
    /// A built-in opcode (0-127).
    Builtin(u8),
    /// A byte offset into the CODE segment.
    Code(u32),
}

#[derive(Debug, Clone)]
pub struct DictEntry {
    pub name: String,
    pub binding: Binding,
    /// If set, the parser invokes this word at compile time instead of
    /// emitting a call.
    pub immediate: bool,
}

/// An opaque handle returned by `mark()` and consumed by `forget()`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mark(usize);

pub struct Dictionary {
    entries: Vec<DictEntry>,
    capacity: usize,
}

impl Dictionary {
    pub fn new(capacity: usize) -> Self {
        Dictionary {
            entries: Vec::new(),
            capacity,
        }
    }

    fn define(&mut self, entry: DictEntry) -> Result<(), RuntimeError> {
        if self.entries.len() >= self.capacity {
            tracing::warn!(name = %entry.name, "dictionary full, definition rejected");
            return Err(RuntimeError::DictionaryFull);
        }
        tracing::trace!(name = %entry.name, binding = ?entry.binding, immediate = entry.immediate, "dictionary entry defined");
        self.entries.push(entry);
        Ok(())
    }

    pub fn define_builtin(
        &mut self,
        name: impl Into<String>,
        opcode: u8,
        immediate: bool,
    ) -> Result<(), RuntimeError> {
        self.define(DictEntry {
            name: name.into(),
            binding: Binding::Builtin(opcode),
            immediate,
        })
    }

    pub fn define_code(
        &mut self,
        name: impl Into<String>,
        address: u32,
        immediate: bool,
    ) -> Result<(), RuntimeError> {
        self.define(DictEntry {
            name: name.into(),
            binding: Binding::Code(address),
            immediate,
        })
    }

    /// Most-recent-wins lookup: later definitions shadow earlier ones of
    /// the same name.
    pub fn lookup(&self, name: &str) -> Option<&DictEntry> {
        self.entries.iter().rev().find(|e| e.name == name)
    }

    pub fn is_defined(&self, name: &str) -> bool {
        self.lookup(name).is_some()
    }

    /// Save the current dictionary head.
    pub fn mark(&self) -> Mark {
        Mark(self.entries.len())
    }

    /// Trim the dictionary back to a previously recorded mark, discarding
    /// every entry defined since. Entries shadowed since the mark (by a
    /// name that was redefined) become reachable again.
    pub fn forget(&mut self, mark: Mark) {
        tracing::trace!(from = self.entries.len(), to = mark.0, "dictionary forget");
        self.entries.truncate(mark.0);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn most_recent_wins() {
        let mut dict = Dictionary::new(16);
        dict.define_builtin("dup", 1, false).unwrap();
        dict.define_code("dup", 100, false).unwrap();
        assert_eq!(dict.lookup("dup").unwrap().binding, Binding::Code(100));
    }

    #[test]
    fn forget_restores_shadowed_entry() {
        let mut dict = Dictionary::new(16);
        dict.define_builtin("sq", 1, false).unwrap();
        let mark = dict.mark();
        dict.define_code("sq", 200, false).unwrap();
        assert_eq!(dict.lookup("sq").unwrap().binding, Binding::Code(200));
        dict.forget(mark);
        assert_eq!(dict.lookup("sq").unwrap().binding, Binding::Builtin(1));
    }

    #[test]
    fn undefined_lookup_is_none() {
        let dict = Dictionary::new(16);
        assert!(dict.lookup("nope").is_none());
    }

    #[test]
    fn dictionary_full_errors() {
        let mut dict = Dictionary::new(1);
        dict.define_builtin("a", 1, false).unwrap();
        assert!(matches!(
            dict.define_builtin("b", 2, false),
            Err(RuntimeError::DictionaryFull)
        ));
    }

    #[test]
    fn immediate_flag_is_recorded() {
        let mut dict = Dictionary::new(16);
        dict.define_builtin("if-else", 1, true).unwrap();
        assert!(dict.lookup("if-else").unwrap().immediate);
    }
}
