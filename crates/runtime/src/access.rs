//! Polymorphic Path Access (`get` / `set`)
//!
//! A path is a *code reference* (spec §4.8): a quotation that, when
//! invoked, pushes zero or more path segments onto the data stack. Each
//! segment is either a NUMBER/INTEGER (an `elem`-style index — negative
//! counts from the end) or a STRING (a symbol key into a map-list).
//! `collect_path` is what runs the quotation and reads the segments back —
//! it measures how far the stack grew rather than expecting the quotation
//! to also push an explicit count, since the worked path `{ 1 0 }` is just
//! two literals with nothing marking how many there are.
//!
//! `walk` is the shared, non-destructive half of both `get` and `set`: it
//! applies each segment in turn — `elem`'s index semantics for a numeric
//! segment, a map-list key→value scan for a symbol one — and returns the
//! address and cell-span of the final element, or `None` if any step
//! misses (index out of range, or no such key), matching spec §4.8's
//! "short-circuit and return NIL".
//!
//! `get` materializes that span as an independent value and replaces the
//! whole (target, path) pair with it, or `NIL` on a miss. `set` writes
//! through in place when both the destination and the incoming value are a
//! single cell; writing a compound value into a compound slot of a
//! different size would shift every cell after it, which this core does
//! not attempt, so `set` reports failure (NIL) rather than silently
//! corrupting the stack.

use svm_core::segments::Segment;
use svm_core::value::{Tag, TaggedValue};

use crate::error::from_core_error;
use crate::error::RuntimeError;
use crate::list;
use crate::vm::Vm;

/// One decoded path segment: an `elem`-style index, or a map-list key (the
/// segment cell's own STRING digest id).
#[derive(Debug, Clone, Copy)]
pub enum PathSegment {
    Index(i32),
    Key(u16),
}

fn decode_segment(vm: &Vm, cell: TaggedValue) -> Result<PathSegment, RuntimeError> {
    if cell.tag() == Tag::String {
        Ok(PathSegment::Key(cell.payload()))
    } else {
        Ok(PathSegment::Index(vm.as_index(
            cell,
            "path segment must be a number, integer, or symbol",
        )?))
    }
}

/// Pop the path reference on top of the stack and run it to completion,
/// reading back whatever segments it pushed. Leaves the stack as it was
/// before the path reference (target still underneath, segments consumed).
fn collect_path(vm: &mut Vm) -> Result<Vec<PathSegment>, RuntimeError> {
    let path_addr = vm.sp.checked_sub(4).ok_or(RuntimeError::StackUnderflow {
        context: "get/set expects a path reference on top of the stack",
    })?;
    let path_ref = vm
        .mem()
        .read_cell(Segment::Stack, path_addr)
        .map(TaggedValue::from_bits)
        .map_err(|e| from_core_error(e, RuntimeError::MalformedList {
            context: "path reference fell outside the stack segment",
        }))?;
    if !matches!(path_ref.tag(), Tag::Code | Tag::Builtin) {
        return Err(RuntimeError::TypeError {
            context: "get/set path must be a code reference",
            got: crate::error::display_cell(path_ref),
        });
    }

    vm.sp = path_addr;
    let marker = vm.sp;
    vm.invoke(path_ref)?;
    let grown = vm
        .sp
        .checked_sub(marker)
        .ok_or(RuntimeError::MalformedList {
            context: "path evaluation left the stack shorter than it started",
        })?;

    let mut segments = Vec::with_capacity(grown / 4);
    let mut addr = marker;
    while addr < vm.sp {
        let cell = vm
            .mem()
            .read_cell(Segment::Stack, addr)
            .map(TaggedValue::from_bits)
            .map_err(|e| from_core_error(e, RuntimeError::MalformedList {
                context: "path segment fell outside the stack segment",
            }))?;
        segments.push(decode_segment(vm, cell)?);
        addr += 4;
    }
    vm.sp = marker;
    Ok(segments)
}

/// Scan the map-list headed at `header_addr` for a STRING key matching
/// `id`. Keys sit at odd header-adjacent element indices — the slot
/// written immediately after its value, so under header-adjacent
/// numbering the value is one index *closer* to the header — matching the
/// pairing `find`'s map-list mode (`crate::builtins`) uses on the same
/// layout.
fn find_key(
    vm: &Vm,
    header_addr: usize,
    id: u16,
) -> Result<Option<(usize, usize)>, RuntimeError> {
    let count = list::element_count(vm.mem(), header_addr)?;
    let mut i = 1usize;
    while i < count {
        let (kaddr, ksize) = list::element_at(vm.mem(), header_addr, i)?;
        if ksize == 1 {
            let kcell = vm
                .mem()
                .read_cell(Segment::Stack, kaddr)
                .map(TaggedValue::from_bits)
                .map_err(|e| from_core_error(e, RuntimeError::MalformedList {
                    context: "path key lookup fell outside the stack segment",
                }))?;
            if kcell.tag() == Tag::String && kcell.payload() == id {
                return Ok(Some(list::element_at(vm.mem(), header_addr, i - 1)?));
            }
        }
        i += 2;
    }
    Ok(None)
}

/// Walk `path` starting from the value whose topmost cell is at
/// `root_addr`. Returns the address and size of the element the full path
/// resolves to, or `None` the moment a segment misses.
pub fn walk(
    vm: &Vm,
    root_addr: usize,
    path: &[PathSegment],
) -> Result<Option<(usize, usize)>, RuntimeError> {
    let mut addr = root_addr;
    let mut size = list::element_size_at(vm.mem(), addr)?;
    for step in path {
        if size <= 1 {
            return Err(RuntimeError::TypeError {
                context: "get/set path descends into a scalar",
                got: format!("{step:?}"),
            });
        }
        match *step {
            PathSegment::Index(raw) => {
                let count = list::element_count(vm.mem(), addr)?;
                let Some(idx) = list::normalize_index(raw, count) else {
                    return Ok(None);
                };
                let (next_addr, next_size) = list::element_at(vm.mem(), addr, idx)?;
                addr = next_addr;
                size = next_size;
            }
            PathSegment::Key(id) => match find_key(vm, addr, id)? {
                Some((next_addr, next_size)) => {
                    addr = next_addr;
                    size = next_size;
                }
                None => return Ok(None),
            },
        }
    }
    Ok(Some((addr, size)))
}

/// `( target {path} -- result )`: evaluate `path`, walk it against
/// `target`, and replace both with the element found (materialized as an
/// independent copy), or `NIL` on a miss.
pub fn get(vm: &mut Vm) -> Result<(), RuntimeError> {
    let path = collect_path(vm)?;
    let root_addr = vm.sp.checked_sub(4).ok_or(RuntimeError::StackUnderflow {
        context: "get expects a value beneath its path",
    })?;
    let found = walk(vm, root_addr, &path)?;
    let root_size = list::element_size_at(vm.mem(), root_addr)?;
    match found {
        Some((found_addr, found_size)) => {
            let result = list::capture(vm.mem(), found_addr, found_size)?;
            vm.sp = root_addr + 4 - 4 * root_size;
            for &bits in result.iter().rev() {
                vm.push(TaggedValue::from_bits(bits))?;
            }
            Ok(())
        }
        None => {
            vm.sp = root_addr + 4 - 4 * root_size;
            vm.push(svm_core::value::NIL)
        }
    }
}

/// `( target newval {path} -- target ok )`: evaluate `path`, walk it
/// against `target`, and write `newval` into the slot it resolves to, in
/// place, only when both the target slot and `newval` occupy exactly one
/// cell. Pushes `1` on success, `NIL` otherwise (miss, compound target, or
/// size mismatch). `target` itself is left on the stack either way (unlike
/// `get`, which doesn't need its root again): since compound values here
/// live on the data stack rather than behind a heap reference, a mutation
/// that didn't leave its receiver reachable afterward would have no way to
/// be observed or chained into further operations.
pub fn set(vm: &mut Vm) -> Result<(), RuntimeError> {
    let path = collect_path(vm)?;
    let newval_addr = vm.sp.checked_sub(4).ok_or(RuntimeError::StackUnderflow {
        context: "set expects a value beneath its path",
    })?;
    let newval_size = list::element_size_at(vm.mem(), newval_addr)?;
    let root_addr = newval_addr
        .checked_sub(4 * newval_size)
        .ok_or(RuntimeError::StackUnderflow {
            context: "set expects a value beneath its replacement",
        })?;

    let found = walk(vm, root_addr, &path)?;
    let ok = match found {
        Some((found_addr, found_size)) if found_size == 1 && newval_size == 1 => {
            let bits = vm
                .mem()
                .read_cell(Segment::Stack, newval_addr)
                .map_err(|e| from_core_error(e, RuntimeError::MalformedList {
                    context: "replacement cell fell outside the stack segment",
                }))?;
            vm.mem_mut()
                .write_cell(Segment::Stack, found_addr, bits)
                .map_err(|e| from_core_error(e, RuntimeError::MalformedList {
                    context: "target slot fell outside the stack segment",
                }))?;
            true
        }
        _ => false,
    };

    // Pop path and newval, leaving the (now possibly updated) target; push
    // the ok flag.
    vm.sp = newval_addr;
    vm.push(if ok {
        TaggedValue::encode(Tag::Integer, 1)
    } else {
        svm_core::value::NIL
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::{Op, VmConfig};
    use svm_core::value::Tag as T;

    fn push_int(vm: &mut Vm, n: i32) {
        vm.push(TaggedValue::from_integer(n).unwrap()).unwrap();
    }

    fn push_list(vm: &mut Vm, values: &[i32]) {
        for &v in values {
            push_int(vm, v);
        }
        vm.push(TaggedValue::encode(T::List, values.len() as u16))
            .unwrap();
    }

    fn symbol(vm: &mut Vm, name: &str) -> TaggedValue {
        let id = vm.digest.intern(vm.mem_mut(), name).unwrap();
        TaggedValue::encode(Tag::String, id)
    }

    /// Assemble `{ segments... }` as a standalone `Enter 0 ... Exit` unit
    /// (the same shape `compile_quotation` emits) and return a CODE
    /// reference to it, the way `get`/`set` expect their path argument.
    fn build_path_quotation(vm: &mut Vm, segments: &[TaggedValue]) -> TaggedValue {
        let entry = vm.code_pos();
        vm.emit_byte(Op::Enter as u8).unwrap();
        vm.emit_byte(0).unwrap();
        for seg in segments {
            vm.emit_byte(Op::PushLiteral as u8).unwrap();
            vm.emit_bytes(&seg.to_bits().to_le_bytes()).unwrap();
        }
        vm.emit_byte(Op::Exit as u8).unwrap();
        TaggedValue::encode(Tag::Code, entry as u16)
    }

    fn list_elem_value(values: &[i32], idx_from_header: usize) -> i16 {
        // element 0 is nearest the header, i.e. the last value pushed.
        let reversed: Vec<i32> = values.iter().rev().cloned().collect();
        reversed[idx_from_header] as i16
    }

    #[test]
    fn get_top_level_index() {
        let mut vm = Vm::new(VmConfig::default());
        push_list(&mut vm, &[10, 20, 30]);
        let path = build_path_quotation(&mut vm, &[TaggedValue::from_integer(1).unwrap()]);
        vm.push(path).unwrap();
        get(&mut vm).unwrap();
        let result = vm.pop().unwrap();
        assert_eq!(result.as_integer(), list_elem_value(&[10, 20, 30], 1));
    }

    #[test]
    fn get_nested_path_two_segments_deep() {
        // ( ( 10 20 ) ( 30 40 ) ) { 0 1 } get -> 30.
        //
        // Construction order pushes the (10 20) sublist first, then
        // (30 40), so under header-adjacent indexing outer element 0 is
        // (30 40) and outer element 1 is (10 20); within (30 40), element
        // 1 is 30 (the first value pushed, farthest from that sublist's
        // own header).
        let mut vm = Vm::new(VmConfig::default());
        push_list(&mut vm, &[10, 20]);
        push_list(&mut vm, &[30, 40]);
        vm.push(TaggedValue::encode(T::List, 6)).unwrap(); // 3 + 3 slots
        let zero = TaggedValue::from_integer(0).unwrap();
        let one = TaggedValue::from_integer(1).unwrap();
        let path = build_path_quotation(&mut vm, &[zero, one]);
        vm.push(path).unwrap();
        get(&mut vm).unwrap();
        let result = vm.pop().unwrap();
        assert_eq!(result.as_integer(), 30);
    }

    #[test]
    fn get_symbol_segment_into_a_map_list() {
        let mut vm = Vm::new(VmConfig::default());
        let a = symbol(&mut vm, "a");
        let b = symbol(&mut vm, "b");
        let c = symbol(&mut vm, "c");
        vm.push(a).unwrap();
        push_int(&mut vm, 1);
        vm.push(b).unwrap();
        push_int(&mut vm, 2);
        vm.push(c).unwrap();
        push_int(&mut vm, 3);
        vm.push(TaggedValue::encode(T::List, 6)).unwrap();

        let key = symbol(&mut vm, "b");
        let path = build_path_quotation(&mut vm, &[key]);
        vm.push(path).unwrap();
        get(&mut vm).unwrap();
        let result = vm.pop().unwrap();
        assert_eq!(result.as_integer(), 2);
    }

    #[test]
    fn get_missing_key_yields_nil() {
        let mut vm = Vm::new(VmConfig::default());
        let a = symbol(&mut vm, "a");
        vm.push(a).unwrap();
        push_int(&mut vm, 1);
        vm.push(TaggedValue::encode(T::List, 2)).unwrap();

        let missing = symbol(&mut vm, "z");
        let path = build_path_quotation(&mut vm, &[missing]);
        vm.push(path).unwrap();
        get(&mut vm).unwrap();
        assert_eq!(vm.pop().unwrap(), svm_core::value::NIL);
    }

    #[test]
    fn set_scalar_in_place_reports_ok() {
        let mut vm = Vm::new(VmConfig::default());
        push_list(&mut vm, &[10, 20, 30]);
        push_int(&mut vm, 99);
        let path = build_path_quotation(&mut vm, &[TaggedValue::from_integer(0).unwrap()]);
        vm.push(path).unwrap();
        set(&mut vm).unwrap();
        let ok = vm.pop().unwrap();
        assert_eq!(ok.as_integer(), 1);
    }
}
