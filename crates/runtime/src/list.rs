//! List Model and Traversal
//!
//! A list is a *reverse list*: its header cell (tag `List`, payload = slot
//! count `s`) sits at the highest address of the `s + 1` contiguous cells it
//! occupies, with the `s` payload cells beneath it. Traversal walks from the
//! header toward lower addresses. A payload cell is either a simple one-slot
//! element, or — when the element itself is a nested list — the nested
//! list's own header, whose `payload + 1` cells (itself included) must be
//! skipped to reach the next element (spec §4.7).
//!
//! Everything here is a pure function of `(Memory, address)`: these helpers
//! know nothing about the data stack's current height or the VM's
//! registers. `crate::vm` and `crate::builtins` call them to implement the
//! stack-visible structural operations (`cons`, `tail`, `append`, ...).

use svm_core::segments::{Memory, Segment};
use svm_core::value::{Tag, TaggedValue};

use crate::error::RuntimeError;

/// Read the slot count from a LIST header at `addr`. Any other tag is a
/// malformed-list condition: callers only ever reach this with an address
/// they believe holds a header.
pub fn header_payload(mem: &Memory, addr: usize) -> Result<u16, RuntimeError> {
    let cell = read(mem, addr)?;
    match cell.tag() {
        Tag::List => Ok(cell.payload()),
        _ => Err(RuntimeError::MalformedList {
            context: "expected a LIST header cell",
        }),
    }
}

/// The number of cells the element *introduced* at `addr` occupies: 1 for a
/// simple value, or `payload + 1` when `addr` is itself a nested list's
/// header (its own topmost cell).
pub fn element_size_at(mem: &Memory, addr: usize) -> Result<usize, RuntimeError> {
    let cell = read(mem, addr)?;
    Ok(match cell.tag() {
        Tag::List => cell.payload() as usize + 1,
        _ => 1,
    })
}

/// Byte address of the `k`-th payload slot beneath `header_addr` (slot 0 is
/// the cell immediately beneath the header). O(1), per spec §4.7.
pub fn slot_addr(header_addr: usize, k: usize) -> Result<usize, RuntimeError> {
    header_addr
        .checked_sub(4 * (k + 1))
        .ok_or(RuntimeError::ValueRangeError {
            context: "slot index runs below the start of the stack segment",
        })
}

/// Locate the `index`-th *element* (not slot) of the list headed at
/// `header_addr`: O(element-count) — every element from 0 up to `index`
/// must be walked to account for nested lists occupying more than one slot.
pub fn element_at(
    mem: &Memory,
    header_addr: usize,
    index: usize,
) -> Result<(usize, usize), RuntimeError> {
    let s = header_payload(mem, header_addr)? as usize;
    let mut slot = 0usize;
    let mut i = 0usize;
    while slot < s {
        let addr = slot_addr(header_addr, slot)?;
        let size = element_size_at(mem, addr)?;
        if slot + size > s {
            return Err(RuntimeError::MalformedList {
                context: "element overruns its list's declared slot count",
            });
        }
        if i == index {
            return Ok((addr, size));
        }
        slot += size;
        i += 1;
    }
    Err(RuntimeError::ValueRangeError {
        context: "element index out of range",
    })
}

/// Number of elements in the list headed at `header_addr`: requires full
/// traversal (O(slot-count)), unlike `header_payload`'s O(1) slot count.
pub fn element_count(mem: &Memory, header_addr: usize) -> Result<usize, RuntimeError> {
    let s = header_payload(mem, header_addr)? as usize;
    let mut slot = 0usize;
    let mut count = 0usize;
    while slot < s {
        let addr = slot_addr(header_addr, slot)?;
        let size = element_size_at(mem, addr)?;
        if slot + size > s {
            return Err(RuntimeError::MalformedList {
                context: "element overruns its list's declared slot count",
            });
        }
        slot += size;
        count += 1;
    }
    Ok(count)
}

/// Translate a possibly-negative language-level index (`-1` is last) into a
/// 0-based element index, per spec §4.8's negative-index policy. Returns
/// `None` when the translated index is out of range.
pub fn normalize_index(raw: i32, element_count: usize) -> Option<usize> {
    if raw >= 0 {
        let idx = raw as usize;
        (idx < element_count).then_some(idx)
    } else {
        let from_end = (-raw) as usize;
        if from_end > element_count {
            None
        } else {
            Some(element_count - from_end)
        }
    }
}

/// Capture the `size` cells of the element starting at `addr` (its topmost
/// cell) downward, in top-to-bottom order — `result[0]` is the cell at
/// `addr` itself (the header, for a compound element), `result[last]` is
/// its deepest cell. This is the materialize-a-copy step `head`, `get`, and
/// `unpack` all need.
pub fn capture(mem: &Memory, addr: usize, size: usize) -> Result<Vec<u32>, RuntimeError> {
    (0..size)
        .map(|i| {
            addr.checked_sub(4 * i)
                .ok_or(RuntimeError::MalformedList {
                    context: "element span runs below the stack segment",
                })
                .and_then(|a| mem.read_cell(Segment::Stack, a).map_err(core_err))
        })
        .collect()
}

/// Write `cells` (in the same top-to-bottom order `capture` produced) so
/// that `cells[last]` lands at the lowest address and `cells[0]` lands at
/// `addr`, reconstructing the original layout starting at `addr` and
/// extending downward.
pub fn restore(mem: &mut Memory, addr: usize, cells: &[u32]) -> Result<(), RuntimeError> {
    for (i, bits) in cells.iter().enumerate() {
        let a = addr.checked_sub(4 * i).ok_or(RuntimeError::MalformedList {
            context: "element span runs below the stack segment",
        })?;
        mem.write_cell(Segment::Stack, a, *bits).map_err(core_err)?;
    }
    Ok(())
}

fn read(mem: &Memory, addr: usize) -> Result<TaggedValue, RuntimeError> {
    mem.read_cell(Segment::Stack, addr)
        .map(TaggedValue::from_bits)
        .map_err(core_err)
}

fn core_err(e: svm_core::CoreError) -> RuntimeError {
    crate::error::from_core_error(
        e,
        RuntimeError::MalformedList {
            context: "list cell access fell outside the stack segment",
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use svm_core::segments::SegmentSizes;

    fn mem() -> Memory {
        Memory::new(SegmentSizes {
            stack: 1024,
            rstack: 256,
            code: 256,
            string: 256,
        })
    }

    /// Push `( 1 2 3 )` by hand: payload cells low-to-high, header on top.
    fn build_flat_list(mem: &mut Memory, values: &[i32]) -> usize {
        let mut addr = 0usize;
        for v in values {
            let tv = TaggedValue::from_integer(*v).unwrap();
            mem.write_cell(Segment::Stack, addr, tv.to_bits()).unwrap();
            addr += 4;
        }
        let header = TaggedValue::encode(Tag::List, values.len() as u16);
        mem.write_cell(Segment::Stack, addr, header.to_bits())
            .unwrap();
        addr
    }

    #[test]
    fn flat_list_slots_and_elements() {
        let mut mem = mem();
        let header = build_flat_list(&mut mem, &[1, 2, 3]);
        assert_eq!(header_payload(&mem, header).unwrap(), 3);
        assert_eq!(element_count(&mem, header).unwrap(), 3);
        let (addr0, size0) = element_at(&mem, header, 0).unwrap();
        assert_eq!(size0, 1);
        assert_eq!(addr0, slot_addr(header, 0).unwrap());
    }

    #[test]
    fn empty_list_has_zero_elements() {
        let mut mem = mem();
        let header = build_flat_list(&mut mem, &[]);
        assert_eq!(header_payload(&mem, header).unwrap(), 0);
        assert_eq!(element_count(&mem, header).unwrap(), 0);
        assert!(element_at(&mem, header, 0).is_err());
    }

    #[test]
    fn nested_list_counts_as_one_element() {
        let mut mem = mem();
        // ( 1 ( 2 3 ) 4 ): build inner list first, then outer payload.
        let mut addr = 0usize;
        let one = TaggedValue::from_integer(1).unwrap();
        mem.write_cell(Segment::Stack, addr, one.to_bits()).unwrap();
        addr += 4;
        let inner_header = build_flat_list(&mut mem, &[2, 3]);
        addr = inner_header + 4;
        let four = TaggedValue::from_integer(4).unwrap();
        mem.write_cell(Segment::Stack, addr, four.to_bits()).unwrap();
        addr += 4;
        // outer payload: [1][inner: 2 payload + 1 header][4] = 1 + 3 + 1 = 5 slots
        let outer_header = TaggedValue::encode(Tag::List, 5);
        mem.write_cell(Segment::Stack, addr, outer_header.to_bits())
            .unwrap();

        assert_eq!(header_payload(&mem, addr).unwrap(), 5);
        assert_eq!(element_count(&mem, addr).unwrap(), 3);
        let (_, size1) = element_at(&mem, addr, 1).unwrap();
        assert_eq!(size1, 3); // inner list occupies 3 slots as one element
    }

    #[test]
    fn normalize_index_handles_negative() {
        assert_eq!(normalize_index(0, 3), Some(0));
        assert_eq!(normalize_index(2, 3), Some(2));
        assert_eq!(normalize_index(3, 3), None);
        assert_eq!(normalize_index(-1, 3), Some(2));
        assert_eq!(normalize_index(-3, 3), Some(0));
        assert_eq!(normalize_index(-4, 3), None);
    }

    #[test]
    fn capture_and_restore_roundtrip() {
        let mut mem = mem();
        let header = build_flat_list(&mut mem, &[10, 20, 30]);
        let cells = capture(&mem, header, 4).unwrap();
        let mut mem2 = Memory::new(SegmentSizes {
            stack: 1024,
            rstack: 256,
            code: 256,
            string: 256,
        });
        restore(&mut mem2, 200, &cells).unwrap();
        assert_eq!(header_payload(&mem2, 200).unwrap(), 3);
        assert_eq!(element_count(&mem2, 200).unwrap(), 3);
    }
}
