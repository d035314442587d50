//! Built-in Vocabulary
//!
//! Implements every named operation dispatched through `Op` (everything at
//! or above `Op::Dup`, i.e. every opcode the compiler-internal control
//! instructions in `crate::vm` don't already handle) and registers each
//! one's name and opcode in the dictionary so the compiler can resolve
//! ordinary words without special-casing them.

use svm_core::segments::Segment;
use svm_core::value::{Tag, TaggedValue, NIL};

use crate::access;
use crate::error::{display_cell, from_core_error, RuntimeError};
use crate::list;
use crate::vm::{Op, Vm};

/// Bind every built-in's name to its opcode. Called once by `Vm::new`.
pub fn install(vm: &mut Vm) -> Result<(), RuntimeError> {
    let entries: &[(&str, Op)] = &[
        ("(", Op::Mark),
        (")", Op::EndList),
        ("dup", Op::Dup),
        ("drop", Op::Drop),
        ("swap", Op::Swap),
        ("over", Op::Over),
        ("rot", Op::Rot),
        ("-rot", Op::NRot),
        ("nip", Op::Nip),
        ("tuck", Op::Tuck),
        ("pick", Op::Pick),
        ("roll", Op::Roll),
        ("depth", Op::Depth),
        ("clear", Op::Clear),
        ("2dup", Op::TwoDup),
        ("2drop", Op::TwoDrop),
        ("2swap", Op::TwoSwap),
        ("+", Op::Add),
        ("-", Op::Sub),
        ("*", Op::Mul),
        ("/", Op::Div),
        ("mod", Op::Mod),
        ("neg", Op::Neg),
        ("abs", Op::Abs),
        ("min", Op::Min),
        ("max", Op::Max),
        ("pow", Op::Pow),
        ("sqrt", Op::Sqrt),
        ("exp", Op::Exp),
        ("ln", Op::Ln),
        ("sin", Op::Sin),
        ("cos", Op::Cos),
        ("tan", Op::Tan),
        ("=", Op::Eq),
        ("<>", Op::Neq),
        ("<", Op::Lt),
        ("<=", Op::Le),
        (">", Op::Gt),
        (">=", Op::Ge),
        ("and", Op::And),
        ("or", Op::Or),
        ("not", Op::Not),
        ("=0", Op::EqZero),
        (">0", Op::GtZero),
        ("<0", Op::LtZero),
        ("eval", Op::Eval),
        ("if-else", Op::IfElse),
        ("abort", Op::Abort),
        ("enlist", Op::Enlist),
        ("pack", Op::Pack),
        ("unpack", Op::Unpack),
        ("cons", Op::Cons),
        ("uncons", Op::Uncons),
        ("head", Op::Head),
        ("tail", Op::Tail),
        ("append", Op::Append),
        ("concat", Op::Concat),
        ("reverse", Op::Reverse),
        ("length", Op::Length),
        ("slots", Op::Slots),
        ("slot", Op::SlotOp),
        ("elem", Op::ElemOp),
        ("fetch", Op::Fetch),
        ("store", Op::StoreAddr),
        ("get", Op::Get),
        ("set", Op::Set),
        ("sort", Op::Sort),
        ("mapsort", Op::MapSort),
        ("find", Op::Find),
        ("bfind", Op::BFind),
        ("hindex", Op::HIndex),
        ("hfind", Op::HFind),
        ("print", Op::Print),
        ("raw-print", Op::RawPrint),
        (".", Op::Dot),
        ("nl", Op::Nl),
    ];
    for (name, op) in entries {
        vm.dict.define_builtin(*name, *op as u8, false)?;
    }
    Ok(())
}

/// Dispatch an opcode reached through the normal `Vm::step` loop (byte came
/// straight out of CODE).
pub fn dispatch(vm: &mut Vm, op: Op) -> Result<(), RuntimeError> {
    match op {
        Op::Dup => dup(vm),
        Op::Drop => drop_op(vm),
        Op::Swap => swap(vm),
        Op::Over => over(vm),
        Op::Rot => rot(vm),
        Op::NRot => nrot(vm),
        Op::Nip => nip(vm),
        Op::Tuck => tuck(vm),
        Op::Pick => pick(vm),
        Op::Roll => roll(vm),
        Op::Depth => {
            let d = TaggedValue::from_integer(vm.depth() as i32)
                .map_err(|e| from_core_error(e, RuntimeError::ValueRangeError {
                    context: "stack depth exceeds representable range",
                }))?;
            vm.push(d)
        }
        Op::Clear => {
            vm.sp = 0;
            Ok(())
        }
        Op::TwoDup => two_dup(vm),
        Op::TwoDrop => two_drop(vm),
        Op::TwoSwap => two_swap(vm),

        Op::Add => binop(vm, |a, b| a + b),
        Op::Sub => binop(vm, |a, b| a - b),
        Op::Mul => binop(vm, |a, b| a * b),
        Op::Div => div(vm),
        Op::Mod => rem(vm),
        Op::Neg => unop(vm, |a| -a),
        Op::Abs => unop(vm, |a| a.abs()),
        Op::Min => binop(vm, f32::min),
        Op::Max => binop(vm, f32::max),
        Op::Pow => binop(vm, f32::powf),
        Op::Sqrt => unop(vm, f32::sqrt),
        Op::Exp => unop(vm, f32::exp),
        Op::Ln => unop(vm, f32::ln),
        Op::Sin => unop(vm, f32::sin),
        Op::Cos => unop(vm, f32::cos),
        Op::Tan => unop(vm, f32::tan),

        Op::Eq => cmp(vm, |a, b| a == b),
        Op::Neq => cmp(vm, |a, b| a != b),
        Op::Lt => cmp(vm, |a, b| a < b),
        Op::Le => cmp(vm, |a, b| a <= b),
        Op::Gt => cmp(vm, |a, b| a > b),
        Op::Ge => cmp(vm, |a, b| a >= b),
        Op::And => logic(vm, |a, b| a && b),
        Op::Or => logic(vm, |a, b| a || b),
        Op::Not => {
            let v = vm.pop()?;
            vm.push(bool_cell(!v.is_truthy()))
        }
        Op::EqZero => cmp0(vm, |a| a == 0.0),
        Op::GtZero => cmp0(vm, |a| a > 0.0),
        Op::LtZero => cmp0(vm, |a| a < 0.0),

        Op::Eval => {
            let v = vm.pop()?;
            vm.invoke(v)
        }
        Op::IfElse => if_else(vm),
        Op::Abort => abort(vm),

        Op::Enlist => enlist(vm),
        Op::Pack => pack(vm),
        Op::Unpack => unpack(vm),
        Op::Cons => cons(vm),
        Op::Uncons => uncons(vm),
        Op::Head => head(vm),
        Op::Tail => tail(vm),
        Op::Append => append(vm),
        Op::Concat => concat(vm),
        Op::Reverse => reverse(vm),
        Op::Length => length(vm),
        Op::Slots => slots(vm),

        Op::SlotOp => slot_of(vm),
        Op::ElemOp => elem_of(vm),
        Op::Fetch => fetch(vm),
        Op::StoreAddr => store(vm),
        Op::Get => access::get(vm),
        Op::Set => access::set(vm),

        Op::Sort => sort(vm),
        Op::MapSort => mapsort(vm),
        Op::Find => find(vm),
        Op::BFind => bfind(vm),
        Op::HIndex => hindex(vm),
        Op::HFind => hfind(vm),

        Op::Print => print(vm),
        Op::RawPrint => raw_print(vm),
        Op::Dot => dot(vm),
        Op::Nl => {
            println!();
            Ok(())
        }

        // Control opcodes are handled directly by `Vm::dispatch`; reaching
        // them here means the dispatch tables have drifted apart.
        Op::PushLiteral
        | Op::Branch
        | Op::Branch0
        | Op::Enter
        | Op::Exit
        | Op::PushLocal
        | Op::StoreLocal
        | Op::Mark
        | Op::EndList => Err(RuntimeError::CompileError {
            message: "control opcode reached the built-in dispatcher".into(),
            line: 0,
            col: 0,
        }),
    }
}

/// Dispatch a built-in reached via a BUILTIN-tagged cell passed to `eval`
/// (as opposed to being fetched straight out of CODE).
pub fn dispatch_named(vm: &mut Vm, opcode: u16) -> Result<(), RuntimeError> {
    let op = Op::from_u8(opcode as u8).ok_or(RuntimeError::TypeError {
        context: "not a valid built-in opcode",
        got: format!("{opcode}"),
    })?;
    dispatch(vm, op)
}

// =============================================================================
// Stack manipulation: generic capture/rewrite over whole *values* (a value
// may be a single cell or a compound list's full span), so these are
// correct even when a list sits directly on the stack rather than behind
// an indirection.
// =============================================================================

/// Read the top `n` values (0 = TOS) without mutating the stack. Returns
/// the lowest address occupied by any of them, and each value's cells in
/// top-to-bottom order (index 0 = the shallowest / most recently pushed).
fn capture_values(vm: &Vm, n: usize) -> Result<(usize, Vec<Vec<u32>>), RuntimeError> {
    let mut top = vm.sp;
    let mut values = Vec::with_capacity(n);
    for _ in 0..n {
        let this_top = top
            .checked_sub(4)
            .ok_or(RuntimeError::StackUnderflow {
                context: "stack manipulation",
            })?;
        let size = list::element_size_at(vm.mem(), this_top)?;
        let cells = list::capture(vm.mem(), this_top, size)?;
        values.push(cells);
        top = this_top - 4 * (size - 1);
    }
    Ok((top, values))
}

/// Write the values named by `order` (indices into `values`, new TOS
/// first) back starting at `base`, and update `vm.sp`.
fn rewrite(vm: &mut Vm, base: usize, order: &[usize], values: &[Vec<u32>]) -> Result<(), RuntimeError> {
    let mut flat = Vec::new();
    for &i in order {
        flat.extend_from_slice(&values[i]);
    }
    let new_sp = base + 4 * flat.len();
    if !flat.is_empty() {
        list::restore(vm.mem_mut(), new_sp - 4, &flat)?;
    }
    vm.sp = new_sp;
    Ok(())
}

fn dup(vm: &mut Vm) -> Result<(), RuntimeError> {
    let (base, vals) = capture_values(vm, 1)?;
    rewrite(vm, base, &[0, 0], &vals)
}

fn drop_op(vm: &mut Vm) -> Result<(), RuntimeError> {
    let (base, vals) = capture_values(vm, 1)?;
    rewrite(vm, base, &[], &vals)
}

fn swap(vm: &mut Vm) -> Result<(), RuntimeError> {
    let (base, vals) = capture_values(vm, 2)?;
    rewrite(vm, base, &[1, 0], &vals)
}

fn over(vm: &mut Vm) -> Result<(), RuntimeError> {
    let (base, vals) = capture_values(vm, 2)?;
    rewrite(vm, base, &[1, 0, 1], &vals)
}

fn rot(vm: &mut Vm) -> Result<(), RuntimeError> {
    let (base, vals) = capture_values(vm, 3)?;
    rewrite(vm, base, &[2, 0, 1], &vals)
}

fn nrot(vm: &mut Vm) -> Result<(), RuntimeError> {
    let (base, vals) = capture_values(vm, 3)?;
    rewrite(vm, base, &[1, 2, 0], &vals)
}

fn nip(vm: &mut Vm) -> Result<(), RuntimeError> {
    let (base, vals) = capture_values(vm, 2)?;
    rewrite(vm, base, &[0], &vals)
}

fn tuck(vm: &mut Vm) -> Result<(), RuntimeError> {
    let (base, vals) = capture_values(vm, 2)?;
    rewrite(vm, base, &[0, 1, 0], &vals)
}

fn two_dup(vm: &mut Vm) -> Result<(), RuntimeError> {
    let (base, vals) = capture_values(vm, 2)?;
    rewrite(vm, base, &[0, 1, 0, 1], &vals)
}

fn two_drop(vm: &mut Vm) -> Result<(), RuntimeError> {
    let (base, vals) = capture_values(vm, 2)?;
    rewrite(vm, base, &[], &vals)
}

fn two_swap(vm: &mut Vm) -> Result<(), RuntimeError> {
    let (base, vals) = capture_values(vm, 4)?;
    rewrite(vm, base, &[2, 3, 0, 1], &vals)
}

fn pick(vm: &mut Vm) -> Result<(), RuntimeError> {
    let n = vm.pop_index("pick expects an index")? as usize;
    let (base, vals) = capture_values(vm, n + 1)?;
    let mut order = vec![n];
    order.extend(0..=n);
    rewrite(vm, base, &order, &vals)
}

fn roll(vm: &mut Vm) -> Result<(), RuntimeError> {
    let n = vm.pop_index("roll expects an index")? as usize;
    let (base, vals) = capture_values(vm, n + 1)?;
    let mut order = vec![n];
    order.extend(0..n);
    rewrite(vm, base, &order, &vals)
}

// =============================================================================
// Arithmetic
// =============================================================================

fn pop_number(vm: &mut Vm, context: &'static str) -> Result<f32, RuntimeError> {
    let v = vm.pop()?;
    number_of(v, context)
}

fn number_of(v: TaggedValue, context: &'static str) -> Result<f32, RuntimeError> {
    if v.is_number() {
        Ok(v.as_float())
    } else if v.tag() == Tag::Integer {
        Ok(v.as_integer() as f32)
    } else {
        Err(RuntimeError::TypeError {
            context,
            got: display_cell(v),
        })
    }
}

fn binop(vm: &mut Vm, f: impl Fn(f32, f32) -> f32) -> Result<(), RuntimeError> {
    let b = pop_number(vm, "arithmetic operand")?;
    let a = pop_number(vm, "arithmetic operand")?;
    vm.push(TaggedValue::from_float(f(a, b)))
}

fn unop(vm: &mut Vm, f: impl Fn(f32) -> f32) -> Result<(), RuntimeError> {
    let a = pop_number(vm, "arithmetic operand")?;
    vm.push(TaggedValue::from_float(f(a)))
}

fn div(vm: &mut Vm) -> Result<(), RuntimeError> {
    let b = pop_number(vm, "division operand")?;
    let a = pop_number(vm, "division operand")?;
    if b == 0.0 {
        return Err(RuntimeError::DivByZero);
    }
    vm.push(TaggedValue::from_float(a / b))
}

fn rem(vm: &mut Vm) -> Result<(), RuntimeError> {
    let b = pop_number(vm, "modulo operand")?;
    let a = pop_number(vm, "modulo operand")?;
    if b == 0.0 {
        return Err(RuntimeError::DivByZero);
    }
    vm.push(TaggedValue::from_float(a % b))
}

// =============================================================================
// Comparison / logic
// =============================================================================

fn bool_cell(b: bool) -> TaggedValue {
    TaggedValue::encode(Tag::Integer, if b { 1 } else { 0 })
}

fn cmp(vm: &mut Vm, f: impl Fn(f32, f32) -> bool) -> Result<(), RuntimeError> {
    let b = pop_number(vm, "comparison operand")?;
    let a = pop_number(vm, "comparison operand")?;
    vm.push(bool_cell(f(a, b)))
}

fn cmp0(vm: &mut Vm, f: impl Fn(f32) -> bool) -> Result<(), RuntimeError> {
    let a = pop_number(vm, "comparison operand")?;
    vm.push(bool_cell(f(a)))
}

fn logic(vm: &mut Vm, f: impl Fn(bool, bool) -> bool) -> Result<(), RuntimeError> {
    let b = vm.pop()?.is_truthy();
    let a = vm.pop()?.is_truthy();
    vm.push(bool_cell(f(a, b)))
}

// =============================================================================
// Control combinators
// =============================================================================

fn if_else(vm: &mut Vm) -> Result<(), RuntimeError> {
    let else_branch = vm.pop()?;
    let then_branch = vm.pop()?;
    let cond = vm.pop()?;
    if cond.is_truthy() {
        vm.invoke(then_branch)
    } else {
        vm.invoke(else_branch)
    }
}

fn abort(vm: &mut Vm) -> Result<(), RuntimeError> {
    let v = vm.pop()?;
    let message = if v.tag() == Tag::String {
        vm.digest.lookup(vm.mem(), v.payload())?
    } else {
        display_cell(v)
    };
    vm.running = false;
    Err(RuntimeError::Abort { message })
}

// =============================================================================
// List construction / structural ops
// =============================================================================

fn list_header_err() -> RuntimeError {
    RuntimeError::TypeError {
        context: "expected a LIST on top of the stack",
        got: "non-list cell".into(),
    }
}

fn require_list(vm: &Vm, addr: usize) -> Result<u16, RuntimeError> {
    let cell = vm
        .mem()
        .read_cell(Segment::Stack, addr)
        .map(TaggedValue::from_bits)
        .map_err(|e| from_core_error(e, list_header_err()))?;
    if cell.tag() != Tag::List {
        return Err(list_header_err());
    }
    Ok(cell.payload())
}

fn enlist(vm: &mut Vm) -> Result<(), RuntimeError> {
    let addr = vm.sp.checked_sub(4).ok_or(RuntimeError::StackUnderflow {
        context: "enlist",
    })?;
    let size = list::element_size_at(vm.mem(), addr)?;
    let header = TaggedValue::encode(Tag::List, size as u16);
    vm.push(header)
}

fn pack(vm: &mut Vm) -> Result<(), RuntimeError> {
    let n = vm.pop_index("pack expects a count")? as usize;
    let mut cursor = vm.sp;
    let mut total = 0usize;
    for _ in 0..n {
        let top = cursor.checked_sub(4).ok_or(RuntimeError::StackUnderflow {
            context: "pack",
        })?;
        let size = list::element_size_at(vm.mem(), top)?;
        total += size;
        cursor = top - 4 * (size - 1) - 4;
    }
    let header = TaggedValue::try_encode(Tag::List, total as i64)
        .map_err(|e| from_core_error(e, RuntimeError::ValueRangeError {
            context: "packed list exceeds the maximum slot count",
        }))?;
    vm.push(header)
}

fn unpack(vm: &mut Vm) -> Result<(), RuntimeError> {
    let header_addr = vm.sp.checked_sub(4).ok_or(RuntimeError::StackUnderflow {
        context: "unpack",
    })?;
    let s = require_list(vm, header_addr)? as usize;
    let count = if s == 0 {
        0
    } else {
        list::element_count(vm.mem(), header_addr)?
    };
    vm.sp = header_addr;
    let n = TaggedValue::from_integer(count as i32)
        .map_err(|e| from_core_error(e, RuntimeError::ValueRangeError {
            context: "element count exceeds representable range",
        }))?;
    vm.push(n)
}

fn cons(vm: &mut Vm) -> Result<(), RuntimeError> {
    let v_addr = vm.sp.checked_sub(4).ok_or(RuntimeError::StackUnderflow {
        context: "cons",
    })?;
    let v_size = list::element_size_at(vm.mem(), v_addr)?;
    let header_addr = v_addr
        .checked_sub(4 * v_size)
        .ok_or(RuntimeError::StackUnderflow { context: "cons" })?;
    let s = require_list(vm, header_addr)?;
    let cells = list::capture(vm.mem(), v_addr, v_size)?;
    let new_top = v_addr.checked_sub(4).ok_or(RuntimeError::StackUnderflow {
        context: "cons",
    })?;
    list::restore(vm.mem_mut(), new_top, &cells)?;
    let new_header = TaggedValue::try_encode(Tag::List, s as i64 + 1)
        .map_err(|e| from_core_error(e, RuntimeError::ValueRangeError {
            context: "list exceeds the maximum slot count",
        }))?;
    vm.mem_mut()
        .write_cell(Segment::Stack, v_addr, new_header.to_bits())
        .map_err(|e| from_core_error(e, RuntimeError::StackOverflow { context: "cons" }))
}

fn uncons(vm: &mut Vm) -> Result<(), RuntimeError> {
    let new_header_addr = vm.sp.checked_sub(4).ok_or(RuntimeError::StackUnderflow {
        context: "uncons",
    })?;
    let s = require_list(vm, new_header_addr)?;
    if s == 0 {
        return Err(RuntimeError::ValueRangeError {
            context: "uncons on an empty list",
        });
    }
    let head_top = new_header_addr
        .checked_sub(4)
        .ok_or(RuntimeError::StackUnderflow { context: "uncons" })?;
    let v_size = list::element_size_at(vm.mem(), head_top)?;
    let old_header_addr = new_header_addr
        .checked_sub(4 * v_size)
        .ok_or(RuntimeError::StackUnderflow { context: "uncons" })?;
    let cells = list::capture(vm.mem(), head_top, v_size)?;
    list::restore(vm.mem_mut(), new_header_addr, &cells)?;
    let rest_header = TaggedValue::encode(Tag::List, s - v_size as u16);
    vm.mem_mut()
        .write_cell(Segment::Stack, old_header_addr, rest_header.to_bits())
        .map_err(|e| from_core_error(e, RuntimeError::StackOverflow { context: "uncons" }))
}

fn head(vm: &mut Vm) -> Result<(), RuntimeError> {
    let header_addr = vm.sp.checked_sub(4).ok_or(RuntimeError::StackUnderflow {
        context: "head",
    })?;
    let s = require_list(vm, header_addr)?;
    if s == 0 {
        return Err(RuntimeError::ValueRangeError {
            context: "head of an empty list",
        });
    }
    let (addr, size) = list::element_at(vm.mem(), header_addr, 0)?;
    let cells = list::capture(vm.mem(), addr, size)?;
    let bottom = header_addr.checked_sub(4 * s as usize).ok_or(RuntimeError::StackUnderflow {
        context: "head",
    })?;
    vm.sp = bottom;
    for &bits in cells.iter().rev() {
        vm.push(TaggedValue::from_bits(bits))?;
    }
    Ok(())
}

fn tail(vm: &mut Vm) -> Result<(), RuntimeError> {
    let header_addr = vm.sp.checked_sub(4).ok_or(RuntimeError::StackUnderflow {
        context: "tail",
    })?;
    let s = require_list(vm, header_addr)?;
    if s == 0 {
        return Err(RuntimeError::ValueRangeError {
            context: "tail of an empty list",
        });
    }
    let elem0_top = header_addr
        .checked_sub(4)
        .ok_or(RuntimeError::StackUnderflow { context: "tail" })?;
    let v0_size = list::element_size_at(vm.mem(), elem0_top)?;
    let new_header_addr = elem0_top;
    let new_header = TaggedValue::encode(Tag::List, s - v0_size as u16);
    vm.mem_mut()
        .write_cell(Segment::Stack, new_header_addr, new_header.to_bits())
        .map_err(|e| from_core_error(e, RuntimeError::StackOverflow { context: "tail" }))?;
    vm.sp = new_header_addr + 4;
    Ok(())
}

/// Materialize a list's full payload (index-order cells, header untouched)
/// without popping it off the stack.
fn peek_list_cells(vm: &Vm, header_addr: usize) -> Result<Vec<u32>, RuntimeError> {
    let s = require_list(vm, header_addr)? as usize;
    if s == 0 {
        return Ok(Vec::new());
    }
    list::capture(vm.mem(), header_addr - 4, s)
}

fn pop_list_cells(vm: &mut Vm) -> Result<Vec<u32>, RuntimeError> {
    let header_addr = vm.sp.checked_sub(4).ok_or(RuntimeError::StackUnderflow {
        context: "list operand",
    })?;
    let cells = peek_list_cells(vm, header_addr)?;
    vm.sp = header_addr - 4 * cells.len();
    Ok(cells)
}

fn push_built_list(vm: &mut Vm, cells_index_order: &[u32]) -> Result<(), RuntimeError> {
    for &bits in cells_index_order.iter().rev() {
        vm.push(TaggedValue::from_bits(bits))?;
    }
    let header = TaggedValue::try_encode(Tag::List, cells_index_order.len() as i64)
        .map_err(|e| from_core_error(e, RuntimeError::ValueRangeError {
            context: "list exceeds the maximum slot count",
        }))?;
    vm.push(header)
}

/// `( list value -- list' )`: add `value` as the new element 0 (the slot
/// nearest the header), same placement `cons` gives it.
fn append(vm: &mut Vm) -> Result<(), RuntimeError> {
    let v_addr = vm.sp.checked_sub(4).ok_or(RuntimeError::StackUnderflow {
        context: "append",
    })?;
    let v_size = list::element_size_at(vm.mem(), v_addr)?;
    let value_cells = list::capture(vm.mem(), v_addr, v_size)?;
    vm.sp -= 4 * v_size;
    let list_cells = pop_list_cells(vm)?;
    let mut combined = value_cells;
    combined.extend(list_cells);
    push_built_list(vm, &combined)
}

fn concat(vm: &mut Vm) -> Result<(), RuntimeError> {
    let b_cells = pop_list_cells(vm)?;
    let a_cells = pop_list_cells(vm)?;
    let mut combined = b_cells;
    combined.extend(a_cells);
    push_built_list(vm, &combined)
}

fn reverse(vm: &mut Vm) -> Result<(), RuntimeError> {
    let cells = pop_list_cells(vm)?;
    let reversed: Vec<u32> = cells.into_iter().rev().collect();
    push_built_list(vm, &reversed)
}

fn length(vm: &mut Vm) -> Result<(), RuntimeError> {
    let header_addr = vm.sp.checked_sub(4).ok_or(RuntimeError::StackUnderflow {
        context: "length",
    })?;
    let count = list::element_count(vm.mem(), header_addr)?;
    let n = TaggedValue::from_integer(count as i32)
        .map_err(|e| from_core_error(e, RuntimeError::ValueRangeError {
            context: "element count exceeds representable range",
        }))?;
    vm.push(n)
}

fn slots(vm: &mut Vm) -> Result<(), RuntimeError> {
    let header_addr = vm.sp.checked_sub(4).ok_or(RuntimeError::StackUnderflow {
        context: "slots",
    })?;
    let s = list::header_payload(vm.mem(), header_addr)?;
    let n = TaggedValue::encode(Tag::Integer, s);
    vm.push(n)
}

// =============================================================================
// List access: slot / elem / fetch / store, get / set
// =============================================================================

fn addr_to_cell_index(addr: usize) -> Result<TaggedValue, RuntimeError> {
    TaggedValue::try_encode(Tag::Integer, (addr / 4) as i64)
        .map_err(|e| from_core_error(e, RuntimeError::ValueRangeError {
            context: "stack address exceeds the representable index range",
        }))
}

fn slot_of(vm: &mut Vm) -> Result<(), RuntimeError> {
    let k = vm.pop_index("slot expects an index")? as usize;
    let header_addr = vm.sp.checked_sub(4).ok_or(RuntimeError::StackUnderflow {
        context: "slot",
    })?;
    let addr = list::slot_addr(header_addr, k)?;
    let cell = addr_to_cell_index(addr)?;
    vm.push(cell)
}

fn elem_of(vm: &mut Vm) -> Result<(), RuntimeError> {
    let raw = vm.pop_index("elem expects an index")?;
    let header_addr = vm.sp.checked_sub(4).ok_or(RuntimeError::StackUnderflow {
        context: "elem",
    })?;
    let count = list::element_count(vm.mem(), header_addr)?;
    let idx = list::normalize_index(raw, count).ok_or(RuntimeError::ValueRangeError {
        context: "elem index out of range",
    })?;
    let (addr, _size) = list::element_at(vm.mem(), header_addr, idx)?;
    let cell = addr_to_cell_index(addr)?;
    vm.push(cell)
}

fn fetch(vm: &mut Vm) -> Result<(), RuntimeError> {
    let idx = vm.pop_index("fetch expects a stack address")?;
    let byte_addr = (idx as usize) * 4;
    let bits = vm
        .mem()
        .read_cell(Segment::Stack, byte_addr)
        .map_err(|e| from_core_error(e, RuntimeError::ValueRangeError {
            context: "fetch address out of range",
        }))?;
    vm.push(TaggedValue::from_bits(bits))
}

fn store(vm: &mut Vm) -> Result<(), RuntimeError> {
    let idx = vm.pop_index("store expects a stack address")?;
    let value = vm.pop()?;
    let byte_addr = (idx as usize) * 4;
    vm.mem_mut()
        .write_cell(Segment::Stack, byte_addr, value.to_bits())
        .map_err(|e| from_core_error(e, RuntimeError::ValueRangeError {
            context: "store address out of range",
        }))
}

// =============================================================================
// Sort / search
// =============================================================================

fn sort(vm: &mut Vm) -> Result<(), RuntimeError> {
    let cells = pop_list_cells(vm)?;
    let mut values: Vec<TaggedValue> = cells.into_iter().map(TaggedValue::from_bits).collect();
    values.sort_by(|a, b| {
        let fa = number_of(*a, "sort element").unwrap_or(f32::NAN);
        let fb = number_of(*b, "sort element").unwrap_or(f32::NAN);
        fa.partial_cmp(&fb).unwrap_or(std::cmp::Ordering::Equal)
    });
    let bits: Vec<u32> = values.into_iter().map(|v| v.to_bits()).collect();
    push_built_list(vm, &bits)
}

fn mapsort(vm: &mut Vm) -> Result<(), RuntimeError> {
    let cells = pop_list_cells(vm)?;
    let mut pairs: Vec<(u32, u32)> = cells
        .chunks(2)
        .map(|pair| (pair[0], pair.get(1).copied().unwrap_or(NIL.to_bits())))
        .collect();
    pairs.sort_by(|a, b| {
        let fa = number_of(TaggedValue::from_bits(a.0), "mapsort key").unwrap_or(f32::NAN);
        let fb = number_of(TaggedValue::from_bits(b.0), "mapsort key").unwrap_or(f32::NAN);
        fa.partial_cmp(&fb).unwrap_or(std::cmp::Ordering::Equal)
    });
    let flat: Vec<u32> = pairs.into_iter().flat_map(|(k, v)| [k, v]).collect();
    push_built_list(vm, &flat)
}

fn cells_equal(a: TaggedValue, b: TaggedValue) -> bool {
    if a.is_number() && b.is_number() {
        a.as_float() == b.as_float()
    } else {
        a.to_bits() == b.to_bits()
    }
}

/// `haystack key find`: linear scan over the list beneath `key`. A STRING
/// key treats the list as a map-list (spec §4.7): keys sit at odd
/// header-adjacent indices (the slot written right after its value), so a
/// match at index `i` yields the address of the value at `i - 1`, with a
/// key literally named `default` used as a fallback on a miss. Any other
/// key does a plain element-equals-target scan. Either way the result is a
/// cell-index address, like `elem`/`slot` produce, not an element ordinal
/// — so the caller can chain straight into `fetch`.
fn find(vm: &mut Vm) -> Result<(), RuntimeError> {
    let key = vm.pop()?;
    let header_addr = vm.sp.checked_sub(4).ok_or(RuntimeError::StackUnderflow {
        context: "find",
    })?;
    let count = list::element_count(vm.mem(), header_addr)?;

    if key.tag() == Tag::String {
        return find_map_list(vm, header_addr, count, key);
    }

    for i in 0..count {
        let (addr, size) = list::element_at(vm.mem(), header_addr, i)?;
        if size != 1 {
            continue;
        }
        let cell = vm
            .mem()
            .read_cell(Segment::Stack, addr)
            .map(TaggedValue::from_bits)
            .map_err(|e| from_core_error(e, RuntimeError::MalformedList {
                context: "find traversal fell outside the stack segment",
            }))?;
        if cells_equal(cell, key) {
            return vm.push(addr_to_cell_index(addr)?);
        }
    }
    vm.push(NIL)
}

fn find_map_list(
    vm: &mut Vm,
    header_addr: usize,
    count: usize,
    key: TaggedValue,
) -> Result<(), RuntimeError> {
    let mut default_value_addr = None;
    let mut i = 1usize;
    while i < count {
        let (kaddr, ksize) = list::element_at(vm.mem(), header_addr, i)?;
        if ksize == 1 {
            let kcell = vm
                .mem()
                .read_cell(Segment::Stack, kaddr)
                .map(TaggedValue::from_bits)
                .map_err(|e| from_core_error(e, RuntimeError::MalformedList {
                    context: "find traversal fell outside the stack segment",
                }))?;
            if cells_equal(kcell, key) {
                let (vaddr, _) = list::element_at(vm.mem(), header_addr, i - 1)?;
                return vm.push(addr_to_cell_index(vaddr)?);
            }
            if default_value_addr.is_none() && kcell.tag() == Tag::String {
                let text = vm.digest.lookup(vm.mem(), kcell.payload())?;
                if text == "default" {
                    let (vaddr, _) = list::element_at(vm.mem(), header_addr, i - 1)?;
                    default_value_addr = Some(vaddr);
                }
            }
        }
        i += 2;
    }
    match default_value_addr {
        Some(vaddr) => vm.push(addr_to_cell_index(vaddr)?),
        None => vm.push(NIL),
    }
}

fn bfind(vm: &mut Vm) -> Result<(), RuntimeError> {
    let key = vm.pop()?;
    let header_addr = vm.sp.checked_sub(4).ok_or(RuntimeError::StackUnderflow {
        context: "bfind",
    })?;
    let count = list::element_count(vm.mem(), header_addr)?;
    let key_f = number_of(key, "bfind key")?;
    let (mut lo, mut hi) = (0usize, count);
    while lo < hi {
        let mid = lo + (hi - lo) / 2;
        let (addr, size) = list::element_at(vm.mem(), header_addr, mid)?;
        if size != 1 {
            return Err(RuntimeError::TypeError {
                context: "bfind requires a flat list of numbers",
                got: "compound element".into(),
            });
        }
        let cell = vm
            .mem()
            .read_cell(Segment::Stack, addr)
            .map(TaggedValue::from_bits)
            .map_err(|e| from_core_error(e, RuntimeError::MalformedList {
                context: "bfind traversal fell outside the stack segment",
            }))?;
        let v = number_of(cell, "bfind element")?;
        if v == key_f {
            let n = TaggedValue::from_integer(mid as i32)
                .map_err(|e| from_core_error(e, RuntimeError::ValueRangeError {
                    context: "index exceeds representable range",
                }))?;
            return vm.push(n);
        } else if v < key_f {
            lo = mid + 1;
        } else {
            hi = mid;
        }
    }
    vm.push(NIL)
}

fn hindex(vm: &mut Vm) -> Result<(), RuntimeError> {
    let key = vm.pop()?;
    let header_addr = vm.sp.checked_sub(4).ok_or(RuntimeError::StackUnderflow {
        context: "hindex",
    })?;
    let count = list::element_count(vm.mem(), header_addr)?;
    let mut i = 0usize;
    while i < count {
        let (addr, size) = list::element_at(vm.mem(), header_addr, i)?;
        if size == 1 {
            let cell = vm
                .mem()
                .read_cell(Segment::Stack, addr)
                .map(TaggedValue::from_bits)
                .map_err(|e| from_core_error(e, RuntimeError::MalformedList {
                    context: "hindex traversal fell outside the stack segment",
                }))?;
            if cells_equal(cell, key) {
                let n = TaggedValue::from_integer(i as i32)
                    .map_err(|e| from_core_error(e, RuntimeError::ValueRangeError {
                        context: "index exceeds representable range",
                    }))?;
                return vm.push(n);
            }
        }
        i += 2;
    }
    vm.push(NIL)
}

fn hfind(vm: &mut Vm) -> Result<(), RuntimeError> {
    let key = vm.pop()?;
    let header_addr = vm.sp.checked_sub(4).ok_or(RuntimeError::StackUnderflow {
        context: "hfind",
    })?;
    let count = list::element_count(vm.mem(), header_addr)?;
    let mut i = 0usize;
    while i < count {
        let (addr, size) = list::element_at(vm.mem(), header_addr, i)?;
        if size == 1 {
            let cell = vm
                .mem()
                .read_cell(Segment::Stack, addr)
                .map(TaggedValue::from_bits)
                .map_err(|e| from_core_error(e, RuntimeError::MalformedList {
                    context: "hfind traversal fell outside the stack segment",
                }))?;
            if cells_equal(cell, key) && i + 1 < count {
                let (vaddr, _) = list::element_at(vm.mem(), header_addr, i + 1)?;
                let bits = vm
                    .mem()
                    .read_cell(Segment::Stack, vaddr)
                    .map_err(|e| from_core_error(e, RuntimeError::MalformedList {
                        context: "hfind traversal fell outside the stack segment",
                    }))?;
                return vm.push(TaggedValue::from_bits(bits));
            }
        }
        i += 2;
    }
    vm.push(NIL)
}

// =============================================================================
// I/O
// =============================================================================

fn cell_text(vm: &Vm, v: TaggedValue) -> Result<String, RuntimeError> {
    if v.tag() == Tag::String {
        vm.digest.lookup(vm.mem(), v.payload())
    } else {
        Ok(display_cell(v))
    }
}

fn print(vm: &mut Vm) -> Result<(), RuntimeError> {
    let v = vm.pop()?;
    let text = cell_text(vm, v)?;
    println!("{text}");
    Ok(())
}

/// `raw-print`: pop the value on top of the stack and dump it without a
/// trailing newline, recursing into list structure instead of rendering a
/// compound value as the opaque `LIST:n` tag `print`/`dot` show (spec
/// §4.6). Elements print in source-reading order (left to right), which
/// under the header-adjacent layout means walking from the *highest*
/// element index down to 0.
fn raw_print(vm: &mut Vm) -> Result<(), RuntimeError> {
    let addr = vm.sp.checked_sub(4).ok_or(RuntimeError::StackUnderflow {
        context: "raw-print",
    })?;
    let size = list::element_size_at(vm.mem(), addr)?;
    let mut out = String::new();
    dump_cell(vm, addr, &mut out)?;
    vm.sp -= 4 * size;
    print!("{out}");
    Ok(())
}

fn dump_cell(vm: &Vm, addr: usize, out: &mut String) -> Result<(), RuntimeError> {
    let cell = vm
        .mem()
        .read_cell(Segment::Stack, addr)
        .map(TaggedValue::from_bits)
        .map_err(|e| from_core_error(e, RuntimeError::MalformedList {
            context: "raw-print traversal fell outside the stack segment",
        }))?;
    if cell.tag() != Tag::List {
        out.push_str(&cell_text(vm, cell)?);
        return Ok(());
    }
    let count = list::element_count(vm.mem(), addr)?;
    out.push('(');
    for pos in (0..count).rev() {
        if pos != count - 1 {
            out.push(' ');
        }
        let (eaddr, _) = list::element_at(vm.mem(), addr, pos)?;
        dump_cell(vm, eaddr, out)?;
    }
    out.push(')');
    Ok(())
}

fn dot(vm: &mut Vm) -> Result<(), RuntimeError> {
    let v = vm.pop()?;
    print!("{} ", display_cell(v));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::VmConfig;

    fn int(n: i32) -> TaggedValue {
        TaggedValue::from_integer(n).unwrap()
    }

    #[test]
    fn dup_duplicates_a_compound_list() {
        let mut vm = Vm::new(VmConfig::default());
        vm.push(int(1)).unwrap();
        vm.push(int(2)).unwrap();
        vm.push(TaggedValue::encode(Tag::List, 2)).unwrap();
        dup(&mut vm).unwrap();
        assert_eq!(vm.depth(), 6); // two 3-cell lists
        let top_count = list::element_count(vm.mem(), vm.sp - 4).unwrap();
        assert_eq!(top_count, 2);
    }

    #[test]
    fn swap_exchanges_mixed_size_values() {
        let mut vm = Vm::new(VmConfig::default());
        vm.push(int(1)).unwrap();
        vm.push(int(2)).unwrap();
        vm.push(int(3)).unwrap();
        vm.push(TaggedValue::encode(Tag::List, 2)).unwrap(); // list(2,3)
        swap(&mut vm).unwrap();
        let top = vm.pop().unwrap();
        assert_eq!(top.as_integer(), 1);
    }

    #[test]
    fn cons_prepends_and_enlist_wraps() {
        let mut vm = Vm::new(VmConfig::default());
        vm.push(int(10)).unwrap();
        enlist(&mut vm).unwrap();
        vm.push(int(20)).unwrap();
        cons(&mut vm).unwrap();
        let header_addr = vm.sp - 4;
        assert_eq!(list::header_payload(vm.mem(), header_addr).unwrap(), 2);
        assert_eq!(list::element_count(vm.mem(), header_addr).unwrap(), 2);
    }

    #[test]
    fn pack_then_unpack_roundtrips_count() {
        let mut vm = Vm::new(VmConfig::default());
        vm.push(int(1)).unwrap();
        vm.push(int(2)).unwrap();
        vm.push(int(3)).unwrap();
        vm.push(int(3)).unwrap(); // count operand
        pack(&mut vm).unwrap();
        unpack(&mut vm).unwrap();
        let count = vm.pop().unwrap();
        assert_eq!(count.as_integer(), 3);
    }

    #[test]
    fn find_locates_element_by_value() {
        let mut vm = Vm::new(VmConfig::default());
        vm.push(int(10)).unwrap();
        vm.push(int(20)).unwrap();
        vm.push(int(30)).unwrap();
        vm.push(int(3)).unwrap();
        pack(&mut vm).unwrap();
        vm.push(int(20)).unwrap();
        find(&mut vm).unwrap();
        let idx = vm.pop().unwrap();
        assert!(idx.tag() == Tag::Integer);
    }

    #[test]
    fn find_then_fetch_round_trips_the_matched_value() {
        // ( 10 20 30 ) 30 find fetch -> 30: the address `find` returns
        // must chain straight into `fetch`, not just be a bare ordinal.
        let mut vm = Vm::new(VmConfig::default());
        vm.push(int(10)).unwrap();
        vm.push(int(20)).unwrap();
        vm.push(int(30)).unwrap();
        vm.push(int(3)).unwrap();
        pack(&mut vm).unwrap();
        vm.push(int(30)).unwrap();
        find(&mut vm).unwrap();
        fetch(&mut vm).unwrap();
        assert_eq!(vm.pop().unwrap().as_integer(), 30);
    }

    fn symbol(vm: &mut Vm, name: &str) -> TaggedValue {
        let id = vm.digest.intern(vm.mem_mut(), name).unwrap();
        TaggedValue::encode(Tag::String, id)
    }

    #[test]
    fn find_looks_up_a_map_list_key() {
        // ( `a 1 `b 2 `c 3 ) `b find fetch -> 2.
        let mut vm = Vm::new(VmConfig::default());
        let a = symbol(&mut vm, "a");
        let b = symbol(&mut vm, "b");
        let c = symbol(&mut vm, "c");
        vm.push(a).unwrap();
        vm.push(int(1)).unwrap();
        vm.push(b).unwrap();
        vm.push(int(2)).unwrap();
        vm.push(c).unwrap();
        vm.push(int(3)).unwrap();
        vm.push(int(6)).unwrap();
        pack(&mut vm).unwrap();

        let key = symbol(&mut vm, "b");
        vm.push(key).unwrap();
        find(&mut vm).unwrap();
        fetch(&mut vm).unwrap();
        assert_eq!(vm.pop().unwrap().as_integer(), 2);
    }

    #[test]
    fn find_falls_back_to_a_default_key_on_a_miss() {
        // ( `a 1 `default 99 ) `z find fetch -> 99.
        let mut vm = Vm::new(VmConfig::default());
        let a = symbol(&mut vm, "a");
        let default_key = symbol(&mut vm, "default");
        vm.push(a).unwrap();
        vm.push(int(1)).unwrap();
        vm.push(default_key).unwrap();
        vm.push(int(99)).unwrap();
        vm.push(int(4)).unwrap();
        pack(&mut vm).unwrap();

        let missing = symbol(&mut vm, "z");
        vm.push(missing).unwrap();
        find(&mut vm).unwrap();
        fetch(&mut vm).unwrap();
        assert_eq!(vm.pop().unwrap().as_integer(), 99);
    }

    #[test]
    fn abort_halts_and_reports_message() {
        let mut vm = Vm::new(VmConfig::default());
        let id = vm.digest.intern(vm.mem_mut(), "boom").unwrap();
        vm.push(TaggedValue::encode(Tag::String, id)).unwrap();
        let err = abort(&mut vm).unwrap_err();
        assert!(matches!(err, RuntimeError::Abort { .. }));
        assert!(!vm.running);
    }

    #[test]
    fn raw_print_dumps_nested_list_structure() {
        // ( 1 ( 2 3 ) 4 ) raw-print -> "(1 (2 3) 4)": dump_cell walks
        // header-adjacent indices from highest to lowest, which reproduces
        // the original left-to-right source order, and recurses into the
        // sublist instead of rendering it as LIST:n.
        let mut vm = Vm::new(VmConfig::default());
        vm.push(int(1)).unwrap();
        vm.push(int(2)).unwrap();
        vm.push(int(3)).unwrap();
        vm.push(TaggedValue::encode(Tag::List, 2)).unwrap();
        vm.push(int(4)).unwrap();
        vm.push(TaggedValue::encode(Tag::List, 5)).unwrap();
        let addr = vm.sp - 4;
        let mut out = String::new();
        dump_cell(&vm, addr, &mut out).unwrap();
        assert_eq!(out, "(1 (2 3) 4)");
    }

    #[test]
    fn raw_print_pops_the_whole_structure() {
        let mut vm = Vm::new(VmConfig::default());
        vm.push(int(1)).unwrap();
        vm.push(int(2)).unwrap();
        vm.push(TaggedValue::encode(Tag::List, 2)).unwrap();
        raw_print(&mut vm).unwrap();
        assert_eq!(vm.depth(), 0);
    }
}
