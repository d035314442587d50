//! End-to-end source-to-stack scenarios, driving a session the way a file
//! or REPL line would: through `svm_compiler::eval` against a fresh `Vm`.

use svm_compiler::{eval, EvalError};
use svm_core::value::Tag;
use svm_runtime::{Vm, VmConfig};

fn new_vm() -> Vm {
    Vm::new(VmConfig::default())
}

#[test]
fn arithmetic_and_stack_shuffling() {
    let mut vm = new_vm();
    eval(&mut vm, "10 20 + 3 - 2 *").unwrap();
    assert_eq!(vm.pop().unwrap().as_float(), 54.0);
}

#[test]
fn list_construction_and_length() {
    let mut vm = new_vm();
    eval(&mut vm, "( 1 2 3 4 5 ) length").unwrap();
    assert_eq!(vm.pop().unwrap().as_float(), 5.0);
}

#[test]
fn nested_lists_round_trip_through_head_tail() {
    // Element 0 of a list is the cell nearest its header, i.e. the
    // rightmost-written one — so `head` of `( a b )` is `b`, not `a`.
    let mut vm = new_vm();
    eval(&mut vm, "( ( 1 2 ) ( 3 4 ) ) head head").unwrap();
    assert_eq!(vm.pop().unwrap().as_float(), 4.0);
}

#[test]
fn colon_definitions_persist_across_evaluations() {
    let mut vm = new_vm();
    eval(&mut vm, ": cube dup dup * * ;").unwrap();
    eval(&mut vm, "3 cube").unwrap();
    assert_eq!(vm.pop().unwrap().as_float(), 27.0);
    // a second, independent call proves the definition is reusable, not
    // a one-shot inlining.
    eval(&mut vm, "4 cube").unwrap();
    assert_eq!(vm.pop().unwrap().as_float(), 64.0);
}

#[test]
fn recursive_word_counts_down_to_zero() {
    // A quotation gets its own locals frame (no closure over the
    // enclosing definition's), so the recursion carries `n` on the data
    // stack rather than through a local slot.
    let mut vm = new_vm();
    eval(
        &mut vm,
        ": count-down dup 0 = { } { 1 - count-down } if-else ;",
    )
    .unwrap();
    eval(&mut vm, "5 count-down").unwrap();
    assert_eq!(vm.pop().unwrap().as_float(), 0.0);
}

#[test]
fn quotation_built_and_evaluated_later() {
    let mut vm = new_vm();
    eval(&mut vm, "7 { 2 * } eval").unwrap();
    assert_eq!(vm.pop().unwrap().as_float(), 14.0);
}

#[test]
fn locals_header_and_dynamic_local_compose() {
    let mut vm = new_vm();
    eval(
        &mut vm,
        ": midpoint {: lo hi :} lo hi + -> sum sum 2 / ;",
    )
    .unwrap();
    eval(&mut vm, "10 20 midpoint").unwrap();
    assert_eq!(vm.pop().unwrap().as_float(), 15.0);
}

#[test]
fn sort_then_bfind_locates_an_element() {
    let mut vm = new_vm();
    eval(&mut vm, "( 5 3 1 4 2 ) sort").unwrap();
    let sorted = vm.pop().unwrap();
    assert_eq!(sorted.tag(), Tag::List);
    // push it back and binary-search for the middle value.
    vm.push(sorted).unwrap();
    eval(&mut vm, "3 bfind").unwrap();
    let idx = vm.pop().unwrap();
    assert_ne!(idx, svm_core::value::NIL, "3 should be found in the sorted list");
}

#[test]
fn get_and_set_through_a_path() {
    // Outer element 0 is `4` (nearest the header); element 1 is the
    // sublist `( 2 3 )`, whose own element 0 is `3`. The path is a
    // quotation, not a list literal: `get` evaluates it and reads back
    // whatever segments it pushes.
    let mut vm = new_vm();
    eval(&mut vm, "( 1 ( 2 3 ) 4 ) { 1 0 } get").unwrap();
    assert_eq!(vm.pop().unwrap().as_float(), 3.0);
}

#[test]
fn get_through_a_symbol_path_into_a_map_list() {
    // ( `a 1 `b 2 `c 3 ) { `b } get -> 2.
    let mut vm = new_vm();
    eval(&mut vm, "( `a 1 `b 2 `c 3 ) { `b } get").unwrap();
    assert_eq!(vm.pop().unwrap().as_float(), 2.0);
}

#[test]
fn set_through_a_path_writes_in_place() {
    // `set` leaves `target` itself on the stack so the mutation is
    // observable afterward, pushing only the `ok` flag on top of it.
    let mut vm = new_vm();
    eval(&mut vm, "( 1 2 3 ) 99 { 0 } set").unwrap();
    let ok = vm.pop().unwrap();
    assert_ne!(ok, svm_core::value::NIL);
    eval(&mut vm, "{ 0 } get").unwrap();
    assert_eq!(vm.pop().unwrap().as_float(), 99.0);
}

#[test]
fn stack_underflow_surfaces_as_a_runtime_error_with_a_snapshot() {
    let mut vm = new_vm();
    eval(&mut vm, "1 2 3").unwrap();
    let err = eval(&mut vm, "+ + + +").unwrap_err();
    match err {
        EvalError::Runtime(e) => {
            assert!(format!("{e}").contains("StackUnderflow"));
        }
        other => panic!("expected a runtime error, got {other:?}"),
    }
}

#[test]
fn undefined_word_is_a_compile_error_not_a_runtime_one() {
    let mut vm = new_vm();
    let err = eval(&mut vm, "1 2 frobnicate").unwrap_err();
    assert!(matches!(err, EvalError::Compile(_)));
}

#[test]
fn a_failed_definition_does_not_poison_later_evaluations() {
    let mut vm = new_vm();
    assert!(eval(&mut vm, ": oops nonexistent-word ;").is_err());
    // the VM is still usable: an unrelated, well-formed chunk runs fine.
    eval(&mut vm, "1 1 +").unwrap();
    assert_eq!(vm.pop().unwrap().as_float(), 2.0);
}
