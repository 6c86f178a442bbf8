//! End-to-end structural tests (spec §8): each of [`crate::demos`]'s
//! fixtures compiled through the whole pipeline and checked against the
//! properties the scenario is meant to demonstrate, since this repository
//! never runs the resulting image on a VM.

use matches::assert_matches;

use crate::ast::{Expr, ExprKind, Statement, StatementKind};
use crate::compiler::CompiledObject;
use crate::error::Error;
use crate::hardware::{HardwareGroup, ManipOpcode};
use crate::span::SourceSpan;
use crate::types::Type;
use crate::{demos, driver::Driver, packager};

fn compile(top_level: Vec<crate::ast::Statement>, reg_count: u8) -> packager::PackagedProgram {
    let mut compiler = Driver::new().compile(top_level).expect("compilation should succeed");
    packager::package(&mut compiler, reg_count).expect("packaging should succeed")
}

#[test]
fn byte_store_packages_with_a_main_symbol() {
    let packaged = compile(demos::byte_store(), 10);
    assert!(packaged.symbols.contains_key("main"));
    assert!(!packaged.code.is_empty());
}

#[test]
fn array_index_packages_with_a_main_symbol() {
    let packaged = compile(demos::array_index(), 10);
    assert!(packaged.symbols.contains_key("main"));
}

#[test]
fn recursive_fibonacci_resolves_both_functions() {
    let packaged = compile(demos::recursive_fibonacci(), 10);
    assert!(packaged.symbols.contains_key("fibonacci"));
    assert!(packaged.symbols.contains_key("main"));
}

#[test]
fn deep_expression_forces_spilling_with_few_registers() {
    let top_level = demos::deep_expression_spills();
    let mut compiler = Driver::new().compile(top_level).expect("compilation should succeed");

    let main_scope = compiler
        .compiled_objects
        .iter()
        .find_map(|obj| match obj {
            CompiledObject::Function(f) if f.name == "main" => Some(f.scope.clone()),
            _ => None,
        })
        .expect("main should be compiled");

    packager::package(&mut compiler, 2).expect("packaging should succeed even under register pressure");

    assert!(main_scope.borrow().spill_vars > 0, "a 50-deep expression with 2 registers must spill");
}

#[test]
fn deep_expression_does_not_spill_with_ample_registers() {
    let top_level = demos::deep_expression_spills();
    let mut compiler = Driver::new().compile(top_level).expect("compilation should succeed");

    let main_scope = compiler
        .compiled_objects
        .iter()
        .find_map(|obj| match obj {
            CompiledObject::Function(f) if f.name == "main" => Some(f.scope.clone()),
            _ => None,
        })
        .expect("main should be compiled");

    packager::package(&mut compiler, 200).expect("packaging should succeed");

    assert_eq!(main_scope.borrow().spill_vars, 0);
}

#[test]
fn fifty_parameters_resolve_to_a_single_sum_function() {
    let packaged = compile(demos::fifty_parameter_sum(), 10);
    assert!(packaged.symbols.contains_key("sum50"));
    assert!(packaged.symbols.contains_key("main"));
}

#[test]
fn varargs_function_packages_cleanly() {
    let packaged = compile(demos::varargs_third_argument(), 10);
    assert!(packaged.symbols.contains_key("third_arg"));
}

#[test]
fn nested_array_literal_packages_cleanly() {
    let packaged = compile(demos::nested_array_literal(), 10);
    assert!(packaged.symbols.contains_key("main"));
    assert!(!packaged.data.is_empty(), "the nested array literal reserves data-region storage");
}

#[test]
fn asm_block_produces_a_halt_instruction_in_main() {
    let packaged = compile(demos::asm_block(), 10);
    let halt = packaged
        .code
        .iter()
        .find(|instr| instr.group == HardwareGroup::Manip && instr.opcode == ManipOpcode::Halt as u8);
    assert!(halt.is_some(), "the asm block's Halt mnemonic should lower to a Manip/Halt hardware instruction");
}

#[test]
fn every_named_demo_compiles() {
    for &name in demos::NAMES {
        let top_level = demos::by_name(name).expect("NAMES entries must resolve via by_name");
        compile(top_level, 10);
    }
}

#[test]
fn a_call_to_an_undeclared_function_is_an_unresolved_reference() {
    let span = SourceSpan::synthetic();
    let call = Statement::new(
        StatementKind::Expr(Expr::new(
            ExprKind::Call {
                target: Box::new(Expr::new(ExprKind::Identifier("totally_undeclared".to_string()), span)),
                args: vec![],
            },
            span,
        )),
        span,
    );
    let main = Statement::new(
        StatementKind::FunctionDecl {
            name: "main".to_string(),
            params: vec![],
            returns: Type::Void,
            varargs: false,
            body: vec![call],
        },
        span,
    );

    let result = Driver::new().compile(vec![main]);
    assert_matches!(result, Err(Error::Unresolved(_)));
}
