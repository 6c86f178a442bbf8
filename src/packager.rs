//! The packager (spec §4.6): runs the back-end pipeline over every compiled
//! object, lays out the final image, and resolves every symbolic reference
//! to an absolute byte offset.
//!
//! Grounded on the donor's `backend/rustvm/assemble.py::process_code`: per
//! object, `DesugarIR_Pre` → register allocation → (functions only)
//! `insert_register_stores` → `DesugarIR_Post` → encode. Top-level objects
//! share one reserved spill-slot block sized to their worst case
//! (`allocate_code`) and get wrapped in a stack-size adjustment the donor
//! builds directly rather than through `Prelude`/`Epilog`
//! (`process_toplevel`), since there's no enclosing function scope for them
//! to share. Final placement (`package_objects`) differs from the donor in
//! one respect: because every hardware instruction's byte length is known
//! up front, this lays out every offset in a single pass and only then
//! resolves symbolic operands, rather than iterating to a fixed point.

use std::collections::HashMap;

use crate::compiler::{CompiledFunction, CompiledObject, Compiler, DataEntry};
use crate::desugar::{desugar_pre, desugar_post};
use crate::encoder::{encode_all, expand_immediates};
use crate::error::{Error, InternalCompilerError};
use crate::hardware::{BinaryOpcode, HardwareGroup, HardwareInstruction, HwArg, ManipOpcode, MemOpcode, SpecialRegister};
use crate::ir::Instr;
use crate::regalloc::{allocate, collect_used_hw_regs};
use crate::scope::Scope;

/// A fully resolved image, ready for byte serialization: `startup` and
/// `code` instructions carry only [`HwArg::Register`], [`HwArg::Immediate`],
/// or [`HwArg::MemoryLocation`] operands; `data` is the program-data
/// region's raw bytes.
pub struct PackagedProgram {
    pub startup: HardwareInstruction,
    pub data: Vec<u8>,
    pub code: Vec<HardwareInstruction>,
    pub symbols: HashMap<String, u32>,
}

fn stack_register() -> HwArg {
    HwArg::register(SpecialRegister::Stack.index())
}

/// Add `base` to every still-local [`HwArg::JumpTarget`] in `instrs`,
/// turning it into an absolute [`HwArg::MemoryLocation`] (spec §4.6:
/// "the packager adds this object's placement offset ... on top").
fn place_jump_targets(instrs: &mut [HardwareInstruction], base: u32) {
    for instr in instrs.iter_mut() {
        for arg in instr.args.iter_mut() {
            if let HwArg::JumpTarget(local) = arg {
                *arg = HwArg::MemoryLocation(base + *local as u32);
            }
        }
    }
}

/// Resolve a [`HwArg::DataReference`] (possibly nested inside one
/// [`HwArg::Dereference`]) against the finished symbol table, recording its
/// name in `missing` if it isn't there.
fn resolve_data_reference(arg: &mut HwArg, symbols: &HashMap<String, u32>, missing: &mut Vec<String>) {
    match arg {
        HwArg::DataReference(name) => match symbols.get(name) {
            Some(&offset) => *arg = HwArg::MemoryLocation(offset),
            None => missing.push(name.clone()),
        },
        HwArg::Dereference(inner) => resolve_data_reference(inner, symbols, missing),
        _ => {}
    }
}

/// Run every compiled object through allocation, desugaring, and encoding,
/// then lay out and fully resolve the final image (spec §4.6).
pub fn package(compiler: &mut Compiler, reg_count: u8) -> Result<PackagedProgram, Error> {
    let objects = std::mem::take(&mut compiler.compiled_objects);

    let mut functions: Vec<CompiledFunction> = Vec::new();
    let mut toplevel_codes: Vec<Vec<Instr>> = Vec::new();
    for obj in objects {
        match obj {
            CompiledObject::Function(f) => functions.push(f),
            CompiledObject::TopLevel(code) => toplevel_codes.push(code),
        }
    }

    for f in functions.iter_mut() {
        let code = std::mem::take(&mut f.scope.borrow_mut().code);
        f.scope.borrow_mut().code = desugar_pre(code)?;
    }
    for code in toplevel_codes.iter_mut() {
        let taken = std::mem::take(code);
        *code = desugar_pre(taken)?;
    }

    // Top-level objects are allocated independently but share one spill
    // reservation sized to the worst of them, on a synthetic scope standing
    // in for "the top level" (spec §4.6; donor's `allocate_code`).
    let mut toplevel_max_spill = 0u32;
    for code in toplevel_codes.iter_mut() {
        toplevel_max_spill = toplevel_max_spill.max(allocate(reg_count, code)?);
    }
    let mut toplevel_scope = Scope::new();
    toplevel_scope.reserve_spill_vars(toplevel_max_spill, true);

    for f in functions.iter_mut() {
        let mut code = std::mem::take(&mut f.scope.borrow_mut().code);
        let spill_count = allocate(reg_count, &mut code)?;
        f.scope.borrow_mut().reserve_spill_vars(spill_count, false);
        f.scope.borrow_mut().used_hw_regs = collect_used_hw_regs(&code);
        f.scope.borrow_mut().code = code;
    }

    for f in functions.iter_mut() {
        let code = std::mem::take(&mut f.scope.borrow_mut().code);
        f.scope.borrow_mut().code = desugar_post(code);
    }
    for code in toplevel_codes.iter_mut() {
        let taken = std::mem::take(code);
        *code = desugar_post(taken);
    }

    let mut toplevel_hw: Vec<Vec<HardwareInstruction>> = Vec::new();
    for code in &toplevel_codes {
        let mut hw = encode_all(code, &toplevel_scope, true)?;
        expand_immediates(compiler, &mut hw)?;
        toplevel_hw.push(hw);
    }

    let mut function_hw: Vec<(String, Vec<HardwareInstruction>)> = Vec::new();
    for f in &functions {
        let scope = f.scope.borrow();
        let mut hw = encode_all(&scope.code, &scope, false)?;
        drop(scope);
        expand_immediates(compiler, &mut hw)?;
        function_hw.push((f.name.clone(), hw));
    }

    let mut wrap = vec![
        HardwareInstruction::new(
            HardwareGroup::Binary,
            BinaryOpcode::Add as u8,
            8,
            vec![stack_register(), HwArg::Immediate(i64::from(toplevel_scope.size)), stack_register()],
        ),
        HardwareInstruction::new(
            HardwareGroup::Binary,
            BinaryOpcode::Sub as u8,
            8,
            vec![stack_register(), HwArg::Immediate(i64::from(toplevel_scope.size)), stack_register()],
        ),
    ];
    expand_immediates(compiler, &mut wrap)?;
    let wrap_sub = wrap.pop().unwrap();
    let wrap_add = wrap.pop().unwrap();

    // Layout: startup jump, program-data region, toplevel-code region,
    // function regions (spec §4.6, "Image layout").
    let mut symbols: HashMap<String, u32> = HashMap::new();
    let mut size: u32 = 0;

    let mut startup = HardwareInstruction::new(
        HardwareGroup::Manip,
        ManipOpcode::Jmp as u8,
        2,
        vec![HwArg::Immediate(1), HwArg::DataReference("toplevel".to_string())],
    );
    size += startup.byte_len() as u32;

    let mut data_bytes: Vec<u8> = Vec::new();
    let mut index_to_name: Vec<Option<String>> = vec![None; compiler.data.len()];
    for (name, &idx) in compiler.data_index.iter() {
        index_to_name[idx] = Some(name.clone());
    }
    for (idx, entry) in compiler.data.iter().enumerate() {
        if let Some(name) = &index_to_name[idx] {
            symbols.insert(name.clone(), size);
        }
        match entry {
            DataEntry::Bytes(bytes) => data_bytes.extend_from_slice(bytes),
            DataEntry::VarArray(vars) => data_bytes.extend(std::iter::repeat(0u8).take(vars.len() * 2)),
        }
        size += entry.len() as u32;
    }

    symbols.insert("toplevel".to_string(), size);

    let mut code: Vec<HardwareInstruction> = Vec::new();

    let stks_index = code.len();
    let stks = HardwareInstruction::new(HardwareGroup::Mem, MemOpcode::Stks as u8, 2, vec![HwArg::Immediate(0)]);
    size += stks.byte_len() as u32;
    code.push(stks);

    size += wrap_add.byte_len() as u32;
    code.push(wrap_add);

    for mut hw in toplevel_hw {
        place_jump_targets(&mut hw, size);
        size += hw.iter().map(HardwareInstruction::byte_len).sum::<usize>() as u32;
        code.extend(hw);
    }

    size += wrap_sub.byte_len() as u32;
    code.push(wrap_sub);

    let call_main = HardwareInstruction::new(HardwareGroup::Mem, MemOpcode::Call as u8, 2, vec![HwArg::DataReference("main".to_string())]);
    size += call_main.byte_len() as u32;
    code.push(call_main);

    let halt = HardwareInstruction::new(HardwareGroup::Manip, ManipOpcode::Halt as u8, 1, vec![]);
    size += halt.byte_len() as u32;
    code.push(halt);

    for (name, mut hw) in function_hw {
        symbols.insert(name, size);
        place_jump_targets(&mut hw, size);
        size += hw.iter().map(HardwareInstruction::byte_len).sum::<usize>() as u32;
        code.extend(hw);
    }

    let total_size = size;
    code[stks_index].args[0] = HwArg::Immediate(i64::from(total_size) + 2);

    let mut missing: Vec<String> = Vec::new();
    for arg in startup.args.iter_mut() {
        resolve_data_reference(arg, &symbols, &mut missing);
    }
    for instr in code.iter_mut() {
        for arg in instr.args.iter_mut() {
            resolve_data_reference(arg, &symbols, &mut missing);
        }
    }

    let mut offset_in_data = 0usize;
    for entry in &compiler.data {
        match entry {
            DataEntry::Bytes(bytes) => offset_in_data += bytes.len(),
            DataEntry::VarArray(vars) => {
                for var in vars {
                    match var.global_offset() {
                        Some(reference) => match symbols.get(&reference.name) {
                            Some(&offset) => {
                                data_bytes[offset_in_data..offset_in_data + 2].copy_from_slice(&(offset as u16).to_le_bytes());
                            }
                            None => missing.push(reference.name.clone()),
                        },
                        None => {
                            return Err(InternalCompilerError::new(format!(
                                "data array entry `{}` has no global storage to reference",
                                var.name
                            ))
                            .into())
                        }
                    }
                    offset_in_data += 2;
                }
            }
        }
    }

    if !missing.is_empty() {
        missing.sort();
        missing.dedup();
        return Err(InternalCompilerError::new(format!(
            "unresolved reference(s) after packaging: {}",
            missing.join(", ")
        ))
        .into());
    }

    Ok(PackagedProgram {
        startup,
        data: data_bytes,
        code,
        symbols,
    })
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::ir::{immediate, BinaryOp, Op, RegisterCounter};
    use crate::register::Register;
    use crate::span::SourceSpan;
    use crate::types::Type;

    fn span() -> SourceSpan {
        SourceSpan::synthetic()
    }

    /// `main() {}`: the minimal complete program -- compiles down to a
    /// startup jump, an empty data region, and a toplevel region that calls
    /// straight into `main`'s empty, register-save-free body.
    #[test]
    fn an_empty_main_packages_to_a_startup_jump_and_a_bare_call() {
        let mut compiler = Compiler::new();
        let fn_ty = Type::function(Type::Void, vec![], false);
        compiler.declare_function_symbol("main", fn_ty).unwrap();

        let decl = crate::scope::FunctionDecl::new("main", vec![], Type::Void, false);
        let scope = std::rc::Rc::new(std::cell::RefCell::new(decl.scope));
        scope.borrow_mut().code = vec![
            Instr::new(Op::Prelude { scope: scope.clone() }, span()),
            Instr::new(Op::Epilog { scope: scope.clone() }, span()),
            Instr::new(Op::Return { scope: scope.clone(), arg: None }, span()),
        ];
        compiler.compiled_objects.push(CompiledObject::Function(CompiledFunction {
            name: "main".to_string(),
            params: vec![],
            returns: Type::Void,
            varargs: false,
            scope,
        }));

        let packaged = package(&mut compiler, 10).unwrap();
        assert!(matches!(packaged.startup.args[1], HwArg::MemoryLocation(_)));
        assert!(packaged.data.is_empty());
        assert!(packaged.symbols.contains_key("main"));
        assert!(packaged.symbols.contains_key("toplevel"));

        for instr in std::iter::once(&packaged.startup).chain(packaged.code.iter()) {
            for arg in &instr.args {
                assert!(
                    !matches!(arg, HwArg::DataReference(_) | HwArg::JumpTarget(_)),
                    "every symbolic operand must be resolved by packaging"
                );
            }
        }
    }

    /// A global variable read at top level: its data-table slot must land
    /// in the program-data region, before the toplevel-code region starts.
    #[test]
    fn a_global_variables_offset_resolves_before_the_toplevel_region() {
        let mut compiler = Compiler::new();
        let fn_ty = Type::function(Type::Void, vec![], false);
        compiler.declare_function_symbol("main", fn_ty).unwrap();
        let var = compiler.declare_global("counter", Type::int(4, true)).unwrap();

        let decl = crate::scope::FunctionDecl::new("main", vec![], Type::Void, false);
        let scope = std::rc::Rc::new(std::cell::RefCell::new(decl.scope));
        let mut counter = RegisterCounter::default();
        let dest = counter.fresh(4, true);
        scope.borrow_mut().code = vec![
            Instr::new(Op::Prelude { scope: scope.clone() }, span()),
            Instr::new(
                Op::LoadVar {
                    variable: var.clone(),
                    to: dest.into(),
                    lvalue: false,
                },
                span(),
            ),
            Instr::new(Op::Epilog { scope: scope.clone() }, span()),
            Instr::new(Op::Return { scope: scope.clone(), arg: None }, span()),
        ];
        compiler.compiled_objects.push(CompiledObject::Function(CompiledFunction {
            name: "main".to_string(),
            params: vec![],
            returns: Type::Void,
            varargs: false,
            scope,
        }));

        let packaged = package(&mut compiler, 10).unwrap();
        let counter_offset = packaged.symbols["counter"];
        let toplevel_offset = packaged.symbols["toplevel"];
        assert!(counter_offset < toplevel_offset);
        assert_eq!(packaged.data.len(), 4);
    }

    /// A toplevel `if` produces a conditional jump whose target sits past
    /// the wrapping stack adjustment the packager inserts -- its resolved
    /// `MemoryLocation` must fall within the toplevel region.
    #[test]
    fn a_toplevel_jump_resolves_within_the_toplevel_region() {
        let mut compiler = Compiler::new();
        let fn_ty = Type::function(Type::Void, vec![], false);
        compiler.declare_function_symbol("main", fn_ty).unwrap();

        let mut counter = RegisterCounter::default();
        let mut cond = counter.fresh(2, false);
        cond.physical = Some(0);
        let toplevel_code = vec![
            Instr::new(
                Op::Jump {
                    target: 1,
                    condition: Some(cond.into()),
                },
                span(),
            ),
            Instr::new(Op::JumpTarget, span()),
        ];
        compiler.compiled_objects.push(CompiledObject::TopLevel(toplevel_code));

        let decl = crate::scope::FunctionDecl::new("main", vec![], Type::Void, false);
        let scope = std::rc::Rc::new(std::cell::RefCell::new(decl.scope));
        scope.borrow_mut().code = vec![
            Instr::new(Op::Prelude { scope: scope.clone() }, span()),
            Instr::new(Op::Epilog { scope: scope.clone() }, span()),
            Instr::new(Op::Return { scope: scope.clone(), arg: None }, span()),
        ];
        compiler.compiled_objects.push(CompiledObject::Function(CompiledFunction {
            name: "main".to_string(),
            params: vec![],
            returns: Type::Void,
            varargs: false,
            scope,
        }));

        let packaged = package(&mut compiler, 10).unwrap();
        let toplevel_offset = packaged.symbols["toplevel"];
        let main_offset = packaged.symbols["main"];

        let jump = packaged.code.iter().find(|i| i.group == HardwareGroup::Manip && i.opcode == ManipOpcode::Jmp as u8).unwrap();
        match jump.args[1] {
            HwArg::MemoryLocation(target) => {
                assert!(target >= toplevel_offset && target < main_offset);
            }
            _ => panic!("jump target was not resolved to a memory location"),
        }
    }

    /// Two overlapping live ranges with one physical register force a
    /// spill; the spill/reload expansion must resolve its slot against the
    /// shared top-level scope without erroring.
    #[test]
    fn a_toplevel_spill_resolves_against_the_shared_toplevel_scope() {
        let mut compiler = Compiler::new();
        let fn_ty = Type::function(Type::Void, vec![], false);
        compiler.declare_function_symbol("main", fn_ty).unwrap();

        let mut counter = RegisterCounter::default();
        let a = counter.fresh(4, false);
        let b = counter.fresh(4, false);
        let c = counter.fresh(4, false);
        let define = |r: Register| {
            Instr::new(
                Op::Binary {
                    left: immediate(1, 4).into(),
                    right: immediate(1, 4).into(),
                    op: BinaryOp::Add,
                    to: r.into(),
                },
                span(),
            )
        };
        let touch = |r: Register| {
            Instr::new(
                Op::Unary {
                    arg: r.clone().into(),
                    op: crate::ir::UnaryOp::BitInv,
                    to: r.into(),
                },
                span(),
            )
        };
        let toplevel_code = vec![define(a.clone()), define(b.clone()), define(c.clone()), touch(a), touch(b), touch(c)];
        compiler.compiled_objects.push(CompiledObject::TopLevel(toplevel_code));

        let decl = crate::scope::FunctionDecl::new("main", vec![], Type::Void, false);
        let scope = std::rc::Rc::new(std::cell::RefCell::new(decl.scope));
        scope.borrow_mut().code = vec![
            Instr::new(Op::Prelude { scope: scope.clone() }, span()),
            Instr::new(Op::Epilog { scope: scope.clone() }, span()),
            Instr::new(Op::Return { scope: scope.clone(), arg: None }, span()),
        ];
        compiler.compiled_objects.push(CompiledObject::Function(CompiledFunction {
            name: "main".to_string(),
            params: vec![],
            returns: Type::Void,
            varargs: false,
            scope,
        }));

        let packaged = package(&mut compiler, 2).unwrap();
        assert!(packaged.symbols.contains_key("main"));
    }

    /// Calling a function that is never declared in this program must be
    /// reported, not silently packaged with a dangling reference.
    #[test]
    fn calling_an_undeclared_function_is_a_fatal_unresolved_reference() {
        let mut compiler = Compiler::new();
        let fn_ty = Type::function(Type::Void, vec![], false);
        compiler.declare_function_symbol("main", fn_ty).unwrap();

        let decl = crate::scope::FunctionDecl::new("main", vec![], Type::Void, false);
        let scope = std::rc::Rc::new(std::cell::RefCell::new(decl.scope));
        let mut counter = RegisterCounter::default();
        let target = counter.fresh(2, false);
        scope.borrow_mut().code = vec![
            Instr::new(Op::Prelude { scope: scope.clone() }, span()),
            Instr::new(
                Op::LoadVar {
                    variable: std::rc::Rc::new(crate::variable::Variable::new_global(
                        "never_declared",
                        Type::function(Type::Void, vec![], false),
                        crate::register::DataReference::new("never_declared"),
                    ).as_lvalue_is_rvalue()),
                    to: target.into(),
                    lvalue: false,
                },
                span(),
            ),
            Instr::new(Op::Epilog { scope: scope.clone() }, span()),
            Instr::new(Op::Return { scope: scope.clone(), arg: None }, span()),
        ];
        compiler.compiled_objects.push(CompiledObject::Function(CompiledFunction {
            name: "main".to_string(),
            params: vec![],
            returns: Type::Void,
            varargs: false,
            scope,
        }));

        assert!(package(&mut compiler, 10).is_err());
    }
}
