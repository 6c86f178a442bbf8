//! Two-stage desugaring (spec §4.4): expands high-level IR into the
//! primitive moves, arithmetic, and stack operations the encoder lowers
//! directly.
//!
//! Grounded on the donor's `backend/rustvm/desugar.py`: `DesugarIR_Pre`
//! expands `LoadVar`/`SaveVar`/`Call` before allocation (it needs a scratch
//! register, so it must run while virtual registers are still cheap to
//! mint); `DesugarIR_Post` expands `Prelude`/`Epilog` after allocation, once
//! `Scope::used_hw_regs` is known.

use crate::error::{Error, InternalCompilerError};
use crate::hardware::SpecialRegister;
use crate::ir::{immediate, BinaryOp, Instr, Op};
use crate::register::{Dereference, Register};
use crate::span::SourceSpan;
use crate::variable::{Storage, Variable};

fn next_free_register_id(code: &[Instr]) -> u32 {
    code.iter()
        .flat_map(|instr| instr.op.touched_registers())
        .filter(|r| !r.is_hardware_pinned())
        .map(|r| r.id)
        .max()
        .map_or(0, |m| m + 1)
}

/// Compute a variable's address into `temp` (pointer-width, unsigned):
/// the base pointer plus/minus its stack offset, or its data-table
/// reference, per spec §4.4.
fn emit_address(out: &mut Vec<Instr>, variable: &Variable, temp: Register, span: SourceSpan) {
    match &variable.storage {
        Storage::Stack(offset) => {
            out.push(Instr::new(
                Op::Mov {
                    to: temp.clone().into(),
                    from: Register::hardware(SpecialRegister::Base.index(), 2, false).into(),
                },
                span,
            ));
            let op = if *offset < 0 { BinaryOp::Sub } else { BinaryOp::Add };
            out.push(Instr::new(
                Op::Binary {
                    left: temp.clone().into(),
                    right: immediate(i64::from(offset.unsigned_abs()), 2).into(),
                    op,
                    to: temp.into(),
                },
                span,
            ));
        }
        Storage::Global(reference) => {
            out.push(Instr::new(
                Op::Mov {
                    to: temp.into(),
                    from: reference.clone().into(),
                },
                span,
            ));
        }
    }
}

/// Expand `LoadVar`/`SaveVar`/`Call`, in place, before register allocation
/// runs (spec §4.4, "Pre-allocation").
pub fn desugar_pre(code: Vec<Instr>) -> Result<Vec<Instr>, Error> {
    let mut next_id = next_free_register_id(&code);
    let mut out = Vec::with_capacity(code.len());

    for instr in code {
        let span = instr.span;
        match instr.op {
            Op::LoadVar { variable, to, lvalue } => {
                if variable.lvalue_is_rvalue && lvalue {
                    return Err(InternalCompilerError::new(format!(
                        "{}: variable `{}` has its rvalue marked as its lvalue, \
                         but an lvalue load was requested",
                        span, variable.name
                    ))
                    .into());
                }

                let temp = Register::new(next_id, 2, false);
                next_id += 1;
                emit_address(&mut out, &variable, temp.clone(), span);

                if variable.lvalue_is_rvalue || lvalue {
                    out.push(Instr::new(Op::Mov { to, from: temp.into() }, span));
                } else {
                    let size = to.size();
                    out.push(Instr::new(
                        Op::Mov {
                            to,
                            from: Dereference::new(temp.into(), size).into(),
                        },
                        span,
                    ));
                }
            }
            Op::SaveVar { variable, from } => {
                let temp = Register::new(next_id, 2, false);
                next_id += 1;
                emit_address(&mut out, &variable, temp.clone(), span);

                let size = from.size();
                out.push(Instr::new(
                    Op::Mov {
                        to: Dereference::new(temp.into(), size).into(),
                        from,
                    },
                    span,
                ));
            }
            Op::Call { args, target, result } => {
                for arg in &args {
                    out.push(Instr::new(Op::Push { arg: arg.clone() }, span));
                }
                out.push(Instr::new(Op::Call { args, target, result }, span));
            }
            other => out.push(Instr::new(other, span)),
        }
    }

    Ok(out)
}

/// Expand `Prelude`/`Epilog`, in place, after register allocation has
/// filled in each scope's `used_hw_regs` (spec §4.4, "Post-allocation").
pub fn desugar_post(code: Vec<Instr>) -> Vec<Instr> {
    let mut out = Vec::with_capacity(code.len());

    for instr in code {
        let span = instr.span;
        match instr.op {
            Op::Prelude { scope } => {
                let scope = scope.borrow();
                out.push(Instr::new(
                    Op::Binary {
                        left: Register::hardware(SpecialRegister::Stack.index(), 8, false).into(),
                        right: immediate(i64::from(scope.size), 8).into(),
                        op: BinaryOp::Add,
                        to: Register::hardware(SpecialRegister::Stack.index(), 8, false).into(),
                    },
                    span,
                ));
                for &phys in &scope.used_hw_regs {
                    out.push(Instr::new(
                        Op::Push {
                            arg: Register::hardware(phys, 8, false).into(),
                        },
                        span,
                    ));
                }
            }
            Op::Epilog { scope } => {
                let scope = scope.borrow();
                for &phys in scope.used_hw_regs.iter().rev() {
                    out.push(Instr::new(
                        Op::Pop {
                            arg: Register::hardware(phys, 8, false).into(),
                        },
                        span,
                    ));
                }
                out.push(Instr::new(
                    Op::Binary {
                        left: Register::hardware(SpecialRegister::Stack.index(), 8, false).into(),
                        right: immediate(i64::from(scope.size), 8).into(),
                        op: BinaryOp::Sub,
                        to: Register::hardware(SpecialRegister::Stack.index(), 8, false).into(),
                    },
                    span,
                ));
            }
            other => out.push(Instr::new(other, span)),
        }
    }

    out
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::ir::RegisterCounter;
    use crate::register::DataReference;
    use crate::scope::Scope;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn instr(op: Op) -> Instr {
        Instr::new(op, SourceSpan::synthetic())
    }

    #[test]
    fn loadvar_from_a_negative_stack_offset_subtracts_from_the_base_pointer() {
        let mut counter = RegisterCounter::default();
        let dest = counter.fresh(4, true);
        let var = Rc::new(Variable::new_stack("x", crate::types::Type::int(4, true), -8));

        let code = vec![instr(Op::LoadVar {
            variable: var,
            to: dest.into(),
            lvalue: false,
        })];

        let out = desugar_pre(code).unwrap();
        // Mov(temp, base), Binary.sub(temp, 8), Mov(dest, Deref(temp))
        assert_eq!(out.len(), 3);
        match &out[1].op {
            Op::Binary { op, right, .. } => {
                assert_eq!(*op, BinaryOp::Sub);
                match right {
                    crate::register::Param::Immediate(imm) => assert_eq!(imm.value, 8),
                    _ => unreachable!(),
                }
            }
            _ => unreachable!(),
        }
        match &out[2].op {
            Op::Mov { from, .. } => assert!(matches!(from, crate::register::Param::Dereference(_))),
            _ => unreachable!(),
        }
    }

    #[test]
    fn loadvar_of_an_lvalue_is_rvalue_variable_never_dereferences() {
        let mut counter = RegisterCounter::default();
        let dest = counter.fresh(2, false);
        let var = Rc::new(
            Variable::new_global(
                "arr",
                crate::types::Type::array(crate::types::Type::int(1, false), Some(4)),
                DataReference::new("arr"),
            )
            .as_lvalue_is_rvalue(),
        );

        let code = vec![instr(Op::LoadVar {
            variable: var,
            to: dest.into(),
            lvalue: false,
        })];

        let out = desugar_pre(code).unwrap();
        // Mov(temp, &arr), Mov(dest, temp) -- no dereference.
        assert_eq!(out.len(), 2);
        match &out[1].op {
            Op::Mov { from, .. } => assert!(matches!(from, crate::register::Param::Register(_))),
            _ => unreachable!(),
        }
    }

    #[test]
    fn requesting_an_lvalue_of_an_rvalue_variable_is_an_internal_error() {
        let mut counter = RegisterCounter::default();
        let dest = counter.fresh(2, false);
        let var = Rc::new(
            Variable::new_stack("arr", crate::types::Type::array(crate::types::Type::int(1, false), Some(4)), 0)
                .as_lvalue_is_rvalue(),
        );

        let code = vec![instr(Op::LoadVar {
            variable: var,
            to: dest.into(),
            lvalue: true,
        })];

        assert!(desugar_pre(code).is_err());
    }

    #[test]
    fn call_pushes_args_left_to_right_before_the_bare_call() {
        let mut counter = RegisterCounter::default();
        let a = counter.fresh(4, true);
        let b = counter.fresh(4, true);
        let target = counter.fresh(2, false);

        let code = vec![instr(Op::Call {
            args: vec![a.into(), b.into()],
            target: target.into(),
            result: None,
        })];

        let out = desugar_pre(code).unwrap();
        assert_eq!(out.len(), 3);
        assert!(matches!(out[0].op, Op::Push { .. }));
        assert!(matches!(out[1].op, Op::Push { .. }));
        assert!(matches!(out[2].op, Op::Call { .. }));
    }

    #[test]
    fn prelude_grows_the_stack_then_saves_used_registers() {
        let scope = Rc::new(RefCell::new(Scope::new()));
        scope.borrow_mut().size = 16;
        scope.borrow_mut().used_hw_regs = vec![4, 5];

        let code = vec![instr(Op::Prelude { scope })];
        let out = desugar_post(code);

        assert_eq!(out.len(), 3);
        match &out[0].op {
            Op::Binary { op, .. } => assert_eq!(*op, BinaryOp::Add),
            _ => unreachable!(),
        }
        match &out[1].op {
            Op::Push { arg } => assert_eq!(arg.filter_reg().unwrap().physical, Some(4)),
            _ => unreachable!(),
        }
        match &out[2].op {
            Op::Push { arg } => assert_eq!(arg.filter_reg().unwrap().physical, Some(5)),
            _ => unreachable!(),
        }
    }

    #[test]
    fn epilog_restores_registers_in_reverse_then_shrinks_the_stack() {
        let scope = Rc::new(RefCell::new(Scope::new()));
        scope.borrow_mut().size = 16;
        scope.borrow_mut().used_hw_regs = vec![4, 5];

        let code = vec![instr(Op::Epilog { scope })];
        let out = desugar_post(code);

        assert_eq!(out.len(), 3);
        match &out[0].op {
            Op::Pop { arg } => assert_eq!(arg.filter_reg().unwrap().physical, Some(5)),
            _ => unreachable!(),
        }
        match &out[1].op {
            Op::Pop { arg } => assert_eq!(arg.filter_reg().unwrap().physical, Some(4)),
            _ => unreachable!(),
        }
        match &out[2].op {
            Op::Binary { op, .. } => assert_eq!(*op, BinaryOp::Sub),
            _ => unreachable!(),
        }
    }
}
