//! Expression lowering: `ty`/`compile`/`load_lvalue` over [`Expr`] (spec
//! §4.2). Each may abort the enclosing attempt via [`LowerSignal::Blocked`]
//! when a name isn't resolvable yet.

use crate::ast::{BinOp, CastKind, Expr, ExprKind, UnOp};
use crate::driver::{LowerResult, LowerSignal};
use crate::error::{Error, TypeError};
use crate::ir::{immediate, BinaryOp, CmpOp, Op, UnaryOp};
use crate::register::{Param, Register};
use crate::span::SourceSpan;
use crate::types::Type;

use super::LowerCtx;

fn type_error(span: SourceSpan, error: TypeError) -> LowerSignal {
    LowerSignal::Error(Error::Type { span, error })
}

/// The static type of an integer literal with no explicit suffix: the
/// smallest signed/unsigned width that holds it (spec §4.2, IntegerLiteral).
fn infer_int_type(value: i64) -> Type {
    let signed = value < 0;
    let bits = if signed {
        64 - (-(value + 1)).leading_zeros()
    } else {
        64 - value.leading_zeros()
    };
    let size = if bits < 8 {
        1
    } else if bits < 16 {
        2
    } else if bits < 32 {
        4
    } else {
        8
    };
    Type::int(size, signed)
}

pub fn ty(ctx: &LowerCtx, expr: &Expr) -> LowerResult<Type> {
    match &expr.kind {
        ExprKind::Identifier(name) => Ok(ctx.lookup(name)?.ty.clone()),
        ExprKind::IntegerLiteral(v) => Ok(infer_int_type(*v)),
        ExprKind::ArrayLiteral(elems) => {
            let elem_ty = if let Some(first) = elems.first() {
                ty(ctx, first)?
            } else {
                Type::int(1, false)
            };
            Ok(Type::array(elem_ty, Some(elems.len() as u32)).with_const(true))
        }
        ExprKind::Unary { operand, .. } => ty(ctx, operand),
        ExprKind::Preincrement { operand, .. } | ExprKind::Postincrement { operand, .. } => {
            ty(ctx, operand)
        }
        ExprKind::Dereference(inner) => {
            let t = ty(ctx, inner)?;
            if t.is_pointer() || t.is_array() {
                Ok(t.pointee().clone())
            } else {
                Err(type_error(
                    expr.span,
                    TypeError::Mismatch {
                        expected: "pointer or array".to_string(),
                        found: t.to_string(),
                        context: "dereference",
                    },
                ))
            }
        }
        ExprKind::AddressOf(inner) => Ok(Type::pointer(ty(ctx, inner)?)),
        ExprKind::Index { base, .. } => {
            let t = ty(ctx, base)?;
            if t.is_pointer() || t.is_array() {
                Ok(t.pointee().clone())
            } else {
                Err(type_error(
                    expr.span,
                    TypeError::Mismatch {
                        expected: "pointer or array".to_string(),
                        found: t.to_string(),
                        context: "index",
                    },
                ))
            }
        }
        ExprKind::Cast { to, .. } => Ok(to.clone()),
        ExprKind::Call { target, .. } => {
            let t = ty(ctx, target)?;
            match t {
                Type::Function { returns, .. } => Ok(*returns),
                other => Err(type_error(
                    expr.span,
                    TypeError::NotCallable {
                        found: other.to_string(),
                    },
                )),
            }
        }
        ExprKind::Binary { op, left, right } => binary_result_type(ctx, expr.span, *op, left, right),
        ExprKind::And(..) | ExprKind::Or(..) => Ok(Type::int(1, false)),
        ExprKind::Assignment { target, .. } => ty(ctx, target),
    }
}

fn binary_result_type(
    ctx: &LowerCtx,
    span: SourceSpan,
    op: BinOp,
    left: &Expr,
    right: &Expr,
) -> LowerResult<Type> {
    let lt = ty(ctx, left)?;
    let rt = ty(ctx, right)?;
    let width = lt.size().max(rt.size()).max(1) as u8;
    let mismatch = || {
        type_error(
            span,
            TypeError::Mismatch {
                expected: format!("operands compatible with `{:?}`", op),
                found: format!("{} and {}", lt, rt),
                context: "binary operator",
            },
        )
    };
    match op {
        BinOp::Add | BinOp::Sub => {
            let l_ptr = lt.is_pointer() || lt.is_array();
            let r_ptr = rt.is_pointer() || rt.is_array();
            match (l_ptr, r_ptr) {
                (true, true) if op == BinOp::Sub => Ok(Type::int(2, false)),
                (true, false) if rt.is_int() => Ok(lt),
                (false, true) if r_ptr && lt.is_int() && op == BinOp::Add => Ok(rt),
                (false, false) if lt.is_int() && rt.is_int() => Ok(Type::int(width, false)),
                _ => Err(mismatch()),
            }
        }
        BinOp::Mul | BinOp::Mod => {
            if lt.is_int() && rt.is_int() {
                Ok(Type::int(width, false))
            } else {
                Err(mismatch())
            }
        }
        BinOp::Div => {
            if lt.is_int() && rt.is_int() {
                Ok(Type::int(width, lt.is_signed() && rt.is_signed()))
            } else {
                Err(mismatch())
            }
        }
        BinOp::Shl => {
            if lt.is_int() && rt.is_int() {
                Ok(Type::int(width, false))
            } else {
                Err(mismatch())
            }
        }
        BinOp::Shr => {
            if lt.is_int() && rt.is_int() {
                Ok(Type::int(width, lt.is_signed()))
            } else {
                Err(mismatch())
            }
        }
        BinOp::BitAnd | BinOp::BitOr | BinOp::BitXor => {
            if lt.is_int() && rt.is_int() {
                Ok(Type::int(width, false))
            } else {
                Err(mismatch())
            }
        }
        BinOp::Lt | BinOp::Leq | BinOp::Gt | BinOp::Geq | BinOp::Eq | BinOp::Neq => {
            let both_int = lt.is_int() && rt.is_int();
            let both_ptr = (lt.is_pointer() || lt.is_array()) && (rt.is_pointer() || rt.is_array());
            if both_int || both_ptr {
                Ok(Type::int(1, false))
            } else {
                Err(mismatch())
            }
        }
    }
}

pub(super) fn resize_to(ctx: &mut LowerCtx, reg: Register, size: u8, signed: bool, span: SourceSpan) -> Register {
    if reg.size == size && reg.signed == signed {
        return reg;
    }
    let fresh = ctx.fresh_register(size, signed);
    ctx.emit(
        Op::Resize {
            from: reg.into(),
            to: fresh.clone().into(),
        },
        span,
    );
    fresh
}

/// Compile both operands of a binary op and resize them up to a common
/// width, each keeping its own signedness (spec §4.2).
fn compile_meta(ctx: &mut LowerCtx, left: &Expr, right: &Expr) -> LowerResult<(Register, Register)> {
    let mut lhs = compile(ctx, left)?;
    let mut rhs = compile(ctx, right)?;
    let width = lhs.size.max(rhs.size);
    lhs = resize_to(ctx, lhs, width, lhs.signed, left.span);
    rhs = resize_to(ctx, rhs, width, rhs.signed, right.span);
    Ok((lhs, rhs))
}

pub fn compile(ctx: &mut LowerCtx, expr: &Expr) -> LowerResult<Register> {
    match &expr.kind {
        ExprKind::Identifier(name) => {
            let var = ctx.lookup(name)?;
            let reg = ctx.fresh_register(var.ty.size().max(1) as u8, var.ty.is_signed());
            ctx.emit(
                Op::LoadVar {
                    variable: var,
                    to: reg.clone().into(),
                    lvalue: false,
                },
                expr.span,
            );
            Ok(reg)
        }
        ExprKind::IntegerLiteral(v) => {
            let t = infer_int_type(*v);
            let reg = ctx.fresh_register(t.size() as u8, t.is_signed());
            ctx.emit(
                Op::Mov {
                    to: reg.clone().into(),
                    from: immediate(*v, t.size() as u8).into(),
                },
                expr.span,
            );
            Ok(reg)
        }
        ExprKind::ArrayLiteral(_) => Err(LowerSignal::Error(Error::Type {
            span: expr.span,
            error: TypeError::NoLvalue {
                expr: "array literal outside of a declaration".to_string(),
            },
        })),
        ExprKind::Unary { op, operand } => {
            let reg = compile(ctx, operand)?;
            let operand_ty = ty(ctx, operand)?;
            if !operand_ty.is_signed() {
                match op {
                    UnOp::Pos => return Ok(reg),
                    UnOp::Neg => {
                        return Err(type_error(expr.span, TypeError::NegateUnsigned));
                    }
                    _ => {}
                }
            }
            let ir_op = match op {
                UnOp::BitInv => UnaryOp::BitInv,
                UnOp::LogicInv => UnaryOp::LogicInv,
                UnOp::Neg => UnaryOp::Neg,
                UnOp::Pos => UnaryOp::Pos,
            };
            ctx.emit(
                Op::Unary {
                    arg: reg.clone().into(),
                    op: ir_op,
                    to: reg.clone().into(),
                },
                expr.span,
            );
            Ok(reg)
        }
        ExprKind::Preincrement { op, operand } => {
            let operand_ty = ty(ctx, operand)?;
            let ptr = load_lvalue(ctx, operand)?;
            let step = step_value(&operand_ty);
            let tmp = ctx.fresh_register(operand_ty.size().max(1) as u8, operand_ty.is_signed());
            ctx.emit(
                Op::Mov {
                    to: tmp.clone().into(),
                    from: crate::register::Dereference::new(ptr.clone().into(), tmp.size).into(),
                },
                expr.span,
            );
            let ir_op = bin_to_ir(*op);
            ctx.emit(
                Op::Binary {
                    left: tmp.clone().into(),
                    right: immediate(step, tmp.size).into(),
                    op: ir_op,
                    to: tmp.clone().into(),
                },
                expr.span,
            );
            ctx.emit(
                Op::Mov {
                    to: crate::register::Dereference::new(ptr.into(), tmp.size).into(),
                    from: tmp.clone().into(),
                },
                expr.span,
            );
            Ok(tmp)
        }
        ExprKind::Postincrement { op, operand } => {
            let operand_ty = ty(ctx, operand)?;
            let ptr = load_lvalue(ctx, operand)?;
            let step = step_value(&operand_ty);
            let size = operand_ty.size().max(1) as u8;
            let res = ctx.fresh_register(size, operand_ty.is_signed());
            let tmp = ctx.fresh_register(size, operand_ty.is_signed());
            ctx.emit(
                Op::Mov {
                    to: res.clone().into(),
                    from: crate::register::Dereference::new(ptr.clone().into(), size).into(),
                },
                expr.span,
            );
            let ir_op = bin_to_ir(*op);
            ctx.emit(
                Op::Binary {
                    left: res.clone().into(),
                    right: immediate(step, size).into(),
                    op: ir_op,
                    to: tmp.clone().into(),
                },
                expr.span,
            );
            ctx.emit(
                Op::Mov {
                    to: crate::register::Dereference::new(ptr.into(), size).into(),
                    from: tmp.into(),
                },
                expr.span,
            );
            Ok(res)
        }
        ExprKind::Dereference(inner) => {
            let ptr = load_lvalue(ctx, expr)?;
            let t = ty(ctx, inner)?.pointee().clone();
            let size = t.size().max(1) as u8;
            let reg = ctx.fresh_register(size, t.is_signed());
            ctx.emit(
                Op::Mov {
                    to: reg.clone().into(),
                    from: crate::register::Dereference::new(ptr.into(), size).into(),
                },
                expr.span,
            );
            Ok(reg)
        }
        ExprKind::AddressOf(inner) => {
            if let ExprKind::Identifier(name) = &inner.kind {
                let var = ctx.lookup(name)?;
                if var.lvalue_is_rvalue {
                    return Err(type_error(
                        expr.span,
                        TypeError::TakeAddressOfRvalue { name: name.clone() },
                    ));
                }
            }
            load_lvalue(ctx, inner)
        }
        ExprKind::Index { .. } => {
            let ptr = load_lvalue(ctx, expr)?;
            let t = ty(ctx, expr)?;
            if t.is_array() {
                return Ok(ptr);
            }
            let size = t.size().max(1) as u8;
            let reg = ctx.fresh_register(size, t.is_signed());
            ctx.emit(
                Op::Mov {
                    to: reg.clone().into(),
                    from: crate::register::Dereference::new(ptr.into(), size).into(),
                },
                expr.span,
            );
            Ok(reg)
        }
        ExprKind::Cast { kind, to, operand } => {
            let reg = compile(ctx, operand)?;
            let result = ctx.fresh_register(to.size().max(1) as u8, to.is_signed());
            match kind {
                CastKind::Resize => {
                    ctx.emit(
                        Op::Resize {
                            from: reg.into(),
                            to: result.clone().into(),
                        },
                        expr.span,
                    );
                }
                CastKind::Reinterpret => {
                    ctx.emit(
                        Op::Mov {
                            to: result.clone().into(),
                            from: reg.into(),
                        },
                        expr.span,
                    );
                }
            }
            Ok(result)
        }
        ExprKind::Call { target, args } => {
            let fn_ty = ty(ctx, target)?;
            let (params, returns, varargs) = match fn_ty {
                Type::Function { args, returns, varargs, .. } => (args, *returns, varargs),
                other => {
                    return Err(type_error(
                        expr.span,
                        TypeError::NotCallable {
                            found: other.to_string(),
                        },
                    ))
                }
            };
            if (!varargs && args.len() != params.len()) || (varargs && args.len() < params.len()) {
                return Err(type_error(
                    expr.span,
                    TypeError::WrongArgCount {
                        expected: params.len(),
                        found: args.len(),
                        varargs,
                    },
                ));
            }
            let mut arg_regs = Vec::with_capacity(args.len());
            for (i, arg) in args.iter().enumerate() {
                let mut reg = compile(ctx, arg)?;
                if let Some(declared) = params.get(i) {
                    reg = resize_to(ctx, reg, declared.size().max(1) as u8, declared.is_signed(), arg.span);
                }
                arg_regs.push(Param::Register(reg));
            }
            let target_reg = compile(ctx, target)?;
            let result = if matches!(returns, Type::Void) {
                None
            } else {
                Some(Param::Register(
                    ctx.fresh_register(returns.size().max(1) as u8, returns.is_signed()),
                ))
            };
            ctx.emit(
                Op::Call {
                    args: arg_regs,
                    target: target_reg.into(),
                    result: result.clone(),
                },
                expr.span,
            );
            match result {
                Some(Param::Register(r)) => Ok(r),
                _ => Ok(ctx.fresh_register(1, false)),
            }
        }
        ExprKind::Binary { op, left, right } => compile_binary(ctx, expr.span, *op, left, right),
        ExprKind::And(left, right) | ExprKind::Or(left, right) => {
            let is_and = matches!(expr.kind, ExprKind::And(..));
            let lhs = compile(ctx, left)?;
            ctx.emit(
                Op::Compare {
                    left: lhs.clone().into(),
                    right: immediate(0, lhs.size).into(),
                },
                expr.span,
            );
            let cond = ctx.fresh_register(1, false);
            let cmp = if is_and { CmpOp::Eq } else { CmpOp::Neq };
            ctx.emit(
                Op::SetCmp {
                    dest: cond.clone().into(),
                    cmp,
                },
                expr.span,
            );
            let jump_idx = ctx.emit(
                Op::Jump {
                    target: usize::MAX,
                    condition: Some(cond.into()),
                },
                expr.span,
            );
            let mut rhs = compile(ctx, right)?;
            rhs = resize_to(ctx, rhs, lhs.size, lhs.signed, right.span);
            ctx.emit(
                Op::Mov {
                    to: lhs.clone().into(),
                    from: rhs.into(),
                },
                expr.span,
            );
            let target = ctx.emit(Op::JumpTarget, expr.span);
            if let Op::Jump { target: t, .. } = &mut ctx.code[jump_idx].op {
                *t = target;
            }
            Ok(lhs)
        }
        ExprKind::Assignment { target, value } => {
            let rhs = compile(ctx, value)?;
            let lhs_addr = load_lvalue(ctx, target)?;
            let lhs_ty = ty(ctx, target)?;
            if lhs_ty.is_const() {
                return Err(type_error(
                    expr.span,
                    TypeError::AssignToConst {
                        expr: describe(target),
                    },
                ));
            }
            let size = lhs_ty.size().max(1) as u8;
            let rhs = resize_to(ctx, rhs, size, lhs_ty.is_signed(), expr.span);
            ctx.emit(
                Op::Mov {
                    to: crate::register::Dereference::new(lhs_addr.into(), size).into(),
                    from: rhs.clone().into(),
                },
                expr.span,
            );
            Ok(rhs)
        }
    }
}

fn compile_binary(
    ctx: &mut LowerCtx,
    span: SourceSpan,
    op: BinOp,
    left: &Expr,
    right: &Expr,
) -> LowerResult<Register> {
    let result_ty = binary_result_type(ctx, span, op, left, right)?;

    if matches!(op, BinOp::Lt | BinOp::Leq | BinOp::Gt | BinOp::Geq | BinOp::Eq | BinOp::Neq) {
        let (lhs, rhs) = compile_meta(ctx, left, right)?;
        let signed = lhs.signed && rhs.signed;
        let cmp = match op {
            BinOp::Leq => CmpOp::relational(signed, false, false),
            BinOp::Lt => CmpOp::relational(signed, true, false),
            BinOp::Gt => CmpOp::relational(signed, true, true),
            BinOp::Geq => CmpOp::relational(signed, false, true),
            BinOp::Eq => CmpOp::Eq,
            BinOp::Neq => CmpOp::Neq,
            _ => unreachable!(),
        };
        ctx.emit(
            Op::Compare {
                left: lhs.into(),
                right: rhs.into(),
            },
            span,
        );
        let dest = ctx.fresh_register(1, false);
        ctx.emit(
            Op::SetCmp {
                dest: dest.clone().into(),
                cmp,
            },
            span,
        );
        return Ok(dest);
    }

    let lt = ty(ctx, left)?;
    let rt = ty(ctx, right)?;
    let (lhs, rhs) = compile_meta(ctx, left, right)?;

    if matches!(op, BinOp::Add | BinOp::Sub) && (result_ty.is_pointer() || result_ty.is_array()) {
        let (ptr_side_ty, ptr_reg, mut non_ptr_reg) = if lt.is_pointer() || lt.is_array() {
            (lt.clone(), lhs, rhs)
        } else {
            (rt.clone(), rhs, lhs)
        };
        let elem_size = ptr_side_ty.pointee().size().max(1) as u8;
        if elem_size != 1 {
            let scaled = ctx.fresh_register(non_ptr_reg.size, non_ptr_reg.signed);
            ctx.emit(
                Op::Binary {
                    left: non_ptr_reg.clone().into(),
                    right: immediate(i64::from(elem_size), non_ptr_reg.size).into(),
                    op: BinaryOp::Mul,
                    to: scaled.clone().into(),
                },
                span,
            );
            non_ptr_reg = scaled;
        }
        let res = ctx.fresh_register(ptr_reg.size, ptr_reg.signed);
        let ir_op = if matches!(op, BinOp::Add) { BinaryOp::Add } else { BinaryOp::Sub };
        ctx.emit(
            Op::Binary {
                left: ptr_reg.into(),
                right: non_ptr_reg.into(),
                op: ir_op,
                to: res.clone().into(),
            },
            span,
        );
        return Ok(res);
    }

    let ir_op = match op {
        BinOp::Add => BinaryOp::Add,
        BinOp::Sub => BinaryOp::Sub,
        BinOp::Mul => BinaryOp::Mul,
        BinOp::Div => {
            if result_ty.is_signed() {
                BinaryOp::IDiv
            } else {
                BinaryOp::UDiv
            }
        }
        BinOp::Mod => {
            if result_ty.is_signed() {
                BinaryOp::IMod
            } else {
                BinaryOp::UMod
            }
        }
        BinOp::Shl => BinaryOp::Shl,
        BinOp::Shr => {
            if result_ty.is_signed() {
                BinaryOp::Sar
            } else {
                BinaryOp::Shr
            }
        }
        BinOp::BitAnd => BinaryOp::And,
        BinOp::BitOr => BinaryOp::Or,
        BinOp::BitXor => BinaryOp::Xor,
        _ => unreachable!(),
    };
    let res = ctx.fresh_register(lhs.size, result_ty.is_signed());
    ctx.emit(
        Op::Binary {
            left: lhs.into(),
            right: rhs.into(),
            op: ir_op,
            to: res.clone().into(),
        },
        span,
    );
    Ok(res)
}

fn bin_to_ir(op: BinOp) -> BinaryOp {
    match op {
        BinOp::Add => BinaryOp::Add,
        BinOp::Sub => BinaryOp::Sub,
        _ => unreachable!("preincrement/postincrement only ever carry add/sub"),
    }
}

fn step_value(ty: &Type) -> i64 {
    if ty.is_pointer() || ty.is_array() {
        i64::from(ty.pointee().size().max(1))
    } else {
        1
    }
}

fn describe(expr: &Expr) -> String {
    match &expr.kind {
        ExprKind::Identifier(name) => name.clone(),
        _ => "<expression>".to_string(),
    }
}

/// Emit IR that leaves the *address* of `expr` in a fresh register. Defined
/// only for identifier, dereference, index, cast (pass-through), and
/// preincrement (spec §4.2).
pub fn load_lvalue(ctx: &mut LowerCtx, expr: &Expr) -> LowerResult<Register> {
    match &expr.kind {
        ExprKind::Identifier(name) => {
            let var = ctx.lookup(name)?;
            if var.lvalue_is_rvalue {
                // The identifier already denotes its own address (arrays,
                // function symbols): a plain, non-lvalue load gives it back.
                let reg = ctx.fresh_register(var.ty.size().max(1) as u8, var.ty.is_signed());
                ctx.emit(
                    Op::LoadVar {
                        variable: var,
                        to: reg.clone().into(),
                        lvalue: false,
                    },
                    expr.span,
                );
                return Ok(reg);
            }
            let reg = ctx.fresh_register(2, false);
            ctx.emit(
                Op::LoadVar {
                    variable: var,
                    to: reg.clone().into(),
                    lvalue: true,
                },
                expr.span,
            );
            Ok(reg)
        }
        ExprKind::Dereference(inner) => {
            let reg = compile(ctx, inner)?;
            Ok(resize_to(ctx, reg, 2, false, expr.span))
        }
        ExprKind::Index { base, index } => {
            let base_ty = ty(ctx, base)?;
            let inner_is_array = base_ty.pointee().is_array();
            let base_reg = if inner_is_array {
                load_lvalue(ctx, base)?
            } else {
                compile(ctx, base)?
            };
            let offset_reg = compile(ctx, index)?;
            let offset_reg = resize_to(ctx, offset_reg, base_reg.size, base_reg.signed, index.span);
            let elem_size = ty(ctx, expr)?.storage_size().max(1) as u8;
            let scaled = ctx.fresh_register(offset_reg.size, offset_reg.signed);
            ctx.emit(
                Op::Binary {
                    left: offset_reg.into(),
                    right: immediate(i64::from(elem_size), scaled.size).into(),
                    op: BinaryOp::Mul,
                    to: scaled.clone().into(),
                },
                expr.span,
            );
            let res = ctx.fresh_register(base_reg.size, base_reg.signed);
            ctx.emit(
                Op::Binary {
                    left: base_reg.into(),
                    right: scaled.into(),
                    op: BinaryOp::Add,
                    to: res.clone().into(),
                },
                expr.span,
            );
            Ok(res)
        }
        ExprKind::Cast { operand, .. } => load_lvalue(ctx, operand),
        ExprKind::Preincrement { .. } => {
            if let ExprKind::Preincrement { operand, .. } = &expr.kind {
                load_lvalue(ctx, operand)
            } else {
                unreachable!()
            }
        }
        _ => Err(LowerSignal::Error(Error::Type {
            span: expr.span,
            error: TypeError::NoLvalue {
                expr: describe(expr),
            },
        })),
    }
}
