//! Statement lowering (spec §4.2) and the three entry points the driver
//! calls into: a function body, a global variable's initializer, and any
//! other top-level statement.

use std::cell::RefCell;
use std::rc::Rc;

use crate::ast::{AsmInstr, AsmParam, Expr, ExprKind, Statement, StatementKind};
use crate::compiler::{CompiledFunction, CompiledObject, Compiler};
use crate::driver::{qualify, LowerResult, LowerSignal};
use crate::error::{Error, TypeError};
use crate::ir::{immediate, Op};
use crate::register::{Dereference, Param, Register};
use crate::scope::{FunctionDecl, Scope};
use crate::span::SourceSpan;
use crate::types::Type;

use super::expr::{self, resize_to};
use super::LowerCtx;

pub fn lower_function(
    compiler: &mut Compiler,
    namespace: &str,
    name: &str,
    params: &[(String, Type)],
    returns: &Type,
    varargs: bool,
    body: &[Statement],
    span: SourceSpan,
) -> LowerResult<(CompiledObject, String)> {
    let qualified = qualify(namespace, name);
    let fn_ty = Type::function(returns.clone(), params.iter().map(|(_, t)| t.clone()).collect(), varargs);
    let symbol = compiler
        .declare_function_symbol(&qualified, fn_ty)
        .unwrap_or_else(|existing| existing);

    let decl = FunctionDecl::new(qualified.clone(), params.to_vec(), returns.clone(), varargs);
    let top_scope = Rc::new(RefCell::new(decl.scope));

    let mut ctx = LowerCtx::new(compiler, namespace);
    ctx.set_frame(top_scope.clone());
    ctx.push_scope(top_scope.clone());
    ctx.emit(Op::Prelude { scope: top_scope.clone() }, span);
    lower_body(&mut ctx, body)?;
    ctx.emit(Op::Epilog { scope: top_scope.clone() }, span);
    ctx.emit(
        Op::Return {
            scope: top_scope.clone(),
            arg: None,
        },
        span,
    );
    ctx.pop_scope();

    top_scope.borrow_mut().code = ctx.code;
    let _ = symbol; // the declared symbol is the compiled object's identity

    let function = CompiledFunction {
        name: qualified.clone(),
        params: params.to_vec(),
        returns: returns.clone(),
        varargs,
        scope: top_scope,
    };
    Ok((CompiledObject::Function(function), qualified))
}

pub fn lower_global_variable(
    compiler: &mut Compiler,
    namespace: &str,
    name: &str,
    ty: Option<&Type>,
    init: Option<&Expr>,
    span: SourceSpan,
) -> LowerResult<(CompiledObject, String)> {
    let qualified = qualify(namespace, name);
    let mut ctx = LowerCtx::new(compiler, namespace);

    let declared_ty = match (ty, init) {
        (Some(t), _) => t.clone(),
        (None, Some(e)) => expr::ty(&ctx, e)?,
        (None, None) => {
            return Err(LowerSignal::Error(Error::Internal(
                crate::error::InternalCompilerError::new(format!(
                    "global `{}` has neither a declared type nor an initialiser",
                    qualified
                )),
            )))
        }
    };

    match init {
        None => {
            ctx.compiler
                .declare_global(&qualified, declared_ty)
                .unwrap_or_else(|existing| existing);
        }
        Some(e) if matches!(e.kind, ExprKind::ArrayLiteral(_)) => {
            let elems = match &e.kind {
                ExprKind::ArrayLiteral(elems) => elems,
                _ => unreachable!(),
            };
            check_array_length(
                match &declared_ty {
                    Type::Array { length, .. } => *length,
                    _ => None,
                },
                elems.len(),
                e.span,
            )?;
            let elem_ty = declared_ty.pointee().clone();
            if declared_ty.is_array() {
                let length = match &declared_ty {
                    Type::Array { length, .. } => length.unwrap_or(elems.len() as u32),
                    _ => elems.len() as u32,
                };
                let storage_ty = Type::array(elem_ty.clone(), Some(length));
                let var = ctx
                    .compiler
                    .declare_global_as(&qualified, storage_ty, true)
                    .unwrap_or_else(|existing| existing);
                let base = expr::compile(&mut ctx, &addr_of_rvalue(&var, e.span))?;
                compile_array_literal_into(&mut ctx, &base, elems, &elem_ty, e.span)?;
            } else {
                // Pointer-typed: the declared global holds an address into
                // separate, hidden backing storage (spec §4.2, ArrayLiteral).
                let var = ctx
                    .compiler
                    .declare_global(&qualified, declared_ty.clone())
                    .unwrap_or_else(|existing| existing);

                // An element can still block on a name that isn't declared
                // yet, and the driver retries this whole attempt from
                // scratch once it is. Reserve the hidden storage only once
                // every element has actually compiled, so a blocked attempt
                // leaves the data region exactly as it found it instead of
                // piling up an orphaned entry under a fresh name each retry.
                let data_mark = ctx.compiler.data.len();
                let hidden_name = ctx.compiler.unique_name("array-lit");
                let hidden = ctx
                    .compiler
                    .declare_global_as(&hidden_name, Type::array(elem_ty.clone(), Some(elems.len() as u32)), true)
                    .unwrap_or_else(|existing| existing);
                let base = expr::compile(&mut ctx, &addr_of_rvalue(&hidden, e.span))?;
                if let Err(signal) = compile_array_literal_into(&mut ctx, &base, elems, &elem_ty, e.span) {
                    ctx.compiler.data.truncate(data_mark);
                    ctx.compiler.data_index.remove(&hidden_name);
                    ctx.compiler.vars.remove(&hidden_name);
                    return Err(signal);
                }
                ctx.emit(Op::SaveVar { variable: var, from: base.into() }, e.span);
            }
        }
        Some(e) => {
            let val_ty = expr::ty(&ctx, e)?;
            if !val_ty.implicitly_castable_to(&declared_ty) {
                return Err(type_error(
                    e.span,
                    TypeError::Mismatch {
                        expected: declared_ty.to_string(),
                        found: val_ty.to_string(),
                        context: "global initialiser",
                    },
                ));
            }
            let var = ctx
                .compiler
                .declare_global(&qualified, declared_ty.clone())
                .unwrap_or_else(|existing| existing);
            let mut reg = expr::compile(&mut ctx, e)?;
            reg = resize_to(&mut ctx, reg, declared_ty.size().max(1) as u8, declared_ty.is_signed(), e.span);
            ctx.emit(Op::SaveVar { variable: var, from: reg.into() }, span);
        }
    }

    Ok((CompiledObject::TopLevel(ctx.code), qualified))
}

pub fn lower_toplevel_statement(
    compiler: &mut Compiler,
    namespace: &str,
    statement: &Statement,
) -> LowerResult<CompiledObject> {
    let mut ctx = LowerCtx::new(compiler, namespace);
    let top = Rc::new(RefCell::new(Scope::new()));
    ctx.push_scope(top);
    lower_statement(&mut ctx, statement)?;
    Ok(CompiledObject::TopLevel(ctx.code))
}

fn type_error(span: SourceSpan, error: TypeError) -> LowerSignal {
    LowerSignal::Error(Error::Type { span, error })
}

/// A synthetic `&var` expression node, used to reuse `expr::compile`'s
/// identifier path for taking the address of a storage variable we just
/// declared ourselves (rather than one the user named).
fn addr_of_rvalue(var: &Rc<crate::variable::Variable>, span: SourceSpan) -> Expr {
    Expr::new(ExprKind::Identifier(var.name.clone()), span)
}

fn lower_body(ctx: &mut LowerCtx, body: &[Statement]) -> LowerResult<()> {
    for stmt in body {
        lower_statement(ctx, stmt)?;
    }
    Ok(())
}

fn lower_statement(ctx: &mut LowerCtx, stmt: &Statement) -> LowerResult<()> {
    match &stmt.kind {
        StatementKind::ModDecl { .. } | StatementKind::FunctionDecl { .. } => {
            // Only ever reachable at top level, where the driver handles
            // these directly; a nested occurrence is a parser-level bug.
            Err(LowerSignal::Error(Error::Internal(
                crate::error::InternalCompilerError::new("nested module/function declaration reached statement lowering"),
            )))
        }
        StatementKind::VariableDecl { name, ty, init } => lower_local_decl(ctx, name, ty.as_ref(), init.as_ref(), stmt.span),
        StatementKind::Scope(body) => {
            let scope = Rc::new(RefCell::new(Scope::new()));
            ctx.push_scope(scope.clone());
            ctx.emit(Op::Prelude { scope: scope.clone() }, stmt.span);
            lower_body(ctx, body)?;
            ctx.emit(Op::Epilog { scope: scope.clone() }, stmt.span);
            ctx.pop_scope();
            Ok(())
        }
        StatementKind::Expr(e) => {
            expr::compile(ctx, e)?;
            Ok(())
        }
        StatementKind::Return(value) => lower_return(ctx, value.as_ref(), stmt.span),
        StatementKind::If {
            condition,
            then_branch,
            else_branch,
        } => lower_if(ctx, condition, then_branch, else_branch.as_deref(), stmt.span),
        StatementKind::Loop { condition, body } => lower_loop(ctx, condition, body, stmt.span),
        StatementKind::Asm { exprs, instrs } => lower_asm(ctx, exprs, instrs, stmt.span),
    }
}

fn lower_local_decl(
    ctx: &mut LowerCtx,
    name: &str,
    ty: Option<&Type>,
    init: Option<&Expr>,
    span: SourceSpan,
) -> LowerResult<()> {
    let declared_ty = match (ty, init) {
        (Some(t), _) => t.clone(),
        (None, Some(e)) => expr::ty(ctx, e)?,
        (None, None) => {
            return Err(LowerSignal::Error(Error::Internal(
                crate::error::InternalCompilerError::new(format!("variable `{}` has neither a type nor an initialiser", name)),
            )))
        }
    };

    match init.map(|e| &e.kind) {
        Some(ExprKind::ArrayLiteral(elems)) => {
            let init_span = init.unwrap().span;
            if declared_ty.is_array() {
                let elem_ty = declared_ty.pointee().clone();
                let declared_len = match &declared_ty {
                    Type::Array { length, .. } => *length,
                    _ => unreachable!(),
                };
                check_array_length(declared_len, elems.len(), init_span)?;
                let length = declared_len.unwrap_or(elems.len() as u32);
                let full_ty = Type::array(elem_ty.clone(), Some(length));
                let var = ctx.declare_local(name, full_ty, true);
                let addr = expr::compile(ctx, &addr_of_rvalue(&var, init_span))?;
                compile_array_literal_into(ctx, &addr, elems, &elem_ty, init_span)?;
            } else if declared_ty.is_pointer() {
                let elem_ty = declared_ty.pointee().clone();
                let var = ctx.declare_local(name, declared_ty.clone(), false);
                let hidden_name = ctx.compiler.unique_name("array-lit");
                let hidden = declare_array_storage(ctx, &hidden_name, &declared_ty, elems.len(), init_span, true)?;
                let addr = expr::compile(ctx, &addr_of_rvalue(&hidden, init_span))?;
                compile_array_literal_into(ctx, &addr, elems, &elem_ty, init_span)?;
                ctx.emit(Op::SaveVar { variable: var, from: addr.into() }, init_span);
            } else {
                return Err(type_error(
                    init_span,
                    TypeError::Mismatch {
                        expected: "pointer or array".to_string(),
                        found: declared_ty.to_string(),
                        context: "array literal initialiser",
                    },
                ));
            }
        }
        Some(_) => {
            let e = init.unwrap();
            let val_ty = expr::ty(ctx, e)?;
            if !val_ty.implicitly_castable_to(&declared_ty) {
                return Err(type_error(
                    e.span,
                    TypeError::Mismatch {
                        expected: declared_ty.to_string(),
                        found: val_ty.to_string(),
                        context: "variable initialiser",
                    },
                ));
            }
            let var = ctx.declare_local(name, declared_ty.clone(), false);
            let mut reg = expr::compile(ctx, e)?;
            reg = resize_to(ctx, reg, declared_ty.size().max(1) as u8, declared_ty.is_signed(), e.span);
            ctx.emit(Op::SaveVar { variable: var, from: reg.into() }, span);
        }
        None => {
            ctx.declare_local(name, declared_ty, false);
        }
    }
    Ok(())
}

fn check_array_length(declared: Option<u32>, found: usize, span: SourceSpan) -> LowerResult<()> {
    if let Some(n) = declared {
        if found > n as usize {
            return Err(type_error(
                span,
                TypeError::ArrayLengthTooLarge {
                    declared: n as usize,
                    found,
                },
            ));
        }
    }
    Ok(())
}

/// Declare the hidden backing storage for a pointer-typed array literal (or
/// a top-level `var arr: [T] = {...}` without an array type): an `Array` of
/// the pointer's pointee, sized to the literal (spec §4.2, ArrayLiteral).
fn declare_array_storage(
    ctx: &mut LowerCtx,
    name: &str,
    pointer_ty: &Type,
    len: usize,
    span: SourceSpan,
    as_local: bool,
) -> LowerResult<Rc<crate::variable::Variable>> {
    let elem_ty = pointer_ty.pointee().clone();
    let array_ty = Type::array(elem_ty, Some(len as u32));
    if as_local {
        Ok(ctx.declare_local(name, array_ty, true))
    } else {
        let v = ctx
            .compiler
            .declare_global(name, array_ty)
            .unwrap_or_else(|existing| existing);
        let _ = span;
        Ok(v)
    }
}

/// Write `elems` sequentially starting at the address in `base`, each at
/// `elem_ty.storage_size()` stride. A nested `ArrayLiteral` inlines if the
/// slot's type is itself `Array` (elements written directly into this
/// memory), or gets its own hidden local plus a stored pointer if the
/// slot's type is `Pointer` (spec §4.2, ArrayLiteral's dual personality).
fn compile_array_literal_into(
    ctx: &mut LowerCtx,
    base: &Register,
    elems: &[Expr],
    elem_ty: &Type,
    span: SourceSpan,
) -> LowerResult<()> {
    let stride = elem_ty.storage_size().max(1) as i64;
    for (i, elem) in elems.iter().enumerate() {
        let offset = i as i64 * stride;
        let slot_addr = ctx.fresh_register(2, false);
        ctx.emit(
            Op::Binary {
                left: base.clone().into(),
                right: immediate(offset, 2).into(),
                op: crate::ir::BinaryOp::Add,
                to: slot_addr.clone().into(),
            },
            span,
        );

        match (&elem.kind, elem_ty) {
            (ExprKind::ArrayLiteral(inner), Type::Array { to, length, .. }) => {
                check_array_length(*length, inner.len(), elem.span)?;
                compile_array_literal_into(ctx, &slot_addr, inner, to, elem.span)?;
            }
            (ExprKind::ArrayLiteral(inner), Type::Pointer { to, .. }) => {
                let name = ctx.compiler.unique_name("array-lit");
                let hidden_ty = Type::array((**to).clone(), Some(inner.len() as u32));
                let hidden = ctx.declare_local(&name, hidden_ty, true);
                let hidden_addr = expr::compile(ctx, &addr_of_rvalue(&hidden, elem.span))?;
                compile_array_literal_into(ctx, &hidden_addr, inner, to, elem.span)?;
                ctx.emit(
                    Op::Mov {
                        to: Dereference::new(slot_addr.into(), 2).into(),
                        from: hidden_addr.into(),
                    },
                    elem.span,
                );
            }
            _ => {
                let mut reg = expr::compile(ctx, elem)?;
                let size = elem_ty.size().max(1) as u8;
                reg = resize_to(ctx, reg, size, elem_ty.is_signed(), elem.span);
                ctx.emit(
                    Op::Mov {
                        to: Dereference::new(slot_addr.into(), size).into(),
                        from: reg.into(),
                    },
                    elem.span,
                );
            }
        }
    }
    Ok(())
}

fn lower_return(ctx: &mut LowerCtx, value: Option<&Expr>, span: SourceSpan) -> LowerResult<()> {
    let top = ctx.scope_stack().first().cloned().expect("Return outside a function");

    let reg = match value {
        Some(e) => Some(expr::compile(ctx, e)?),
        None => None,
    };

    for scope in ctx.scope_stack()[1..].iter().rev().cloned().collect::<Vec<_>>() {
        ctx.emit(Op::Epilog { scope }, span);
    }

    let arg = match reg {
        Some(r) => Some(Param::Register(r)),
        None => None,
    };
    ctx.emit(Op::Return { scope: top, arg }, span);
    Ok(())
}

fn lower_if(
    ctx: &mut LowerCtx,
    condition: &Expr,
    then_branch: &[Statement],
    else_branch: Option<&[Statement]>,
    span: SourceSpan,
) -> LowerResult<()> {
    let cond = expr::compile(ctx, condition)?;

    match else_branch {
        None => {
            // Jump(end, cond-false... actually: Jump(body) / Jump(end); body; end
            // laid out so the "fall through on true" case needs a single jump.
            let to_else = ctx.emit(
                Op::Jump {
                    target: usize::MAX,
                    condition: Some(cond.clone().into()),
                },
                span,
            );
            let to_end = ctx.emit(Op::Jump { target: usize::MAX, condition: None }, span);
            let body_label = ctx.emit(Op::JumpTarget, span);
            patch_jump(ctx, to_else, body_label);
            lower_body(ctx, then_branch)?;
            let end_label = ctx.emit(Op::JumpTarget, span);
            patch_jump(ctx, to_end, end_label);
        }
        Some(else_body) => {
            let to_else = ctx.emit(
                Op::Jump {
                    target: usize::MAX,
                    condition: Some(cond.into()),
                },
                span,
            );
            lower_body(ctx, else_body)?;
            let to_end = ctx.emit(Op::Jump { target: usize::MAX, condition: None }, span);
            let else_label = ctx.emit(Op::JumpTarget, span);
            patch_jump(ctx, to_else, else_label);
            lower_body(ctx, then_branch)?;
            let end_label = ctx.emit(Op::JumpTarget, span);
            patch_jump(ctx, to_end, end_label);
        }
    }
    Ok(())
}

fn lower_loop(ctx: &mut LowerCtx, condition: &Expr, body: &[Statement], span: SourceSpan) -> LowerResult<()> {
    let test_label = ctx.emit(Op::JumpTarget, span);
    let cond = expr::compile(ctx, condition)?;
    let to_continue = ctx.emit(
        Op::Jump {
            target: usize::MAX,
            condition: Some(cond.into()),
        },
        span,
    );
    let to_end = ctx.emit(Op::Jump { target: usize::MAX, condition: None }, span);
    let continue_label = ctx.emit(Op::JumpTarget, span);
    patch_jump(ctx, to_continue, continue_label);
    lower_body(ctx, body)?;
    ctx.emit(Op::Jump { target: test_label, condition: None }, span);
    let end_label = ctx.emit(Op::JumpTarget, span);
    patch_jump(ctx, to_end, end_label);
    Ok(())
}

fn patch_jump(ctx: &mut LowerCtx, jump_idx: usize, target: usize) {
    if let Op::Jump { target: t, .. } = &mut ctx.code[jump_idx].op {
        *t = target;
    }
}

fn lower_asm(ctx: &mut LowerCtx, exprs: &[Expr], instrs: &[AsmInstr], span: SourceSpan) -> LowerResult<()> {
    let mut compiled = Vec::with_capacity(exprs.len());
    for e in exprs {
        compiled.push(expr::compile(ctx, e)?);
    }

    for instr in instrs {
        let mut params = Vec::with_capacity(instr.params.len());
        for operand in &instr.params {
            let base: Param = match operand.param {
                AsmParam::Register(n) => Register::hardware(n as u8, instr.size, false).into(),
                AsmParam::Immediate(v) => immediate(v, instr.size).into(),
                AsmParam::ExprIndex(i) => {
                    let reg = compiled
                        .get(i)
                        .cloned()
                        .ok_or_else(|| {
                            LowerSignal::Error(Error::Internal(crate::error::InternalCompilerError::new(format!(
                                "asm block referenced expression index {} out of range",
                                i
                            ))))
                        })?;
                    Param::Register(reg)
                }
            };
            params.push(match operand.deref_size {
                Some(size) => Dereference::new(base, size).into(),
                None => base,
            });
        }
        ctx.emit(
            Op::MachineInstr {
                name: instr.name.clone(),
                size: instr.size,
                params,
            },
            span,
        );
    }
    Ok(())
}
