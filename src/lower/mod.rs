//! Expression & statement lowering (spec §4.2): typed AST to IR, one
//! top-level object at a time.
//!
//! Lowering is attempted into a scratch [`LowerCtx`] that is discarded
//! wholesale if the attempt blocks on an unresolved name (spec §9: "IR is
//! built into a scratch buffer and only committed to the object on
//! success").

pub mod expr;
pub mod stmt;

use std::cell::RefCell;
use std::rc::Rc;

use crate::driver::{qualify, LowerResult, LowerSignal};
use crate::ir::{Instr, Op, RegisterCounter};
use crate::register::Register;
use crate::scope::Scope;
use crate::span::SourceSpan;
use crate::types::Type;
use crate::variable::Variable;

/// Per-attempt lowering state: the compiler, the current namespace prefix,
/// a stack of lexical scopes for name lookup, a fresh-register supply, and
/// the flat instruction buffer this attempt is building.
///
/// Only `frame` ever accumulates stack offsets (spec §3: "the top scope of
/// a function owns stack-offset assignment for all nested scopes, and all
/// locals share one contiguous frame"). Nested `Scope`s pushed by `{ ... }`
/// blocks still get their own `Scope` (for name shadowing and their own
/// `used_hw_regs`/Prelude-Epilog pair), but their `size` stays zero; a
/// nested Prelude's stack adjustment is a no-op, only its register
/// save/restore does anything.
pub struct LowerCtx<'a> {
    pub compiler: &'a mut crate::compiler::Compiler,
    pub namespace: String,
    scopes: Vec<Rc<RefCell<Scope>>>,
    frame: Option<Rc<RefCell<Scope>>>,
    registers: RegisterCounter,
    pub code: Vec<Instr>,
}

impl<'a> LowerCtx<'a> {
    pub fn new(compiler: &'a mut crate::compiler::Compiler, namespace: &str) -> LowerCtx<'a> {
        LowerCtx {
            compiler,
            namespace: namespace.to_string(),
            scopes: Vec::new(),
            frame: None,
            registers: RegisterCounter::default(),
            code: Vec::new(),
        }
    }

    /// Bind the function frame that `declare_local` accumulates offsets
    /// into. Must be called (once) before lowering a function body, with
    /// the same scope that will be pushed as its top scope.
    pub fn set_frame(&mut self, frame: Rc<RefCell<Scope>>) {
        self.frame = Some(frame);
    }

    pub fn push_scope(&mut self, scope: Rc<RefCell<Scope>>) {
        self.scopes.push(scope);
    }

    pub fn pop_scope(&mut self) -> Rc<RefCell<Scope>> {
        self.scopes.pop().expect("pop_scope with no pushed scope")
    }

    pub fn current_scope(&self) -> Rc<RefCell<Scope>> {
        self.scopes.last().expect("no scope on the stack").clone()
    }

    pub fn fresh_register(&mut self, size: u8, signed: bool) -> Register {
        self.registers.fresh(size, signed)
    }

    pub fn emit(&mut self, op: Op, span: SourceSpan) -> usize {
        self.code.push(Instr::new(op, span));
        self.code.len() - 1
    }

    /// Declare a local named `name` of type `ty`, visible in the innermost
    /// scope. Inside a function, its offset is carved out of the shared
    /// frame; outside one (bare top-level code has no base pointer to be
    /// relative to), it becomes an ordinary namespace-qualified global.
    /// `lvalue_is_rvalue` marks hidden array-literal storage and similar
    /// variables whose identifier already denotes its own address.
    pub fn declare_local(&mut self, name: &str, ty: Type, lvalue_is_rvalue: bool) -> Rc<Variable> {
        let var = match &self.frame {
            Some(frame) => {
                let offset = {
                    let mut f = frame.borrow_mut();
                    let off = f.size as i32;
                    f.size += ty.storage_size().max(ty.size());
                    off
                };
                let mut v = Variable::new_stack(name.to_string(), ty, offset);
                if lvalue_is_rvalue {
                    v = v.as_lvalue_is_rvalue();
                }
                Rc::new(v)
            }
            None => {
                let qualified = qualify(&self.namespace, name);
                let v = match self.compiler.declare_global(&qualified, ty) {
                    Ok(v) | Err(v) => v,
                };
                return v;
            }
        };
        self.current_scope()
            .borrow_mut()
            .variables
            .insert(name.to_string(), var.clone());
        var
    }

    /// The active lexical-scope stack, innermost last. Used by `Return` to
    /// emit an `Epilog` for every scope but the function's own top scope.
    pub fn scope_stack(&self) -> &[Rc<RefCell<Scope>>] {
        &self.scopes
    }

    /// Resolve `name`: scope stack first (innermost to outermost), then the
    /// global table, namespace-qualified unless the name is rooted with
    /// `..` (spec §4.1, *Namespace qualification*). A miss blocks the
    /// enclosing attempt rather than erroring immediately, since the name
    /// may simply not have been compiled yet.
    pub fn lookup(&self, name: &str) -> LowerResult<Rc<Variable>> {
        for scope in self.scopes.iter().rev() {
            if let Some(var) = scope.borrow().lookup_local(name) {
                return Ok(var);
            }
        }

        if let Some(rooted) = name.strip_prefix("..") {
            return self
                .compiler
                .vars
                .get(rooted)
                .cloned()
                .ok_or_else(|| LowerSignal::Blocked(rooted.to_string()));
        }

        let qualified = qualify(&self.namespace, name);
        if let Some(var) = self.compiler.vars.get(&qualified) {
            return Ok(var.clone());
        }
        // Also try the bare (unqualified) name: functions/globals declared
        // at the root namespace are visible from any nested module too.
        if let Some(var) = self.compiler.vars.get(name) {
            return Ok(var.clone());
        }

        Err(LowerSignal::Blocked(qualified))
    }
}
