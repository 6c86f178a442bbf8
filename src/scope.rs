//! [`Scope`] and [`FunctionDecl`] (spec §3): lexical nesting, stack-frame
//! layout, and the set of physical registers a scope's body touches.

use std::collections::HashMap;
use std::rc::Rc;

use crate::ir::Instr;
use crate::types::Type;
use crate::variable::Variable;

/// A lexical scope: locals declared directly in it, the IR its statements
/// emit, and (filled in after register allocation) the hardware registers
/// its body uses, so the desugarer can save/restore exactly those.
#[derive(Default)]
pub struct Scope {
    pub variables: HashMap<String, Rc<Variable>>,
    /// Running total, in bytes, of all variables declared directly in this
    /// scope (spec §3: "size: a running size in bytes").
    pub size: u32,
    pub code: Vec<Instr>,
    pub used_hw_regs: Vec<u8>,
    /// Number of spill slots reserved for this scope by the allocator.
    pub spill_vars: u32,
}

impl Scope {
    pub fn new() -> Scope {
        Scope::default()
    }

    pub fn lookup_local(&self, name: &str) -> Option<Rc<Variable>> {
        self.variables.get(name).cloned()
    }

    /// Reserve `count` 8-byte spill slots, named `spill-var-{i}` (or
    /// `global-spill-{i}` at top level, per spec §4.3) starting at the
    /// current size.
    pub fn reserve_spill_vars(&mut self, count: u32, top_level: bool) {
        self.spill_vars = count;
        for i in 0..count {
            let name = if top_level {
                format!("global-spill-{}", i)
            } else {
                format!("spill-var-{}", i)
            };
            let offset = self.size as i32;
            self.size += 8;
            self.variables
                .insert(name.clone(), Rc::new(Variable::new_stack(name, Type::int(8, false), offset)));
        }
    }
}

/// A function declaration: a [`Scope`] (the function body's top scope) plus
/// signature information. Parameters get negative stack offsets,
/// accumulated from the right, below the saved base pointer and return
/// address (spec §3).
pub struct FunctionDecl {
    pub name: String,
    pub params: Vec<(String, Type)>,
    pub returns: Type,
    pub varargs: bool,
    pub scope: Scope,
    /// Present iff `varargs`: a synthetic variable pointing just past the
    /// last declared parameter.
    pub var_args: Option<Rc<Variable>>,
}

/// Fixed overhead, in bytes, of the saved base pointer and return address
/// pushed by the caller before parameters become addressable: parameters
/// are laid out below this.
pub const FRAME_HEADER_SIZE: i32 = 16;

impl FunctionDecl {
    pub fn new(
        name: impl Into<String>,
        params: Vec<(String, Type)>,
        returns: Type,
        varargs: bool,
    ) -> FunctionDecl {
        let mut scope = Scope::new();
        let mut offset = -FRAME_HEADER_SIZE;
        // Accumulate from the right: the last parameter sits closest to
        // the frame header, the first parameter furthest away.
        let mut assigned = Vec::with_capacity(params.len());
        for (pname, ty) in params.iter().rev() {
            offset -= ty.storage_size().max(ty.size()) as i32;
            assigned.push((pname.clone(), ty.clone(), offset));
        }
        assigned.reverse();
        for (pname, ty, off) in assigned {
            scope
                .variables
                .insert(pname.clone(), Rc::new(Variable::new_stack(pname, ty, off)));
        }

        let var_args = if varargs {
            // Just past the last declared parameter, on the side closer to
            // the frame header: the boundary every parameter's offset was
            // accumulated down from, independent of how many there are.
            let va = Variable::new_stack("var_args", Type::pointer(Type::Void), -FRAME_HEADER_SIZE)
                .as_lvalue_is_rvalue();
            let rc = Rc::new(va);
            scope.variables.insert("var_args".to_string(), rc.clone());
            Some(rc)
        } else {
            None
        };

        FunctionDecl {
            name: name.into(),
            params,
            returns,
            varargs,
            scope,
            var_args,
        }
    }

    pub fn ty(&self) -> Type {
        Type::function(
            self.returns.clone(),
            self.params.iter().map(|(_, t)| t.clone()).collect(),
            self.varargs,
        )
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parameters_get_negative_offsets_accumulated_from_the_right() {
        let f = FunctionDecl::new(
            "f",
            vec![
                ("a".to_string(), Type::int(1, false)),
                ("b".to_string(), Type::int(4, true)),
            ],
            Type::Void,
            false,
        );
        let a = f.scope.variables.get("a").unwrap();
        let b = f.scope.variables.get("b").unwrap();
        // b is declared last syntactically, so it sits closest to the frame header.
        assert_eq!(b.stack_offset(), Some(-FRAME_HEADER_SIZE - 4));
        assert_eq!(a.stack_offset(), Some(-FRAME_HEADER_SIZE - 4 - 1));
    }

    #[test]
    fn varargs_pointer_sits_just_past_the_last_parameter() {
        let f = FunctionDecl::new(
            "f",
            vec![
                ("a".to_string(), Type::int(4, true)),
                ("b".to_string(), Type::int(1, false)),
            ],
            Type::Void,
            true,
        );
        let va = f.var_args.as_ref().unwrap();
        assert!(va.lvalue_is_rvalue);
        // Sits at the frame-header boundary regardless of how many
        // parameters were accumulated below it.
        assert_eq!(va.stack_offset(), Some(-FRAME_HEADER_SIZE));
    }
}
