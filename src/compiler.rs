//! [`Compiler`]: the global state threaded through lowering (spec §3).
//!
//! Unlike the donor's `Compiler` object, nothing here is a singleton:
//! callers hold a `&mut Compiler` explicitly (spec §9, *Global mutable
//! state*).

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use crate::register::DataReference;
use crate::scope::Scope;
use crate::types::Type;
use crate::variable::Variable;

/// One entry in the program-data region (spec §4.6).
#[derive(Clone, Debug)]
pub enum DataEntry {
    Bytes(Vec<u8>),
    /// A list of variables whose eventual memory locations become a
    /// pointer array at pack time.
    VarArray(Vec<Rc<Variable>>),
}

impl DataEntry {
    /// Byte length this entry contributes to the data region before
    /// resolution (each `VarArray` element is a 2-byte pointer).
    pub fn len(&self) -> usize {
        match self {
            DataEntry::Bytes(b) => b.len(),
            DataEntry::VarArray(v) => v.len() * 2,
        }
    }
}

/// A fully lowered function, ready for desugaring/encoding. `scope` is
/// shared with the `Prelude`/`Epilog` IR emitted into its own code: the
/// allocator fills in `used_hw_regs` after this object is built, and those
/// two instructions read it back out at desugar time.
pub struct CompiledFunction {
    pub name: String,
    pub params: Vec<(String, Type)>,
    pub returns: Type,
    pub varargs: bool,
    pub scope: Rc<RefCell<Scope>>,
}

/// A fully compiled top-level object, in the order its lowering attempt
/// finished (spec §3: "a list of fully compiled top-level objects in
/// resolution order").
pub enum CompiledObject {
    Function(CompiledFunction),
    /// A top-level statement that isn't a function (a global variable
    /// initializer, a bare top-level expression): its code is concatenated
    /// into the toplevel-code region in finish order.
    TopLevel(Vec<crate::ir::Instr>),
}

impl CompiledObject {
    pub fn identifier(&self) -> Option<&str> {
        match self {
            CompiledObject::Function(f) => Some(&f.name),
            CompiledObject::TopLevel(_) => None,
        }
    }
}

/// Global compiler state: the name table, the data region, and the
/// finish-ordered list of compiled objects (spec §3).
#[derive(Default)]
pub struct Compiler {
    pub vars: HashMap<String, Rc<Variable>>,
    pub data: Vec<DataEntry>,
    pub data_index: HashMap<String, usize>,
    pub compiled_objects: Vec<CompiledObject>,
    unique_counter: u32,
}

impl Compiler {
    pub fn new() -> Compiler {
        Compiler::default()
    }

    pub fn unique_name(&mut self, prefix: &str) -> String {
        let n = self.unique_counter;
        self.unique_counter += 1;
        format!("{}-{}", prefix, n)
    }

    /// Declare a global variable, reserving its zero-initialized storage in
    /// the data region. Returns the prior declaration (same name, same
    /// type) instead of a fresh one if it's already declared.
    pub fn declare_global(&mut self, name: &str, ty: Type) -> Result<Rc<Variable>, Rc<Variable>> {
        self.declare_global_as(name, ty, false)
    }

    /// As [`Compiler::declare_global`], but marks the variable
    /// `lvalue_is_rvalue` (used for array-typed globals, whose identifier
    /// already denotes their storage address).
    pub fn declare_global_as(
        &mut self,
        name: &str,
        ty: Type,
        lvalue_is_rvalue: bool,
    ) -> Result<Rc<Variable>, Rc<Variable>> {
        if let Some(existing) = self.vars.get(name) {
            return Err(existing.clone());
        }
        let index = self.data.len();
        self.data.push(DataEntry::Bytes(vec![0; ty.storage_size().max(ty.size()) as usize]));
        let reference = DataReference::new(name);
        self.data_index.insert(name.to_string(), index);
        let mut var = Variable::new_global(name, ty, reference);
        if lvalue_is_rvalue {
            var = var.as_lvalue_is_rvalue();
        }
        let var = Rc::new(var);
        self.vars.insert(name.to_string(), var.clone());
        Ok(var)
    }

    /// Declare a function's symbol: unlike [`Compiler::declare_global`], no
    /// data-table slot is reserved. A function's address resolves via the
    /// packager's code-label symbol table (spec §4.6), not the data region.
    pub fn declare_function_symbol(
        &mut self,
        name: &str,
        ty: Type,
    ) -> Result<Rc<Variable>, Rc<Variable>> {
        if let Some(existing) = self.vars.get(name) {
            return Err(existing.clone());
        }
        let reference = DataReference::new(name);
        let var = Rc::new(Variable::new_global(name, ty, reference).as_lvalue_is_rvalue());
        self.vars.insert(name.to_string(), var.clone());
        Ok(var)
    }

    /// Reserve a fresh, uniquely-named global slot (used for hidden array
    /// literal storage and spill-slot backing at top level).
    pub fn declare_anonymous_global(&mut self, prefix: &str, ty: Type) -> Rc<Variable> {
        let name = self.unique_name(prefix);
        self.declare_global(&name, ty)
            .unwrap_or_else(|_| unreachable!("unique_name never collides"))
    }

    /// Append raw bytes to the data region, returning the index a
    /// `DataReference` should carry.
    pub fn add_bytes(&mut self, prefix: &str, bytes: Vec<u8>) -> String {
        let name = self.unique_name(prefix);
        let index = self.data.len();
        self.data.push(DataEntry::Bytes(bytes));
        self.data_index.insert(name.clone(), index);
        name
    }

    /// Append a list of variables whose locations become a pointer array at
    /// pack time (spec §3: "lists of Variables ... become pointer arrays at
    /// pack time").
    pub fn add_array(&mut self, prefix: &str, vars: Vec<Rc<Variable>>) -> String {
        let name = self.unique_name(prefix);
        let index = self.data.len();
        self.data.push(DataEntry::VarArray(vars));
        self.data_index.insert(name.clone(), index);
        name
    }
}
