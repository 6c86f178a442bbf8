//! [`Variable`]: a declared name's storage location (spec §3).

use crate::register::DataReference;
use crate::types::Type;

#[derive(Clone, Debug, PartialEq)]
pub enum Storage {
    /// Offset in bytes relative to the function's base pointer. Negative
    /// offsets are parameters; non-negative offsets are locals.
    Stack(i32),
    /// A symbolic reference into the compiler's data table, resolved to an
    /// absolute offset at packaging time.
    Global(DataReference),
}

#[derive(Clone, Debug, PartialEq)]
pub struct Variable {
    pub name: String,
    pub ty: Type,
    pub storage: Storage,
    /// Set for variables whose identifier already denotes their address:
    /// arrays, function symbols, the synthetic varargs pointer. Taking the
    /// address of such a variable is an error; dereferencing it is the
    /// identity (see spec glossary).
    pub lvalue_is_rvalue: bool,
}

impl Variable {
    pub fn new_stack(name: impl Into<String>, ty: Type, offset: i32) -> Variable {
        Variable {
            name: name.into(),
            ty,
            storage: Storage::Stack(offset),
            lvalue_is_rvalue: false,
        }
    }

    pub fn new_global(name: impl Into<String>, ty: Type, reference: DataReference) -> Variable {
        Variable {
            name: name.into(),
            ty,
            storage: Storage::Global(reference),
            lvalue_is_rvalue: false,
        }
    }

    pub fn as_lvalue_is_rvalue(mut self) -> Variable {
        self.lvalue_is_rvalue = true;
        self
    }

    pub fn stack_offset(&self) -> Option<i32> {
        match &self.storage {
            Storage::Stack(off) => Some(*off),
            Storage::Global(_) => None,
        }
    }

    pub fn global_offset(&self) -> Option<&DataReference> {
        match &self.storage {
            Storage::Global(r) => Some(r),
            Storage::Stack(_) => None,
        }
    }
}
