//! Hardware instructions (spec §4.5/§4.6): the fixed-shape, opcode-grouped
//! form the encoder produces and the packager serializes to bytes.
//!
//! Grounded on the donor's `backend/rustvm/encoder.py`: `BinaryInstructions`,
//! `UnaryInstructions`, `Manip`, `Mem`, `IO` as flat `IntEnum`s, each with a
//! `group` tag, packed via `size << 14 | group << 8 | opcode`.

use util::{EnumFromStr, InteropGetName};
use util_derive::{EnumFromStr, InteropGetName};

use crate::error::{Error, InternalCompilerError};
use crate::ir::{BinaryOp, UnaryOp};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HardwareGroup {
    Binary,
    Unary,
    Manip,
    Mem,
    Io,
}

impl HardwareGroup {
    pub fn code(self) -> u8 {
        match self {
            HardwareGroup::Binary => 0,
            HardwareGroup::Unary => 1,
            HardwareGroup::Manip => 2,
            HardwareGroup::Mem => 3,
            HardwareGroup::Io => 4,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, EnumFromStr, InteropGetName)]
pub enum BinaryOpcode {
    Add,
    Sub,
    Mul,
    Udiv,
    Idiv,
    Umod,
    Imod,
    Shl,
    Shr,
    Sar,
    And,
    Or,
    Xor,
}

impl From<BinaryOp> for BinaryOpcode {
    fn from(op: BinaryOp) -> BinaryOpcode {
        match op {
            BinaryOp::Add => BinaryOpcode::Add,
            BinaryOp::Sub => BinaryOpcode::Sub,
            BinaryOp::Mul => BinaryOpcode::Mul,
            BinaryOp::UDiv => BinaryOpcode::Udiv,
            BinaryOp::IDiv => BinaryOpcode::Idiv,
            BinaryOp::UMod => BinaryOpcode::Umod,
            BinaryOp::IMod => BinaryOpcode::Imod,
            BinaryOp::Shl => BinaryOpcode::Shl,
            BinaryOp::Shr => BinaryOpcode::Shr,
            BinaryOp::Sar => BinaryOpcode::Sar,
            BinaryOp::And => BinaryOpcode::And,
            BinaryOp::Or => BinaryOpcode::Or,
            BinaryOp::Xor => BinaryOpcode::Xor,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, EnumFromStr, InteropGetName)]
pub enum UnaryOpcode {
    Binv,
    Linv,
    Neg,
    Pos,
}

impl From<UnaryOp> for UnaryOpcode {
    fn from(op: UnaryOp) -> UnaryOpcode {
        match op {
            UnaryOp::BitInv => UnaryOpcode::Binv,
            UnaryOp::LogicInv => UnaryOpcode::Linv,
            UnaryOp::Neg => UnaryOpcode::Neg,
            UnaryOp::Pos => UnaryOpcode::Pos,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, EnumFromStr, InteropGetName)]
pub enum ManipOpcode {
    Mov,
    Sxu,
    Sxi,
    Jmp,
    Set,
    Tst,
    Halt,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, EnumFromStr, InteropGetName)]
pub enum MemOpcode {
    Stks,
    Push,
    Pop,
    Call,
    Ret,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, EnumFromStr, InteropGetName)]
pub enum IoOpcode {
    Getc,
    Putc,
}

/// Named, non-allocatable hardware registers; `FREE_REG_OFFSET` is how far
/// past these the allocator's physical register numbering starts (spec
/// §4.6: "`free_reg_offset` equals the count of named special-purpose
/// hardware registers").
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SpecialRegister {
    Stack,
    Base,
    Current,
    Return,
}

impl SpecialRegister {
    pub fn index(self) -> u8 {
        match self {
            SpecialRegister::Stack => 0,
            SpecialRegister::Base => 1,
            SpecialRegister::Current => 2,
            SpecialRegister::Return => 3,
        }
    }
}

pub const FREE_REG_OFFSET: u8 = 4;

pub const REG_FLAG: u16 = 1 << 15;
pub const DEREF_FLAG: u16 = 1 << 14;
const VALUE_MASK: u16 = 0x3fff;

/// One hardware-instruction operand, still possibly carrying a symbolic
/// reference (`DataReference`/`JumpTarget`); the packager resolves those to
/// `MemoryLocation` before anything calls [`HwArg::pack`].
#[derive(Clone, Debug, PartialEq)]
pub enum HwArg {
    Register(u8),
    Dereference(Box<HwArg>),
    Immediate(i64),
    DataReference(String),
    JumpTarget(usize),
    MemoryLocation(u32),
}

impl HwArg {
    /// A register operand whose `index` is already the final wire index
    /// (an allocated physical register plus [`FREE_REG_OFFSET`], or a
    /// [`SpecialRegister::index`] for a named register).
    pub fn register(index: u8) -> HwArg {
        HwArg::Register(index)
    }

    pub fn deref(inner: HwArg) -> HwArg {
        HwArg::Dereference(Box::new(inner))
    }

    /// Pack this operand into its 16-bit wire encoding (spec §4.6, operand
    /// packing table). `Register` holds its final wire index already:
    /// named registers (stack/base/current/return) encode their
    /// `SpecialRegister::index()` directly, allocated registers encode
    /// `physical + FREE_REG_OFFSET`; see [`encoder`](crate::encoder) for
    /// where that distinction is made. Any symbolic operand reaching here is
    /// an internal error: packaging's symbol-resolution pass must have
    /// already replaced it.
    pub fn pack(&self) -> Result<u16, Error> {
        match self {
            HwArg::Register(index) => Ok(REG_FLAG | (*index as u16 & VALUE_MASK)),
            HwArg::Dereference(inner) => match inner.as_ref() {
                HwArg::Register(index) => Ok(REG_FLAG | DEREF_FLAG | (*index as u16 & VALUE_MASK)),
                HwArg::Immediate(v) => Ok(DEREF_FLAG | (*v as u16 & VALUE_MASK)),
                HwArg::MemoryLocation(ofs) => Ok(DEREF_FLAG | (*ofs as u16 & VALUE_MASK)),
                other => Err(InternalCompilerError::new(format!("cannot dereference operand {:?}", other)).into()),
            },
            HwArg::Immediate(v) => Ok(*v as u16 & VALUE_MASK),
            HwArg::MemoryLocation(ofs) => Ok(*ofs as u16 & VALUE_MASK),
            HwArg::DataReference(name) => {
                Err(InternalCompilerError::new(format!("unresolved data reference `{}` reached assembly", name)).into())
            }
            HwArg::JumpTarget(idx) => {
                Err(InternalCompilerError::new(format!("unresolved jump target {} reached assembly", idx)).into())
            }
        }
    }
}

fn size_code(size: u8) -> Result<u16, Error> {
    match size {
        1 => Ok(0),
        2 => Ok(1),
        4 => Ok(2),
        8 => Ok(3),
        other => Err(InternalCompilerError::new(format!("invalid hardware instruction size {}", other)).into()),
    }
}

pub fn pack_opcode(group: HardwareGroup, opcode: u8, size: u8) -> Result<u16, Error> {
    Ok((size_code(size)? << 14) | ((group.code() as u16) << 8) | opcode as u16)
}

/// One fully opcode-grouped hardware instruction (spec §4.5).
#[derive(Clone, Debug, PartialEq)]
pub struct HardwareInstruction {
    pub group: HardwareGroup,
    pub opcode: u8,
    pub size: u8,
    pub args: Vec<HwArg>,
}

impl HardwareInstruction {
    pub fn new(group: HardwareGroup, opcode: u8, size: u8, args: Vec<HwArg>) -> HardwareInstruction {
        HardwareInstruction {
            group,
            opcode,
            size,
            args,
        }
    }

    /// Byte length once assembled: one opcode word plus one word per arg.
    pub fn byte_len(&self) -> usize {
        2 * (1 + self.args.len())
    }

    pub fn encode(&self) -> Result<Vec<u16>, Error> {
        let mut words = vec![pack_opcode(self.group, self.opcode, self.size)?];
        for arg in &self.args {
            words.push(arg.pack()?);
        }
        Ok(words)
    }
}

/// Resolve an inline `asm` block mnemonic (spec §4.2, ASM block) to its
/// hardware group and opcode, trying each group's `EnumFromStr` in turn
/// (the donor's mnemonic-to-opcode lookup, reused per spec §10's ambient
/// stack note on `util`'s enum/string plumbing).
pub fn resolve_mnemonic(name: &str) -> Result<(HardwareGroup, u8), Error> {
    if let Ok(op) = ManipOpcode::from_str(name) {
        return Ok((HardwareGroup::Manip, op as u8));
    }
    if let Ok(op) = MemOpcode::from_str(name) {
        return Ok((HardwareGroup::Mem, op as u8));
    }
    if let Ok(op) = BinaryOpcode::from_str(name) {
        return Ok((HardwareGroup::Binary, op as u8));
    }
    if let Ok(op) = UnaryOpcode::from_str(name) {
        return Ok((HardwareGroup::Unary, op as u8));
    }
    if let Ok(op) = IoOpcode::from_str(name) {
        return Ok((HardwareGroup::Io, op as u8));
    }
    Err(InternalCompilerError::new(format!("unknown machine instruction mnemonic `{}`", name)).into())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn opcode_word_packs_size_group_and_opcode() {
        let word = pack_opcode(HardwareGroup::Manip, ManipOpcode::Mov as u8, 4).unwrap();
        assert_eq!(word, (2u16 << 14) | (2u16 << 8) | 0);
    }

    #[test]
    fn allocated_register_operand_sits_past_the_special_registers() {
        let word = HwArg::register(FREE_REG_OFFSET).pack().unwrap();
        assert_eq!(word, REG_FLAG | FREE_REG_OFFSET as u16);
    }

    #[test]
    fn special_register_operand_encodes_its_raw_index() {
        let word = HwArg::register(SpecialRegister::Base.index()).pack().unwrap();
        assert_eq!(word, REG_FLAG | SpecialRegister::Base.index() as u16);
    }

    #[test]
    fn dereferenced_register_sets_both_flags() {
        let word = HwArg::deref(HwArg::register(2 + FREE_REG_OFFSET)).pack().unwrap();
        assert_eq!(word, REG_FLAG | DEREF_FLAG | (2 + FREE_REG_OFFSET as u16));
    }

    #[test]
    fn resolves_mnemonics_across_groups() {
        assert_eq!(resolve_mnemonic("Mov").unwrap(), (HardwareGroup::Manip, ManipOpcode::Mov as u8));
        assert_eq!(resolve_mnemonic("Push").unwrap(), (HardwareGroup::Mem, MemOpcode::Push as u8));
        assert!(resolve_mnemonic("NotAnOpcode").is_err());
    }
}
