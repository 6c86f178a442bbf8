//! The external-interface AST (spec §6): a closed tree the core treats as
//! immutable input. No parser ships in this repository (see `demos/`); this
//! module is what a front-end would build and what the lowering passes in
//! [`crate::lower`] consume.

use crate::span::SourceSpan;
use crate::types::Type;

/// A binary operator at the surface-syntax level, before it is resolved to
/// an [`crate::ir::BinaryOp`]/[`crate::ir::CmpOp`] by `lower::expr`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Shl,
    Shr,
    BitAnd,
    BitOr,
    BitXor,
    Lt,
    Leq,
    Gt,
    Geq,
    Eq,
    Neq,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UnOp {
    BitInv,
    LogicInv,
    Neg,
    Pos,
}

/// `::` resizes (sign/zero-extends or truncates); `:>` reinterprets the bits
/// at a new width without touching the value.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CastKind {
    Resize,
    Reinterpret,
}

#[derive(Clone, Debug, PartialEq)]
pub enum ExprKind {
    Identifier(String),
    IntegerLiteral(i64),
    ArrayLiteral(Vec<Expr>),
    Unary {
        op: UnOp,
        operand: Box<Expr>,
    },
    Preincrement {
        op: BinOp,
        operand: Box<Expr>,
    },
    Postincrement {
        op: BinOp,
        operand: Box<Expr>,
    },
    Dereference(Box<Expr>),
    /// `&e`: the address of `e`. Only valid where `e.load_lvalue` is defined.
    AddressOf(Box<Expr>),
    Index {
        base: Box<Expr>,
        index: Box<Expr>,
    },
    Cast {
        kind: CastKind,
        to: Type,
        operand: Box<Expr>,
    },
    Call {
        target: Box<Expr>,
        args: Vec<Expr>,
    },
    Binary {
        op: BinOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Assignment {
        target: Box<Expr>,
        value: Box<Expr>,
    },
}

#[derive(Clone, Debug, PartialEq)]
pub struct Expr {
    pub kind: ExprKind,
    pub span: SourceSpan,
}

impl Expr {
    pub fn new(kind: ExprKind, span: SourceSpan) -> Expr {
        Expr { kind, span }
    }
}

/// One parameter of an inline machine instruction inside an `asm` block
/// (spec §4.2, ASM block): a register, an integer immediate, or an index
/// into the block's pre-evaluated expression list, optionally dereferenced.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AsmParam {
    Register(u32),
    Immediate(i64),
    ExprIndex(usize),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AsmOperand {
    pub param: AsmParam,
    /// Present if this operand is accessed through memory; the byte width
    /// of that access.
    pub deref_size: Option<u8>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AsmInstr {
    pub name: String,
    pub size: u8,
    pub params: Vec<AsmOperand>,
}

#[derive(Clone, Debug, PartialEq)]
pub enum StatementKind {
    ModDecl {
        name: String,
        body: Vec<Statement>,
    },
    FunctionDecl {
        name: String,
        params: Vec<(String, Type)>,
        returns: Type,
        varargs: bool,
        body: Vec<Statement>,
    },
    VariableDecl {
        name: String,
        ty: Option<Type>,
        init: Option<Expr>,
    },
    /// A bare nested block, introducing its own lexical scope.
    Scope(Vec<Statement>),
    Expr(Expr),
    Return(Option<Expr>),
    If {
        condition: Expr,
        then_branch: Vec<Statement>,
        else_branch: Option<Vec<Statement>>,
    },
    Loop {
        condition: Expr,
        body: Vec<Statement>,
    },
    Asm {
        exprs: Vec<Expr>,
        instrs: Vec<AsmInstr>,
    },
}

#[derive(Clone, Debug, PartialEq)]
pub struct Statement {
    pub kind: StatementKind,
    pub span: SourceSpan,
}

impl Statement {
    pub fn new(kind: StatementKind, span: SourceSpan) -> Statement {
        Statement { kind, span }
    }
}
