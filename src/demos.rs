//! Embeddable program fixtures (spec §6): since this repository's core
//! accepts a pre-built AST rather than source text, these functions stand in
//! for a parser. Each builds the top-level statement list for one of the
//! end-to-end scenarios (spec §8) that the CLI and the scenario tests share.

use crate::ast::{AsmInstr, BinOp, CastKind, Expr, ExprKind, Statement, StatementKind};
use crate::span::SourceSpan;
use crate::types::Type;

fn span() -> SourceSpan {
    SourceSpan::synthetic()
}

fn stmt(kind: StatementKind) -> Statement {
    Statement::new(kind, span())
}

fn expr(kind: ExprKind) -> Expr {
    Expr::new(kind, span())
}

fn int(v: i64) -> Expr {
    expr(ExprKind::IntegerLiteral(v))
}

fn ident(name: &str) -> Expr {
    expr(ExprKind::Identifier(name.to_string()))
}

fn assign(target: Expr, value: Expr) -> Statement {
    stmt(StatementKind::Expr(expr(ExprKind::Assignment {
        target: Box::new(target),
        value: Box::new(value),
    })))
}

/// `*(address::*ty) = value`: store to an absolute memory address, the
/// pattern every scenario below uses to make its result observable.
fn store_at(address: i64, ty: Type, value: Expr) -> Statement {
    let pointer = expr(ExprKind::Cast {
        kind: CastKind::Resize,
        to: Type::pointer(ty),
        operand: Box::new(int(address)),
    });
    assign(expr(ExprKind::Dereference(Box::new(pointer))), value)
}

fn function(name: &str, params: Vec<(String, Type)>, returns: Type, varargs: bool, body: Vec<Statement>) -> Statement {
    stmt(StatementKind::FunctionDecl {
        name: name.to_string(),
        params,
        returns,
        varargs,
        body,
    })
}

fn call(target: &str, args: Vec<Expr>) -> Expr {
    expr(ExprKind::Call {
        target: Box::new(ident(target)),
        args,
    })
}

/// 1. `fn main() { *(1000::*u8) = 4; }`: byte at 1000 equals 4.
pub fn byte_store() -> Vec<Statement> {
    vec![function(
        "main",
        vec![],
        Type::Void,
        false,
        vec![store_at(1000, Type::int(1, false), int(4))],
    )]
}

/// 2. `var arr: [u8] = {1,2,3,4}; fn main() { *(1000::*u8) = arr[3]; }`:
/// byte at 1000 equals 4.
pub fn array_index() -> Vec<Statement> {
    vec![
        stmt(StatementKind::VariableDecl {
            name: "arr".to_string(),
            ty: Some(Type::array(Type::int(1, false), Some(4))),
            init: Some(expr(ExprKind::ArrayLiteral(vec![int(1), int(2), int(3), int(4)]))),
        }),
        function(
            "main",
            vec![],
            Type::Void,
            false,
            vec![store_at(
                1000,
                Type::int(1, false),
                expr(ExprKind::Index {
                    base: Box::new(ident("arr")),
                    index: Box::new(int(3)),
                }),
            )],
        ),
    ]
}

/// 3. A recursive `fibonacci(10)` assigned to `*(1000::*u8)` equals 55.
pub fn recursive_fibonacci() -> Vec<Statement> {
    let n_leq_1 = expr(ExprKind::Binary {
        op: BinOp::Leq,
        left: Box::new(ident("n")),
        right: Box::new(int(1)),
    });
    let n_minus = |k: i64| {
        expr(ExprKind::Binary {
            op: BinOp::Sub,
            left: Box::new(ident("n")),
            right: Box::new(int(k)),
        })
    };
    let body = vec![
        stmt(StatementKind::If {
            condition: n_leq_1,
            then_branch: vec![stmt(StatementKind::Return(Some(ident("n"))))],
            else_branch: None,
        }),
        stmt(StatementKind::Return(Some(expr(ExprKind::Binary {
            op: BinOp::Add,
            left: Box::new(call("fibonacci", vec![n_minus(1)])),
            right: Box::new(call("fibonacci", vec![n_minus(2)])),
        })))),
    ];

    vec![
        function("fibonacci", vec![("n".to_string(), Type::int(1, false))], Type::int(1, false), false, body),
        function(
            "main",
            vec![],
            Type::Void,
            false,
            vec![store_at(1000, Type::int(1, false), call("fibonacci", vec![int(10)]))],
        ),
    ]
}

/// Build `(1 + (1 + (1 + ... 1 ...)))`, `depth` additions deep.
fn nested_additions(depth: u32) -> Expr {
    if depth == 0 {
        int(1)
    } else {
        expr(ExprKind::Binary {
            op: BinOp::Add,
            left: Box::new(int(1)),
            right: Box::new(nested_additions(depth - 1)),
        })
    }
}

/// 4. A 50-deep nested expression forces register spilling; result equals 50.
pub fn deep_expression_spills() -> Vec<Statement> {
    vec![function(
        "main",
        vec![],
        Type::Void,
        false,
        vec![store_at(1000, Type::int(1, false), nested_additions(49))],
    )]
}

/// 5. A function with 50 `u8` parameters summed and returned equals
/// `sum(range(50))`.
pub fn fifty_parameter_sum() -> Vec<Statement> {
    let params: Vec<(String, Type)> = (0..50).map(|i| (format!("p{}", i), Type::int(1, false))).collect();
    let widen = |i: usize| {
        expr(ExprKind::Cast {
            kind: CastKind::Resize,
            to: Type::int(4, false),
            operand: Box::new(ident(&format!("p{}", i))),
        })
    };
    let mut sum = widen(0);
    for i in 1..50 {
        sum = expr(ExprKind::Binary {
            op: BinOp::Add,
            left: Box::new(sum),
            right: Box::new(widen(i)),
        });
    }

    let body = vec![stmt(StatementKind::Return(Some(sum)))];
    let args: Vec<Expr> = (0..50).map(|i| int(i as i64)).collect();

    vec![
        function("sum50", params, Type::int(4, false), false, body),
        function(
            "main",
            vec![],
            Type::Void,
            false,
            vec![store_at(1000, Type::int(4, false), call("sum50", args))],
        ),
    ]
}

/// 6. A varargs function reading its third argument via pointer arithmetic
/// over `var_args` yields the expected value.
pub fn varargs_third_argument() -> Vec<Statement> {
    let as_byte_ptr = expr(ExprKind::Cast {
        kind: CastKind::Reinterpret,
        to: Type::pointer(Type::int(1, false)),
        operand: Box::new(ident("var_args")),
    });
    let third = expr(ExprKind::Binary {
        op: BinOp::Add,
        left: Box::new(as_byte_ptr),
        right: Box::new(int(2)),
    });

    let body = vec![stmt(StatementKind::Return(Some(expr(ExprKind::Dereference(Box::new(third))))))];

    vec![
        function("third_arg", vec![("a".to_string(), Type::int(1, false))], Type::int(1, false), true, body),
        function(
            "main",
            vec![],
            Type::Void,
            false,
            vec![store_at(1000, Type::int(1, false), call("third_arg", vec![int(10), int(20), int(30)]))],
        ),
    ]
}

/// 7. `var x: [[u8]] = {{1,2},{123,4}}; fn main() { *(5000::*u8) = x[1][0]; }`:
/// yields 123, verifying inline storage of nested array literals.
pub fn nested_array_literal() -> Vec<Statement> {
    let row = |a: i64, b: i64| expr(ExprKind::ArrayLiteral(vec![int(a), int(b)]));
    vec![
        stmt(StatementKind::VariableDecl {
            name: "x".to_string(),
            ty: Some(Type::array(Type::array(Type::int(1, false), Some(2)), Some(2))),
            init: Some(expr(ExprKind::ArrayLiteral(vec![row(1, 2), row(123, 4)]))),
        }),
        function(
            "main",
            vec![],
            Type::Void,
            false,
            vec![store_at(
                5000,
                Type::int(1, false),
                expr(ExprKind::Index {
                    base: Box::new(expr(ExprKind::Index {
                        base: Box::new(ident("x")),
                        index: Box::new(int(1)),
                    })),
                    index: Box::new(int(0)),
                }),
            )],
        ),
    ]
}

/// An inline `asm` block exercising the machine-instruction escape hatch
/// (spec §4.2, ASM block): not one of the numbered scenarios, but useful as
/// a CLI demo and a `--dump-hw` smoke test.
pub fn asm_block() -> Vec<Statement> {
    let body = vec![stmt(StatementKind::Asm {
        exprs: vec![int(7)],
        instrs: vec![AsmInstr {
            name: "Halt".to_string(),
            size: 2,
            params: vec![],
        }],
    })];
    vec![function("main", vec![], Type::Void, false, body)]
}

pub const NAMES: &[&str] = &[
    "byte-store",
    "array-index",
    "recursive-fibonacci",
    "deep-expression-spills",
    "fifty-parameter-sum",
    "varargs-third-argument",
    "nested-array-literal",
    "asm-block",
];

pub fn by_name(name: &str) -> Option<Vec<Statement>> {
    match name {
        "byte-store" => Some(byte_store()),
        "array-index" => Some(array_index()),
        "recursive-fibonacci" => Some(recursive_fibonacci()),
        "deep-expression-spills" => Some(deep_expression_spills()),
        "fifty-parameter-sum" => Some(fifty_parameter_sum()),
        "varargs-third-argument" => Some(varargs_third_argument()),
        "nested-array-literal" => Some(nested_array_literal()),
        "asm-block" => Some(asm_block()),
        _ => None,
    }
}
