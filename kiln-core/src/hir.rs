//! High-level intermediate representation (HIR).
//!
//! HIR is the typed, resolved form produced by the checker and consumed
//! by lowering. Names are replaced by symbol or local ids, compound
//! assignments are desugared and every expression carries its type.

use std::path::PathBuf;

use crate::ast::{BinaryOp, UnaryOp};
use crate::builtins::BuiltinKind;
use crate::name_resolve::SymbolId;
use crate::span::Span;
use crate::types::Type;

/// Index into `HirFunction::locals`. Parameters come first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LocalId(pub u32);

impl LocalId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct HirLocal {
    pub name: String,
    pub ty: Type,
}

/// A checked function body.
#[derive(Debug, Clone, PartialEq)]
pub struct HirFunction {
    pub symbol: SymbolId,
    pub param_count: usize,
    /// Parameters followed by every `let` in the body, in declaration order.
    pub locals: Vec<HirLocal>,
    pub result: Type,
    pub body: Vec<HirStmt>,
}

/// Assignable places.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Place {
    Local(LocalId),
    Global(SymbolId),
}

#[derive(Debug, Clone, PartialEq)]
pub enum HirStmt {
    /// `init` is `None` for a declaration without initializer; the local
    /// is then reset to zero.
    Let {
        local: LocalId,
        init: Option<HirExpr>,
    },
    Assign {
        place: Place,
        value: HirExpr,
    },
    Expr(HirExpr),
    Return(Option<HirExpr>),
    Break,
    Continue,
    If {
        cond: HirExpr,
        then_body: Vec<HirStmt>,
        else_body: Vec<HirStmt>,
    },
    While {
        cond: HirExpr,
        body: Vec<HirStmt>,
    },
    Block(Vec<HirStmt>),
}

/// Expression node in HIR. Every node carries its `Type` and `Span`.
#[derive(Debug, Clone, PartialEq)]
pub struct HirExpr {
    pub kind: HirExprKind,
    pub ty: Type,
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq)]
pub enum HirExprKind {
    I32(i32),
    I64(i64),
    F32(f32),
    F64(f64),
    Bool(bool),

    Local(LocalId),
    Global(SymbolId),

    /// Call of a user function or a foreign import.
    Call {
        callee: SymbolId,
        args: Vec<HirExpr>,
    },
    Builtin {
        kind: BuiltinKind,
        args: Vec<HirExpr>,
    },

    Unary {
        op: UnaryOp,
        operand: Box<HirExpr>,
    },
    /// Both operands have the same type; for comparisons the node's type
    /// is `bool`.
    Binary {
        op: BinaryOp,
        lhs: Box<HirExpr>,
        rhs: Box<HirExpr>,
    },
    /// Conversion to the node's type.
    Cast(Box<HirExpr>),

    /// Absolute or working-directory-relative path of the embedded file.
    FileContents(PathBuf),

    /// Placeholder for an expression that failed to check.
    Error,
}

impl HirExpr {
    pub fn error(span: Span) -> HirExpr {
        HirExpr {
            kind: HirExprKind::Error,
            ty: Type::Error,
            span,
        }
    }

    /// Calls every symbol this expression refers to, in evaluation order.
    pub fn visit_symbols(&self, f: &mut impl FnMut(SymbolId)) {
        match &self.kind {
            HirExprKind::Global(id) => f(*id),
            HirExprKind::Call { callee, args } => {
                f(*callee);
                args.iter().for_each(|arg| arg.visit_symbols(f));
            }
            HirExprKind::Builtin { args, .. } => args.iter().for_each(|arg| arg.visit_symbols(f)),
            HirExprKind::Unary { operand, .. } => operand.visit_symbols(f),
            HirExprKind::Binary { lhs, rhs, .. } => {
                lhs.visit_symbols(f);
                rhs.visit_symbols(f);
            }
            HirExprKind::Cast(operand) => operand.visit_symbols(f),
            HirExprKind::I32(_)
            | HirExprKind::I64(_)
            | HirExprKind::F32(_)
            | HirExprKind::F64(_)
            | HirExprKind::Bool(_)
            | HirExprKind::Local(_)
            | HirExprKind::FileContents(_)
            | HirExprKind::Error => {}
        }
    }
}

impl HirStmt {
    pub fn visit_symbols(&self, f: &mut impl FnMut(SymbolId)) {
        match self {
            HirStmt::Let { init, .. } => {
                if let Some(init) = init {
                    init.visit_symbols(f);
                }
            }
            HirStmt::Assign { place, value } => {
                if let Place::Global(id) = place {
                    f(*id);
                }
                value.visit_symbols(f);
            }
            HirStmt::Expr(expr) => expr.visit_symbols(f),
            HirStmt::Return(value) => {
                if let Some(value) = value {
                    value.visit_symbols(f);
                }
            }
            HirStmt::Break | HirStmt::Continue => {}
            HirStmt::If {
                cond,
                then_body,
                else_body,
            } => {
                cond.visit_symbols(f);
                then_body.iter().for_each(|stmt| stmt.visit_symbols(f));
                else_body.iter().for_each(|stmt| stmt.visit_symbols(f));
            }
            HirStmt::While { cond, body } => {
                cond.visit_symbols(f);
                body.iter().for_each(|stmt| stmt.visit_symbols(f));
            }
            HirStmt::Block(body) => body.iter().for_each(|stmt| stmt.visit_symbols(f)),
        }
    }
}
