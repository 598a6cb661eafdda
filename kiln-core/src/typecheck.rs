//! Type checking: AST to HIR.
//!
//! The checker is bidirectional. Each expression is checked against an
//! optional expected type, which lets integer and float literals adopt
//! the numeric type their context wants. There are no other implicit
//! conversions.
//!
//! Program-level names are reached through [`ProgramScope`]. Function
//! bodies are checked against a [`FrozenScope`], a read-only view that can
//! be shared across worker threads. Global initializers are checked
//! through a [`GlobalScope`], which infers the types of referenced
//! globals on demand and detects cyclic definitions.

use std::path::PathBuf;

use crate::ast::{self, BinaryOp, ExprKind, StmtKind, UnaryOp};
use crate::diagnostic::Diagnostic;
use crate::hir::{HirExpr, HirExprKind, HirFunction, HirLocal, HirStmt, LocalId, Place};
use crate::name_resolve::{SymbolId, SymbolKind, SymbolTable, resolve_type, resolve_value_type};
use crate::registry::UnitRegistry;
use crate::span::Span;
use crate::types::{FunctionSig, Type};

#[derive(Debug, Clone)]
pub struct CheckOptions {
    pub allow_file_contents: bool,
    /// Base directory for units that are not files.
    pub working_dir: PathBuf,
}

/// Access to program-level symbols while checking.
pub trait ProgramScope {
    fn table(&self) -> &SymbolTable;

    /// Type of the global `id`, referenced at `span`.
    fn global_type(&mut self, id: SymbolId, span: Span, diagnostics: &mut Vec<Diagnostic>)
    -> Type;
}

/// Read-only scope used once every global has been typed.
pub struct FrozenScope<'a> {
    table: &'a SymbolTable,
}

impl<'a> FrozenScope<'a> {
    pub fn new(table: &'a SymbolTable) -> Self {
        FrozenScope { table }
    }
}

impl ProgramScope for FrozenScope<'_> {
    fn table(&self) -> &SymbolTable {
        self.table
    }

    fn global_type(&mut self, id: SymbolId, _span: Span, _: &mut Vec<Diagnostic>) -> Type {
        self.table
            .get(id)
            .global()
            .and_then(|info| info.ty)
            .unwrap_or(Type::Error)
    }
}

/// Scope that types global initializers, recursing into the globals
/// they reference.
pub struct GlobalScope<'a> {
    table: &'a mut SymbolTable,
    registry: &'a UnitRegistry,
    options: &'a CheckOptions,
    in_progress: Vec<SymbolId>,
}

impl<'a> GlobalScope<'a> {
    pub fn new(
        table: &'a mut SymbolTable,
        registry: &'a UnitRegistry,
        options: &'a CheckOptions,
    ) -> Self {
        GlobalScope {
            table,
            registry,
            options,
            in_progress: Vec::new(),
        }
    }

    /// Check the initializer of `id` and record its type and HIR.
    pub fn resolve(&mut self, id: SymbolId, diagnostics: &mut Vec<Diagnostic>) -> Type {
        self.infer(id, None, diagnostics)
    }

    fn infer(
        &mut self,
        id: SymbolId,
        reference: Option<Span>,
        diagnostics: &mut Vec<Diagnostic>,
    ) -> Type {
        let symbol = self.table.get(id);
        let Some(info) = symbol.global() else {
            return Type::Error;
        };
        if let Some(ty) = info.ty {
            return ty;
        }
        if self.in_progress.contains(&id) {
            if let Some(span) = reference {
                diagnostics.push(
                    Diagnostic::error(
                        format!("cyclic definition: `{}` depends on itself", symbol.name),
                        span,
                    )
                    .with_code("E0305"),
                );
            }
            return Type::Error;
        }

        let declared = info.declared;
        let registry = self.registry;
        let options = self.options;
        let Some(site) = symbol.site else {
            return Type::Error;
        };
        let Some(decl) = registry.global_decl(site) else {
            return Type::Error;
        };
        let base_dir = registry.get(site.unit).base_dir(&options.working_dir);

        self.in_progress.push(id);
        let (init, nested) = {
            let mut checker = TypeChecker::new(self, options, base_dir);
            let init = match declared {
                Some(ty) => checker.check_expr_as(&decl.init, ty),
                None => checker.check_expr(&decl.init, None),
            };
            (init, checker.diagnostics)
        };
        self.in_progress.pop();
        diagnostics.extend(nested);

        let mut ty = declared.unwrap_or(init.ty);
        if ty == Type::Void {
            diagnostics.push(
                Diagnostic::error(
                    format!("`{}` cannot be initialized with a `void` value", decl.name.name),
                    decl.init.span,
                )
                .with_code("E0204"),
            );
            ty = Type::Error;
        }

        if let SymbolKind::Global(info) = &mut self.table.get_mut(id).kind {
            info.ty = Some(ty);
            info.init = Some(init);
        }
        ty
    }
}

impl ProgramScope for GlobalScope<'_> {
    fn table(&self) -> &SymbolTable {
        self.table
    }

    fn global_type(
        &mut self,
        id: SymbolId,
        span: Span,
        diagnostics: &mut Vec<Diagnostic>,
    ) -> Type {
        self.infer(id, Some(span), diagnostics)
    }
}

/// Check one function body.
pub fn check_function<'s>(
    scope: &'s mut dyn ProgramScope,
    options: &'s CheckOptions,
    base_dir: PathBuf,
    symbol: SymbolId,
    decl: &ast::FunctionDecl,
) -> (HirFunction, Vec<Diagnostic>) {
    let sig = scope
        .table()
        .get(symbol)
        .signature()
        .unwrap_or_else(|| FunctionSig::new(Vec::new(), Type::Error));

    let mut checker = TypeChecker::new(scope, options, base_dir);
    checker.result = sig.result;
    checker.push_scope();
    for (param, ty) in decl.sig.params.iter().zip(&sig.params) {
        if checker.lookup_in_innermost(&param.name.name) {
            checker.diagnostics.push(
                Diagnostic::error(
                    format!("parameter `{}` is declared more than once", param.name.name),
                    param.name.span,
                )
                .with_code("E0206"),
            );
        }
        checker.declare_local(&param.name.name, *ty);
    }

    let (body, diverges) = checker.check_block(&decl.body);
    if !diverges && !matches!(sig.result, Type::Void | Type::Error) {
        checker.diagnostics.push(
            Diagnostic::error(
                format!(
                    "missing return: `{}` must return a `{}` on every path",
                    decl.name.name, sig.result
                ),
                decl.name.span,
            )
            .with_code("E0304"),
        );
    }
    checker.pop_scope();

    let function = HirFunction {
        symbol,
        param_count: sig.params.len(),
        locals: checker.locals,
        result: sig.result,
        body,
    };
    (function, checker.diagnostics)
}

/// Core type checker.
pub struct TypeChecker<'s> {
    scope: &'s mut dyn ProgramScope,
    options: &'s CheckOptions,
    base_dir: PathBuf,
    locals: Vec<HirLocal>,
    scopes: Vec<Vec<(String, LocalId)>>,
    loop_depth: u32,
    result: Type,
    pub diagnostics: Vec<Diagnostic>,
}

impl<'s> TypeChecker<'s> {
    pub fn new(scope: &'s mut dyn ProgramScope, options: &'s CheckOptions, base_dir: PathBuf) -> Self {
        TypeChecker {
            scope,
            options,
            base_dir,
            locals: Vec::new(),
            scopes: Vec::new(),
            loop_depth: 0,
            result: Type::Void,
            diagnostics: Vec::new(),
        }
    }

    fn error(&mut self, message: impl Into<String>, span: Span, code: &'static str) {
        self.diagnostics
            .push(Diagnostic::error(message, span).with_code(code));
    }

    // -----------------------------------------------------------------
    // Locals
    // -----------------------------------------------------------------

    fn push_scope(&mut self) {
        self.scopes.push(Vec::new());
    }

    fn pop_scope(&mut self) {
        self.scopes.pop();
    }

    fn declare_local(&mut self, name: &str, ty: Type) -> LocalId {
        let id = LocalId(self.locals.len() as u32);
        self.locals.push(HirLocal {
            name: name.to_string(),
            ty,
        });
        if let Some(scope) = self.scopes.last_mut() {
            scope.push((name.to_string(), id));
        }
        id
    }

    fn lookup_local(&self, name: &str) -> Option<LocalId> {
        self.scopes
            .iter()
            .rev()
            .flat_map(|scope| scope.iter().rev())
            .find(|(local, _)| local == name)
            .map(|(_, id)| *id)
    }

    fn lookup_in_innermost(&self, name: &str) -> bool {
        self.scopes
            .last()
            .is_some_and(|scope| scope.iter().any(|(local, _)| local == name))
    }

    // -----------------------------------------------------------------
    // Statements
    // -----------------------------------------------------------------

    /// Returns the checked statements and whether the block always
    /// leaves through `return`, `break`, `continue` or a trap.
    fn check_block(&mut self, block: &ast::Block) -> (Vec<HirStmt>, bool) {
        self.push_scope();
        let mut out = Vec::with_capacity(block.stmts.len());
        let mut diverges = false;
        let mut warned = false;
        for stmt in &block.stmts {
            if diverges && !warned {
                self.diagnostics.push(
                    Diagnostic::warning("unreachable code", stmt.span).with_code("W0301"),
                );
                warned = true;
            }
            let (hir, stmt_diverges) = self.check_stmt(stmt);
            out.push(hir);
            diverges |= stmt_diverges;
        }
        self.pop_scope();
        (out, diverges)
    }

    fn check_stmt(&mut self, stmt: &ast::Stmt) -> (HirStmt, bool) {
        match &stmt.kind {
            StmtKind::Local { name, ty, init } => {
                let (ty, init) = self.check_local(name, ty.as_ref(), init.as_ref());
                let local = self.declare_local(&name.name, ty);
                (HirStmt::Let { local, init }, false)
            }
            StmtKind::Assign { target, op, value } => {
                (self.check_assign(target, *op, value, stmt.span), false)
            }
            StmtKind::Return(value) => (self.check_return(value.as_ref(), stmt.span), true),
            StmtKind::Break | StmtKind::Continue => {
                let is_break = matches!(stmt.kind, StmtKind::Break);
                if self.loop_depth == 0 {
                    let keyword = if is_break { "break" } else { "continue" };
                    self.error(
                        format!("`{keyword}` outside of a loop"),
                        stmt.span,
                        "E0306",
                    );
                }
                let hir = if is_break {
                    HirStmt::Break
                } else {
                    HirStmt::Continue
                };
                (hir, true)
            }
            StmtKind::If {
                cond,
                then_block,
                else_branch,
            } => {
                let cond = self.check_expr_as(cond, Type::Bool);
                let (then_body, then_diverges) = self.check_block(then_block);
                let (else_body, else_diverges) = match else_branch {
                    Some(branch) => {
                        let (hir, diverges) = self.check_stmt(branch);
                        (vec![hir], diverges)
                    }
                    None => (Vec::new(), false),
                };
                let hir = HirStmt::If {
                    cond,
                    then_body,
                    else_body,
                };
                (hir, then_diverges && else_diverges)
            }
            StmtKind::While { cond, body } => {
                let cond = self.check_expr_as(cond, Type::Bool);
                self.loop_depth += 1;
                let (body, _) = self.check_block(body);
                self.loop_depth -= 1;
                (HirStmt::While { cond, body }, false)
            }
            StmtKind::Block(block) => {
                let (body, diverges) = self.check_block(block);
                (HirStmt::Block(body), diverges)
            }
            StmtKind::Expr(expr) => {
                let expr = self.check_expr(expr, None);
                let diverges = matches!(
                    &expr.kind,
                    HirExprKind::Builtin { kind, .. } if kind.diverges()
                );
                (HirStmt::Expr(expr), diverges)
            }
        }
    }

    fn check_local(
        &mut self,
        name: &ast::Ident,
        ty: Option<&ast::TypeExpr>,
        init: Option<&ast::Expr>,
    ) -> (Type, Option<HirExpr>) {
        let declared = ty.map(|ty| resolve_value_type(ty, "a local", &mut self.diagnostics));
        match (declared, init) {
            (Some(ty), Some(init)) => (ty, Some(self.check_expr_as(init, ty))),
            (Some(ty), None) => (ty, None),
            (None, Some(init)) => {
                let init = self.check_expr(init, None);
                if init.ty == Type::Void {
                    self.error(
                        format!("`{}` cannot hold a `void` value", name.name),
                        init.span,
                        "E0204",
                    );
                    return (Type::Error, Some(init));
                }
                (init.ty, Some(init))
            }
            (None, None) => (Type::Error, None),
        }
    }

    fn check_assign(
        &mut self,
        target: &ast::Ident,
        op: Option<BinaryOp>,
        value: &ast::Expr,
        span: Span,
    ) -> HirStmt {
        let Some((place, place_ty)) = self.resolve_place(target) else {
            let value = self.check_expr(value, None);
            return HirStmt::Expr(HirExpr::error(value.span));
        };

        let value = match op {
            None => self.check_expr_as(value, place_ty),
            Some(op) => {
                let current = HirExpr {
                    kind: match place {
                        Place::Local(id) => HirExprKind::Local(id),
                        Place::Global(id) => HirExprKind::Global(id),
                    },
                    ty: place_ty,
                    span: target.span,
                };
                let rhs = self.check_expr_as(value, place_ty);
                self.check_arithmetic(op, current, rhs, span)
            }
        };
        HirStmt::Assign { place, value }
    }

    fn resolve_place(&mut self, target: &ast::Ident) -> Option<(Place, Type)> {
        if let Some(local) = self.lookup_local(&target.name) {
            return Some((Place::Local(local), self.locals[local.index()].ty));
        }
        let Some(id) = self.scope.table().lookup(&target.name) else {
            self.error(
                format!("cannot find `{}` in this scope", target.name),
                target.span,
                "E0201",
            );
            return None;
        };
        let symbol = self.scope.table().get(id);
        let assignable = symbol.global().is_some_and(|info| info.mutable);
        if !assignable {
            let what = symbol.kind.describe();
            self.error(
                format!("cannot assign to {what} `{}`", target.name),
                target.span,
                "E0309",
            );
            return None;
        }
        let ty = self
            .scope
            .global_type(id, target.span, &mut self.diagnostics);
        Some((Place::Global(id), ty))
    }

    fn check_return(&mut self, value: Option<&ast::Expr>, span: Span) -> HirStmt {
        match (value, self.result) {
            (Some(value), Type::Void) => {
                let value = self.check_expr(value, None);
                self.error(
                    "this function returns `void` but a value was returned",
                    value.span,
                    "E0301",
                );
                HirStmt::Return(Some(value))
            }
            (Some(value), result) => HirStmt::Return(Some(self.check_expr_as(value, result))),
            (None, Type::Void | Type::Error) => HirStmt::Return(None),
            (None, result) => {
                self.error(
                    format!("expected a return value of type `{result}`"),
                    span,
                    "E0301",
                );
                HirStmt::Return(None)
            }
        }
    }

    // -----------------------------------------------------------------
    // Expressions
    // -----------------------------------------------------------------

    /// Check `expr` and report a mismatch if it is not of type `ty`.
    pub fn check_expr_as(&mut self, expr: &ast::Expr, ty: Type) -> HirExpr {
        let hir = self.check_expr(expr, Some(ty));
        if !hir.ty.compatible(ty) {
            self.error(
                format!("mismatched types: expected `{ty}`, found `{}`", hir.ty),
                hir.span,
                "E0301",
            );
        }
        hir
    }

    pub fn check_expr(&mut self, expr: &ast::Expr, expected: Option<Type>) -> HirExpr {
        let span = expr.span;
        match &expr.kind {
            ExprKind::Int(value) => self.int_literal(*value, false, expected, span),
            ExprKind::Float(value) => float_literal(*value, expected, span),
            ExprKind::Bool(value) => HirExpr {
                kind: HirExprKind::Bool(*value),
                ty: Type::Bool,
                span,
            },
            ExprKind::Name(ident) => self.check_name(ident),
            ExprKind::Call { callee, args } => self.check_call(callee, args, span),
            ExprKind::Unary { op, operand } => self.check_unary(*op, operand, expected, span),
            ExprKind::Binary { op, lhs, rhs } => self.check_binary(*op, lhs, rhs, expected, span),
            ExprKind::Cast { ty, operand } => self.check_cast(ty, operand, span),
            ExprKind::FileContents(path) => {
                if !self.options.allow_file_contents {
                    self.error("`#file_contents` is disabled", span, "E0310");
                    return HirExpr::error(span);
                }
                HirExpr {
                    kind: HirExprKind::FileContents(self.base_dir.join(path)),
                    ty: Type::I32,
                    span,
                }
            }
        }
    }

    fn int_literal(
        &mut self,
        value: u64,
        negative: bool,
        expected: Option<Type>,
        span: Span,
    ) -> HirExpr {
        let ty = expected.filter(|ty| ty.is_numeric()).unwrap_or(Type::I32);
        let signed = if negative {
            -(value as i128)
        } else {
            value as i128
        };
        let kind = match ty {
            Type::I32 => i32::try_from(signed).ok().map(HirExprKind::I32),
            Type::I64 => i64::try_from(signed).ok().map(HirExprKind::I64),
            Type::F32 => Some(HirExprKind::F32(signed as f32)),
            _ => Some(HirExprKind::F64(signed as f64)),
        };
        match kind {
            Some(kind) => HirExpr { kind, ty, span },
            None => {
                self.error(
                    format!("integer literal does not fit in `{ty}`"),
                    span,
                    "E0311",
                );
                HirExpr::error(span)
            }
        }
    }

    fn check_name(&mut self, ident: &ast::Ident) -> HirExpr {
        let span = ident.span;
        if let Some(local) = self.lookup_local(&ident.name) {
            return HirExpr {
                kind: HirExprKind::Local(local),
                ty: self.locals[local.index()].ty,
                span,
            };
        }
        let Some(id) = self.scope.table().lookup(&ident.name) else {
            self.error(
                format!("cannot find `{}` in this scope", ident.name),
                span,
                "E0201",
            );
            return HirExpr::error(span);
        };
        let symbol = self.scope.table().get(id);
        if symbol.global().is_none() {
            let what = symbol.kind.describe();
            self.error(
                format!("`{}` is a {what} and cannot be used as a value", ident.name),
                span,
                "E0303",
            );
            return HirExpr::error(span);
        }
        let ty = self.scope.global_type(id, span, &mut self.diagnostics);
        HirExpr {
            kind: HirExprKind::Global(id),
            ty,
            span,
        }
    }

    fn check_call(&mut self, callee: &ast::Ident, args: &[ast::Expr], span: Span) -> HirExpr {
        let target = if self.lookup_local(&callee.name).is_some() {
            Err(Diagnostic::error(
                format!("`{}` is a local variable, not a function", callee.name),
                callee.span,
            )
            .with_code("E0303"))
        } else {
            match self.scope.table().lookup(&callee.name) {
                None => Err(Diagnostic::error(
                    format!("cannot find function `{}` in this scope", callee.name),
                    callee.span,
                )
                .with_code("E0201")),
                Some(id) => {
                    let symbol = self.scope.table().get(id);
                    match symbol.signature() {
                        Some(sig) => {
                            let builtin = match symbol.kind {
                                SymbolKind::Builtin(kind) => Some(kind),
                                _ => None,
                            };
                            Ok((id, sig, builtin))
                        }
                        None => Err(Diagnostic::error(
                            format!(
                                "`{}` is a {}, not a function",
                                callee.name,
                                symbol.kind.describe()
                            ),
                            callee.span,
                        )
                        .with_code("E0303")),
                    }
                }
            }
        };

        let (id, sig, builtin) = match target {
            Ok(target) => target,
            Err(diagnostic) => {
                self.diagnostics.push(diagnostic);
                for arg in args {
                    self.check_expr(arg, None);
                }
                return HirExpr::error(span);
            }
        };

        if args.len() != sig.params.len() {
            let plural = if sig.params.len() == 1 { "" } else { "s" };
            self.error(
                format!(
                    "`{}` takes {} argument{plural} but {} were supplied",
                    callee.name,
                    sig.params.len(),
                    args.len()
                ),
                span,
                "E0302",
            );
        }

        let mut checked = Vec::with_capacity(args.len());
        for (index, arg) in args.iter().enumerate() {
            let hir = match sig.params.get(index) {
                Some(ty) => self.check_expr_as(arg, *ty),
                None => self.check_expr(arg, None),
            };
            checked.push(hir);
        }

        let kind = match builtin {
            Some(kind) => HirExprKind::Builtin {
                kind,
                args: checked,
            },
            None => HirExprKind::Call {
                callee: id,
                args: checked,
            },
        };
        HirExpr {
            kind,
            ty: sig.result,
            span,
        }
    }

    fn check_unary(
        &mut self,
        op: UnaryOp,
        operand: &ast::Expr,
        expected: Option<Type>,
        span: Span,
    ) -> HirExpr {
        match (op, &operand.kind) {
            (UnaryOp::Neg, ExprKind::Int(value)) => {
                return self.int_literal(*value, true, expected, span);
            }
            (UnaryOp::Neg, ExprKind::Float(value)) => {
                return float_literal(-*value, expected, span);
            }
            _ => {}
        }

        let (operand, ok) = match op {
            UnaryOp::Not => (self.check_expr_as(operand, Type::Bool), true),
            UnaryOp::Neg => {
                let operand = self.check_expr(operand, expected.filter(|ty| ty.is_numeric()));
                let ok = operand.ty.is_numeric() || operand.ty.is_error();
                (operand, ok)
            }
            UnaryOp::BitNot => {
                let operand = self.check_expr(operand, expected.filter(|ty| ty.is_integer()));
                let ok = operand.ty.is_integer() || operand.ty.is_error();
                (operand, ok)
            }
        };
        if !ok {
            let symbol = match op {
                UnaryOp::Neg => "-",
                UnaryOp::Not => "!",
                UnaryOp::BitNot => "~",
            };
            self.error(
                format!("operator `{symbol}` cannot be applied to `{}`", operand.ty),
                operand.span,
                "E0307",
            );
            return HirExpr::error(span);
        }

        let ty = if op == UnaryOp::Not {
            Type::Bool
        } else {
            operand.ty
        };
        HirExpr {
            kind: HirExprKind::Unary {
                op,
                operand: Box::new(operand),
            },
            ty,
            span,
        }
    }

    fn check_binary(
        &mut self,
        op: BinaryOp,
        lhs: &ast::Expr,
        rhs: &ast::Expr,
        expected: Option<Type>,
        span: Span,
    ) -> HirExpr {
        if op.is_logical() {
            let lhs = self.check_expr_as(lhs, Type::Bool);
            let rhs = self.check_expr_as(rhs, Type::Bool);
            return binary(op, lhs, rhs, Type::Bool, span);
        }

        if op.is_comparison() {
            let (lhs, rhs) = self.check_operands(lhs, rhs, None);
            if !lhs.ty.compatible(rhs.ty) {
                self.mismatched_operands(op, &lhs, &rhs, span);
                return HirExpr::error(span);
            }
            let operand_ty = operand_type(&lhs, &rhs);
            let equality = matches!(op, BinaryOp::Eq | BinaryOp::Ne);
            let ok = operand_ty.is_numeric()
                || operand_ty.is_error()
                || (equality && operand_ty == Type::Bool);
            if !ok {
                self.invalid_operator(op, operand_ty, span);
                return HirExpr::error(span);
            }
            return binary(op, lhs, rhs, Type::Bool, span);
        }

        let hint = expected.filter(|ty| ty.is_numeric());
        let (lhs, rhs) = self.check_operands(lhs, rhs, hint);
        self.check_arithmetic(op, lhs, rhs, span)
    }

    /// Check the operands of an arithmetic or bitwise operator that have
    /// already been typed individually.
    fn check_arithmetic(&mut self, op: BinaryOp, lhs: HirExpr, rhs: HirExpr, span: Span) -> HirExpr {
        if !lhs.ty.compatible(rhs.ty) {
            self.mismatched_operands(op, &lhs, &rhs, span);
            return HirExpr::error(span);
        }
        let ty = operand_type(&lhs, &rhs);
        let integer_only = op.is_bitwise() || op == BinaryOp::Rem;
        let ok = ty.is_error() || if integer_only { ty.is_integer() } else { ty.is_numeric() };
        if !ok {
            self.invalid_operator(op, ty, span);
            return HirExpr::error(span);
        }
        binary(op, lhs, rhs, ty, span)
    }

    /// Check both operands so that a literal on either side adopts the
    /// other side's type.
    fn check_operands(
        &mut self,
        lhs: &ast::Expr,
        rhs: &ast::Expr,
        hint: Option<Type>,
    ) -> (HirExpr, HirExpr) {
        if lhs.is_literal() && !rhs.is_literal() {
            let rhs = self.check_expr(rhs, hint);
            let lhs = self.check_expr(lhs, numeric(rhs.ty).or(hint));
            (lhs, rhs)
        } else {
            let lhs = self.check_expr(lhs, hint);
            let rhs = self.check_expr(rhs, numeric(lhs.ty).or(hint));
            (lhs, rhs)
        }
    }

    fn mismatched_operands(&mut self, op: BinaryOp, lhs: &HirExpr, rhs: &HirExpr, span: Span) {
        self.error(
            format!(
                "mismatched types: `{}` {} `{}`",
                lhs.ty,
                op.symbol(),
                rhs.ty
            ),
            span,
            "E0301",
        );
    }

    fn invalid_operator(&mut self, op: BinaryOp, ty: Type, span: Span) {
        self.error(
            format!("operator `{}` cannot be applied to `{ty}`", op.symbol()),
            span,
            "E0307",
        );
    }

    fn check_cast(&mut self, ty: &ast::TypeExpr, operand: &ast::Expr, span: Span) -> HirExpr {
        let target = resolve_type(ty, &mut self.diagnostics);
        let hint = if operand.is_literal() {
            numeric(target)
        } else {
            None
        };
        let operand = self.check_expr(operand, hint);
        if target == Type::Void || !operand.ty.can_cast_to(target) {
            self.error(
                format!("cannot cast `{}` to `{target}`", operand.ty),
                span,
                "E0308",
            );
            return HirExpr::error(span);
        }
        if operand.ty == target {
            return HirExpr { span, ..operand };
        }
        HirExpr {
            kind: HirExprKind::Cast(Box::new(operand)),
            ty: target,
            span,
        }
    }
}

fn float_literal(value: f64, expected: Option<Type>, span: Span) -> HirExpr {
    if expected == Some(Type::F32) {
        return HirExpr {
            kind: HirExprKind::F32(value as f32),
            ty: Type::F32,
            span,
        };
    }
    HirExpr {
        kind: HirExprKind::F64(value),
        ty: Type::F64,
        span,
    }
}

fn numeric(ty: Type) -> Option<Type> {
    ty.is_numeric().then_some(ty)
}

/// The operand type of a well-typed binary expression, skipping a poisoned side.
fn operand_type(lhs: &HirExpr, rhs: &HirExpr) -> Type {
    if lhs.ty.is_error() { rhs.ty } else { lhs.ty }
}

fn binary(op: BinaryOp, lhs: HirExpr, rhs: HirExpr, ty: Type, span: Span) -> HirExpr {
    HirExpr {
        kind: HirExprKind::Binary {
            op,
            lhs: Box::new(lhs),
            rhs: Box::new(rhs),
        },
        ty,
        span,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::name_resolve::{DeclareOptions, declare_module};
    use crate::parser::{ParseOptions, parse};
    use crate::span::UnitId;

    struct Checked {
        functions: Vec<HirFunction>,
        diagnostics: Vec<Diagnostic>,
        table: SymbolTable,
    }

    fn options() -> CheckOptions {
        CheckOptions {
            allow_file_contents: true,
            working_dir: PathBuf::from("."),
        }
    }

    fn check(source: &str) -> Checked {
        check_with(source, options())
    }

    fn check_with(source: &str, options: CheckOptions) -> Checked {
        let mut registry = UnitRegistry::new();
        let unit = registry.register_injected(source.to_string());
        let parsed = parse(unit, source, ParseOptions::default());
        assert!(parsed.diagnostics.is_empty(), "{:?}", parsed.diagnostics);
        registry.get_mut(unit).module = Some(parsed.module);

        let mut table = SymbolTable::with_builtins();
        let module = registry.get(unit).module.as_ref().unwrap();
        let declared = declare_module(&mut table, unit, module, DeclareOptions::default());
        let mut diagnostics = declared.diagnostics;

        let mut scope = GlobalScope::new(&mut table, &registry, &options);
        for id in &declared.globals {
            scope.resolve(*id, &mut diagnostics);
        }

        let mut functions = Vec::new();
        for id in declared.functions {
            let site = table.get(id).site.unwrap();
            let decl = registry.function_decl(site).unwrap();
            let mut frozen = FrozenScope::new(&table);
            let (function, found) =
                check_function(&mut frozen, &options, PathBuf::from("."), id, decl);
            functions.push(function);
            diagnostics.extend(found);
        }

        Checked {
            functions,
            diagnostics,
            table,
        }
    }

    fn codes(checked: &Checked) -> Vec<&'static str> {
        checked
            .diagnostics
            .iter()
            .map(|d| d.code.unwrap_or("-"))
            .collect()
    }

    #[test]
    fn accepts_well_typed_program() {
        let checked = check(
            "LIMIT :: 10;\n\
             total: i64 = 0;\n\
             sum :: (n: i32) -> i64 {\n\
               i := 0;\n\
               while i < n && i < LIMIT {\n\
                 total += cast(i64) i;\n\
                 i = i + 1;\n\
               }\n\
               return total * 2;\n\
             }\n\
             half :: (x: f32) -> f32 { return x / 2; }",
        );
        assert!(checked.diagnostics.is_empty(), "{:?}", checked.diagnostics);
        let sum = &checked.functions[0];
        assert_eq!(sum.param_count, 1);
        assert_eq!(sum.locals.len(), 2);
        assert_eq!(sum.result, Type::I64);
    }

    #[test]
    fn literals_adopt_expected_type() {
        let checked = check("f :: () -> f32 { x: i64 = -9000000000; return 1.5; }");
        assert!(checked.diagnostics.is_empty(), "{:?}", checked.diagnostics);
        let HirStmt::Let { init: Some(init), .. } = &checked.functions[0].body[0] else {
            panic!("expected let");
        };
        assert_eq!(init.kind, HirExprKind::I64(-9_000_000_000));
        let HirStmt::Return(Some(value)) = &checked.functions[0].body[1] else {
            panic!("expected return");
        };
        assert_eq!(value.kind, HirExprKind::F32(1.5));
    }

    #[test]
    fn reports_unknown_name_at_reference() {
        let source = "main :: () -> i32 { return missing + 1; }";
        let checked = check(source);
        assert_eq!(codes(&checked), vec!["E0201"]);
        let span = checked.diagnostics[0].span.unwrap();
        assert_eq!(&source[span.start as usize..span.end as usize], "missing");
    }

    #[test]
    fn reports_type_mismatch_without_cascade() {
        let checked = check("f :: (a: i64) -> i32 { b := a; return b + 1; }");
        assert_eq!(codes(&checked), vec!["E0301"]);
    }

    #[test]
    fn reports_missing_return() {
        let checked = check("f :: (a: i32) -> i32 { if a > 0 { return 1; } }");
        assert_eq!(codes(&checked), vec!["E0304"]);

        let checked = check(
            "f :: (a: i32) -> i32 { if a > 0 { return 1; } else { trap(); } }",
        );
        assert!(checked.diagnostics.is_empty(), "{:?}", checked.diagnostics);
    }

    #[test]
    fn warns_about_unreachable_code_once() {
        let checked = check("f :: () -> i32 { return 1; g := 2; g = 3; }");
        assert_eq!(codes(&checked), vec!["W0301"]);
        assert!(!checked.diagnostics[0].is_fatal());
    }

    #[test]
    fn rejects_break_outside_loop() {
        let checked = check("f :: () { while true { continue; } break; }");
        assert_eq!(codes(&checked), vec!["E0306"]);
    }

    #[test]
    fn checks_calls() {
        let checked = check(
            "add :: (a: i32, b: i32) -> i32 { return a + b; }\n\
             f :: () -> f64 { x := add(1); return sqrt(2); }",
        );
        assert_eq!(codes(&checked), vec!["E0302"]);

        let checked = check("N :: 1;\nf :: () { N(); sqrt = 2.0; }");
        assert_eq!(codes(&checked), vec!["E0303", "E0309"]);
    }

    #[test]
    fn infers_globals_in_any_order() {
        let checked = check("A :: B * 2;\nB :: C + 1;\nC: i64 = 4;");
        assert!(checked.diagnostics.is_empty(), "{:?}", checked.diagnostics);
        let a = checked.table.get(checked.table.lookup("A").unwrap());
        assert_eq!(a.global().unwrap().ty, Some(Type::I64));
    }

    #[test]
    fn detects_cyclic_globals() {
        let checked = check("A :: B + 1;\nB :: A + 1;");
        assert_eq!(codes(&checked), vec!["E0305"]);
    }

    #[test]
    fn rejects_assignment_to_constant() {
        let checked = check("K :: 1;\nf :: () { K = 2; }");
        assert_eq!(codes(&checked), vec!["E0309"]);
    }

    #[test]
    fn file_contents_can_be_disabled() {
        let checked = check_with(
            "DATA :: #file_contents \"x.bin\";",
            CheckOptions {
                allow_file_contents: false,
                working_dir: PathBuf::from("."),
            },
        );
        assert_eq!(codes(&checked), vec!["E0310"]);
    }

    #[test]
    fn validates_operator_operands() {
        let checked = check("f :: (a: f64, b: bool) { x := a % 2.0; y := -b; z := b < b; }");
        assert_eq!(codes(&checked), vec!["E0307", "E0307", "E0307"]);
    }
}
