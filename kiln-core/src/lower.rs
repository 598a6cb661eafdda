//! Lowering from HIR to wasm instruction lists.
//!
//! Function and global references stay symbolic ([`Op::Call`],
//! [`Op::GlobalGet`], [`Op::GlobalSet`]) because the final index space is
//! only known once every unit has been lowered and dead code has been
//! removed. Emission resolves them.
//!
//! Global initializers are folded to constants here, and `#file_contents`
//! blobs are placed into the data layout.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use wasm_encoder::{BlockType, Instruction, ValType};

use crate::ast::{BinaryOp, UnaryOp};
use crate::builtins::BuiltinKind;
use crate::diagnostic::Diagnostic;
use crate::hir::{HirExpr, HirExprKind, HirFunction, HirStmt, Place};
use crate::name_resolve::{SymbolId, SymbolTable};
use crate::span::Span;
use crate::types::Type;

/// Wasm representation of a value type. `void` and the poison type have none.
pub fn val_type(ty: Type) -> Option<ValType> {
    match ty {
        Type::I32 | Type::Bool => Some(ValType::I32),
        Type::I64 => Some(ValType::I64),
        Type::F32 => Some(ValType::F32),
        Type::F64 => Some(ValType::F64),
        Type::Void | Type::Error => None,
    }
}

#[derive(Debug, Clone)]
pub enum Op {
    Plain(Instruction<'static>),
    Call(SymbolId),
    GlobalGet(SymbolId),
    GlobalSet(SymbolId),
}

#[derive(Debug, Clone)]
pub struct LoweredFunction {
    pub symbol: SymbolId,
    pub params: Vec<ValType>,
    pub result: Option<ValType>,
    /// Locals beyond the parameters.
    pub locals: Vec<ValType>,
    /// Body including the final `end`.
    pub body: Vec<Op>,
}

impl LoweredFunction {
    /// Symbols called by this function, in order of first use.
    pub fn callees(&self) -> impl Iterator<Item = SymbolId> + '_ {
        self.body.iter().filter_map(|op| match op {
            Op::Call(id) => Some(*id),
            _ => None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ConstValue {
    I32(i32),
    I64(i64),
    F32(f32),
    F64(f64),
}

impl ConstValue {
    pub fn instruction(self) -> Instruction<'static> {
        match self {
            ConstValue::I32(value) => Instruction::I32Const(value),
            ConstValue::I64(value) => Instruction::I64Const(value),
            ConstValue::F32(value) => Instruction::F32Const(value.into()),
            ConstValue::F64(value) => Instruction::F64Const(value.into()),
        }
    }

    pub fn val_type(self) -> ValType {
        match self {
            ConstValue::I32(_) => ValType::I32,
            ConstValue::I64(_) => ValType::I64,
            ConstValue::F32(_) => ValType::F32,
            ConstValue::F64(_) => ValType::F64,
        }
    }

    fn truthy(self) -> bool {
        !matches!(self, ConstValue::I32(0))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LoweredGlobal {
    pub symbol: SymbolId,
    pub val_type: ValType,
    pub mutable: bool,
    pub init: ConstValue,
}

// ---------------------------------------------------------------------
// Data layout
// ---------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataSegment {
    pub offset: u32,
    pub bytes: Vec<u8>,
}

/// Linear memory contents for `#file_contents` blobs.
///
/// Each blob is a little-endian `u32` length followed by the bytes,
/// aligned to 4. A file embedded twice is stored once.
#[derive(Debug, Clone)]
pub struct DataLayout {
    segments: Vec<DataSegment>,
    by_path: HashMap<PathBuf, u32>,
    next: u32,
}

impl Default for DataLayout {
    fn default() -> Self {
        DataLayout {
            segments: Vec::new(),
            by_path: HashMap::new(),
            next: DataLayout::START,
        }
    }
}

impl DataLayout {
    /// Address of the first blob. Address 0 stays unused.
    pub const START: u32 = 8;
    pub const PAGE_SIZE: u32 = 65536;

    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn segments(&self) -> &[DataSegment] {
        &self.segments
    }

    /// Memory pages needed to hold every blob, at least one.
    pub fn pages(&self) -> u64 {
        u64::from(self.next.div_ceil(Self::PAGE_SIZE).max(1))
    }

    /// Read `path` and place it in memory, returning the blob's address.
    pub fn embed(&mut self, path: &Path) -> std::io::Result<u32> {
        if let Some(address) = self.by_path.get(path) {
            return Ok(*address);
        }
        let bytes = fs::read(path)?;
        let length = u32::try_from(bytes.len()).map_err(|_| {
            std::io::Error::new(std::io::ErrorKind::InvalidData, "file is larger than 4 GiB")
        })?;

        let address = self.next.next_multiple_of(4);
        let mut blob = Vec::with_capacity(bytes.len() + 4);
        blob.extend_from_slice(&length.to_le_bytes());
        blob.extend_from_slice(&bytes);
        self.next = address + 4 + length;
        self.segments.push(DataSegment {
            offset: address,
            bytes: blob,
        });
        self.by_path.insert(path.to_path_buf(), address);
        Ok(address)
    }
}

fn embed_error(path: &Path, err: std::io::Error, span: Span) -> Diagnostic {
    Diagnostic::error(format!("cannot read `{}`: {err}", path.display()), span).with_code("E0403")
}

// ---------------------------------------------------------------------
// Functions
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default)]
pub struct LowerOptions {
    /// Float-to-int casts saturate instead of trapping.
    pub saturating_casts: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Label {
    Plain,
    LoopExit,
    LoopContinue,
}

struct FunctionLowerer<'a> {
    function: &'a HirFunction,
    data: &'a mut DataLayout,
    options: LowerOptions,
    ops: Vec<Op>,
    labels: Vec<Label>,
    diagnostics: Vec<Diagnostic>,
}

pub fn lower_function(
    function: &HirFunction,
    data: &mut DataLayout,
    options: LowerOptions,
) -> Result<LoweredFunction, Vec<Diagnostic>> {
    let mut lowerer = FunctionLowerer {
        function,
        data,
        options,
        ops: Vec::new(),
        labels: Vec::new(),
        diagnostics: Vec::new(),
    };
    lowerer.stmts(&function.body);
    if val_type(function.result).is_some() {
        // Every path has returned already.
        lowerer.emit(Instruction::Unreachable);
    }
    lowerer.emit(Instruction::End);

    if !lowerer.diagnostics.is_empty() {
        return Err(lowerer.diagnostics);
    }

    let value_types = |locals: &[crate::hir::HirLocal]| -> Vec<ValType> {
        locals
            .iter()
            .map(|local| val_type(local.ty).unwrap_or(ValType::I32))
            .collect()
    };
    let (params, locals) = function.locals.split_at(function.param_count);
    Ok(LoweredFunction {
        symbol: function.symbol,
        params: value_types(params),
        result: val_type(function.result),
        locals: value_types(locals),
        body: lowerer.ops,
    })
}

impl FunctionLowerer<'_> {
    fn emit(&mut self, instruction: Instruction<'static>) {
        self.ops.push(Op::Plain(instruction));
    }

    fn depth_of(&self, wanted: Label) -> u32 {
        self.labels
            .iter()
            .rev()
            .position(|label| *label == wanted)
            .map_or(0, |depth| depth as u32)
    }

    fn stmts(&mut self, stmts: &[HirStmt]) {
        for stmt in stmts {
            self.stmt(stmt);
        }
    }

    fn stmt(&mut self, stmt: &HirStmt) {
        match stmt {
            HirStmt::Let { local, init } => {
                match init {
                    Some(init) => self.expr(init),
                    None => {
                        let ty = self.function.locals[local.index()].ty;
                        self.emit(zero(ty).instruction());
                    }
                }
                self.emit(Instruction::LocalSet(local.0));
            }
            HirStmt::Assign { place, value } => {
                self.expr(value);
                match place {
                    Place::Local(local) => self.emit(Instruction::LocalSet(local.0)),
                    Place::Global(id) => self.ops.push(Op::GlobalSet(*id)),
                }
            }
            HirStmt::Expr(expr) => {
                self.expr(expr);
                if val_type(expr.ty).is_some() {
                    self.emit(Instruction::Drop);
                }
            }
            HirStmt::Return(value) => {
                if let Some(value) = value {
                    self.expr(value);
                }
                self.emit(Instruction::Return);
            }
            HirStmt::Break => {
                let depth = self.depth_of(Label::LoopExit);
                self.emit(Instruction::Br(depth));
            }
            HirStmt::Continue => {
                let depth = self.depth_of(Label::LoopContinue);
                self.emit(Instruction::Br(depth));
            }
            HirStmt::If {
                cond,
                then_body,
                else_body,
            } => {
                self.expr(cond);
                self.emit(Instruction::If(BlockType::Empty));
                self.labels.push(Label::Plain);
                self.stmts(then_body);
                if !else_body.is_empty() {
                    self.emit(Instruction::Else);
                    self.stmts(else_body);
                }
                self.labels.pop();
                self.emit(Instruction::End);
            }
            HirStmt::While { cond, body } => {
                self.emit(Instruction::Block(BlockType::Empty));
                self.labels.push(Label::LoopExit);
                self.emit(Instruction::Loop(BlockType::Empty));
                self.labels.push(Label::LoopContinue);

                self.expr(cond);
                self.emit(Instruction::I32Eqz);
                self.emit(Instruction::BrIf(1));
                self.stmts(body);
                self.emit(Instruction::Br(0));

                self.labels.pop();
                self.emit(Instruction::End);
                self.labels.pop();
                self.emit(Instruction::End);
            }
            HirStmt::Block(body) => self.stmts(body),
        }
    }

    fn expr(&mut self, expr: &HirExpr) {
        match &expr.kind {
            HirExprKind::I32(value) => self.emit(Instruction::I32Const(*value)),
            HirExprKind::I64(value) => self.emit(Instruction::I64Const(*value)),
            HirExprKind::F32(value) => self.emit(Instruction::F32Const((*value).into())),
            HirExprKind::F64(value) => self.emit(Instruction::F64Const((*value).into())),
            HirExprKind::Bool(value) => self.emit(Instruction::I32Const(i32::from(*value))),
            HirExprKind::Local(local) => self.emit(Instruction::LocalGet(local.0)),
            HirExprKind::Global(id) => self.ops.push(Op::GlobalGet(*id)),
            HirExprKind::Call { callee, args } => {
                for arg in args {
                    self.expr(arg);
                }
                self.ops.push(Op::Call(*callee));
            }
            HirExprKind::Builtin { kind, args } => {
                for arg in args {
                    self.expr(arg);
                }
                self.emit(match kind {
                    BuiltinKind::Sqrt => Instruction::F64Sqrt,
                    BuiltinKind::Floor => Instruction::F64Floor,
                    BuiltinKind::Ceil => Instruction::F64Ceil,
                    BuiltinKind::Trunc => Instruction::F64Trunc,
                    BuiltinKind::Trap => Instruction::Unreachable,
                });
            }
            HirExprKind::Unary { op, operand } => self.unary(*op, operand),
            HirExprKind::Binary { op, lhs, rhs } => self.binary(*op, lhs, rhs),
            HirExprKind::Cast(operand) => {
                self.expr(operand);
                for instruction in cast(operand.ty, expr.ty, self.options.saturating_casts) {
                    self.emit(instruction);
                }
            }
            HirExprKind::FileContents(path) => match self.data.embed(path) {
                Ok(address) => self.emit(Instruction::I32Const(address as i32)),
                Err(err) => {
                    self.diagnostics.push(embed_error(path, err, expr.span));
                    self.emit(Instruction::I32Const(0));
                }
            },
            HirExprKind::Error => self.emit(Instruction::Unreachable),
        }
    }

    fn unary(&mut self, op: UnaryOp, operand: &HirExpr) {
        match (op, operand.ty) {
            (UnaryOp::Neg, Type::I32) => {
                self.emit(Instruction::I32Const(0));
                self.expr(operand);
                self.emit(Instruction::I32Sub);
            }
            (UnaryOp::Neg, Type::I64) => {
                self.emit(Instruction::I64Const(0));
                self.expr(operand);
                self.emit(Instruction::I64Sub);
            }
            (UnaryOp::Neg, Type::F32) => {
                self.expr(operand);
                self.emit(Instruction::F32Neg);
            }
            (UnaryOp::Neg, _) => {
                self.expr(operand);
                self.emit(Instruction::F64Neg);
            }
            (UnaryOp::Not, _) => {
                self.expr(operand);
                self.emit(Instruction::I32Eqz);
            }
            (UnaryOp::BitNot, Type::I64) => {
                self.expr(operand);
                self.emit(Instruction::I64Const(-1));
                self.emit(Instruction::I64Xor);
            }
            (UnaryOp::BitNot, _) => {
                self.expr(operand);
                self.emit(Instruction::I32Const(-1));
                self.emit(Instruction::I32Xor);
            }
        }
    }

    fn binary(&mut self, op: BinaryOp, lhs: &HirExpr, rhs: &HirExpr) {
        match op {
            BinaryOp::And => {
                self.expr(lhs);
                self.emit(Instruction::If(BlockType::Result(ValType::I32)));
                self.labels.push(Label::Plain);
                self.expr(rhs);
                self.emit(Instruction::Else);
                self.emit(Instruction::I32Const(0));
                self.labels.pop();
                self.emit(Instruction::End);
            }
            BinaryOp::Or => {
                self.expr(lhs);
                self.emit(Instruction::If(BlockType::Result(ValType::I32)));
                self.labels.push(Label::Plain);
                self.emit(Instruction::I32Const(1));
                self.emit(Instruction::Else);
                self.expr(rhs);
                self.labels.pop();
                self.emit(Instruction::End);
            }
            _ => {
                self.expr(lhs);
                self.expr(rhs);
                self.emit(binary_instruction(op, lhs.ty));
            }
        }
    }
}

fn zero(ty: Type) -> ConstValue {
    match ty {
        Type::I64 => ConstValue::I64(0),
        Type::F32 => ConstValue::F32(0.0),
        Type::F64 => ConstValue::F64(0.0),
        _ => ConstValue::I32(0),
    }
}

fn binary_instruction(op: BinaryOp, operand: Type) -> Instruction<'static> {
    use BinaryOp as B;
    use Instruction as I;
    match operand {
        Type::I64 => match op {
            B::Add => I::I64Add,
            B::Sub => I::I64Sub,
            B::Mul => I::I64Mul,
            B::Div => I::I64DivS,
            B::Rem => I::I64RemS,
            B::BitAnd => I::I64And,
            B::BitOr => I::I64Or,
            B::BitXor => I::I64Xor,
            B::Shl => I::I64Shl,
            B::Shr => I::I64ShrS,
            B::Eq => I::I64Eq,
            B::Ne => I::I64Ne,
            B::Lt => I::I64LtS,
            B::Le => I::I64LeS,
            B::Gt => I::I64GtS,
            B::Ge => I::I64GeS,
            B::And | B::Or => I::Unreachable,
        },
        Type::F32 => match op {
            B::Add => I::F32Add,
            B::Sub => I::F32Sub,
            B::Mul => I::F32Mul,
            B::Div => I::F32Div,
            B::Eq => I::F32Eq,
            B::Ne => I::F32Ne,
            B::Lt => I::F32Lt,
            B::Le => I::F32Le,
            B::Gt => I::F32Gt,
            B::Ge => I::F32Ge,
            _ => I::Unreachable,
        },
        Type::F64 => match op {
            B::Add => I::F64Add,
            B::Sub => I::F64Sub,
            B::Mul => I::F64Mul,
            B::Div => I::F64Div,
            B::Eq => I::F64Eq,
            B::Ne => I::F64Ne,
            B::Lt => I::F64Lt,
            B::Le => I::F64Le,
            B::Gt => I::F64Gt,
            B::Ge => I::F64Ge,
            _ => I::Unreachable,
        },
        // i32 and bool
        _ => match op {
            B::Add => I::I32Add,
            B::Sub => I::I32Sub,
            B::Mul => I::I32Mul,
            B::Div => I::I32DivS,
            B::Rem => I::I32RemS,
            B::BitAnd => I::I32And,
            B::BitOr => I::I32Or,
            B::BitXor => I::I32Xor,
            B::Shl => I::I32Shl,
            B::Shr => I::I32ShrS,
            B::Eq => I::I32Eq,
            B::Ne => I::I32Ne,
            B::Lt => I::I32LtS,
            B::Le => I::I32LeS,
            B::Gt => I::I32GtS,
            B::Ge => I::I32GeS,
            B::And | B::Or => I::Unreachable,
        },
    }
}

/// Instructions converting a value of type `from` on the stack to `to`.
fn cast(from: Type, to: Type, saturating: bool) -> Vec<Instruction<'static>> {
    use Instruction as I;
    use Type as T;
    let single = match (from, to) {
        (from, to) if from == to => return Vec::new(),
        (T::I32 | T::Bool, T::I32) => return Vec::new(),
        (T::I32, T::I64) => I::I64ExtendI32S,
        (T::Bool, T::I64) => I::I64ExtendI32U,
        (T::I64, T::I32) => I::I32WrapI64,
        (T::I32, T::Bool) => return vec![I::I32Const(0), I::I32Ne],
        (T::I64, T::Bool) => return vec![I::I64Const(0), I::I64Ne],

        (T::I32, T::F32) => I::F32ConvertI32S,
        (T::I64, T::F32) => I::F32ConvertI64S,
        (T::I32, T::F64) => I::F64ConvertI32S,
        (T::I64, T::F64) => I::F64ConvertI64S,

        (T::F32, T::I32) if saturating => I::I32TruncSatF32S,
        (T::F64, T::I32) if saturating => I::I32TruncSatF64S,
        (T::F32, T::I64) if saturating => I::I64TruncSatF32S,
        (T::F64, T::I64) if saturating => I::I64TruncSatF64S,
        (T::F32, T::I32) => I::I32TruncF32S,
        (T::F64, T::I32) => I::I32TruncF64S,
        (T::F32, T::I64) => I::I64TruncF32S,
        (T::F64, T::I64) => I::I64TruncF64S,

        (T::F32, T::F64) => I::F64PromoteF32,
        (T::F64, T::F32) => I::F32DemoteF64,
        _ => I::Unreachable,
    };
    vec![single]
}

// ---------------------------------------------------------------------
// Globals
// ---------------------------------------------------------------------

/// Fold the initializer of global `id` to a constant.
pub fn lower_global(
    id: SymbolId,
    table: &SymbolTable,
    data: &mut DataLayout,
) -> Result<LoweredGlobal, Diagnostic> {
    let symbol = table.get(id);
    let info = symbol
        .global()
        .ok_or_else(|| Diagnostic::detached(format!("`{}` is not a global", symbol.name)))?;
    let init = info.init.as_ref().ok_or_else(|| {
        Diagnostic::detached(format!("`{}` has no checked initializer", symbol.name))
    })?;

    let mut folder = ConstFolder {
        table,
        data,
        visiting: vec![id],
    };
    let value = folder.fold(init)?;
    Ok(LoweredGlobal {
        symbol: id,
        val_type: value.val_type(),
        mutable: info.mutable,
        init: value,
    })
}

struct ConstFolder<'a> {
    table: &'a SymbolTable,
    data: &'a mut DataLayout,
    visiting: Vec<SymbolId>,
}

fn not_constant(what: &str, span: Span) -> Diagnostic {
    Diagnostic::error(
        format!("global initializers must be constant; {what} is not"),
        span,
    )
    .with_code("E0401")
}

impl ConstFolder<'_> {
    fn fold(&mut self, expr: &HirExpr) -> Result<ConstValue, Diagnostic> {
        let span = expr.span;
        match &expr.kind {
            HirExprKind::I32(value) => Ok(ConstValue::I32(*value)),
            HirExprKind::I64(value) => Ok(ConstValue::I64(*value)),
            HirExprKind::F32(value) => Ok(ConstValue::F32(*value)),
            HirExprKind::F64(value) => Ok(ConstValue::F64(*value)),
            HirExprKind::Bool(value) => Ok(ConstValue::I32(i32::from(*value))),
            HirExprKind::Global(id) => {
                let symbol = self.table.get(*id);
                let info = symbol
                    .global()
                    .ok_or_else(|| not_constant("this name", span))?;
                if info.mutable {
                    return Err(not_constant(
                        &format!("the mutable global `{}`", symbol.name),
                        span,
                    ));
                }
                if self.visiting.contains(id) {
                    return Err(Diagnostic::error(
                        format!("cyclic constant: `{}` depends on itself", symbol.name),
                        span,
                    )
                    .with_code("E0405"));
                }
                let init = info
                    .init
                    .as_ref()
                    .ok_or_else(|| not_constant(&format!("`{}`", symbol.name), span))?;
                self.visiting.push(*id);
                let value = self.fold(init);
                self.visiting.pop();
                value
            }
            HirExprKind::Unary { op, operand } => {
                let value = self.fold(operand)?;
                Ok(fold_unary(*op, value))
            }
            HirExprKind::Binary { op, lhs, rhs } => {
                let lhs = self.fold(lhs)?;
                if op.is_logical() {
                    let short = match op {
                        BinaryOp::And => !lhs.truthy(),
                        _ => lhs.truthy(),
                    };
                    if short {
                        return Ok(lhs);
                    }
                    return self.fold(rhs);
                }
                let rhs = self.fold(rhs)?;
                fold_binary(*op, lhs, rhs, span)
            }
            HirExprKind::Cast(operand) => {
                let value = self.fold(operand)?;
                Ok(fold_cast(value, expr.ty))
            }
            HirExprKind::FileContents(path) => self
                .data
                .embed(path)
                .map(|address| ConstValue::I32(address as i32))
                .map_err(|err| embed_error(path, err, span)),
            HirExprKind::Local(_) => Err(not_constant("a local variable", span)),
            HirExprKind::Call { .. } | HirExprKind::Builtin { .. } => {
                Err(not_constant("a function call", span))
            }
            HirExprKind::Error => Err(not_constant("this expression", span)),
        }
    }
}

fn fold_unary(op: UnaryOp, value: ConstValue) -> ConstValue {
    use ConstValue as C;
    match (op, value) {
        (UnaryOp::Neg, C::I32(v)) => C::I32(v.wrapping_neg()),
        (UnaryOp::Neg, C::I64(v)) => C::I64(v.wrapping_neg()),
        (UnaryOp::Neg, C::F32(v)) => C::F32(-v),
        (UnaryOp::Neg, C::F64(v)) => C::F64(-v),
        (UnaryOp::Not, v) => C::I32(i32::from(!v.truthy())),
        (UnaryOp::BitNot, C::I32(v)) => C::I32(!v),
        (UnaryOp::BitNot, C::I64(v)) => C::I64(!v),
        (UnaryOp::BitNot, v) => v,
    }
}

fn fold_binary(
    op: BinaryOp,
    lhs: ConstValue,
    rhs: ConstValue,
    span: Span,
) -> Result<ConstValue, Diagnostic> {
    use ConstValue as C;
    let division = || {
        Diagnostic::error("division by zero or overflow in constant expression", span)
            .with_code("E0402")
    };
    let flag = |b: bool| C::I32(i32::from(b));

    let value = match (lhs, rhs) {
        (C::I32(a), C::I32(b)) => match op {
            BinaryOp::Add => C::I32(a.wrapping_add(b)),
            BinaryOp::Sub => C::I32(a.wrapping_sub(b)),
            BinaryOp::Mul => C::I32(a.wrapping_mul(b)),
            BinaryOp::Div => C::I32(a.checked_div(b).ok_or_else(division)?),
            BinaryOp::Rem => C::I32(a.checked_rem(b).ok_or_else(division)?),
            BinaryOp::BitAnd => C::I32(a & b),
            BinaryOp::BitOr => C::I32(a | b),
            BinaryOp::BitXor => C::I32(a ^ b),
            BinaryOp::Shl => C::I32(a.wrapping_shl(b as u32)),
            BinaryOp::Shr => C::I32(a.wrapping_shr(b as u32)),
            BinaryOp::Eq => flag(a == b),
            BinaryOp::Ne => flag(a != b),
            BinaryOp::Lt => flag(a < b),
            BinaryOp::Le => flag(a <= b),
            BinaryOp::Gt => flag(a > b),
            BinaryOp::Ge => flag(a >= b),
            BinaryOp::And => flag(a != 0 && b != 0),
            BinaryOp::Or => flag(a != 0 || b != 0),
        },
        (C::I64(a), C::I64(b)) => match op {
            BinaryOp::Add => C::I64(a.wrapping_add(b)),
            BinaryOp::Sub => C::I64(a.wrapping_sub(b)),
            BinaryOp::Mul => C::I64(a.wrapping_mul(b)),
            BinaryOp::Div => C::I64(a.checked_div(b).ok_or_else(division)?),
            BinaryOp::Rem => C::I64(a.checked_rem(b).ok_or_else(division)?),
            BinaryOp::BitAnd => C::I64(a & b),
            BinaryOp::BitOr => C::I64(a | b),
            BinaryOp::BitXor => C::I64(a ^ b),
            BinaryOp::Shl => C::I64(a.wrapping_shl(b as u32)),
            BinaryOp::Shr => C::I64(a.wrapping_shr(b as u32)),
            BinaryOp::Eq => flag(a == b),
            BinaryOp::Ne => flag(a != b),
            BinaryOp::Lt => flag(a < b),
            BinaryOp::Le => flag(a <= b),
            BinaryOp::Gt => flag(a > b),
            BinaryOp::Ge => flag(a >= b),
            BinaryOp::And => flag(a != 0 && b != 0),
            BinaryOp::Or => flag(a != 0 || b != 0),
        },
        (C::F32(a), C::F32(b)) => fold_float(op, f64::from(a), f64::from(b), |v| C::F32(v as f32)),
        (C::F64(a), C::F64(b)) => fold_float(op, a, b, C::F64),
        _ => return Err(not_constant("this mixed-type expression", span)),
    };
    Ok(value)
}

fn fold_float(op: BinaryOp, a: f64, b: f64, wrap: impl Fn(f64) -> ConstValue) -> ConstValue {
    let flag = |b: bool| ConstValue::I32(i32::from(b));
    match op {
        BinaryOp::Add => wrap(a + b),
        BinaryOp::Sub => wrap(a - b),
        BinaryOp::Mul => wrap(a * b),
        BinaryOp::Div => wrap(a / b),
        BinaryOp::Eq => flag(a == b),
        BinaryOp::Ne => flag(a != b),
        BinaryOp::Lt => flag(a < b),
        BinaryOp::Le => flag(a <= b),
        BinaryOp::Gt => flag(a > b),
        BinaryOp::Ge => flag(a >= b),
        _ => wrap(f64::NAN),
    }
}

/// Constant conversions. Float-to-int conversions saturate.
fn fold_cast(value: ConstValue, to: Type) -> ConstValue {
    use ConstValue as C;
    match (value, to) {
        (C::I32(v), Type::I32) => C::I32(v),
        (C::I32(v), Type::Bool) => C::I32(i32::from(v != 0)),
        (C::I32(v), Type::I64) => C::I64(i64::from(v)),
        (C::I32(v), Type::F32) => C::F32(v as f32),
        (C::I32(v), Type::F64) => C::F64(f64::from(v)),
        (C::I64(v), Type::I32) => C::I32(v as i32),
        (C::I64(v), Type::Bool) => C::I32(i32::from(v != 0)),
        (C::I64(v), Type::F32) => C::F32(v as f32),
        (C::I64(v), Type::F64) => C::F64(v as f64),
        (C::F32(v), Type::I32) => C::I32(v as i32),
        (C::F32(v), Type::I64) => C::I64(v as i64),
        (C::F32(v), Type::F64) => C::F64(f64::from(v)),
        (C::F64(v), Type::I32) => C::I32(v as i32),
        (C::F64(v), Type::I64) => C::I64(v as i64),
        (C::F64(v), Type::F32) => C::F32(v as f32),
        (value, _) => value,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hir::{HirLocal, LocalId};
    use crate::name_resolve::{DeclSite, GlobalInfo, Symbol, SymbolKind};
    use crate::span::UnitId;

    fn span() -> Span {
        Span::new(UnitId(0), 0, 1)
    }

    fn expr(kind: HirExprKind, ty: Type) -> HirExpr {
        HirExpr {
            kind,
            ty,
            span: span(),
        }
    }

    fn table_with_globals(globals: Vec<(&str, bool, HirExpr)>) -> SymbolTable {
        let mut table = SymbolTable::with_builtins();
        for (index, (name, mutable, init)) in globals.into_iter().enumerate() {
            let ident = crate::ast::Ident {
                name: name.to_string(),
                span: span(),
            };
            let kind = SymbolKind::Global(GlobalInfo {
                declared: None,
                ty: Some(init.ty),
                mutable,
                init: Some(init),
            });
            let site = DeclSite {
                unit: UnitId(0),
                item: index,
            };
            table.declare(&ident, kind, site).expect("declare");
        }
        table
    }

    #[test]
    fn folds_constant_initializers() {
        let table = table_with_globals(vec![
            ("A", false, expr(HirExprKind::I32(6), Type::I32)),
            ("B", true, expr(HirExprKind::I32(0), Type::I32)),
        ]);
        let a = table.lookup("A").unwrap();
        let b = table.lookup("B").unwrap();

        let mut symbols = table.clone();
        let product = expr(
            HirExprKind::Binary {
                op: BinaryOp::Mul,
                lhs: Box::new(expr(HirExprKind::Global(a), Type::I32)),
                rhs: Box::new(expr(HirExprKind::I32(7), Type::I32)),
            },
            Type::I32,
        );
        if let SymbolKind::Global(info) = &mut symbols.get_mut(b).kind {
            info.init = Some(product);
        }

        let mut data = DataLayout::new();
        let lowered = lower_global(b, &symbols, &mut data).expect("fold");
        assert_eq!(lowered.init, ConstValue::I32(42));
        assert!(lowered.mutable);
        assert_eq!(lowered.val_type, ValType::I32);
    }

    #[test]
    fn rejects_division_by_zero() {
        let init = expr(
            HirExprKind::Binary {
                op: BinaryOp::Div,
                lhs: Box::new(expr(HirExprKind::I32(1), Type::I32)),
                rhs: Box::new(expr(HirExprKind::I32(0), Type::I32)),
            },
            Type::I32,
        );
        let table = table_with_globals(vec![("Z", false, init)]);
        let err = lower_global(table.lookup("Z").unwrap(), &table, &mut DataLayout::new())
            .unwrap_err();
        assert_eq!(err.code, Some("E0402"));
    }

    #[test]
    fn rejects_reads_of_mutable_globals() {
        let table = table_with_globals(vec![("M", true, expr(HirExprKind::I32(1), Type::I32))]);
        let m = table.lookup("M").unwrap();
        let mut symbols = table.clone();
        let ident = crate::ast::Ident {
            name: "N".into(),
            span: span(),
        };
        let kind = SymbolKind::Global(GlobalInfo {
            declared: None,
            ty: Some(Type::I32),
            mutable: false,
            init: Some(expr(HirExprKind::Global(m), Type::I32)),
        });
        let n = symbols
            .declare(
                &ident,
                kind,
                DeclSite {
                    unit: UnitId(0),
                    item: 1,
                },
            )
            .unwrap();
        let err = lower_global(n, &symbols, &mut DataLayout::new()).unwrap_err();
        assert_eq!(err.code, Some("E0401"));
    }

    #[test]
    fn embeds_files_once_with_length_prefix() {
        let dir = tempfile::tempdir().expect("tempdir");
        let first = dir.path().join("a.bin");
        let second = dir.path().join("b.bin");
        fs::write(&first, b"abc").unwrap();
        fs::write(&second, b"xy").unwrap();

        let mut data = DataLayout::new();
        assert_eq!(data.embed(&first).unwrap(), 8);
        assert_eq!(data.embed(&second).unwrap(), 16);
        assert_eq!(data.embed(&first).unwrap(), 8);
        assert_eq!(data.segments().len(), 2);
        assert_eq!(data.segments()[0].bytes, vec![3, 0, 0, 0, b'a', b'b', b'c']);
        assert_eq!(data.pages(), 1);

        assert!(data.embed(&dir.path().join("missing.bin")).is_err());
    }

    #[test]
    fn lowers_loops_with_branch_depths() {
        // while true { if true { break; } continue; }
        let function = HirFunction {
            symbol: SymbolId(0),
            param_count: 0,
            locals: vec![HirLocal {
                name: "x".into(),
                ty: Type::I64,
            }],
            result: Type::Void,
            body: vec![
                HirStmt::Let {
                    local: LocalId(0),
                    init: None,
                },
                HirStmt::While {
                    cond: expr(HirExprKind::Bool(true), Type::Bool),
                    body: vec![
                        HirStmt::If {
                            cond: expr(HirExprKind::Bool(true), Type::Bool),
                            then_body: vec![HirStmt::Break],
                            else_body: Vec::new(),
                        },
                        HirStmt::Continue,
                    ],
                },
            ],
        };
        let lowered =
            lower_function(&function, &mut DataLayout::new(), LowerOptions::default()).unwrap();
        assert_eq!(lowered.locals, vec![ValType::I64]);
        let branches: Vec<u32> = lowered
            .body
            .iter()
            .filter_map(|op| match op {
                Op::Plain(Instruction::Br(depth)) => Some(*depth),
                _ => None,
            })
            .collect();
        // break inside `if` skips if + loop; continue targets the loop; the
        // loop's own back-edge is last.
        assert_eq!(branches, vec![2, 0, 0]);
        assert!(matches!(
            lowered.body.last(),
            Some(Op::Plain(Instruction::End))
        ));
    }

    #[test]
    fn casts_saturate_when_requested() {
        assert!(matches!(
            cast(Type::F64, Type::I32, true).as_slice(),
            [Instruction::I32TruncSatF64S]
        ));
        assert!(matches!(
            cast(Type::F64, Type::I32, false).as_slice(),
            [Instruction::I32TruncF64S]
        ));
        assert!(cast(Type::Bool, Type::I32, false).is_empty());
    }
}
