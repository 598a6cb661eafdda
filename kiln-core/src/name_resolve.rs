//! Program-wide symbol table and declaration of top-level items.
//!
//! One table spans every unit plus the builtin intrinsics. Units are
//! declared one at a time as they reach the resolving stage, so a unit
//! registered late simply adds its symbols after the others.

use std::collections::HashMap;

use crate::ast::{self, Item, Module};
use crate::builtins::{BUILTINS, BuiltinKind};
use crate::diagnostic::Diagnostic;
use crate::hir::HirExpr;
use crate::span::{Span, UnitId};
use crate::types::{FunctionSig, Type};

/// Index into the `SymbolTable`. Ids follow declaration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SymbolId(pub u32);

impl SymbolId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Where a symbol was declared: the unit and the item's index in it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeclSite {
    pub unit: UnitId,
    pub item: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GlobalInfo {
    /// Type written in the declaration, if any.
    pub declared: Option<Type>,
    /// Filled in when the initializer is checked.
    pub ty: Option<Type>,
    pub mutable: bool,
    pub init: Option<HirExpr>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SymbolKind {
    Function(FunctionSig),
    Foreign {
        sig: FunctionSig,
        module: String,
        field: String,
    },
    Builtin(BuiltinKind),
    Global(GlobalInfo),
}

impl SymbolKind {
    pub fn describe(&self) -> &'static str {
        match self {
            SymbolKind::Function(_) => "function",
            SymbolKind::Foreign { .. } => "foreign function",
            SymbolKind::Builtin(_) => "builtin function",
            SymbolKind::Global(info) if info.mutable => "global variable",
            SymbolKind::Global(_) => "constant",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Symbol {
    pub name: String,
    pub kind: SymbolKind,
    /// `None` for builtins.
    pub site: Option<DeclSite>,
    pub span: Option<Span>,
}

impl Symbol {
    /// Signature of anything callable.
    pub fn signature(&self) -> Option<FunctionSig> {
        match &self.kind {
            SymbolKind::Function(sig) | SymbolKind::Foreign { sig, .. } => Some(sig.clone()),
            SymbolKind::Builtin(kind) => Some(kind.signature()),
            SymbolKind::Global(_) => None,
        }
    }

    pub fn global(&self) -> Option<&GlobalInfo> {
        match &self.kind {
            SymbolKind::Global(info) => Some(info),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct SymbolTable {
    symbols: Vec<Symbol>,
    by_name: HashMap<String, SymbolId>,
}

impl SymbolTable {
    /// A table holding only the builtin intrinsics.
    pub fn with_builtins() -> Self {
        let mut table = SymbolTable::default();
        for builtin in BUILTINS {
            table.insert(Symbol {
                name: builtin.name.to_string(),
                kind: SymbolKind::Builtin(builtin.kind),
                site: None,
                span: None,
            });
        }
        table
    }

    pub fn lookup(&self, name: &str) -> Option<SymbolId> {
        self.by_name.get(name).copied()
    }

    pub fn get(&self, id: SymbolId) -> &Symbol {
        &self.symbols[id.index()]
    }

    pub fn get_mut(&mut self, id: SymbolId) -> &mut Symbol {
        &mut self.symbols[id.index()]
    }

    pub fn len(&self) -> usize {
        self.symbols.len()
    }

    pub fn is_empty(&self) -> bool {
        self.symbols.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (SymbolId, &Symbol)> {
        self.symbols
            .iter()
            .enumerate()
            .map(|(i, symbol)| (SymbolId(i as u32), symbol))
    }

    /// Add a user symbol. A name that is already taken is reported at
    /// the new definition and the symbol is not added.
    pub fn declare(
        &mut self,
        name: &ast::Ident,
        kind: SymbolKind,
        site: DeclSite,
    ) -> Result<SymbolId, Diagnostic> {
        if let Some(existing) = self.lookup(&name.name) {
            let what = self.get(existing).kind.describe();
            return Err(Diagnostic::error(
                format!("`{}` is already defined as a {what}", name.name),
                name.span,
            )
            .with_code("E0203"));
        }
        Ok(self.insert(Symbol {
            name: name.name.clone(),
            kind,
            site: Some(site),
            span: Some(name.span),
        }))
    }

    fn insert(&mut self, symbol: Symbol) -> SymbolId {
        let id = SymbolId(self.symbols.len() as u32);
        self.by_name.insert(symbol.name.clone(), id);
        self.symbols.push(symbol);
        id
    }
}

/// An `#export` waiting for its target to be resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingExport {
    pub name: String,
    pub target: ast::Ident,
    pub span: Span,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DeclareOptions {
    pub disable_extensions: bool,
}

/// Symbols and requests produced by declaring one unit.
#[derive(Debug, Default)]
pub struct Declared {
    pub functions: Vec<SymbolId>,
    pub globals: Vec<SymbolId>,
    pub exports: Vec<PendingExport>,
    pub diagnostics: Vec<Diagnostic>,
}

/// Declare every top-level item of `module` into `table`.
///
/// `#load` items are ignored here; they are handled when the unit is parsed.
pub fn declare_module(
    table: &mut SymbolTable,
    unit: UnitId,
    module: &Module,
    options: DeclareOptions,
) -> Declared {
    let mut out = Declared::default();

    for (index, item) in module.items.iter().enumerate() {
        let site = DeclSite { unit, item: index };
        match item {
            Item::Load(_) => {}
            Item::Export { name, target, span } => out.exports.push(PendingExport {
                name: name.clone(),
                target: target.clone(),
                span: *span,
            }),
            Item::Extension { name, span } => {
                let diagnostic = if options.disable_extensions {
                    Diagnostic::error(format!("extension `{name}` is not allowed"), *span)
                        .with_code("E0207")
                } else {
                    Diagnostic::warning(
                        format!("extension `{name}` is not supported and has no effect"),
                        *span,
                    )
                    .with_code("W0201")
                };
                out.diagnostics.push(diagnostic);
            }
            Item::Function(func) => {
                let sig = resolve_signature(&func.sig, &mut out.diagnostics);
                match table.declare(&func.name, SymbolKind::Function(sig), site) {
                    Ok(id) => out.functions.push(id),
                    Err(diagnostic) => out.diagnostics.push(diagnostic),
                }
            }
            Item::Foreign(foreign) => {
                let sig = resolve_signature(&foreign.sig, &mut out.diagnostics);
                let kind = SymbolKind::Foreign {
                    sig,
                    module: foreign.module.clone(),
                    field: foreign.field.clone(),
                };
                if let Err(diagnostic) = table.declare(&foreign.name, kind, site) {
                    out.diagnostics.push(diagnostic);
                }
            }
            Item::Global(global) => {
                let declared = global
                    .ty
                    .as_ref()
                    .map(|ty| resolve_value_type(ty, "a global", &mut out.diagnostics));
                let kind = SymbolKind::Global(GlobalInfo {
                    declared,
                    ty: None,
                    mutable: global.mutable,
                    init: None,
                });
                match table.declare(&global.name, kind, site) {
                    Ok(id) => out.globals.push(id),
                    Err(diagnostic) => out.diagnostics.push(diagnostic),
                }
            }
        }
    }

    out
}

/// Resolve a written type; unknown names yield the poison type.
pub fn resolve_type(ty: &ast::TypeExpr, diagnostics: &mut Vec<Diagnostic>) -> Type {
    match Type::from_name(&ty.name) {
        Some(resolved) => resolved,
        None => {
            diagnostics.push(
                Diagnostic::error(format!("unknown type `{}`", ty.name), ty.span)
                    .with_code("E0202"),
            );
            Type::Error
        }
    }
}

/// Like `resolve_type`, but `void` is rejected because `what` must hold a value.
pub fn resolve_value_type(
    ty: &ast::TypeExpr,
    what: &str,
    diagnostics: &mut Vec<Diagnostic>,
) -> Type {
    let resolved = resolve_type(ty, diagnostics);
    if resolved == Type::Void {
        diagnostics.push(
            Diagnostic::error(format!("{what} cannot have type `void`"), ty.span)
                .with_code("E0204"),
        );
        return Type::Error;
    }
    resolved
}

fn resolve_signature(sig: &ast::Signature, diagnostics: &mut Vec<Diagnostic>) -> FunctionSig {
    let params = sig
        .params
        .iter()
        .map(|param| resolve_value_type(&param.ty, "a parameter", diagnostics))
        .collect();
    let result = sig
        .result
        .as_ref()
        .map_or(Type::Void, |ty| resolve_type(ty, diagnostics));
    FunctionSig::new(params, result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::{ParseOptions, parse};

    fn declare(source: &str, options: DeclareOptions) -> (SymbolTable, Declared) {
        let parsed = parse(UnitId(0), source, ParseOptions::default());
        assert!(parsed.diagnostics.is_empty(), "{:?}", parsed.diagnostics);
        let mut table = SymbolTable::with_builtins();
        let declared = declare_module(&mut table, UnitId(0), &parsed.module, options);
        (table, declared)
    }

    #[test]
    fn declares_functions_globals_and_foreigns() {
        let (table, declared) = declare(
            "f :: (a: i32) -> i64 { return cast(i64) a; }\n\
             g :: (x: f64) #foreign \"env\" \"g\";\n\
             N :: 3;\n\
             #export \"run\" f;",
            DeclareOptions::default(),
        );
        assert!(declared.diagnostics.is_empty());
        assert_eq!(declared.functions.len(), 1);
        assert_eq!(declared.globals.len(), 1);
        assert_eq!(declared.exports[0].name, "run");

        let f = table.get(table.lookup("f").unwrap());
        assert_eq!(
            f.signature(),
            Some(FunctionSig::new(vec![Type::I32], Type::I64))
        );
        assert!(matches!(
            table.get(table.lookup("g").unwrap()).kind,
            SymbolKind::Foreign { .. }
        ));
        assert!(matches!(
            table.get(table.lookup("sqrt").unwrap()).kind,
            SymbolKind::Builtin(BuiltinKind::Sqrt)
        ));
    }

    #[test]
    fn reports_duplicates_at_second_definition() {
        let source = "a :: 1;\na :: () {}\nsqrt :: 2.0;";
        let (_, declared) = declare(source, DeclareOptions::default());
        assert_eq!(declared.diagnostics.len(), 2);
        let first = declared.diagnostics[0].span.unwrap();
        assert_eq!(&source[first.start as usize..first.end as usize], "a");
        assert_eq!(first.start, 8);
        assert!(declared.diagnostics[1].message.contains("builtin"));
    }

    #[test]
    fn reports_unknown_and_void_types() {
        let (table, declared) = declare(
            "f :: (a: string, b: void) -> i32 { return 0; }",
            DeclareOptions::default(),
        );
        let codes: Vec<_> = declared.diagnostics.iter().map(|d| d.code).collect();
        assert_eq!(codes, vec![Some("E0202"), Some("E0204")]);
        let sig = table.get(table.lookup("f").unwrap()).signature().unwrap();
        assert_eq!(sig.params, vec![Type::Error, Type::Error]);
    }

    #[test]
    fn extension_is_warning_unless_disabled() {
        let (_, declared) = declare("#extension \"x\";", DeclareOptions::default());
        assert!(!declared.diagnostics[0].is_fatal());

        let (_, declared) = declare(
            "#extension \"x\";",
            DeclareOptions {
                disable_extensions: true,
            },
        );
        assert!(declared.diagnostics[0].is_fatal());
    }
}
