//! WASM backend.
//!
//! Assembles lowered functions, folded globals and the data layout into
//! a binary module with `wasm-encoder`. Symbol references inside
//! function bodies are resolved to indices here, after the set of
//! emitted functions is known.

use std::borrow::Cow;
use std::collections::{BTreeMap, BTreeSet, HashMap};

use wasm_encoder::{
    CodeSection, ConstExpr, CustomSection, DataSection, EntityType, ExportKind, ExportSection,
    Function, FunctionSection, GlobalSection, GlobalType, ImportSection, Instruction,
    MemorySection, MemoryType, Module, TypeSection, ValType,
};

use crate::diagnostic::Diagnostic;
use crate::lower::{ConstValue, DataLayout, LoweredFunction, LoweredGlobal, Op, val_type};
use crate::name_resolve::{SymbolId, SymbolKind, SymbolTable};
use crate::span::Span;
use crate::types::FunctionSig;

pub const TYPE_INFO_SECTION: &str = "kiln.type_info";
pub const METHOD_INFO_SECTION: &str = "kiln.method_info";
pub const FOREIGN_INFO_SECTION: &str = "kiln.foreign_info";

/// An `#export` whose target has been resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedExport {
    pub name: String,
    pub target: SymbolId,
    pub span: Span,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct EmitOptions {
    /// Emit every function instead of only those reachable from exports.
    pub keep_stale_code: bool,
    pub foreign_info: bool,
    pub type_info: bool,
    pub method_info: bool,
}

/// Everything the backend reads.
pub struct EmitInput<'a> {
    pub table: &'a SymbolTable,
    pub functions: &'a BTreeMap<SymbolId, LoweredFunction>,
    pub globals: &'a BTreeMap<SymbolId, LoweredGlobal>,
    pub data: &'a DataLayout,
    pub exports: &'a [ResolvedExport],
    pub options: EmitOptions,
}

/// Function and global index spaces of the module being emitted.
#[derive(Debug, Default)]
struct IndexSpace {
    imports: Vec<SymbolId>,
    defined: Vec<SymbolId>,
    functions: HashMap<SymbolId, u32>,
    globals: HashMap<SymbolId, u32>,
}

pub fn generate_wasm(input: &EmitInput<'_>) -> Result<Vec<u8>, Vec<Diagnostic>> {
    let mut diagnostics = Vec::new();
    let exports = collect_exports(input, &mut diagnostics);
    if !diagnostics.is_empty() {
        return Err(diagnostics);
    }

    let space = assign_indices(input, &exports);
    let mut module = Module::new();

    // Types, deduplicated by signature.
    let mut types = TypeSection::new();
    let mut type_indices: HashMap<(Vec<ValType>, Vec<ValType>), u32> = HashMap::new();
    let mut type_of = |params: Vec<ValType>, results: Vec<ValType>| -> u32 {
        let next = type_indices.len() as u32;
        *type_indices
            .entry((params, results))
            .or_insert_with_key(|(params, results)| {
                types
                    .ty()
                    .function(params.iter().copied(), results.iter().copied());
                next
            })
    };

    let mut imports = ImportSection::new();
    for id in &space.imports {
        let symbol = input.table.get(*id);
        if let SymbolKind::Foreign { sig, module, field } = &symbol.kind {
            let (params, results) = sig_val_types(sig);
            let type_index = type_of(params, results);
            imports.import(module, field, EntityType::Function(type_index));
        }
    }

    let mut functions = FunctionSection::new();
    let mut code = CodeSection::new();
    for id in &space.defined {
        let Some(lowered) = input.functions.get(id) else {
            continue;
        };
        let type_index = type_of(lowered.params.clone(), lowered.result.into_iter().collect());
        functions.function(type_index);
        match encode_body(lowered, &space) {
            Ok(body) => {
                code.function(&body);
            }
            Err(diagnostic) => diagnostics.push(diagnostic),
        }
    }
    if !diagnostics.is_empty() {
        return Err(diagnostics);
    }

    let mut globals = GlobalSection::new();
    for global in input.globals.values() {
        globals.global(
            GlobalType {
                val_type: global.val_type,
                mutable: global.mutable,
                shared: false,
            },
            &const_expr(global.init),
        );
    }

    let mut export_section = ExportSection::new();
    for (name, target) in &exports {
        if let Some(index) = space.functions.get(target) {
            export_section.export(name, ExportKind::Func, *index);
        }
    }
    if !input.data.is_empty() {
        export_section.export("memory", ExportKind::Memory, 0);
    }

    module.section(&types);
    if !imports.is_empty() {
        module.section(&imports);
    }
    module.section(&functions);
    if !input.data.is_empty() {
        let mut memories = MemorySection::new();
        memories.memory(MemoryType {
            minimum: input.data.pages(),
            maximum: None,
            memory64: false,
            shared: false,
            page_size_log2: None,
        });
        module.section(&memories);
    }
    if !globals.is_empty() {
        module.section(&globals);
    }
    module.section(&export_section);
    module.section(&code);
    if !input.data.is_empty() {
        let mut data = DataSection::new();
        for segment in input.data.segments() {
            data.active(
                0,
                &ConstExpr::i32_const(segment.offset as i32),
                segment.bytes.iter().copied(),
            );
        }
        module.section(&data);
    }

    if input.options.type_info {
        custom_section(&mut module, TYPE_INFO_SECTION, type_info(input, &space));
    }
    if input.options.method_info {
        custom_section(&mut module, METHOD_INFO_SECTION, method_info(input, &space));
    }
    if input.options.foreign_info {
        custom_section(&mut module, FOREIGN_INFO_SECTION, foreign_info(input, &space));
    }

    Ok(module.finish())
}

/// Explicit exports plus `main`, checked for duplicate names.
fn collect_exports(
    input: &EmitInput<'_>,
    diagnostics: &mut Vec<Diagnostic>,
) -> Vec<(String, SymbolId)> {
    let mut exports: Vec<(String, SymbolId)> = Vec::new();
    for export in input.exports {
        if exports.iter().any(|(name, _)| *name == export.name) {
            diagnostics.push(
                Diagnostic::error(format!("`{}` is exported twice", export.name), export.span)
                    .with_code("E0404"),
            );
            continue;
        }
        exports.push((export.name.clone(), export.target));
    }

    let explicit_main = exports.iter().any(|(name, _)| name == "main");
    if !explicit_main {
        if let Some(main) = input.table.lookup("main") {
            if input.functions.contains_key(&main) {
                exports.push(("main".to_string(), main));
            }
        }
    }
    exports
}

fn assign_indices(input: &EmitInput<'_>, exports: &[(String, SymbolId)]) -> IndexSpace {
    let reachable: BTreeSet<SymbolId> = if input.options.keep_stale_code {
        input
            .table
            .iter()
            .filter(|(id, symbol)| match symbol.kind {
                SymbolKind::Foreign { .. } => true,
                SymbolKind::Function(_) => input.functions.contains_key(id),
                _ => false,
            })
            .map(|(id, _)| id)
            .collect()
    } else {
        reachable_from(exports.iter().map(|(_, id)| *id), input)
    };

    let mut space = IndexSpace::default();
    for id in &reachable {
        match input.table.get(*id).kind {
            SymbolKind::Foreign { .. } => space.imports.push(*id),
            _ => space.defined.push(*id),
        }
    }
    for (index, id) in space.imports.iter().chain(&space.defined).enumerate() {
        space.functions.insert(*id, index as u32);
    }
    for (index, id) in input.globals.keys().enumerate() {
        space.globals.insert(*id, index as u32);
    }
    space
}

/// Functions transitively called from `roots`.
fn reachable_from(roots: impl Iterator<Item = SymbolId>, input: &EmitInput<'_>) -> BTreeSet<SymbolId> {
    let mut seen = BTreeSet::new();
    let mut work: Vec<SymbolId> = roots.collect();
    while let Some(id) = work.pop() {
        if !seen.insert(id) {
            continue;
        }
        if let Some(function) = input.functions.get(&id) {
            work.extend(function.callees().filter(|callee| !seen.contains(callee)));
        }
    }
    seen
}

fn encode_body(lowered: &LoweredFunction, space: &IndexSpace) -> Result<Function, Diagnostic> {
    let mut function = Function::new_with_locals_types(lowered.locals.iter().copied());
    let missing = |what: &str, id: SymbolId| {
        Diagnostic::detached(format!(
            "internal codegen error: no index for {what} #{}",
            id.0
        ))
    };
    for op in &lowered.body {
        match op {
            Op::Plain(instruction) => {
                function.instruction(instruction);
            }
            Op::Call(id) => {
                let index = space.functions.get(id).ok_or_else(|| missing("function", *id))?;
                function.instruction(&Instruction::Call(*index));
            }
            Op::GlobalGet(id) => {
                let index = space.globals.get(id).ok_or_else(|| missing("global", *id))?;
                function.instruction(&Instruction::GlobalGet(*index));
            }
            Op::GlobalSet(id) => {
                let index = space.globals.get(id).ok_or_else(|| missing("global", *id))?;
                function.instruction(&Instruction::GlobalSet(*index));
            }
        }
    }
    Ok(function)
}

fn sig_val_types(sig: &FunctionSig) -> (Vec<ValType>, Vec<ValType>) {
    let params = sig.params.iter().filter_map(|ty| val_type(*ty)).collect();
    let results = val_type(sig.result).into_iter().collect();
    (params, results)
}

fn const_expr(value: ConstValue) -> ConstExpr {
    match value {
        ConstValue::I32(value) => ConstExpr::i32_const(value),
        ConstValue::I64(value) => ConstExpr::i64_const(value),
        ConstValue::F32(value) => ConstExpr::f32_const(value.into()),
        ConstValue::F64(value) => ConstExpr::f64_const(value.into()),
    }
}

fn custom_section(module: &mut Module, name: &'static str, lines: Vec<String>) {
    let mut text = String::new();
    for line in lines {
        text.push_str(&line);
        text.push('\n');
    }
    module.section(&CustomSection {
        name: Cow::Borrowed(name),
        data: Cow::Owned(text.into_bytes()),
    });
}

fn type_info(input: &EmitInput<'_>, space: &IndexSpace) -> Vec<String> {
    let mut lines = Vec::new();
    for id in input.globals.keys() {
        let symbol = input.table.get(*id);
        if let Some(ty) = symbol.global().and_then(|info| info.ty) {
            lines.push(format!("{}: {ty}", symbol.name));
        }
    }
    for id in space.imports.iter().chain(&space.defined) {
        let symbol = input.table.get(*id);
        if let Some(sig) = symbol.signature() {
            lines.push(format!("{}: {sig}", symbol.name));
        }
    }
    lines
}

fn method_info(input: &EmitInput<'_>, space: &IndexSpace) -> Vec<String> {
    space
        .defined
        .iter()
        .map(|id| format!("{} {}", space.functions[id], input.table.get(*id).name))
        .collect()
}

fn foreign_info(input: &EmitInput<'_>, space: &IndexSpace) -> Vec<String> {
    space
        .imports
        .iter()
        .filter_map(|id| {
            let symbol = input.table.get(*id);
            match &symbol.kind {
                SymbolKind::Foreign { sig, module, field } => {
                    Some(format!("{module} {field} {} {sig}", symbol.name))
                }
                _ => None,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::Ident;
    use crate::name_resolve::DeclSite;
    use crate::span::UnitId;
    use crate::types::Type;

    struct Fixture {
        table: SymbolTable,
        functions: BTreeMap<SymbolId, LoweredFunction>,
        globals: BTreeMap<SymbolId, LoweredGlobal>,
        data: DataLayout,
    }

    fn declare(table: &mut SymbolTable, name: &str, kind: SymbolKind) -> SymbolId {
        let ident = Ident {
            name: name.to_string(),
            span: Span::new(UnitId(0), 0, 0),
        };
        let site = DeclSite {
            unit: UnitId(0),
            item: table.len(),
        };
        table.declare(&ident, kind, site).expect("declare")
    }

    fn function(symbol: SymbolId, result: Option<ValType>, body: Vec<Op>) -> LoweredFunction {
        LoweredFunction {
            symbol,
            params: Vec::new(),
            result,
            locals: Vec::new(),
            body,
        }
    }

    // main calls helper and the imported `log`; `unused` and `unused_import`
    // are never referenced.
    fn fixture() -> Fixture {
        let mut table = SymbolTable::with_builtins();
        let void_sig = FunctionSig::new(Vec::new(), Type::Void);
        let int_sig = FunctionSig::new(Vec::new(), Type::I32);
        let log = declare(
            &mut table,
            "log",
            SymbolKind::Foreign {
                sig: FunctionSig::new(vec![Type::I32], Type::Void),
                module: "env".into(),
                field: "log".into(),
            },
        );
        declare(
            &mut table,
            "unused_import",
            SymbolKind::Foreign {
                sig: void_sig.clone(),
                module: "env".into(),
                field: "nothing".into(),
            },
        );
        let helper = declare(&mut table, "helper", SymbolKind::Function(int_sig.clone()));
        let unused = declare(&mut table, "unused", SymbolKind::Function(void_sig));
        let main = declare(&mut table, "main", SymbolKind::Function(int_sig));

        let mut functions = BTreeMap::new();
        functions.insert(
            helper,
            function(
                helper,
                Some(ValType::I32),
                vec![Op::Plain(Instruction::I32Const(41)), Op::Plain(Instruction::End)],
            ),
        );
        functions.insert(unused, function(unused, None, vec![Op::Plain(Instruction::End)]));
        functions.insert(
            main,
            function(
                main,
                Some(ValType::I32),
                vec![
                    Op::Plain(Instruction::I32Const(7)),
                    Op::Call(log),
                    Op::Call(helper),
                    Op::Plain(Instruction::I32Const(1)),
                    Op::Plain(Instruction::I32Add),
                    Op::Plain(Instruction::End),
                ],
            ),
        );

        Fixture {
            table,
            functions,
            globals: BTreeMap::new(),
            data: DataLayout::new(),
        }
    }

    fn emit(fixture: &Fixture, exports: &[ResolvedExport], options: EmitOptions) -> Vec<u8> {
        let input = EmitInput {
            table: &fixture.table,
            functions: &fixture.functions,
            globals: &fixture.globals,
            data: &fixture.data,
            exports,
            options,
        };
        generate_wasm(&input).expect("emit")
    }

    fn function_counts(wasm: &[u8]) -> (usize, usize) {
        let mut imports = 0;
        let mut defined = 0;
        for payload in wasmparser::Parser::new(0).parse_all(wasm) {
            match payload.expect("payload") {
                wasmparser::Payload::ImportSection(reader) => imports = reader.count() as usize,
                wasmparser::Payload::FunctionSection(reader) => defined = reader.count() as usize,
                _ => {}
            }
        }
        (imports, defined)
    }

    #[test]
    fn removes_unreachable_functions_and_imports() {
        let fixture = fixture();
        let wasm = emit(&fixture, &[], EmitOptions::default());
        wasmparser::validate(&wasm).expect("valid module");
        assert_eq!(function_counts(&wasm), (1, 2));
    }

    #[test]
    fn keeps_everything_when_requested() {
        let fixture = fixture();
        let options = EmitOptions {
            keep_stale_code: true,
            ..EmitOptions::default()
        };
        let wasm = emit(&fixture, &[], options);
        wasmparser::validate(&wasm).expect("valid module");
        assert_eq!(function_counts(&wasm), (2, 3));
    }

    #[test]
    fn rejects_duplicate_export_names() {
        let fixture = fixture();
        let helper = fixture.table.lookup("helper").unwrap();
        let span = Span::new(UnitId(0), 3, 4);
        let exports = vec![
            ResolvedExport {
                name: "x".into(),
                target: helper,
                span,
            },
            ResolvedExport {
                name: "x".into(),
                target: helper,
                span,
            },
        ];
        let input = EmitInput {
            table: &fixture.table,
            functions: &fixture.functions,
            globals: &fixture.globals,
            data: &fixture.data,
            exports: &exports,
            options: EmitOptions::default(),
        };
        let errors = generate_wasm(&input).unwrap_err();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].code, Some("E0404"));
    }

    #[test]
    fn writes_metadata_sections() {
        let fixture = fixture();
        let options = EmitOptions {
            foreign_info: true,
            type_info: true,
            method_info: true,
            ..EmitOptions::default()
        };
        let wasm = emit(&fixture, &[], options);

        let mut sections = HashMap::new();
        for payload in wasmparser::Parser::new(0).parse_all(&wasm) {
            if let wasmparser::Payload::CustomSection(reader) = payload.expect("payload") {
                let text = String::from_utf8(reader.data().to_vec()).expect("utf-8");
                sections.insert(reader.name().to_string(), text);
            }
        }
        assert_eq!(sections[METHOD_INFO_SECTION], "1 helper\n2 main\n");
        assert_eq!(sections[FOREIGN_INFO_SECTION], "env log log (i32) -> void\n");
        assert!(sections[TYPE_INFO_SECTION].contains("main: () -> i32\n"));
    }

    #[test]
    fn runs_emitted_module() {
        let fixture = fixture();
        let wasm = emit(&fixture, &[], EmitOptions::default());

        let engine = wasmi::Engine::default();
        let module = wasmi::Module::new(&engine, &wasm[..]).expect("module");
        let mut linker = wasmi::Linker::new(&engine);
        linker
            .func_wrap("env", "log", |_: i32| {})
            .expect("define log");
        let mut store = wasmi::Store::new(&engine, ());
        let instance = linker
            .instantiate_and_start(&mut store, &module)
            .expect("instantiate");
        let main = instance
            .get_typed_func::<(), i32>(&store, "main")
            .expect("main export");
        assert_eq!(main.call(&mut store, ()).expect("run main"), 42);
    }
}
