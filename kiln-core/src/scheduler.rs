//! The pump: a resumable driver that advances compilation one task at a time.
//!
//! Work is tracked per unit (`UnitStage`) and in queues of symbols. Each
//! call to [`Pipeline::step`] picks the highest-priority task that the
//! current phase allows. Earlier stages always win, so a unit registered
//! while later phases run is loaded, parsed, declared and checked before
//! the pipeline moves on. When no task is left the phase advances.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fs;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};

use log::{debug, trace, warn};
use rayon::prelude::*;

use crate::ast::{Item, LoadDirective, LoadKind};
use crate::codegen_wasm::{EmitInput, EmitOptions, ResolvedExport, generate_wasm};
use crate::corelib::{CORE_ORIGIN, CORE_SOURCE, collect_sources};
use crate::diagnostic::{Diagnostic, DiagnosticSink};
use crate::error::KilnError;
use crate::hir::HirFunction;
use crate::lower::{
    DataLayout, LowerOptions, LoweredFunction, LoweredGlobal, lower_function, lower_global,
};
use crate::name_resolve::{
    DeclareOptions, PendingExport, SymbolId, SymbolKind, SymbolTable, declare_module,
};
use crate::options::{OptionKey, Options};
use crate::parser::{ParseOptions, ParseResult, parse};
use crate::registry::{UnitRegistry, UnitSource, UnitStage, is_mapped, resolve_unit_path};
use crate::span::{Span, UnitId};
use crate::typecheck::{CheckOptions, FrozenScope, GlobalScope, check_function};

/// Upper bound on worker threads with `MultiThreading`.
const MAX_WORKERS: usize = 4;

/// Pipeline phases, in order. `Errored` may follow any of them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum PipelineState {
    Idle,
    Loading,
    Parsing,
    Resolving,
    Checking,
    Lowering,
    Emitting,
    Done,
    Errored,
}

impl PipelineState {
    pub fn is_terminal(self) -> bool {
        matches!(self, PipelineState::Done | PipelineState::Errored)
    }

    fn next(self) -> PipelineState {
        match self {
            PipelineState::Idle => PipelineState::Loading,
            PipelineState::Loading => PipelineState::Parsing,
            PipelineState::Parsing => PipelineState::Resolving,
            PipelineState::Resolving => PipelineState::Checking,
            PipelineState::Checking => PipelineState::Lowering,
            PipelineState::Lowering => PipelineState::Emitting,
            PipelineState::Emitting | PipelineState::Done => PipelineState::Done,
            PipelineState::Errored => PipelineState::Errored,
        }
    }
}

/// Result of one [`Pipeline::step`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PumpStatus {
    Continue,
    Done,
    Errored,
}

/// Parts of the context the pipeline works on.
pub struct Env<'a> {
    pub options: &'a Options,
    pub folders: &'a HashMap<String, PathBuf>,
    pub registry: &'a mut UnitRegistry,
    pub sink: &'a mut DiagnosticSink,
}

impl Env<'_> {
    fn report(&mut self, diagnostic: Diagnostic) {
        let record = self.registry.record(diagnostic);
        self.sink.append(record);
    }

    fn report_all(&mut self, diagnostics: impl IntoIterator<Item = Diagnostic>) {
        for diagnostic in diagnostics {
            self.report(diagnostic);
        }
    }
}

#[derive(Debug)]
enum Task {
    Load(UnitId),
    Parse(Vec<UnitId>),
    Declare(UnitId),
    ResolveGlobal(SymbolId),
    ResolveExport,
    Check(Vec<SymbolId>),
    LowerGlobal(SymbolId),
    LowerFunction(SymbolId),
    Emit,
}

impl Task {
    fn needs_clean_sink(&self) -> bool {
        matches!(
            self,
            Task::LowerGlobal(_) | Task::LowerFunction(_) | Task::Emit
        )
    }
}

pub struct Pipeline {
    state: PipelineState,
    pool: Option<rayon::ThreadPool>,
    check_options: CheckOptions,

    symbols: SymbolTable,
    global_queue: VecDeque<SymbolId>,
    export_queue: VecDeque<PendingExport>,
    check_queue: VecDeque<SymbolId>,
    lower_global_queue: VecDeque<SymbolId>,
    lower_function_queue: VecDeque<SymbolId>,

    exports: Vec<ResolvedExport>,
    checked: BTreeMap<SymbolId, HirFunction>,
    lowered_globals: BTreeMap<SymbolId, LoweredGlobal>,
    lowered_functions: BTreeMap<SymbolId, LoweredFunction>,
    data: DataLayout,
    emitted: Option<Vec<u8>>,
}

impl Default for Pipeline {
    fn default() -> Self {
        Pipeline::new()
    }
}

impl Pipeline {
    pub fn new() -> Self {
        Pipeline {
            state: PipelineState::Idle,
            pool: None,
            check_options: CheckOptions {
                allow_file_contents: true,
                working_dir: PathBuf::from("."),
            },
            symbols: SymbolTable::with_builtins(),
            global_queue: VecDeque::new(),
            export_queue: VecDeque::new(),
            check_queue: VecDeque::new(),
            lower_global_queue: VecDeque::new(),
            lower_function_queue: VecDeque::new(),
            exports: Vec::new(),
            checked: BTreeMap::new(),
            lowered_globals: BTreeMap::new(),
            lowered_functions: BTreeMap::new(),
            data: DataLayout::new(),
            emitted: None,
        }
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    pub fn status(&self) -> PumpStatus {
        match self.state {
            PipelineState::Done => PumpStatus::Done,
            PipelineState::Errored => PumpStatus::Errored,
            _ => PumpStatus::Continue,
        }
    }

    pub fn symbols(&self) -> &SymbolTable {
        &self.symbols
    }

    /// The finished module; `None` unless the pipeline is `Done`.
    pub fn output(&self) -> Option<&[u8]> {
        match self.state {
            PipelineState::Done => self.emitted.as_deref(),
            _ => None,
        }
    }

    /// Leave `Idle`: validate options, register the core unit and build the pool.
    pub fn start(&mut self, env: &mut Env<'_>) -> Result<(), KilnError> {
        if self.state != PipelineState::Idle {
            return Err(KilnError::AlreadyStarted);
        }
        env.options.validate()?;

        if env.options.multi_threading {
            let workers = std::thread::available_parallelism()
                .map_or(1, NonZeroUsize::get)
                .clamp(1, MAX_WORKERS);
            let pool = rayon::ThreadPoolBuilder::new()
                .num_threads(workers)
                .thread_name(|index| format!("kiln-worker-{index}"))
                .build()
                .map_err(|err| KilnError::InvalidOption {
                    key: OptionKey::MultiThreading,
                    reason: err.to_string(),
                })?;
            debug!("started worker pool with {workers} threads");
            self.pool = Some(pool);
        }

        if !env.options.disable_core {
            env.registry
                .register_named(CORE_ORIGIN, CORE_SOURCE.to_string());
        }

        self.check_options = CheckOptions {
            allow_file_contents: !env.options.disable_file_contents,
            working_dir: env.options.current_directory.clone(),
        };
        self.transition(PipelineState::Loading);
        Ok(())
    }

    /// Perform one task, or one phase transition when no task is left.
    pub fn step(&mut self, env: &mut Env<'_>) -> PumpStatus {
        match self.state {
            PipelineState::Done | PipelineState::Errored => return self.status(),
            PipelineState::Idle => {
                if let Err(err) = self.start(env) {
                    env.report(Diagnostic::detached(err.to_string()));
                    self.transition(PipelineState::Errored);
                }
                return self.status();
            }
            _ => {}
        }

        match self.next_task(env.registry) {
            Some(task) if task.needs_clean_sink() && env.sink.has_fatal() => {
                self.transition(PipelineState::Errored);
            }
            Some(task) => {
                trace!("{:?}: {task:?}", self.state);
                self.run(task, env);
            }
            None if env.sink.has_fatal() => self.transition(PipelineState::Errored),
            None => self.transition(self.state.next()),
        }
        self.status()
    }

    fn transition(&mut self, to: PipelineState) {
        debug!("pipeline {:?} -> {to:?}", self.state);
        self.state = to;
    }

    fn next_task(&self, registry: &UnitRegistry) -> Option<Task> {
        let phase = self.state;

        if let Some(unit) = registry.first_in_stage(UnitStage::Registered) {
            return Some(Task::Load(unit));
        }
        if phase >= PipelineState::Parsing {
            let mut loaded = registry.in_stage(UnitStage::Loaded);
            if self.pool.is_some() {
                let batch: Vec<UnitId> = loaded.collect();
                if !batch.is_empty() {
                    return Some(Task::Parse(batch));
                }
            } else if let Some(unit) = loaded.next() {
                return Some(Task::Parse(vec![unit]));
            }
        }
        if phase >= PipelineState::Resolving {
            if let Some(unit) = registry.first_in_stage(UnitStage::Parsed) {
                return Some(Task::Declare(unit));
            }
            if let Some(id) = self.global_queue.front() {
                return Some(Task::ResolveGlobal(*id));
            }
            if !self.export_queue.is_empty() {
                return Some(Task::ResolveExport);
            }
        }
        if phase >= PipelineState::Checking && !self.check_queue.is_empty() {
            let batch = match self.pool {
                Some(_) => self.check_queue.iter().copied().collect(),
                None => self.check_queue.iter().take(1).copied().collect(),
            };
            return Some(Task::Check(batch));
        }
        if phase >= PipelineState::Lowering {
            if let Some(id) = self.lower_global_queue.front() {
                return Some(Task::LowerGlobal(*id));
            }
            if let Some(id) = self.lower_function_queue.front() {
                return Some(Task::LowerFunction(*id));
            }
        }
        if phase == PipelineState::Emitting && self.emitted.is_none() {
            return Some(Task::Emit);
        }
        None
    }

    fn run(&mut self, task: Task, env: &mut Env<'_>) {
        match task {
            Task::Load(unit) => load_unit(env, unit),
            Task::Parse(units) => self.parse_units(env, &units),
            Task::Declare(unit) => self.declare_unit(env, unit),
            Task::ResolveGlobal(id) => {
                self.global_queue.pop_front();
                let mut diagnostics = Vec::new();
                GlobalScope::new(&mut self.symbols, env.registry, &self.check_options)
                    .resolve(id, &mut diagnostics);
                env.report_all(diagnostics);
                self.lower_global_queue.push_back(id);
            }
            Task::ResolveExport => {
                if let Some(export) = self.export_queue.pop_front() {
                    match self.resolve_export(export) {
                        Ok(resolved) => self.exports.push(resolved),
                        Err(diagnostic) => env.report(diagnostic),
                    }
                }
            }
            Task::Check(ids) => self.check_functions(env, ids),
            Task::LowerGlobal(id) => {
                self.lower_global_queue.pop_front();
                self.emitted = None;
                match lower_global(id, &self.symbols, &mut self.data) {
                    Ok(global) => {
                        self.lowered_globals.insert(id, global);
                    }
                    Err(diagnostic) => env.report(diagnostic),
                }
            }
            Task::LowerFunction(id) => {
                self.lower_function_queue.pop_front();
                self.emitted = None;
                let Some(function) = self.checked.remove(&id) else {
                    return;
                };
                let options = LowerOptions {
                    saturating_casts: env.options.post_mvp_features,
                };
                match lower_function(&function, &mut self.data, options) {
                    Ok(lowered) => {
                        self.lowered_functions.insert(id, lowered);
                    }
                    Err(diagnostics) => env.report_all(diagnostics),
                }
            }
            Task::Emit => self.emit(env),
        }
    }

    fn parse_units(&mut self, env: &mut Env<'_>, units: &[UnitId]) {
        let options = ParseOptions {
            optional_semicolons: env.options.optional_semicolons,
        };
        let registry: &UnitRegistry = env.registry;
        let parse_one = |unit: &UnitId| parse(*unit, &registry.get(*unit).text, options);
        let results: Vec<ParseResult> = match &self.pool {
            Some(pool) if units.len() > 1 => {
                pool.install(|| units.par_iter().map(parse_one).collect())
            }
            _ => units.iter().map(parse_one).collect(),
        };

        // Merge in registration order.
        for (unit, result) in units.iter().zip(results) {
            env.report_all(result.diagnostics);
            let loads: Vec<LoadDirective> = result
                .module
                .items
                .iter()
                .filter_map(|item| match item {
                    Item::Load(load) => Some(load.clone()),
                    _ => None,
                })
                .collect();
            let entry = env.registry.get_mut(*unit);
            entry.module = Some(result.module);
            entry.stage = UnitStage::Parsed;
            for load in &loads {
                process_load(env, *unit, load);
            }
        }
    }

    fn declare_unit(&mut self, env: &mut Env<'_>, unit: UnitId) {
        let options = DeclareOptions {
            disable_extensions: env.options.disable_extensions,
        };
        let declared = match &env.registry.get(unit).module {
            Some(module) => declare_module(&mut self.symbols, unit, module, options),
            None => Default::default(),
        };
        env.registry.get_mut(unit).stage = UnitStage::Declared;
        debug!(
            "declared {}: {} functions, {} globals",
            env.registry.get(unit).origin,
            declared.functions.len(),
            declared.globals.len()
        );

        self.global_queue.extend(declared.globals);
        self.check_queue.extend(declared.functions);
        self.export_queue.extend(declared.exports);
        env.report_all(declared.diagnostics);
    }

    fn resolve_export(&self, export: PendingExport) -> Result<ResolvedExport, Diagnostic> {
        let target = &export.target;
        let Some(id) = self.symbols.lookup(&target.name) else {
            return Err(Diagnostic::error(
                format!("cannot find `{}` to export", target.name),
                target.span,
            )
            .with_code("E0201"));
        };
        match &self.symbols.get(id).kind {
            SymbolKind::Function(_) | SymbolKind::Foreign { .. } => Ok(ResolvedExport {
                name: export.name,
                target: id,
                span: export.span,
            }),
            other => Err(Diagnostic::error(
                format!(
                    "only functions can be exported, but `{}` is a {}",
                    target.name,
                    other.describe()
                ),
                target.span,
            )
            .with_code("E0205")),
        }
    }

    fn check_functions(&mut self, env: &mut Env<'_>, ids: Vec<SymbolId>) {
        for _ in 0..ids.len() {
            self.check_queue.pop_front();
        }

        let symbols = &self.symbols;
        let registry: &UnitRegistry = env.registry;
        let options = &self.check_options;
        let check_one = |id: &SymbolId| -> Option<(HirFunction, Vec<Diagnostic>)> {
            let site = symbols.get(*id).site?;
            let decl = registry.function_decl(site)?;
            let base_dir = registry.get(site.unit).base_dir(&options.working_dir);
            let mut scope = FrozenScope::new(symbols);
            Some(check_function(&mut scope, options, base_dir, *id, decl))
        };
        let results: Vec<_> = match &self.pool {
            Some(pool) if ids.len() > 1 => pool.install(|| ids.par_iter().map(check_one).collect()),
            _ => ids.iter().map(check_one).collect(),
        };

        // Merge in declaration order.
        for (id, result) in ids.into_iter().zip(results) {
            let Some((function, diagnostics)) = result else {
                continue;
            };
            env.report_all(diagnostics);
            self.checked.insert(id, function);
            self.lower_function_queue.push_back(id);
        }
    }

    fn emit(&mut self, env: &mut Env<'_>) {
        let input = EmitInput {
            table: &self.symbols,
            functions: &self.lowered_functions,
            globals: &self.lowered_globals,
            data: &self.data,
            exports: &self.exports,
            options: EmitOptions {
                keep_stale_code: env.options.disable_stale_code,
                foreign_info: env.options.generate_foreign_info,
                type_info: env.options.generate_type_info,
                method_info: env.options.generate_method_info,
            },
        };
        match generate_wasm(&input) {
            Ok(bytes) => {
                debug!("emitted module of {} bytes", bytes.len());
                self.emitted = Some(bytes);
            }
            Err(diagnostics) => env.report_all(diagnostics),
        }
    }
}

fn load_unit(env: &mut Env<'_>, unit: UnitId) {
    let path = match &env.registry.get(unit).source {
        UnitSource::File { path, .. } => path.clone(),
        // Injected units are registered with their text.
        UnitSource::Injected => {
            env.registry.get_mut(unit).stage = UnitStage::Loaded;
            return;
        }
    };
    let at_start = Span::new(unit, 0, 0);
    let failure = match fs::read(&path) {
        Ok(bytes) => match String::from_utf8(bytes) {
            Ok(text) => {
                debug!("loaded {} ({} bytes)", path.display(), text.len());
                env.registry.get_mut(unit).set_text(text);
                return;
            }
            Err(_) => Diagnostic::error(
                format!("{} is not valid UTF-8", path.display()),
                at_start,
            )
            .with_code("E0502"),
        },
        Err(err) => Diagnostic::error(
            format!("cannot read {}: {err}", path.display()),
            at_start,
        )
        .with_code("E0501"),
    };
    env.registry.get_mut(unit).stage = UnitStage::Failed;
    env.report(failure);
}

/// Register the units named by a `#load` directive found in `unit`.
fn process_load(env: &mut Env<'_>, unit: UnitId, load: &LoadDirective) {
    let working_dir = env.options.current_directory.clone();
    let including_dir = env.registry.get(unit).base_dir(&working_dir);
    let append_extension = load.kind == LoadKind::File;

    let mut candidates = Vec::new();
    if !is_mapped(&load.target, env.folders) && !Path::new(&load.target).is_absolute() {
        candidates.push(resolve_unit_path(
            &load.target,
            env.folders,
            &including_dir,
            append_extension,
        ));
    }
    candidates.push(resolve_unit_path(
        &load.target,
        env.folders,
        &working_dir,
        append_extension,
    ));

    match load.kind {
        LoadKind::File => match candidates.into_iter().find(|path| path.is_file()) {
            Some(path) => register_loaded(env, &load.target, path, load.span),
            None => env.report(
                Diagnostic::error(format!("cannot find unit `{}` to load", load.target), load.span)
                    .with_code("E0503"),
            ),
        },
        LoadKind::All | LoadKind::AllRecursive => {
            let recursive = load.kind == LoadKind::AllRecursive;
            let listing = candidates
                .into_iter()
                .find(|path| path.is_dir())
                .map(|dir| collect_sources(dir, recursive));
            match listing {
                Some(Ok(files)) => {
                    for file in files {
                        let name = file.display().to_string();
                        register_loaded(env, &name, file, load.span);
                    }
                }
                Some(Err(err)) => env.report(
                    Diagnostic::error(
                        format!("cannot list `{}`: {err}", load.target),
                        load.span,
                    )
                    .with_code("E0504"),
                ),
                None => env.report(
                    Diagnostic::error(format!("`{}` is not a directory", load.target), load.span)
                        .with_code("E0504"),
                ),
            }
        }
    }
}

fn register_loaded(env: &mut Env<'_>, name: &str, path: PathBuf, span: Span) {
    if env.registry.contains_path(&path) {
        trace!("{} is already registered", path.display());
        return;
    }
    if let Err(err) = env.registry.register_file(name, path) {
        warn!("#load of `{name}` failed: {err}");
        env.report(Diagnostic::error(err.to_string(), span).with_code("E0503"));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Harness {
        options: Options,
        folders: HashMap<String, PathBuf>,
        registry: UnitRegistry,
        sink: DiagnosticSink,
        pipeline: Pipeline,
    }

    impl Harness {
        fn new(options: Options) -> Self {
            Harness {
                options,
                folders: HashMap::new(),
                registry: UnitRegistry::new(),
                sink: DiagnosticSink::new(),
                pipeline: Pipeline::new(),
            }
        }

        fn step(&mut self) -> PumpStatus {
            let mut env = Env {
                options: &self.options,
                folders: &self.folders,
                registry: &mut self.registry,
                sink: &mut self.sink,
            };
            self.pipeline.step(&mut env)
        }

        fn run(&mut self) -> (PumpStatus, Vec<PipelineState>) {
            let mut states = vec![self.pipeline.state()];
            loop {
                let status = self.step();
                states.push(self.pipeline.state());
                if status != PumpStatus::Continue {
                    return (status, states);
                }
            }
        }
    }

    fn no_core() -> Options {
        Options {
            disable_core: true,
            ..Options::default()
        }
    }

    #[test]
    fn visits_every_phase_in_order() {
        let mut harness = Harness::new(no_core());
        harness
            .registry
            .register_injected("main :: () -> i32 { return 1; }".into());
        let (status, states) = harness.run();
        assert_eq!(status, PumpStatus::Done);
        assert!(states.windows(2).all(|pair| pair[0] <= pair[1]));

        let mut phases = states.clone();
        phases.dedup();
        assert_eq!(
            phases,
            vec![
                PipelineState::Idle,
                PipelineState::Loading,
                PipelineState::Parsing,
                PipelineState::Resolving,
                PipelineState::Checking,
                PipelineState::Lowering,
                PipelineState::Emitting,
                PipelineState::Done,
            ]
        );
        assert!(harness.pipeline.output().is_some());
    }

    #[test]
    fn folds_late_units_into_earlier_stages() {
        let mut harness = Harness::new(no_core());
        harness
            .registry
            .register_injected("main :: () -> i32 { return 1; }".into());
        while harness.pipeline.state() < PipelineState::Checking {
            harness.step();
        }

        let late = harness
            .registry
            .register_injected("helper :: () -> i32 { return 2; }".into());
        harness.step();
        assert_eq!(harness.registry.get(late).stage, UnitStage::Parsed);
        assert_eq!(harness.pipeline.state(), PipelineState::Checking);

        let (status, _) = harness.run();
        assert_eq!(status, PumpStatus::Done);
        assert!(harness.pipeline.symbols().lookup("helper").is_some());
    }

    #[test]
    fn gates_lowering_on_fatal_diagnostics() {
        let mut harness = Harness::new(no_core());
        harness
            .registry
            .register_injected("main :: () -> i32 { return missing; }".into());
        let (status, states) = harness.run();
        assert_eq!(status, PumpStatus::Errored);
        assert!(!states.contains(&PipelineState::Lowering));
        assert!(harness.pipeline.output().is_none());
        assert_eq!(harness.sink.fatal_count(), 1);
    }

    #[test]
    fn reports_unreadable_units_at_load() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("bad.kiln");
        fs::write(&path, [0xff, 0xfe, 0x00]).unwrap();

        let mut harness = Harness::new(no_core());
        let unit = harness.registry.register_file("bad", path).unwrap();
        let (status, _) = harness.run();
        assert_eq!(status, PumpStatus::Errored);
        assert_eq!(harness.registry.get(unit).stage, UnitStage::Failed);
        let record = harness.sink.get(0).unwrap();
        assert_eq!(record.code(), Some("E0502"));
        assert_eq!((record.line(), record.column()), (1, 1));
    }

    #[test]
    fn implicit_start_failure_is_reported() {
        let options = Options {
            current_directory: PathBuf::from("./no/such/directory"),
            ..no_core()
        };
        let mut harness = Harness::new(options);
        assert_eq!(harness.step(), PumpStatus::Errored);
        assert_eq!(harness.sink.count(), 1);
        assert_eq!(harness.sink.get(0).unwrap().origin(), "");
        assert_eq!(harness.step(), PumpStatus::Errored);
        assert_eq!(harness.sink.count(), 1);
    }

    #[test]
    fn parses_and_checks_in_batches_with_workers() {
        let options = Options {
            multi_threading: true,
            ..no_core()
        };
        let mut harness = Harness::new(options);
        for index in 0..4 {
            harness
                .registry
                .register_injected(format!("f{index} :: () -> i32 {{ return {index}; }}"));
        }
        while harness.pipeline.state() < PipelineState::Parsing {
            harness.step();
        }
        harness.step();
        assert_eq!(harness.registry.in_stage(UnitStage::Parsed).count(), 4);

        let (status, _) = harness.run();
        assert_eq!(status, PumpStatus::Done);
    }
}
