//! The compilation context: the one object embedders hold.
//!
//! A `Context` owns its options, folder mappings, units, diagnostics and
//! pipeline. Nothing is shared between contexts.

use std::collections::HashMap;
use std::path::PathBuf;

use log::debug;

use crate::diagnostic::{DiagnosticRecord, DiagnosticSink};
use crate::error::KilnError;
use crate::options::{OptionKey, OptionValue, Options};
use crate::registry::{UnitRegistry, resolve_unit_path};
use crate::scheduler::{Env, Pipeline, PipelineState, PumpStatus};
use crate::span::UnitId;

#[derive(Default)]
pub struct Context {
    options: Options,
    folders: HashMap<String, PathBuf>,
    registry: UnitRegistry,
    sink: DiagnosticSink,
    pipeline: Pipeline,
}

impl Context {
    pub fn new() -> Self {
        Self::default()
    }

    /// Release the context. Equivalent to dropping it.
    pub fn free(self) {}

    // -----------------------------------------------------------------
    // Options
    // -----------------------------------------------------------------

    pub fn set_option(&mut self, key: OptionKey, value: OptionValue) -> Result<(), KilnError> {
        self.ensure_configurable()?;
        self.options.set(key, value)?;
        debug!("option {key:?} set");
        Ok(())
    }

    pub fn set_option_str(&mut self, key: OptionKey, value: &str) -> Result<(), KilnError> {
        self.set_option(key, value.into())
    }

    pub fn set_option_bytes(&mut self, key: OptionKey, value: &[u8]) -> Result<(), KilnError> {
        self.set_option(key, value.into())
    }

    pub fn set_option_int(&mut self, key: OptionKey, value: i32) -> Result<(), KilnError> {
        self.set_option(key, value.into())
    }

    pub fn options(&self) -> &Options {
        &self.options
    }

    /// Make `name:rest` unit names resolve under `path`.
    pub fn map_folder(&mut self, name: &str, path: impl Into<PathBuf>) -> Result<(), KilnError> {
        self.ensure_configurable()?;
        let path = path.into();
        debug!("mapped folder {name} to {}", path.display());
        self.folders.insert(name.to_string(), path);
        Ok(())
    }

    fn ensure_configurable(&self) -> Result<(), KilnError> {
        if self.pipeline.state() != PipelineState::Idle {
            return Err(KilnError::OptionsFrozen);
        }
        Ok(())
    }

    // -----------------------------------------------------------------
    // Units
    // -----------------------------------------------------------------

    /// Register a source file by logical name.
    pub fn add_file(&mut self, name: &str) -> Result<UnitId, KilnError> {
        self.ensure_open()?;
        let path = resolve_unit_path(name, &self.folders, &self.options.current_directory, true);
        self.registry.register_file(name, path)
    }

    /// Like [`Context::add_file`], for a name given as raw bytes.
    pub fn add_file_bytes(&mut self, name: &[u8]) -> Result<UnitId, KilnError> {
        let name = std::str::from_utf8(name).map_err(|_| KilnError::EncodingError("unit name"))?;
        self.add_file(name)
    }

    /// Register a code buffer as its own unit.
    pub fn add_injected(&mut self, code: impl AsRef<[u8]>) -> Result<UnitId, KilnError> {
        self.ensure_open()?;
        let text = std::str::from_utf8(code.as_ref())
            .map_err(|_| KilnError::EncodingError("injected code"))?;
        Ok(self.registry.register_injected(text.to_string()))
    }

    fn ensure_open(&self) -> Result<(), KilnError> {
        if self.pipeline.state().is_terminal() {
            return Err(KilnError::PipelineClosed);
        }
        Ok(())
    }

    pub fn unit_count(&self) -> usize {
        self.registry.len()
    }

    /// Display name of a unit, as used in diagnostics.
    pub fn unit_origin(&self, unit: UnitId) -> Option<&str> {
        (unit.index() < self.registry.len()).then(|| self.registry.get(unit).origin.as_str())
    }

    // -----------------------------------------------------------------
    // Driving
    // -----------------------------------------------------------------

    /// Freeze options and leave `Idle`.
    pub fn start(&mut self) -> Result<(), KilnError> {
        let (pipeline, mut env) = self.split();
        pipeline.start(&mut env)
    }

    /// Advance by one task.
    pub fn step(&mut self) -> PumpStatus {
        let (pipeline, mut env) = self.split();
        pipeline.step(&mut env)
    }

    pub fn run_to_completion(&mut self) -> PumpStatus {
        loop {
            let status = self.step();
            if status != PumpStatus::Continue {
                return status;
            }
        }
    }

    pub fn state(&self) -> PipelineState {
        self.pipeline.state()
    }

    fn split(&mut self) -> (&mut Pipeline, Env<'_>) {
        let env = Env {
            options: &self.options,
            folders: &self.folders,
            registry: &mut self.registry,
            sink: &mut self.sink,
        };
        (&mut self.pipeline, env)
    }

    // -----------------------------------------------------------------
    // Diagnostics
    // -----------------------------------------------------------------

    pub fn diagnostic_count(&self) -> usize {
        self.sink.count()
    }

    pub fn diagnostic(&self, index: usize) -> Result<&DiagnosticRecord, KilnError> {
        self.sink.get(index)
    }

    pub fn diagnostics(&self) -> impl Iterator<Item = &DiagnosticRecord> {
        self.sink.iter()
    }

    pub fn error_message(&self, index: usize) -> Result<&str, KilnError> {
        Ok(self.sink.get(index)?.message())
    }

    pub fn error_filename(&self, index: usize) -> Result<&str, KilnError> {
        Ok(self.sink.get(index)?.origin())
    }

    pub fn error_line(&self, index: usize) -> Result<u32, KilnError> {
        Ok(self.sink.get(index)?.line())
    }

    pub fn error_column(&self, index: usize) -> Result<u32, KilnError> {
        Ok(self.sink.get(index)?.column())
    }

    pub fn error_length(&self, index: usize) -> Result<u32, KilnError> {
        Ok(self.sink.get(index)?.length())
    }

    // -----------------------------------------------------------------
    // Output
    // -----------------------------------------------------------------

    /// The emitted module, once the pipeline is `Done`.
    pub fn output(&self) -> Option<&[u8]> {
        self.pipeline.output()
    }

    /// Size of the emitted module; 0 until `Done`.
    pub fn output_len(&self) -> usize {
        self.output().map_or(0, <[u8]>::len)
    }

    /// Copy the module into `buffer`, which must be exactly `output_len()` bytes.
    pub fn write_output(&self, buffer: &mut [u8]) -> Result<(), KilnError> {
        let output = self.output().unwrap_or_default();
        if buffer.len() != output.len() {
            return Err(KilnError::BufferSizeMismatch {
                expected: output.len(),
                actual: buffer.len(),
            });
        }
        buffer.copy_from_slice(output);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codegen_wasm::TYPE_INFO_SECTION;
    use std::fs;

    fn context() -> Context {
        let mut ctx = Context::new();
        ctx.set_option_int(OptionKey::DisableCore, 1).unwrap();
        ctx
    }

    fn compile(ctx: &mut Context) -> Vec<u8> {
        let status = ctx.run_to_completion();
        let messages: Vec<String> = ctx.diagnostics().map(ToString::to_string).collect();
        assert_eq!(status, PumpStatus::Done, "{messages:#?}");
        let mut buffer = vec![0; ctx.output_len()];
        ctx.write_output(&mut buffer).expect("write output");
        wasmparser::validate(&buffer).expect("valid module");
        buffer
    }

    fn run_main<R: wasmi::WasmResults>(wasm: &[u8]) -> R {
        let engine = wasmi::Engine::default();
        let module = wasmi::Module::new(&engine, wasm).expect("module");
        let linker = wasmi::Linker::new(&engine);
        let mut store = wasmi::Store::new(&engine, ());
        let instance = linker
            .instantiate_and_start(&mut store, &module)
            .expect("instantiate");
        let main = instance
            .get_typed_func::<(), R>(&store, "main")
            .expect("main export");
        main.call(&mut store, ()).expect("run main")
    }

    #[test]
    fn single_declaration_compiles() {
        let mut ctx = context();
        ctx.add_injected("main :: () -> i32 { return 0; }").unwrap();
        let wasm = compile(&mut ctx);
        assert!(!wasm.is_empty());
        assert_eq!(ctx.diagnostic_count(), 0);
        assert_eq!(run_main::<i32>(&wasm), 0);
    }

    #[test]
    fn undefined_identifier_fails_at_reference() {
        let mut ctx = context();
        ctx.add_injected("main :: () -> i32 {\n    return undefined_thing;\n}")
            .unwrap();
        assert_eq!(ctx.run_to_completion(), PumpStatus::Errored);
        assert!(ctx.diagnostic_count() >= 1);
        assert_eq!(ctx.error_filename(0).unwrap(), "<injected #1>");
        assert_eq!(ctx.error_line(0).unwrap(), 2);
        assert_eq!(ctx.error_column(0).unwrap(), 12);
        assert_eq!(ctx.error_length(0).unwrap(), "undefined_thing".len() as u32);
        assert!(ctx.error_message(0).unwrap().contains("undefined_thing"));
    }

    #[test]
    fn file_unit_diagnostic_names_the_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("main.kiln");
        fs::write(&path, "main :: () -> i32 {\n  x := 1;\n  return x + missing;\n}").unwrap();

        let mut ctx = context();
        ctx.set_option_str(OptionKey::CurrentDirectory, &dir.path().to_string_lossy())
            .unwrap();
        ctx.add_file("main").unwrap();
        assert_eq!(ctx.run_to_completion(), PumpStatus::Errored);
        assert_eq!(ctx.error_filename(0).unwrap(), path.display().to_string());
        assert_eq!(ctx.error_line(0).unwrap(), 3);
        assert_eq!(ctx.error_column(0).unwrap(), 14);
        assert_eq!(ctx.error_length(0).unwrap(), "missing".len() as u32);
    }

    #[test]
    fn typed_locals_compile() {
        let mut ctx = context();
        ctx.add_injected(
            "main :: () -> i32 {\n\
                 x : i32 = 1;\n\
                 y : i32;\n\
                 y = x + 41;\n\
                 return y;\n\
             }",
        )
        .unwrap();
        let wasm = compile(&mut ctx);
        assert_eq!(ctx.diagnostic_count(), 0);
        assert_eq!(run_main::<i32>(&wasm), 42);
    }

    #[test]
    fn deep_nesting_is_a_diagnostic() {
        let depth = 100_000;
        let mut ctx = context();
        ctx.add_injected(format!(
            "main :: () -> i32 {{ return {}1{}; }}",
            "(".repeat(depth),
            ")".repeat(depth)
        ))
        .unwrap();
        assert_eq!(ctx.run_to_completion(), PumpStatus::Errored);
        assert_eq!(ctx.diagnostic(0).unwrap().code(), Some("E0107"));
    }

    #[test]
    fn cross_unit_reference_compiles() {
        let mut ctx = context();
        ctx.add_injected("main :: () -> i32 { return helper() + LIMIT; }")
            .unwrap();
        ctx.add_injected("helper :: () -> i32 { return 40; }\nLIMIT :: 2;")
            .unwrap();
        let wasm = compile(&mut ctx);
        assert_eq!(ctx.diagnostic_count(), 0);
        assert_eq!(run_main::<i32>(&wasm), 42);
    }

    #[test]
    fn missing_file_fails_immediately() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut ctx = context();
        ctx.set_option_str(OptionKey::CurrentDirectory, &dir.path().to_string_lossy())
            .unwrap();
        let err = ctx.add_file("nope").unwrap_err();
        assert!(matches!(err, KilnError::UnitNotFound { .. }));
        assert_eq!(ctx.diagnostic_count(), 0);
        assert_eq!(ctx.state(), PipelineState::Idle);
        assert_eq!(ctx.unit_count(), 0);
    }

    #[test]
    fn duplicate_files_are_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::write(dir.path().join("main.kiln"), "main :: () {}").unwrap();
        let mut ctx = context();
        ctx.set_option_str(OptionKey::CurrentDirectory, &dir.path().to_string_lossy())
            .unwrap();
        let unit = ctx.add_file("main").unwrap();
        assert!(matches!(
            ctx.add_file("main.kiln"),
            Err(KilnError::DuplicateUnit(_))
        ));
        assert_eq!(ctx.unit_count(), 1);
        assert!(ctx.unit_origin(unit).unwrap().ends_with("main.kiln"));
    }

    #[test]
    fn terminal_step_is_idempotent() {
        let mut ctx = context();
        ctx.add_injected("main :: () { x := ; }").unwrap();
        assert_eq!(ctx.run_to_completion(), PumpStatus::Errored);
        let count = ctx.diagnostic_count();
        for _ in 0..3 {
            assert_eq!(ctx.step(), PumpStatus::Errored);
        }
        assert_eq!(ctx.diagnostic_count(), count);
        assert_eq!(ctx.state(), PipelineState::Errored);
        assert!(matches!(
            ctx.add_injected("x :: 1;"),
            Err(KilnError::PipelineClosed)
        ));
    }

    #[test]
    fn diagnostic_count_never_decreases() {
        let mut ctx = context();
        ctx.add_injected("a :: () -> i32 { return b; }\nc :: () -> i32 { return d; }")
            .unwrap();
        let mut last = 0;
        while ctx.step() == PumpStatus::Continue {
            assert!(ctx.diagnostic_count() >= last);
            last = ctx.diagnostic_count();
        }
        assert_eq!(ctx.diagnostic_count(), 2);
        assert!(matches!(
            ctx.diagnostic(2),
            Err(KilnError::IndexOutOfRange { index: 2, count: 2 })
        ));
    }

    #[test]
    fn no_output_after_errors() {
        let mut ctx = context();
        ctx.add_injected("main :: () -> i32 { return true; }").unwrap();
        assert_eq!(ctx.run_to_completion(), PumpStatus::Errored);
        assert_eq!(ctx.output_len(), 0);
        assert!(ctx.output().is_none());
        ctx.write_output(&mut []).expect("empty buffer accepted");
        assert!(matches!(
            ctx.write_output(&mut [0; 4]),
            Err(KilnError::BufferSizeMismatch { expected: 0, actual: 4 })
        ));
    }

    #[test]
    fn output_retrieval_is_stable() {
        let mut ctx = context();
        ctx.add_injected("main :: () -> i32 { return 3; }").unwrap();
        let first = compile(&mut ctx);
        assert_eq!(ctx.output_len(), first.len());

        let mut second = vec![0; ctx.output_len()];
        ctx.write_output(&mut second).unwrap();
        assert_eq!(first, second);

        let mut short = vec![0; first.len() - 1];
        assert!(ctx.write_output(&mut short).is_err());
    }

    #[test]
    fn options_freeze_after_start() {
        let mut ctx = context();
        ctx.start().unwrap();
        assert!(matches!(
            ctx.set_option_int(OptionKey::PostMvpFeatures, 1),
            Err(KilnError::OptionsFrozen)
        ));
        assert!(matches!(ctx.map_folder("lib", "/tmp"), Err(KilnError::OptionsFrozen)));
        assert!(!ctx.options().post_mvp_features);
        assert!(matches!(ctx.start(), Err(KilnError::AlreadyStarted)));
    }

    #[test]
    fn option_types_are_checked() {
        let mut ctx = Context::new();
        assert!(matches!(
            ctx.set_option_str(OptionKey::MultiThreading, "yes"),
            Err(KilnError::OptionType { .. })
        ));
        assert!(matches!(
            ctx.set_option_int(OptionKey::CurrentDirectory, 1),
            Err(KilnError::OptionType { .. })
        ));
        ctx.set_option_bytes(OptionKey::NoOp, b"anything").unwrap();
    }

    #[test]
    fn start_rejects_missing_working_directory() {
        let mut ctx = context();
        ctx.set_option_str(OptionKey::CurrentDirectory, "./no/such/dir")
            .unwrap();
        assert!(matches!(ctx.start(), Err(KilnError::InvalidOption { .. })));
        assert_eq!(ctx.state(), PipelineState::Idle);
    }

    #[test]
    fn injected_code_must_be_utf8() {
        let mut ctx = context();
        assert!(matches!(
            ctx.add_injected([0xc3, 0x28]),
            Err(KilnError::EncodingError(_))
        ));
        assert!(matches!(
            ctx.add_file_bytes(&[0xff]),
            Err(KilnError::EncodingError(_))
        ));
    }

    #[test]
    fn late_files_join_a_running_pipeline() {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::write(dir.path().join("late.kiln"), "late :: () -> i32 { return 5; }").unwrap();

        let mut ctx = context();
        ctx.set_option_str(OptionKey::CurrentDirectory, &dir.path().to_string_lossy())
            .unwrap();
        ctx.add_injected("#export \"late\" late;").unwrap();
        while ctx.state() < PipelineState::Parsing {
            ctx.step();
        }
        ctx.add_file("late").unwrap();
        let wasm = compile(&mut ctx);

        let engine = wasmi::Engine::default();
        let module = wasmi::Module::new(&engine, &wasm[..]).unwrap();
        assert!(module.exports().any(|export| export.name() == "late"));
    }

    #[test]
    fn load_directives_register_units() {
        let dir = tempfile::tempdir().expect("tempdir");
        let lib = dir.path().join("lib");
        fs::create_dir_all(lib.join("deep")).unwrap();
        fs::write(
            dir.path().join("main.kiln"),
            "#load \"util\";\n#load_all_recursive \"lib\";\n#load \"main\";\n\
             main :: () -> i32 { return twice(add_one(1)) + deeper(); }",
        )
        .unwrap();
        fs::write(dir.path().join("util.kiln"), "twice :: (x: i32) -> i32 { return x * 2; }")
            .unwrap();
        fs::write(lib.join("a.kiln"), "add_one :: (x: i32) -> i32 { return x + 1; }").unwrap();
        fs::write(lib.join("deep").join("b.kiln"), "deeper :: () -> i32 { return 10; }").unwrap();

        let mut ctx = context();
        ctx.set_option_str(OptionKey::CurrentDirectory, &dir.path().to_string_lossy())
            .unwrap();
        ctx.add_file("main").unwrap();
        let wasm = compile(&mut ctx);
        assert_eq!(ctx.unit_count(), 4);
        assert_eq!(run_main::<i32>(&wasm), 14);
    }

    #[test]
    fn missing_load_target_is_a_diagnostic() {
        let mut ctx = context();
        ctx.add_injected("#load \"absent\";\n#load_all \"nowhere\";").unwrap();
        assert_eq!(ctx.run_to_completion(), PumpStatus::Errored);
        let codes: Vec<_> = ctx.diagnostics().map(|record| record.code()).collect();
        assert_eq!(codes, vec![Some("E0503"), Some("E0504")]);
    }

    #[test]
    fn mapped_folders_resolve_units() {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::write(dir.path().join("math.kiln"), "main :: () -> i32 { return 9; }").unwrap();
        let mut ctx = context();
        ctx.map_folder("std", dir.path()).unwrap();
        ctx.add_file("std:math").unwrap();
        let wasm = compile(&mut ctx);
        assert_eq!(run_main::<i32>(&wasm), 9);
    }

    #[test]
    fn core_library_is_available_by_default() {
        let mut ctx = Context::new();
        ctx.add_injected("main :: () -> i32 { return clamp_i32(abs_i32(-50), 0, 10); }")
            .unwrap();
        let wasm = compile(&mut ctx);
        assert_eq!(run_main::<i32>(&wasm), 10);
        assert_eq!(ctx.unit_count(), 2);
    }

    #[test]
    fn multi_threading_keeps_diagnostic_order() {
        let source = "a :: () -> i32 { return x; }\n\
                      b :: () -> i32 { return y; }\n\
                      c :: () -> bool { return 1; }";
        let collect = |threads: i32| -> Vec<String> {
            let mut ctx = context();
            ctx.set_option_int(OptionKey::MultiThreading, threads).unwrap();
            ctx.add_injected(source).unwrap();
            ctx.add_injected("d :: () -> i32 { return z; }").unwrap();
            assert_eq!(ctx.run_to_completion(), PumpStatus::Errored);
            ctx.diagnostics().map(ToString::to_string).collect()
        };
        let single = collect(0);
        assert_eq!(single.len(), 4);
        assert_eq!(collect(1), single);
    }

    #[test]
    fn globals_and_loops_execute() {
        let mut ctx = context();
        ctx.add_injected(
            "COUNT :: 10;\n\
             total : i64 = 0;\n\
             main :: () -> i64 {\n\
                 i := 0;\n\
                 while i < COUNT {\n\
                     i += 1;\n\
                     if i % 2 == 0 { continue; }\n\
                     total += cast(i64) i;\n\
                 }\n\
                 return total;\n\
             }",
        )
        .unwrap();
        let wasm = compile(&mut ctx);
        assert_eq!(run_main::<i64>(&wasm), 25);
    }

    #[test]
    fn file_contents_are_placed_in_memory() {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::write(dir.path().join("blob.txt"), "hello").unwrap();
        let mut ctx = context();
        ctx.set_option_str(OptionKey::CurrentDirectory, &dir.path().to_string_lossy())
            .unwrap();
        ctx.add_injected("main :: () -> i32 { return #file_contents \"blob.txt\"; }")
            .unwrap();
        let wasm = compile(&mut ctx);

        let engine = wasmi::Engine::default();
        let module = wasmi::Module::new(&engine, &wasm[..]).unwrap();
        let mut store = wasmi::Store::new(&engine, ());
        let instance = wasmi::Linker::new(&engine)
            .instantiate_and_start(&mut store, &module)
            .unwrap();
        let address = instance
            .get_typed_func::<(), i32>(&store, "main")
            .unwrap()
            .call(&mut store, ())
            .unwrap() as usize;
        assert_eq!(address, 8);
        let memory = instance.get_memory(&store, "memory").expect("memory export");
        let bytes = &memory.data(&store)[address..address + 9];
        assert_eq!(bytes, b"\x05\x00\x00\x00hello");
    }

    #[test]
    fn file_contents_can_be_disabled() {
        let mut ctx = context();
        ctx.set_option_int(OptionKey::DisableFileContents, 1).unwrap();
        ctx.add_injected("main :: () -> i32 { return #file_contents \"x\"; }")
            .unwrap();
        assert_eq!(ctx.run_to_completion(), PumpStatus::Errored);
        assert_eq!(ctx.diagnostic(0).unwrap().code(), Some("E0310"));
    }

    #[test]
    fn type_info_lists_emitted_symbols() {
        let mut ctx = context();
        ctx.set_option_int(OptionKey::GenerateTypeInfo, 1).unwrap();
        ctx.add_injected("SCALE :: 2.5;\nmain :: () -> f64 { return SCALE; }")
            .unwrap();
        let wasm = compile(&mut ctx);
        let text = wasmparser::Parser::new(0)
            .parse_all(&wasm)
            .find_map(|payload| match payload.ok()? {
                wasmparser::Payload::CustomSection(reader) if reader.name() == TYPE_INFO_SECTION => {
                    Some(String::from_utf8_lossy(reader.data()).into_owned())
                }
                _ => None,
            })
            .expect("type info section");
        assert_eq!(text, "SCALE: f64\nmain: () -> f64\n");
    }

    #[test]
    fn extension_warning_does_not_stop_compilation() {
        let mut ctx = context();
        ctx.add_injected("#extension \"simd\";\nmain :: () {}").unwrap();
        assert_eq!(ctx.run_to_completion(), PumpStatus::Done);
        assert_eq!(ctx.diagnostic_count(), 1);
        assert!(!ctx.diagnostic(0).unwrap().is_fatal());
    }
}
