use std::fs;
use std::io::{self, IsTerminal, Read};
use std::path::{Path, PathBuf};

use anyhow::{Context as _, Result, anyhow, bail};
use clap::Parser;
use clap_verbosity_flag::{Verbosity, WarnLevel};
use kiln_core::{Context, OptionKey, PumpStatus};
use log::{debug, info};
use wasmi::{Engine, Linker, Module, Store};

/// Compile Kiln sources to a WebAssembly module.
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Source units, by logical name or path. Reads stdin when none are given.
    inputs: Vec<String>,

    #[arg(short, long, default_value = "out.wasm")]
    output: PathBuf,

    #[arg(long, value_name = "DIR", help = "Working directory for relative unit names")]
    cwd: Option<PathBuf>,

    #[arg(
        long = "map",
        value_name = "NAME=PATH",
        value_parser = parse_mapping,
        help = "Resolve NAME:unit under PATH"
    )]
    maps: Vec<(String, PathBuf)>,

    #[arg(long = "inject", value_name = "CODE", help = "Compile CODE as an extra unit")]
    injected: Vec<String>,

    #[arg(long, help = "Allow post-MVP instructions (saturating casts)")]
    post_mvp: bool,

    #[arg(long, help = "Parse and check on worker threads")]
    threads: bool,

    #[arg(long, help = "Emit the kiln.foreign_info section")]
    foreign_info: bool,

    #[arg(long, help = "Emit the kiln.type_info section")]
    type_info: bool,

    #[arg(long, help = "Emit the kiln.method_info section")]
    method_info: bool,

    #[arg(long, help = "Do not include the core library")]
    no_core: bool,

    #[arg(long, help = "Keep functions that are never called")]
    no_dce: bool,

    #[arg(long, help = "Let a newline end a statement")]
    optional_semicolons: bool,

    #[arg(long, help = "Reject #file_contents")]
    no_file_contents: bool,

    #[arg(long, help = "Reject #extension")]
    no_extensions: bool,

    #[arg(long, help = "Run `main` after compiling")]
    run: bool,

    #[command(flatten)]
    verbose: Verbosity<WarnLevel>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    env_logger::Builder::new()
        .filter_level(cli.verbose.log_level_filter())
        .init();
    execute(cli)
}

fn parse_mapping(raw: &str) -> Result<(String, PathBuf), String> {
    match raw.split_once('=') {
        Some((name, path)) if !name.is_empty() && !path.is_empty() => {
            Ok((name.to_string(), PathBuf::from(path)))
        }
        _ => Err(format!("expected NAME=PATH, got `{raw}`")),
    }
}

fn configure(cli: &Cli) -> Result<Context> {
    let mut ctx = Context::new();
    if let Some(cwd) = &cli.cwd {
        ctx.set_option_str(OptionKey::CurrentDirectory, &cwd.to_string_lossy())?;
    }
    let flags = [
        (OptionKey::PostMvpFeatures, cli.post_mvp),
        (OptionKey::MultiThreading, cli.threads),
        (OptionKey::GenerateForeignInfo, cli.foreign_info),
        (OptionKey::GenerateTypeInfo, cli.type_info),
        (OptionKey::GenerateMethodInfo, cli.method_info),
        (OptionKey::DisableCore, cli.no_core),
        (OptionKey::DisableStaleCode, cli.no_dce),
        (OptionKey::OptionalSemicolons, cli.optional_semicolons),
        (OptionKey::DisableFileContents, cli.no_file_contents),
        (OptionKey::DisableExtensions, cli.no_extensions),
    ];
    for (key, enabled) in flags {
        ctx.set_option_int(key, i32::from(enabled))?;
    }
    for (name, path) in &cli.maps {
        ctx.map_folder(name, path)?;
    }

    for input in &cli.inputs {
        ctx.add_file(input)
            .with_context(|| format!("failed to add input {input}"))?;
    }
    for code in &cli.injected {
        ctx.add_injected(code)?;
    }
    if cli.inputs.is_empty() && cli.injected.is_empty() {
        if io::stdin().is_terminal() {
            bail!("no inputs given");
        }
        let mut buffer = String::new();
        io::stdin()
            .read_to_string(&mut buffer)
            .context("failed to read stdin")?;
        ctx.add_injected(buffer)?;
    }
    Ok(ctx)
}

fn execute(cli: Cli) -> Result<()> {
    let mut ctx = configure(&cli)?;
    ctx.start()?;

    let status = ctx.run_to_completion();
    for record in ctx.diagnostics() {
        eprintln!("{record}");
    }
    if status != PumpStatus::Done {
        let errors = ctx.diagnostics().filter(|record| record.is_fatal()).count();
        return Err(anyhow!("compilation failed with {errors} error(s)"));
    }

    let mut wasm = vec![0; ctx.output_len()];
    ctx.write_output(&mut wasm)?;
    write_output(&cli.output, &wasm)?;
    info!("wrote {} bytes to {}", wasm.len(), cli.output.display());

    if cli.run {
        match run_wasm(&wasm)? {
            Some(result) => println!("Program exited with {result}"),
            None => println!("Program finished"),
        }
    }
    Ok(())
}

fn write_output(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create directory {parent:?}"))?;
        }
    }
    fs::write(path, bytes)
        .with_context(|| format!("failed to write output file {}", path.display()))?;
    Ok(())
}

/// Run the exported `main`, returning its result if it has an integer one.
fn run_wasm(wasm: &[u8]) -> Result<Option<i64>> {
    let engine = Engine::default();
    let module = Module::new(&engine, wasm).context("failed to compile wasm artifact")?;
    let linker = Linker::new(&engine);
    let mut store = Store::new(&engine, ());
    let instance = linker
        .instantiate_and_start(&mut store, &module)
        .context("failed to instantiate module")?;
    debug!("instantiated module");

    if let Ok(main) = instance.get_typed_func::<(), i32>(&store, "main") {
        let result = main.call(&mut store, ()).context("failed to execute main")?;
        return Ok(Some(i64::from(result)));
    }
    if let Ok(main) = instance.get_typed_func::<(), i64>(&store, "main") {
        let result = main.call(&mut store, ()).context("failed to execute main")?;
        return Ok(Some(result));
    }
    let main = instance
        .get_typed_func::<(), ()>(&store, "main")
        .context("exported main function missing or has an unsupported type")?;
    main.call(&mut store, ()).context("failed to execute main")?;
    Ok(None)
}
