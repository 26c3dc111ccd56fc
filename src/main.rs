//! `emberc`: compile (and, unless `--no-run` is given, execute) a single
//! ember entry file. One mode of operation -- there is no separate
//! compile-to-artifact step, since the instruction stream is never
//! persisted to disk -- so the CLI surface is a single flat argument
//! list rather than the subcommand style a multi-backend driver would
//! need.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::Parser;

use emberlang::resolver::{LoaderError, ProjectLoader, Resolver};
use emberlang::{builtins, lowering, pathutil, program::Program, vm};

#[derive(Parser)]
#[command(name = "emberc")]
#[command(about = "Compile and run an ember source file", long_about = None)]
struct Cli {
    /// Entry source file.
    file: PathBuf,

    /// Increase log verbosity (-v debug, -vv trace). Diagnostics produced
    /// by compilation itself are always printed regardless of this flag --
    /// it only controls operational logging (`log`/`env_logger`).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Suppress informational logging; diagnostics and uncaught-exception
    /// output are unaffected.
    #[arg(short, long)]
    quiet: bool,

    /// Print a summary of the compiled program (function/class/global
    /// counts and the distinguished main/global-init function ids) instead
    /// of, or in addition to, running it.
    #[arg(long)]
    dump_program: bool,

    /// Stop after resolution and lowering; do not execute `main`. Useful
    /// as a compile-check mode.
    #[arg(long)]
    no_run: bool,

    /// Print diagnostics as JSON lines instead of `file:line:col: ...`
    /// text, for consumption by editor tooling.
    #[arg(long)]
    json_diagnostics: bool,
}

/// Resolves imports against files on disk, relative to the entry file's
/// containing directory (the project's one and only sub-project root --
/// ember has no multi-project workspace concept at the CLI level).
struct FsLoader {
    project_dir: String,
}

impl FsLoader {
    fn new(project_dir: String) -> Self {
        Self { project_dir }
    }

    fn strip_scheme(uri: &str) -> &str {
        uri.strip_prefix("file://").unwrap_or(uri)
    }
}

impl ProjectLoader for FsLoader {
    fn get_file_sub_project_path(&self, _file_uri: &str) -> Result<(String, Option<String>), LoaderError> {
        Ok((format!("file://{}", self.project_dir), None))
    }

    fn resolve_import(&self, _source_file_uri: &str, import_elements: &[String], _library: Option<&str>) -> Result<String, LoaderError> {
        let relative = format!("{}.ember", import_elements.join("/"));
        let normalized = pathutil::normalize(&relative);
        Ok(format!("file://{}/{}", self.project_dir, normalized))
    }

    fn read_source(&self, file_uri: &str) -> Result<String, LoaderError> {
        let path = Self::strip_scheme(file_uri);
        std::fs::read_to_string(path).map_err(|e| LoaderError::Io(format!("{path}: {e}")))
    }
}

fn init_logging(verbose: u8, quiet: bool) {
    let level = if quiet {
        "error"
    } else {
        match verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.quiet);

    let exit_code = run(&cli)?;
    std::process::exit(exit_code);
}

fn run(cli: &Cli) -> Result<i32> {
    let entry_path = cli.file.canonicalize().with_context(|| format!("cannot find entry file {}", cli.file.display()))?;
    let project_dir = entry_path
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."))
        .to_string_lossy()
        .replace('\\', "/");
    let entry_uri = format!("file://{}", entry_path.to_string_lossy().replace('\\', "/"));

    log::info!("resolving {}", entry_uri);
    let loader = FsLoader::new(project_dir);
    let mut resolver = Resolver::new(loader);
    let mut program = Program::new();
    builtins::register_error_classes(&mut program).context("registering builtin error classes")?;
    builtins::register_funcs(&mut program).context("registering builtin functions")?;

    let entry = resolver.resolve_entry(&mut program, &entry_uri, true).map_err(|e| anyhow::anyhow!("{e}"))?;

    let messages = resolver.ast(entry).result_messages.clone();
    for diag in &messages.messages {
        if cli.json_diagnostics {
            eprintln!("{}", serde_json::to_string(diag).expect("Diagnostic always serializes"));
        } else {
            eprintln!("{diag}");
        }
    }
    if !messages.success {
        bail!("compilation failed with {} diagnostic(s)", messages.messages.len());
    }

    log::debug!("lowering {} function(s)", program.functions.len());
    let asts = resolver.into_asts();
    lowering::lower_program(&asts, &mut program).context("lowering resolved program to bytecode")?;

    if cli.dump_program {
        dump_program(&program);
    }

    if cli.no_run {
        return Ok(0);
    }

    log::info!("running main (func id {})", program.main_func_id);
    Ok(vm::execute_program(&mut program))
}

fn dump_program(program: &Program) {
    println!("functions: {}", program.functions.len());
    println!("classes: {}", program.classes.len());
    println!("globals: {}", program.globals.len());
    println!("main_func_id: {}", program.main_func_id);
    println!("global_init_func_id: {}", program.global_init_func_id);
    for (class_id, class) in program.classes.iter().enumerate() {
        println!("  class {class_id}: {} (base {:?})", class.name, class.base_class_id);
    }
}
