//! Spindle - browser-style module Workers for the Boa JS engine
//!
//! `spindle run <file>` runs a module as the orchestrator and keeps its event
//! loop going until every worker it started has exited.

use clap::{Parser, Subcommand};
use colored::Colorize;
use miette::{IntoDiagnostic, Result};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing_subscriber::EnvFilter;

use spindle::loader::HookApi;
use spindle::runtime::{Runtime, RuntimeConfig};

#[derive(Parser)]
#[command(name = "spindle")]
#[command(author, version, about = "Browser-style module Workers for the Boa JS engine")]
struct Cli {
    /// Module to run
    file: Option<PathBuf>,

    /// Module hook call shape (positional or bag); defaults to the linked engine's
    #[arg(long, global = true)]
    hook_api: Option<HookApi>,

    /// How long to wait for a blob: URL's content, in milliseconds (0 waits forever)
    #[arg(long, global = true)]
    resolve_timeout_ms: Option<u64>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a module and wait for its workers
    Run {
        /// TypeScript/JavaScript module to run
        file: PathBuf,
    },
    /// Evaluate a script
    Eval {
        /// Code to evaluate
        code: String,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env("SPINDLE_LOG").unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let mut config = RuntimeConfig::default();
    if let Some(api) = cli.hook_api {
        config.hook_api = api;
    }
    if let Some(ms) = cli.resolve_timeout_ms {
        config.resolve_timeout = (ms > 0).then(|| Duration::from_millis(ms));
    }

    match cli.command {
        Some(Commands::Run { file }) => run_file(&file, config)?,
        Some(Commands::Eval { code }) => eval_code(&code, config)?,
        None => match cli.file {
            Some(file) => run_file(&file, config)?,
            None => {
                eprintln!("{}: no module given, try `spindle run <file>`", "Error".red());
                std::process::exit(2);
            }
        },
    }

    Ok(())
}

/// Run a module as the orchestrator
fn run_file(path: &Path, mut config: RuntimeConfig) -> Result<()> {
    let path = std::fs::canonicalize(path).into_diagnostic()?;
    if let Some(parent) = path.parent() {
        config.base_path = parent.to_path_buf();
    }

    let mut runtime = Runtime::with_config(config).into_diagnostic()?;

    if let Err(e) = runtime.run_module(&path.to_string_lossy()) {
        eprintln!("{}: {}", "Error".red(), e);
        std::process::exit(1);
    }

    Ok(())
}

/// Evaluate code from the command line
fn eval_code(code: &str, config: RuntimeConfig) -> Result<()> {
    let mut runtime = Runtime::with_config(config).into_diagnostic()?;

    match runtime.eval(code, "eval.ts") {
        Ok(value) => {
            runtime.run_event_loop().into_diagnostic()?;
            if !value.is_undefined() {
                let result = runtime.value_to_string(&value);
                println!("{}", result);
            }
        }
        Err(e) => {
            eprintln!("{}: {}", "Error".red(), e);
            std::process::exit(1);
        }
    }

    Ok(())
}
