//! `duet` command-line entry point: one-shot builds and watch mode.

use std::ops::ControlFlow;
use std::path::PathBuf;
use std::process;

use clap::{Args, Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use duet_compiler::options::CONFIG_FILE_NAME;
use duet_compiler::{BuildError, BuildMode, CompileOptions, Compiler};

#[derive(Parser, Debug)]
#[command(name = "duet", version, about = "Split unified components into server and client bundles")]
struct Cli {
    /// Enable debug-level logging.
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Build once and exit.
    Build(BuildArgs),
    /// Build, then rebuild on every source change.
    Watch(BuildArgs),
}

#[derive(Args, Debug)]
struct BuildArgs {
    /// Config file; missing files fall back to defaults.
    #[arg(long, default_value = CONFIG_FILE_NAME)]
    config: PathBuf,

    /// Source directory, overrides the config.
    #[arg(long)]
    src: Option<PathBuf>,

    /// Output directory, overrides the config.
    #[arg(long)]
    out: Option<PathBuf>,

    /// `development` or `production`, overrides the config.
    #[arg(long)]
    mode: Option<BuildMode>,
}

impl BuildArgs {
    fn resolve(&self) -> Result<CompileOptions, BuildError> {
        let mut options = CompileOptions::load(&self.config)?;
        if let Some(src) = &self.src {
            options.src_dir = src.clone();
        }
        if let Some(out) = &self.out {
            options.out_dir = out.clone();
        }
        if let Some(mode) = self.mode {
            options.mode = mode;
        }
        Ok(options)
    }
}

fn init_logging(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

fn run(cli: Cli) -> Result<bool, BuildError> {
    match cli.command {
        Command::Build(args) => {
            let mut compiler = Compiler::new(args.resolve()?);
            let report = compiler.build()?;
            for diagnostic in &report.diagnostics {
                eprintln!("{}", diagnostic);
            }
            println!("manifest written to {}", report.manifest_path.display());
            Ok(report.diagnostics.is_empty())
        }
        Command::Watch(args) => {
            let mut compiler = Compiler::new(args.resolve()?);
            compiler.watch(|result| {
                if let Ok(report) = result {
                    for diagnostic in &report.diagnostics {
                        eprintln!("{}", diagnostic);
                    }
                }
                ControlFlow::Continue(())
            })?;
            Ok(true)
        }
    }
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match run(cli) {
        Ok(true) => {}
        Ok(false) => process::exit(1),
        Err(err) => {
            tracing::error!("{}", err);
            process::exit(2);
        }
    }
}
