use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::*;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;
use unvirt_core::verify::verify_module;
use unvirt_core::{Module, Pipeline, PipelineConfig, PipelineStatus};
use unvirt_emit::{
    write_module, Emitter, EmitterConfig, OutputFormat, ReportEmitter, VerbosityLevel,
};

#[derive(Parser)]
#[command(name = "unvirt")]
#[command(about = "unvirt - devirtualize lifted machine code")]
#[command(version = "0.1.0")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the devirtualization pipeline on a JSON module.
    Optimize {
        input: PathBuf,

        /// JSON pipeline configuration; flags below override it.
        #[arg(long)]
        config: Option<PathBuf>,

        #[arg(long)]
        max_iterations: Option<usize>,

        #[arg(long)]
        max_operations: Option<u64>,

        #[arg(long)]
        time_limit_ms: Option<u64>,

        #[arg(long)]
        horizon: Option<usize>,

        #[arg(long)]
        max_blocks: Option<usize>,

        #[arg(long)]
        workers: Option<usize>,

        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Write the pipeline report as JSON.
        #[arg(long)]
        report: Option<PathBuf>,

        /// Emit the optimized module as text instead of JSON.
        #[arg(long)]
        text: bool,

        #[arg(short, long)]
        verbose: bool,
    },

    /// Print a module as text.
    Show {
        input: PathBuf,

        #[arg(long)]
        no_color: bool,

        #[arg(short, long)]
        verbose: bool,
    },

    /// Run the structural verifier.
    Verify {
        input: PathBuf,

        #[arg(short, long)]
        verbose: bool,
    },
}

struct Overrides {
    max_iterations: Option<usize>,
    max_operations: Option<u64>,
    time_limit_ms: Option<u64>,
    horizon: Option<usize>,
    max_blocks: Option<usize>,
    workers: Option<usize>,
}

impl Overrides {
    fn apply(self, mut config: PipelineConfig) -> PipelineConfig {
        if let Some(max) = self.max_iterations {
            config.budget = config.budget.with_max_iterations(max);
        }
        if let Some(max) = self.max_operations {
            config.budget = config.budget.with_max_operations(max);
        }
        if let Some(ms) = self.time_limit_ms {
            config.budget = config.budget.with_time_limit(Duration::from_millis(ms));
        }
        if let Some(horizon) = self.horizon {
            config.splitter = config.splitter.with_horizon(horizon);
        }
        if let Some(max) = self.max_blocks {
            config.splitter = config.splitter.with_max_blocks(max);
        }
        if let Some(workers) = self.workers {
            config.synthesis = config.synthesis.with_workers(workers);
        }
        config
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Optimize {
            input,
            config,
            max_iterations,
            max_operations,
            time_limit_ms,
            horizon,
            max_blocks,
            workers,
            output,
            report,
            text,
            verbose,
        } => {
            init_tracing(verbose);
            let overrides = Overrides {
                max_iterations,
                max_operations,
                time_limit_ms,
                horizon,
                max_blocks,
                workers,
            };
            cmd_optimize(input, config, overrides, output, report, text, verbose)
        }
        Commands::Show {
            input,
            no_color,
            verbose,
        } => {
            init_tracing(verbose);
            cmd_show(input, no_color, verbose)
        }
        Commands::Verify { input, verbose } => {
            init_tracing(verbose);
            cmd_verify(input)
        }
    }
}

/// `RUST_LOG` wins; otherwise `-v` selects debug output for the pipeline.
fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn load_module(path: &Path) -> Result<Module> {
    let json = fs::read_to_string(path)
        .with_context(|| format!("failed to read module {}", path.display()))?;
    let module = Module::from_json(&json)
        .with_context(|| format!("failed to parse module {}", path.display()))?;
    debug!(
        module = %module.name,
        functions = module.functions.len(),
        blocks = module.block_count(),
        "loaded module"
    );
    Ok(module)
}

fn load_config(path: Option<&Path>) -> Result<PipelineConfig> {
    let Some(path) = path else {
        return Ok(PipelineConfig::default());
    };
    let json = fs::read_to_string(path)
        .with_context(|| format!("failed to read config {}", path.display()))?;
    PipelineConfig::from_json(&json)
        .with_context(|| format!("failed to parse config {}", path.display()))
}

fn cmd_optimize(
    input: PathBuf,
    config: Option<PathBuf>,
    overrides: Overrides,
    output: Option<PathBuf>,
    report_path: Option<PathBuf>,
    text: bool,
    verbose: bool,
) -> Result<()> {
    let config = overrides.apply(load_config(config.as_deref())?);
    let mut module = load_module(&input)?;
    let blocks_before = module.block_count();
    let instructions_before = module.instruction_count();

    info!(input = %input.display(), "optimizing");
    let report = Pipeline::new(config).run(&mut module);

    let format = if text { OutputFormat::Text } else { OutputFormat::Json };
    let emit_config = EmitterConfig::plain();
    match &output {
        Some(path) => {
            let mut file = fs::File::create(path)
                .with_context(|| format!("failed to create {}", path.display()))?;
            write_module(&mut file, &module, format, &emit_config)?;
        }
        None => {
            let stdout = std::io::stdout();
            let mut handle = stdout.lock();
            write_module(&mut handle, &module, format, &emit_config)?;
            handle.flush()?;
        }
    }

    if let Some(path) = report_path {
        fs::write(&path, report.to_json()?)
            .with_context(|| format!("failed to write report {}", path.display()))?;
    }

    let flag = match report.status {
        PipelineStatus::Converged => "CONVERGED".bright_green().bold(),
        PipelineStatus::BudgetExceeded => "BUDGET EXCEEDED".bright_yellow().bold(),
    };
    eprintln!("{}", flag);
    eprintln!(
        "   blocks: {} -> {}, instructions: {} -> {}",
        blocks_before,
        module.block_count(),
        instructions_before,
        module.instruction_count()
    );
    if verbose {
        let verbosity = EmitterConfig::plain().with_verbosity(VerbosityLevel::Verbose);
        eprint!("{}", ReportEmitter::new(verbosity).emit_to_string(&report)?);
    }
    Ok(())
}

fn cmd_show(input: PathBuf, no_color: bool, verbose: bool) -> Result<()> {
    let module = load_module(&input)?;
    let mut config = EmitterConfig::default();
    config.use_colors = !no_color;
    if verbose {
        config = config.with_verbosity(VerbosityLevel::Debug);
    }
    let stdout = std::io::stdout();
    let mut handle = stdout.lock();
    write_module(&mut handle, &module, OutputFormat::Text, &config)?;
    handle.flush()?;
    Ok(())
}

fn cmd_verify(input: PathBuf) -> Result<()> {
    let module = load_module(&input)?;
    match verify_module(&module) {
        Ok(()) => {
            println!("{}", "VALID".bright_green().bold());
            Ok(())
        }
        Err(e) => {
            println!("{}", "INVALID".bright_red().bold());
            println!("{}", e);
            Err(anyhow::anyhow!("Verification failed"))
        }
    }
}
