use std::io::{self, BufRead, IsTerminal, Write};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use clap::{Parser, Subcommand, ValueHint};
use kernelgen::apply::{
    ApplyEngine, ApplyFlags, Confirm, Plan, exit_codes, read_entries, validate_plan,
};
use kernelgen::config::ToolchainConfig;
use kernelgen::reporter::TracingReporter;
use kernelgen::workspace::Workspace;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, prelude::*};

fn main() -> Result<()> {
    let cli = Cli::parse();
    configure_tracing()?;

    match cli.command {
        Commands::Apply {
            root,
            config,
            yes,
            backup,
            force,
            dry_run,
        } => {
            let flags = ApplyFlags {
                yes,
                backup,
                force,
                dry_run,
            };
            let code = apply_command(root, config, flags)?;
            if code != exit_codes::SUCCESS {
                std::process::exit(code);
            }
            Ok(())
        }
        Commands::Plan {
            action: PlanCommands::Validate { root, config },
        } => validate_plan_cmd(root, config),
        Commands::Log {
            root,
            config,
            limit,
        } => show_log(root, config, limit),
    }
}

fn configure_tracing() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
        .try_init()
        .map_err(|err| anyhow!(err.to_string()))?;
    Ok(())
}

fn load_config(root: &std::path::Path, config: Option<PathBuf>) -> Result<ToolchainConfig> {
    match config {
        Some(path) => ToolchainConfig::load(&path),
        None => ToolchainConfig::discover(root),
    }
}

fn apply_command(root: PathBuf, config: Option<PathBuf>, flags: ApplyFlags) -> Result<i32> {
    let workspace = Workspace::open(&root)?;
    let config = load_config(workspace.root(), config)?;
    let reporter = Arc::new(TracingReporter::new("kernelgen.apply"));
    let engine = ApplyEngine::new(&workspace, &config.apply, reporter);

    let prompt = TerminalPrompt;
    let confirm: Option<&dyn Confirm> = if io::stdin().is_terminal() {
        Some(&prompt)
    } else {
        None
    };

    let outcome = engine.run(flags, confirm);
    let summary = outcome.entry.summary;
    println!(
        "{}: {} applied, {} conflict(s), {} skipped",
        outcome.status().as_str(),
        summary.applied,
        summary.conflicts,
        summary.skipped
    );
    for record in &outcome.entry.records {
        let detail = record
            .details
            .reason
            .as_deref()
            .or(record.details.action.as_deref())
            .unwrap_or_default();
        println!("  {:?} {} {}", record.status, record.file, detail);
    }
    if let Some(path) = &outcome.log_path {
        info!(file = %path.display(), "Apply log updated");
    }
    Ok(outcome.exit_code())
}

fn validate_plan_cmd(root: PathBuf, config: Option<PathBuf>) -> Result<()> {
    let workspace = Workspace::open(&root)?;
    let config = load_config(workspace.root(), config)?;
    let plan_path = config.apply.plan.as_str();
    let plan = Plan::load(&workspace, plan_path)?
        .with_context(|| format!("No apply plan found at {plan_path}"))?;
    let report = validate_plan(&plan, &config.apply);

    for warning in &report.warnings {
        warn!(file = plan_path, "{warning}");
    }

    if report.is_ok() {
        info!(
            file = plan_path,
            instructions = plan.len(),
            "Plan validation passed"
        );
        Ok(())
    } else {
        for error_msg in &report.errors {
            error!(file = plan_path, "{error_msg}");
        }
        Err(anyhow!(
            "Plan validation failed with {} error(s)",
            report.errors.len()
        ))
    }
}

fn show_log(root: PathBuf, config: Option<PathBuf>, limit: Option<usize>) -> Result<()> {
    let workspace = Workspace::open(&root)?;
    let config = load_config(workspace.root(), config)?;
    let path = workspace.resolve(&config.apply.log)?;
    let entries = read_entries(&path)?;
    let skip = limit.map_or(0, |limit| entries.len().saturating_sub(limit));

    let stdout = io::stdout();
    let mut out = stdout.lock();
    for entry in entries.iter().skip(skip) {
        serde_json::to_writer(&mut out, entry)?;
        writeln!(out)?;
    }
    Ok(())
}

/// Reads a yes/no answer from stdin. Anything but `y`/`yes` declines.
struct TerminalPrompt;

impl Confirm for TerminalPrompt {
    fn confirm(&self, message: &str) -> Result<bool> {
        eprint!("{message} [y/N] ");
        io::stderr().flush()?;
        let mut answer = String::new();
        io::stdin().lock().read_line(&mut answer)?;
        Ok(matches!(
            answer.trim().to_ascii_lowercase().as_str(),
            "y" | "yes"
        ))
    }
}

#[derive(Parser)]
#[command(
    author,
    version,
    about = "Code-generation pipeline and transactional apply engine"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Apply the staged plan to the workspace.
    Apply {
        #[arg(long, default_value = ".", value_hint = ValueHint::DirPath)]
        root: PathBuf,
        #[arg(long, value_hint = ValueHint::FilePath)]
        config: Option<PathBuf>,
        /// Skip the confirmation prompt.
        #[arg(long, short = 'y')]
        yes: bool,
        /// Write `<file>.bak` before overwriting or deleting.
        #[arg(long)]
        backup: bool,
        /// Overwrite conflicting files with the incoming version.
        #[arg(long)]
        force: bool,
        /// Preview the outcome without touching the workspace.
        #[arg(long)]
        dry_run: bool,
    },
    /// Inspect the staged apply plan.
    Plan {
        #[command(subcommand)]
        action: PlanCommands,
    },
    /// Print apply log entries as JSON lines.
    Log {
        #[arg(long, default_value = ".", value_hint = ValueHint::DirPath)]
        root: PathBuf,
        #[arg(long, value_hint = ValueHint::FilePath)]
        config: Option<PathBuf>,
        /// Only show the most recent N entries.
        #[arg(long)]
        limit: Option<usize>,
    },
}

#[derive(Subcommand)]
enum PlanCommands {
    /// Check the staged plan without applying it.
    Validate {
        #[arg(long, default_value = ".", value_hint = ValueHint::DirPath)]
        root: PathBuf,
        #[arg(long, value_hint = ValueHint::FilePath)]
        config: Option<PathBuf>,
    },
}
