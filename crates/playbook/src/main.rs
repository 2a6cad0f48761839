//! Playbook - validate and run business playbooks.
//!
//! Main entry point for the playbook CLI.

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::warn;

mod bundle;
mod commands;

use commands::{config, run, validate};

// ─────────────────────────────────────────────────────────────────────────────
// CLI Structure
// ─────────────────────────────────────────────────────────────────────────────

/// Playbook - contract-checked orchestration of business playbooks
#[derive(Parser)]
#[command(name = "playbook")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Output as JSON (for scripting)
    #[arg(long, global = true)]
    pub json: bool,

    /// Config file to use instead of the discovered layers
    #[arg(long, global = true, env = "PLAYBOOK_CONFIG")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Check a playbook bundle without running it
    Validate(validate::ValidateArgs),

    /// Run a playbook bundle to completion against a fresh store
    Run(run::RunArgs),

    /// Configuration management
    Config(config::ConfigArgs),
}

// ─────────────────────────────────────────────────────────────────────────────
// Main
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let (resolved, sources, warnings) = match cli.config {
        Some(ref path) => (
            playbook_config::load_config_file(path)?,
            vec![path.clone()],
            Vec::new(),
        ),
        None => {
            let loaded = playbook_config::load_config(None)?;
            let sources = loaded
                .loaded_from()
                .into_iter()
                .map(|p| p.to_path_buf())
                .collect();
            (loaded.config, sources, loaded.warnings)
        }
    };
    resolved.validate()?;

    // Guard must live until exit so buffered file logs are flushed.
    let _guard = init_logging(&resolved.logging(), cli.verbose);
    for warning in &warnings {
        warn!("{warning}");
    }

    let ctx = commands::Context {
        config: resolved,
        sources,
        json_output: cli.json,
        verbose: cli.verbose,
    };

    match cli.command {
        Commands::Validate(args) => validate::run(args, &ctx).await,
        Commands::Run(args) => run::run(args, &ctx).await,
        Commands::Config(args) => config::run(args, &ctx).await,
    }
}

/// Console logging on stderr, plus a daily-rolling JSON file when the
/// logging section names a directory. `RUST_LOG` overrides the level.
fn init_logging(
    section: &playbook_config::LoggingSection,
    verbose: bool,
) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    use tracing_subscriber::prelude::*;
    use tracing_subscriber::{EnvFilter, fmt};

    let default_level = if verbose {
        "playbook=debug,playbook_engine=debug,playbook_contracts=debug,playbook_ai=debug,info"
    } else {
        section.level.as_str()
    };
    let console_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let console = fmt::layer()
        .with_target(true)
        .with_writer(std::io::stderr)
        .with_filter(console_filter);

    let Some(ref dir) = section.directory else {
        tracing_subscriber::registry().with(console).init();
        return None;
    };
    let file_appender = tracing_appender::rolling::daily(dir, "playbook.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
    tracing_subscriber::registry()
        .with(console)
        .with(
            fmt::layer()
                .json()
                .with_writer(non_blocking)
                .with_filter(EnvFilter::new(
                    "playbook=trace,playbook_engine=trace,playbook_contracts=trace,playbook_ai=debug,info",
                )),
        )
        .init();
    Some(guard)
}
