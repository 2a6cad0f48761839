//! Config command - configuration management.

use anyhow::Result;
use clap::{Args, Subcommand};

use super::Context;

/// Arguments for the config command.
#[derive(Args, Debug)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub command: ConfigCommand,
}

#[derive(Subcommand, Debug)]
pub enum ConfigCommand {
    /// Show the resolved configuration with defaults filled in
    Show,

    /// Show which config files were loaded
    Which,

    /// Show the user config file path
    Path,
}

/// Run the config command.
pub async fn run(args: ConfigArgs, ctx: &Context) -> Result<()> {
    match args.command {
        ConfigCommand::Show => cmd_show(ctx),
        ConfigCommand::Which => cmd_which(ctx),
        ConfigCommand::Path => cmd_path(),
    }
}

fn cmd_show(ctx: &Context) -> Result<()> {
    let config = &ctx.config;
    let resolved = playbook_config::PlaybookConfig {
        orchestrator: Some(config.orchestrator()),
        retry: Some(config.retry()),
        workers: Some(config.workers()),
        ai: Some(config.ai()),
        contracts: Some(config.contracts()),
        sla: Some(config.sla()),
        storage: Some(config.storage()),
        logging: Some(config.logging()),
    };
    if ctx.json_output {
        println!("{}", serde_json::to_string_pretty(&resolved)?);
    } else {
        print!("{}", resolved.to_toml()?);
    }
    Ok(())
}

fn cmd_which(ctx: &Context) -> Result<()> {
    if ctx.sources.is_empty() {
        println!("No config files loaded (using defaults)");
    } else {
        for source in &ctx.sources {
            println!("{}", source.display());
        }
    }
    Ok(())
}

fn cmd_path() -> Result<()> {
    match playbook_config::user_config_path() {
        Some(path) => println!("{}", path.display()),
        None => println!("No user config directory on this platform"),
    }
    Ok(())
}
