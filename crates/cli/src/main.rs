//! Stepwise CLI - Main Entry Point
//!
//! Authors projects, test cases and plain-language steps, and runs them
//! against a real browser.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use stepwise_engine::{EngineConfig, RunOrchestrator};

mod commands;
mod output;

use commands::{browser, case, config, project, run, step};

/// Stepwise - plain-language browser tests
#[derive(Parser)]
#[command(name = "stepwise")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Configuration file
    #[arg(long, env = "STEPWISE_CONFIG", global = true)]
    config: Option<PathBuf>,

    /// Output format
    #[arg(long, default_value = "table", global = true)]
    format: output::OutputFormat,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage projects
    #[command(subcommand)]
    Project(project::ProjectCommands),

    /// Manage test cases
    #[command(subcommand)]
    Case(case::CaseCommands),

    /// Manage the steps of a test case
    #[command(subcommand)]
    Step(step::StepCommands),

    /// Show how a step would be interpreted
    Parse {
        /// Step text
        text: String,
    },

    /// Start and inspect runs
    #[command(subcommand)]
    Run(run::RunCommands),

    /// Manage browser engines
    #[command(subcommand)]
    Browser(browser::BrowserCommands),

    /// Show or initialize the configuration file
    #[command(subcommand)]
    Config(config::ConfigCommands),

    /// Show version information
    Version,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let log_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level)),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    if let Commands::Parse { text } = &cli.command {
        let ok = step::parse_text(text, cli.format);
        if !ok {
            std::process::exit(1);
        }
        return Ok(());
    }
    if let Commands::Version = cli.command {
        println!("Stepwise CLI v{}", stepwise_common::VERSION);
        return Ok(());
    }

    let config_path = cli.config.clone().unwrap_or_else(stepwise_common::default_config_path);
    let config = EngineConfig::load(&config_path)?;
    tracing::debug!(config = %config_path.display(), store = %config.store_path.display(), "loaded configuration");
    if let Commands::Config(cmd) = cli.command {
        return config::execute(cmd, &config, &config_path, cli.format);
    }
    let orchestrator = RunOrchestrator::from_config(&config)?;

    match cli.command {
        Commands::Project(cmd) => project::execute(cmd, &orchestrator, cli.format)?,
        Commands::Case(cmd) => case::execute(cmd, &orchestrator, cli.format)?,
        Commands::Step(cmd) => step::execute(cmd, &orchestrator, cli.format)?,
        Commands::Run(cmd) => {
            let passed = run::execute(cmd, &orchestrator, &config, cli.format).await?;
            if !passed {
                std::process::exit(1);
            }
        }
        Commands::Browser(cmd) => browser::execute(cmd, &orchestrator, cli.format).await?,
        Commands::Parse { .. } | Commands::Version | Commands::Config(_) => {}
    }

    Ok(())
}
