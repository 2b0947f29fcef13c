//! tor-ingress: serve tor-class ingresses as Tor hidden services.
//!
//! # Usage
//!
//! ```text
//! tor-ingress run [--config PATH]
//! tor-ingress render [--config PATH] [--diff]
//! tor-ingress status [--config PATH] [--json]
//! tor-ingress resync [--config PATH] [KEY]
//! tor-ingress stop [--config PATH]
//! ```

mod commands;

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use commands::{
    control::{ResyncArgs, StopArgs},
    render::RenderArgs,
    run::RunArgs,
    status::StatusArgs,
};
use tor_ingress_core::ControllerConfig;

// ---------------------------------------------------------------------------
// CLI entry point
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(
    name = "tor-ingress",
    version,
    about = "Expose tor-class ingresses as Tor onion services",
    long_about = None,
)]
struct Cli {
    /// Controller configuration file (defaults to the per-user config, then
    /// built-in defaults).
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the controller in the foreground.
    Run(RunArgs),

    /// Build the torrc from the manifests offline and print it.
    Render(RenderArgs),

    /// Query a running controller.
    Status(StatusArgs),

    /// Ask a running controller to re-sync one key or everything.
    Resync(ResyncArgs),

    /// Ask a running controller to shut down.
    Stop(StopArgs),
}

pub(crate) fn load_config(path: Option<&Path>) -> Result<ControllerConfig> {
    ControllerConfig::load(path).context("failed to load controller configuration")
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;
    match cli.command {
        Commands::Run(args) => args.run(config),
        Commands::Render(args) => args.run(config),
        Commands::Status(args) => args.run(&config),
        Commands::Resync(args) => args.run(&config),
        Commands::Stop(args) => args.run(&config),
    }
}
