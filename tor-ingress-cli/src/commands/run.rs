//! `tor-ingress run`: the controller in the foreground.

use anyhow::{Context, Result};
use clap::Args;

use tor_ingress_core::{ControllerConfig, LogFormat};
use tor_ingress_daemon::start_blocking;

#[derive(Args, Debug)]
pub struct RunArgs {
    /// Override `log.format` from the configuration.
    #[arg(long, value_parser = ["text", "json"])]
    pub log_format: Option<String>,
}

impl RunArgs {
    pub fn run(self, mut config: ControllerConfig) -> Result<()> {
        match self.log_format.as_deref() {
            Some("json") => config.log.format = LogFormat::Json,
            Some("text") => config.log.format = LogFormat::Text,
            _ => {}
        }
        start_blocking(config).context("controller exited with error")
    }
}
