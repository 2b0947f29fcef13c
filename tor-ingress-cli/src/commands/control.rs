//! `tor-ingress resync` and `tor-ingress stop`.

use anyhow::{Context, Result};
use clap::Args;

use tor_ingress_core::ControllerConfig;
use tor_ingress_daemon::{request_resync, request_stop, DaemonError};

#[derive(Args, Debug)]
pub struct ResyncArgs {
    /// `namespace/name` of one ingress; omit to re-sync everything.
    pub key: Option<String>,
}

impl ResyncArgs {
    pub fn run(self, config: &ControllerConfig) -> Result<()> {
        let data = request_resync(&config.socket_path, self.key)
            .context("failed to request resync")?;
        let count = data
            .get("queued")
            .and_then(|queued| queued.as_array())
            .map_or(0, Vec::len);
        println!("queued {count} key(s) for resync");
        Ok(())
    }
}

#[derive(Args, Debug)]
pub struct StopArgs {}

impl StopArgs {
    pub fn run(self, config: &ControllerConfig) -> Result<()> {
        match request_stop(&config.socket_path) {
            Ok(()) => println!("controller stop requested"),
            Err(DaemonError::NotRunning { .. }) => println!("controller is not running"),
            Err(err) => return Err(err).context("failed to stop controller"),
        }
        Ok(())
    }
}
