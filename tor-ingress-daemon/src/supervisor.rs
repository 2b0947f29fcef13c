//! Supervision of the tor process: `Stopped -> Starting -> Running`.
//!
//! There is no health-check loop. A tor process that dies between reloads is
//! only noticed at the next reload, which then starts a fresh one.

use std::fmt;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use chrono::{DateTime, Utc};
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use serde::Serialize;
use tokio::process::{Child, Command};

use tor_ingress_core::config::TorConfig;
use tor_ingress_core::ReloadPolicy;

use crate::error::SupervisorError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SupervisorState {
    Stopped,
    Starting,
    Running,
}

impl fmt::Display for SupervisorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SupervisorState::Stopped => write!(f, "stopped"),
            SupervisorState::Starting => write!(f, "starting"),
            SupervisorState::Running => write!(f, "running"),
        }
    }
}

/// How to launch and manage the process.
#[derive(Debug, Clone)]
pub struct SupervisorSettings {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub reload_policy: ReloadPolicy,
    pub reload_grace: Duration,
    pub stop_timeout: Duration,
}

impl SupervisorSettings {
    /// `<binary> -f <torrc_path> [extra_args...]`
    pub fn from_config(tor: &TorConfig) -> Self {
        let mut args = vec!["-f".to_string(), tor.torrc_path.display().to_string()];
        args.extend(tor.extra_args.iter().cloned());
        Self {
            program: tor.binary.clone(),
            args,
            reload_policy: tor.reload_policy,
            reload_grace: tor.reload_grace(),
            stop_timeout: tor.stop_timeout(),
        }
    }
}

/// Point-in-time view for the status report.
#[derive(Debug, Clone, Serialize)]
pub struct SupervisorStatus {
    pub state: SupervisorState,
    pub pid: Option<u32>,
    pub reloads: u64,
    pub restarts: u64,
    pub started_at: Option<DateTime<Utc>>,
}

pub struct TorSupervisor {
    settings: SupervisorSettings,
    child: Option<Child>,
    state: SupervisorState,
    reloads: u64,
    restarts: u64,
    started_at: Option<DateTime<Utc>>,
}

impl TorSupervisor {
    pub fn new(settings: SupervisorSettings) -> Self {
        Self {
            settings,
            child: None,
            state: SupervisorState::Stopped,
            reloads: 0,
            restarts: 0,
            started_at: None,
        }
    }

    pub fn state(&self) -> SupervisorState {
        self.state
    }

    pub fn pid(&self) -> Option<u32> {
        self.child.as_ref().and_then(Child::id)
    }

    pub fn status(&self) -> SupervisorStatus {
        SupervisorStatus {
            state: self.state,
            pid: self.pid(),
            reloads: self.reloads,
            restarts: self.restarts,
            started_at: self.started_at,
        }
    }

    /// True while the spawned process has not exited.
    pub fn is_alive(&mut self) -> bool {
        match self.child.as_mut() {
            Some(child) => matches!(child.try_wait(), Ok(None)),
            None => false,
        }
    }

    /// Spawn the process. `Running` as soon as the spawn succeeds; a live
    /// process makes this a no-op.
    pub fn start(&mut self) -> Result<(), SupervisorError> {
        if self.state == SupervisorState::Running && self.is_alive() {
            return Ok(());
        }

        self.state = SupervisorState::Starting;
        let spawned = Command::new(&self.settings.program)
            .args(&self.settings.args)
            .stdin(Stdio::null())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn();

        match spawned {
            Ok(child) => {
                tracing::info!(
                    program = %self.settings.program.display(),
                    pid = child.id(),
                    "tor started",
                );
                self.child = Some(child);
                self.state = SupervisorState::Running;
                self.started_at = Some(Utc::now());
                Ok(())
            }
            Err(source) => {
                self.state = SupervisorState::Stopped;
                Err(SupervisorError::Spawn {
                    binary: self.settings.program.clone(),
                    source,
                })
            }
        }
    }

    /// Make the process re-read its configuration. Never returns with the
    /// supervisor `Stopped` unless the (re)start itself failed.
    pub async fn reload(&mut self) -> Result<(), SupervisorError> {
        if !self.is_alive() {
            if self.child.is_some() {
                tracing::warn!("tor exited since the last reload; starting it again");
                self.restarts += 1;
            }
            self.child = None;
            return self.start();
        }

        let hup = self.send_signal(Signal::SIGHUP);
        self.reloads += 1;

        match self.settings.reload_policy {
            ReloadPolicy::Restart => {
                if let Err(err) = hup {
                    tracing::debug!(error = %err, "SIGHUP before restart failed");
                }
                self.restart().await
            }
            ReloadPolicy::Signal => {
                if let Err(err) = hup {
                    tracing::warn!(error = %err, "SIGHUP failed; restarting tor");
                    return self.restart().await;
                }
                tokio::time::sleep(self.settings.reload_grace).await;
                if !self.is_alive() {
                    tracing::warn!("tor exited after SIGHUP; restarting");
                    return self.restart().await;
                }
                tracing::info!(pid = self.pid(), "tor reloaded");
                Ok(())
            }
        }
    }

    pub async fn restart(&mut self) -> Result<(), SupervisorError> {
        self.stop().await?;
        self.restarts += 1;
        self.start()
    }

    /// `SIGTERM`, then `SIGKILL` after the stop timeout. No-op when stopped.
    pub async fn stop(&mut self) -> Result<(), SupervisorError> {
        let Some(mut child) = self.child.take() else {
            self.state = SupervisorState::Stopped;
            return Ok(());
        };

        if matches!(child.try_wait(), Ok(None)) {
            if let Some(pid) = child.id() {
                if let Err(err) = signal::kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
                    tracing::debug!(pid, error = %err, "SIGTERM failed");
                }
            }
            match tokio::time::timeout(self.settings.stop_timeout, child.wait()).await {
                Ok(status) => {
                    let status = status.map_err(SupervisorError::Wait)?;
                    tracing::info!(%status, "tor stopped");
                }
                Err(_) => {
                    tracing::warn!(pid = child.id(), "tor ignored SIGTERM; sending SIGKILL");
                    child.kill().await.map_err(SupervisorError::Wait)?;
                }
            }
        }

        self.state = SupervisorState::Stopped;
        Ok(())
    }

    fn send_signal(&self, sig: Signal) -> Result<(), SupervisorError> {
        let Some(pid) = self.pid() else {
            return Ok(());
        };
        let pid = pid as i32;
        signal::kill(Pid::from_raw(pid), sig).map_err(|source| SupervisorError::Signal { pid, source })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
