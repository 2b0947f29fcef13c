//! `tor-ingress status`: what the running controller is serving.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::Args;
use colored::Colorize;
use serde::Deserialize;
use serde_json::Value;
use tabled::{settings::Style, Table, Tabled};

use tor_ingress_core::ControllerConfig;
use tor_ingress_daemon::{request_status, DaemonError};

/// Arguments for `tor-ingress status`.
#[derive(Args, Debug)]
pub struct StatusArgs {
    /// Emit machine-readable JSON.
    #[arg(long)]
    pub json: bool,
}

impl StatusArgs {
    pub fn run(self, config: &ControllerConfig) -> Result<()> {
        let payload = match request_status(&config.socket_path) {
            Ok(payload) => payload,
            Err(DaemonError::NotRunning { .. }) => {
                if self.json {
                    let payload = serde_json::json!({
                        "running": false,
                        "socket": config.socket_path.display().to_string(),
                    });
                    print_json(&payload)?;
                } else {
                    println!("controller is not running");
                }
                return Ok(());
            }
            Err(err) => return Err(err).context("failed to query controller status"),
        };

        if self.json {
            return print_json(&payload);
        }

        let report: StatusReport =
            serde_json::from_value(payload).context("unexpected status payload")?;
        print_table(report);
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct StatusReport {
    started_at: Option<DateTime<Utc>>,
    tor: TorReport,
    queue_depth: usize,
    #[serde(default)]
    services: Vec<ServiceReport>,
}

#[derive(Debug, Deserialize)]
struct TorReport {
    state: String,
    pid: Option<u32>,
    reloads: u64,
    restarts: u64,
}

#[derive(Debug, Deserialize)]
struct ServiceReport {
    key: String,
    state: String,
    hostname: Option<String>,
    backend: String,
    public_port: u16,
    updated_at: DateTime<Utc>,
}

#[derive(Tabled)]
struct ServiceTableRow {
    #[tabled(rename = "ingress")]
    key: String,
    #[tabled(rename = "state")]
    state: String,
    #[tabled(rename = "hostname")]
    hostname: String,
    #[tabled(rename = "backend")]
    backend: String,
    #[tabled(rename = "port")]
    public_port: u16,
    #[tabled(rename = "updated")]
    updated: String,
}

fn print_json(payload: &Value) -> Result<()> {
    println!(
        "{}",
        serde_json::to_string_pretty(payload).context("failed to serialize status JSON")?
    );
    Ok(())
}

fn print_table(report: StatusReport) {
    let now = Utc::now();
    let pid = report
        .tor
        .pid
        .map_or_else(|| "-".to_string(), |pid| pid.to_string());
    println!(
        "tor-ingress v{} | up {} | tor {} (pid {pid}) | {} reloads | {} restarts | queue {}",
        env!("CARGO_PKG_VERSION"),
        report
            .started_at
            .map_or_else(|| "?".to_string(), |at| format_age(now, at)),
        colour_tor_state(&report.tor.state),
        report.tor.reloads,
        report.tor.restarts,
        report.queue_depth,
    );

    if report.services.is_empty() {
        println!("No hidden services configured.");
        return;
    }

    let rows: Vec<ServiceTableRow> = report
        .services
        .into_iter()
        .map(|service| ServiceTableRow {
            key: service.key,
            state: colour_service_state(&service.state),
            hostname: service.hostname.unwrap_or_else(|| "-".to_string()),
            backend: service.backend,
            public_port: service.public_port,
            updated: format!("{} ago", format_age(now, service.updated_at)),
        })
        .collect();
    let mut table = Table::new(rows);
    table.with(Style::rounded());
    println!("{table}");
}

fn colour_service_state(state: &str) -> String {
    match state {
        "ready" => state.green().bold().to_string(),
        "configured" => state.yellow().bold().to_string(),
        _ => state.bright_black().bold().to_string(),
    }
}

fn colour_tor_state(state: &str) -> String {
    match state {
        "running" => state.green().bold().to_string(),
        "starting" => state.yellow().bold().to_string(),
        _ => state.red().bold().to_string(),
    }
}

/// Coarse "3m" / "2h" / "5d" rendering of `now - then`.
fn format_age(now: DateTime<Utc>, then: DateTime<Utc>) -> String {
    let secs = (now - then).num_seconds().max(0);
    match secs {
        0..=59 => format!("{secs}s"),
        60..=3_599 => format!("{}m", secs / 60),
        3_600..=86_399 => format!("{}h", secs / 3_600),
        _ => format!("{}d", secs / 86_400),
    }
}
