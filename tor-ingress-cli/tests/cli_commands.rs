use std::fs;
use std::path::Path;
use std::process::Command;

use assert_cmd::prelude::*;
use predicates::prelude::*;
use predicates::str::contains;
use tempfile::TempDir;

const MANIFESTS: &str = "\
kind: Ingress
metadata:
  name: app
  namespace: ns
  annotations:
    kubernetes.io/ingress.class: tor
spec:
  backend:
    serviceName: svc
    servicePort: 8080
---
kind: Service
metadata:
  name: svc
  namespace: ns
spec:
  clusterIP: 10.96.0.12
---
kind: Ingress
metadata:
  name: multi
  namespace: ns
  annotations:
    kubernetes.io/ingress.class: tor
spec:
  rules:
    - http:
        paths:
          - backend: { serviceName: a, servicePort: 80 }
          - backend: { serviceName: b, servicePort: 80 }
";

struct Workspace {
    dir: TempDir,
    config: std::path::PathBuf,
}

fn workspace() -> Workspace {
    let dir = TempDir::new().expect("tempdir");
    let root = dir.path();
    fs::create_dir_all(root.join("manifests")).expect("manifests");
    fs::write(root.join("manifests").join("app.yaml"), MANIFESTS).expect("manifest");

    let config = root.join("config.yaml");
    fs::write(
        &config,
        format!(
            "state_dir: {root}/state\n\
             socket_path: {root}/control.sock\n\
             tor:\n  torrc_path: {root}/tor/torfile\n  services_root: {root}/tor\n\
             source:\n  manifests_dir: {root}/manifests\n  status_dir: {root}/status\n",
            root = root.display()
        ),
    )
    .expect("config");
    Workspace { dir, config }
}

fn tor_ingress(home: &Path) -> Command {
    let mut cmd = Command::new(assert_cmd::cargo::cargo_bin!("tor-ingress"));
    cmd.env("HOME", home).env("XDG_CONFIG_HOME", home.join(".config"));
    cmd
}

#[test]
fn render_prints_torrc_for_servable_ingresses() {
    let ws = workspace();
    let services_root = ws.dir.path().join("tor");

    tor_ingress(ws.dir.path())
        .arg("render")
        .arg("--config")
        .arg(&ws.config)
        .assert()
        .success()
        .stdout(contains(format!(
            "HiddenServiceDir {}/ns_app_svc_8080/",
            services_root.display()
        )))
        .stdout(contains("HiddenServicePort 80 10.96.0.12:8080"))
        .stdout(contains("ns/multi").not())
        .stderr(contains("ns/multi"));

    assert!(
        !ws.dir.path().join("tor").join("torfile").exists(),
        "render never writes the torrc"
    );
}

#[test]
fn render_diff_against_missing_torrc_shows_additions() {
    let ws = workspace();
    let assert = tor_ingress(ws.dir.path())
        .args(["render", "--diff", "--config"])
        .arg(&ws.config)
        .assert()
        .success();
    let stdout = String::from_utf8(assert.get_output().stdout.clone()).expect("utf8");
    assert!(
        stdout
            .lines()
            .any(|line| line.starts_with('+') && line.contains("HiddenServicePort 80")),
        "{stdout}"
    );
}

#[test]
fn render_diff_reports_no_differences_when_current() {
    let ws = workspace();
    let rendered = tor_ingress(ws.dir.path())
        .args(["render", "--config"])
        .arg(&ws.config)
        .output()
        .expect("render");
    let torrc = ws.dir.path().join("tor").join("torfile");
    fs::create_dir_all(torrc.parent().expect("parent")).expect("mkdir");
    fs::write(&torrc, &rendered.stdout).expect("write torrc");

    tor_ingress(ws.dir.path())
        .args(["render", "--diff", "--config"])
        .arg(&ws.config)
        .assert()
        .success()
        .stdout(contains("No differences"));
}

#[test]
fn status_without_controller_reports_not_running() {
    let ws = workspace();
    tor_ingress(ws.dir.path())
        .args(["status", "--config"])
        .arg(&ws.config)
        .assert()
        .success()
        .stdout(contains("controller is not running"));

    tor_ingress(ws.dir.path())
        .args(["status", "--json", "--config"])
        .arg(&ws.config)
        .assert()
        .success()
        .stdout(contains("\"running\": false"));
}

#[test]
fn stop_without_controller_succeeds() {
    let ws = workspace();
    tor_ingress(ws.dir.path())
        .args(["stop", "--config"])
        .arg(&ws.config)
        .assert()
        .success()
        .stdout(contains("controller is not running"));
}

#[test]
fn resync_without_controller_fails() {
    let ws = workspace();
    tor_ingress(ws.dir.path())
        .args(["resync", "ns/app", "--config"])
        .arg(&ws.config)
        .assert()
        .failure()
        .stderr(contains("not running"));
}

#[test]
fn malformed_config_is_reported() {
    let ws = workspace();
    fs::write(&ws.config, "controller: [not, a, map]\n").expect("write");
    tor_ingress(ws.dir.path())
        .args(["render", "--config"])
        .arg(&ws.config)
        .assert()
        .failure()
        .stderr(contains("failed to load controller configuration"));
}
