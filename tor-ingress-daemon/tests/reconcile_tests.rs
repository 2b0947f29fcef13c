//! End-to-end reconciliation over the file-backed manifest store, a stand-in
//! tor process and pre-published hostname files.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use tor_ingress_core::config::SourceConfig;
use tor_ingress_core::{
    ControllerConfig, Ingress, IngressStore, ReloadPolicy, ServiceKey, ServiceRegistry,
    ServiceState, SkipReason, StatusWriter, StoreError,
};
use tor_ingress_daemon::{
    run_worker, ControlPlane, ManifestStore, ReconcileError, Reconciler, SharedControlPlane,
    StatusError, SupervisorSettings, SupervisorState, SyncOutcome, TorSupervisor, WorkQueue,
};
use tor_ingress_sync::TorrcWriter;

const APP: &str = "\
kind: Ingress
metadata:
  name: app
  namespace: ns
  annotations:
    kubernetes.io/ingress.class: tor
    tor.ingress/private-key: app-key
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
kind: Secret
metadata:
  name: app-key
  namespace: ns
stringData:
  private-key: PRIVATE
";

const MULTI: &str = "\
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

struct Harness {
    _dir: TempDir,
    config: ControllerConfig,
    store: Arc<ManifestStore>,
    plane: SharedControlPlane,
    reconciler: Reconciler,
}

fn stand_in_tor() -> SupervisorSettings {
    SupervisorSettings {
        program: PathBuf::from("sh"),
        args: vec!["-c".to_string(), "trap '' HUP; exec sleep 300".to_string()],
        reload_policy: ReloadPolicy::Signal,
        reload_grace: Duration::from_millis(50),
        stop_timeout: Duration::from_secs(2),
    }
}

impl Harness {
    fn new() -> Self {
        Self::with(|_, _, _| {})
    }

    /// Build a harness, letting `tweak` adjust the config and the supervisor
    /// settings before anything is constructed from them.
    fn with(tweak: impl FnOnce(&Path, &mut ControllerConfig, &mut SupervisorSettings)) -> Self {
        let dir = TempDir::new().expect("tempdir");
        let root = dir.path();
        let mut config = ControllerConfig {
            state_dir: root.join("state"),
            socket_path: root.join("control.sock"),
            source: SourceConfig {
                manifests_dir: root.join("manifests"),
                status_dir: root.join("status"),
                ..SourceConfig::default()
            },
            ..ControllerConfig::default()
        };
        config.tor.torrc_path = root.join("tor").join("torfile");
        config.tor.services_root = root.join("tor");
        config.controller.hostname_poll_ms = 20;
        config.controller.hostname_timeout_ms = 2_000;
        let mut settings = stand_in_tor();
        tweak(root, &mut config, &mut settings);
        fs::create_dir_all(&config.source.manifests_dir).expect("manifests dir");
        fs::create_dir_all(&config.tor.services_root).expect("services root");

        let store = Arc::new(ManifestStore::new(&config.source));
        let plane = ControlPlane::new(
            ServiceRegistry::new(&config.tor.services_root),
            TorrcWriter::from_config(&config).expect("writer"),
            TorSupervisor::new(settings),
        )
        .shared();
        let reconciler = Reconciler::new(
            plane.clone(),
            store.clone(),
            store.clone(),
            store.clone(),
            &config,
        );

        Self {
            _dir: dir,
            config,
            store,
            plane,
            reconciler,
        }
    }

    /// A second reconciler over the same control plane with different
    /// ingress and status collaborators.
    fn reconciler_with(
        &self,
        ingresses: Arc<dyn IngressStore>,
        status: Arc<dyn StatusWriter>,
    ) -> Reconciler {
        Reconciler::new(
            self.plane.clone(),
            ingresses,
            self.store.clone(),
            status,
            &self.config,
        )
    }

    fn write_manifest(&self, name: &str, contents: &str) -> PathBuf {
        let path = self.config.source.manifests_dir.join(name);
        fs::write(&path, contents).expect("write manifest");
        self.store.full_scan().expect("scan");
        path
    }

    fn publish_hostname(&self, dir_name: &str, hostname: &str) -> PathBuf {
        let service_dir = self.config.tor.services_root.join(dir_name);
        fs::create_dir_all(&service_dir).expect("service dir");
        fs::write(service_dir.join("hostname"), format!("{hostname}\n")).expect("hostname");
        service_dir
    }

    fn torrc(&self) -> String {
        fs::read_to_string(&self.config.tor.torrc_path).unwrap_or_default()
    }

    async fn reloads(&self) -> u64 {
        self.reconciler.plane().lock().await.supervisor.status().reloads
    }

    async fn shutdown(&self) {
        self.reconciler
            .plane()
            .lock()
            .await
            .supervisor
            .stop()
            .await
            .expect("stop");
    }
}

fn key(raw: &str) -> ServiceKey {
    ServiceKey::from(raw)
}

async fn wait_for(what: &str, mut done: impl FnMut() -> bool) {
    for _ in 0..200 {
        if done() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

/// Status writer whose every update loses the version race.
#[derive(Default)]
struct AlwaysConflicting {
    updates: AtomicUsize,
}

impl StatusWriter for AlwaysConflicting {
    fn update_status(&self, ingress: &Ingress) -> Result<(), StoreError> {
        self.updates.fetch_add(1, Ordering::SeqCst);
        Err(StoreError::Conflict {
            key: ingress.key().to_string(),
            expected: "1".to_string(),
            found: "2".to_string(),
        })
    }
}

/// Ingress store that is always unreachable.
#[derive(Default)]
struct Unreachable {
    reads: AtomicUsize,
}

impl IngressStore for Unreachable {
    fn get_by_key(&self, _key: &ServiceKey) -> Result<Option<Ingress>, StoreError> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        Err(StoreError::Backend("connection refused".to_string()))
    }

    fn backend_address(&self, _namespace: &str, _service: &str) -> Result<String, StoreError> {
        Err(StoreError::Backend("connection refused".to_string()))
    }
}

#[tokio::test]
async fn tor_ingress_becomes_a_published_hidden_service() {
    let h = Harness::new();
    h.write_manifest("app.yaml", APP);
    let service_dir = h.publish_hostname("ns_app_svc_8080", "abc123.onion");

    let outcome = h.reconciler.sync(&key("ns/app")).await.expect("sync");
    assert_eq!(
        outcome,
        SyncOutcome::Ready {
            hostname: "abc123.onion".to_string()
        }
    );

    let torrc = h.torrc();
    assert!(
        torrc.contains(&format!("HiddenServiceDir {}/", service_dir.display())),
        "{torrc}"
    );
    assert!(torrc.contains("HiddenServicePort 80 10.96.0.12:8080"), "{torrc}");
    assert_eq!(
        fs::read_to_string(service_dir.join("private-key")).expect("key"),
        "PRIVATE"
    );

    {
        let plane = h.reconciler.plane().lock().await;
        let service = plane.registry.get(&key("ns/app")).expect("registered");
        assert_eq!(service.state, ServiceState::Ready);
        assert_eq!(service.hostname.as_deref(), Some("abc123.onion"));
        assert!(plane.supervisor.pid().is_some(), "tor started");
    }

    let ingress = h
        .store
        .get_by_key(&key("ns/app"))
        .expect("read")
        .expect("present");
    assert_eq!(ingress.published_hostnames(), ["abc123.onion"]);

    h.shutdown().await;
}

#[tokio::test]
async fn second_sync_without_changes_does_not_reload() {
    let h = Harness::new();
    h.write_manifest("app.yaml", APP);
    h.publish_hostname("ns_app_svc_8080", "abc123.onion");

    h.reconciler.sync(&key("ns/app")).await.expect("first sync");
    let torrc = h.torrc();
    let reloads = h.reloads().await;

    h.reconciler.sync(&key("ns/app")).await.expect("second sync");
    assert_eq!(h.torrc(), torrc);
    assert_eq!(h.reloads().await, reloads);

    h.shutdown().await;
}

#[tokio::test]
async fn deleted_ingress_is_removed_everywhere() {
    let h = Harness::new();
    let manifest = h.write_manifest("app.yaml", APP);
    let service_dir = h.publish_hostname("ns_app_svc_8080", "abc123.onion");
    h.reconciler.sync(&key("ns/app")).await.expect("sync");
    // Let the stand-in process install its HUP trap before the next reload.
    tokio::time::sleep(Duration::from_millis(200)).await;

    fs::remove_file(&manifest).expect("delete manifest");
    let changed = h.store.rescan_file(&manifest).expect("rescan");
    assert!(changed.contains(&key("ns/app")), "{changed:?}");

    let outcome = h.reconciler.sync(&key("ns/app")).await.expect("sync");
    assert_eq!(outcome, SyncOutcome::Removed);
    assert!(!service_dir.exists(), "service directory removed");
    assert!(!h.torrc().contains("HiddenServiceDir"), "{}", h.torrc());
    assert!(h.reconciler.plane().lock().await.registry.is_empty());

    h.shutdown().await;
}

#[tokio::test]
async fn multi_backend_ingress_is_skipped() {
    let h = Harness::new();
    h.write_manifest("multi.yaml", MULTI);

    let outcome = h.reconciler.sync(&key("ns/multi")).await.expect("sync");
    assert_eq!(outcome, SyncOutcome::Skipped(SkipReason::MultipleBackends(2)));
    assert!(h.reconciler.plane().lock().await.registry.is_empty());
    assert!(!h.torrc().contains("HiddenServiceDir"));
}

#[tokio::test]
async fn unknown_key_is_a_no_op_removal() {
    let h = Harness::new();
    let outcome = h.reconciler.sync(&key("ns/ghost")).await.expect("sync");
    assert_eq!(outcome, SyncOutcome::Removed);
    assert_eq!(h.reloads().await, 0);
}

#[tokio::test]
async fn missing_backend_service_is_a_retryable_error() {
    let h = Harness::new();
    let ingress_only = APP.split("---").next().expect("first document");
    h.write_manifest("app.yaml", ingress_only);

    let err = h.reconciler.sync(&key("ns/app")).await.unwrap_err();
    assert!(matches!(err, ReconcileError::Store(_)), "got: {err}");
    assert!(h.reconciler.plane().lock().await.registry.is_empty());
}

// ---------------------------------------------------------------------------
// Failure paths
// ---------------------------------------------------------------------------

#[tokio::test]
async fn failed_tor_start_is_retried_by_the_next_sync() {
    let h = Harness::with(|root, _, settings| {
        settings.program = root.join("bin").join("tor");
        settings.args = vec!["-c".to_string(), "trap '' HUP; exec sleep 300".to_string()];
    });
    h.write_manifest("app.yaml", APP);
    h.publish_hostname("ns_app_svc_8080", "abc123.onion");

    let err = h.reconciler.sync(&key("ns/app")).await.unwrap_err();
    assert!(matches!(err, ReconcileError::Supervisor(_)), "got: {err}");
    let torrc = h.torrc();
    assert!(torrc.contains("HiddenServicePort 80 10.96.0.12:8080"), "{torrc}");
    assert!(h.plane.lock().await.needs_apply());

    // The torrc on disk is already current; only tor itself was missing.
    let bin = h.config.tor.services_root.parent().expect("root").join("bin");
    fs::create_dir_all(&bin).expect("bin dir");
    std::os::unix::fs::symlink("/bin/sh", bin.join("tor")).expect("symlink");

    let outcome = h.reconciler.sync(&key("ns/app")).await.expect("retry");
    assert_eq!(
        outcome,
        SyncOutcome::Ready {
            hostname: "abc123.onion".to_string()
        }
    );
    assert_eq!(h.torrc(), torrc);
    {
        let plane = h.plane.lock().await;
        assert!(!plane.needs_apply());
        assert_eq!(plane.supervisor.state(), SupervisorState::Running);
        assert!(plane.supervisor.pid().is_some());
    }

    h.shutdown().await;
}

#[tokio::test]
async fn failed_removal_is_finished_by_the_next_sync() {
    let h = Harness::new();
    let manifest = h.write_manifest("app.yaml", APP);
    h.publish_hostname("ns_app_svc_8080", "abc123.onion");
    h.reconciler.sync(&key("ns/app")).await.expect("sync");
    tokio::time::sleep(Duration::from_millis(200)).await;

    fs::remove_file(&manifest).expect("delete manifest");
    h.store.rescan_file(&manifest).expect("rescan");

    // A directory where the torrc belongs makes the atomic rename fail.
    let torrc_path = h.config.tor.torrc_path.clone();
    fs::remove_file(&torrc_path).expect("remove torrc");
    fs::create_dir(&torrc_path).expect("block torrc");

    let err = h.reconciler.sync(&key("ns/app")).await.unwrap_err();
    assert!(matches!(err, ReconcileError::Persist(_)), "got: {err}");
    assert!(h.plane.lock().await.registry.is_empty());
    let reloads = h.reloads().await;

    fs::remove_dir(&torrc_path).expect("unblock torrc");
    let outcome = h.reconciler.sync(&key("ns/app")).await.expect("retry");
    assert_eq!(outcome, SyncOutcome::Removed);
    assert!(!h.torrc().contains("HiddenServiceDir"), "{}", h.torrc());
    assert!(h.reloads().await > reloads, "tor reloaded with the removal");
    assert!(!h.plane.lock().await.needs_apply());

    h.shutdown().await;
}

#[tokio::test]
async fn hostname_that_never_appears_leaves_the_service_configured() {
    let h = Harness::with(|_, config, _| config.controller.hostname_timeout_ms = 200);
    h.write_manifest("app.yaml", APP);

    let err = h.reconciler.sync(&key("ns/app")).await.unwrap_err();
    assert!(matches!(err, ReconcileError::Hostname(_)), "got: {err}");

    let plane = h.plane.lock().await;
    let service = plane.registry.get(&key("ns/app")).expect("registered");
    assert_eq!(service.state, ServiceState::Configured);
    assert_eq!(service.hostname, None);
    drop(plane);
    assert!(h.torrc().contains("HiddenServicePort 80 10.96.0.12:8080"));

    h.shutdown().await;
}

#[tokio::test]
async fn status_conflicts_past_the_retry_budget_fail_the_sync() {
    let h = Harness::new();
    h.write_manifest("app.yaml", APP);
    h.publish_hostname("ns_app_svc_8080", "abc123.onion");
    let status = Arc::new(AlwaysConflicting::default());
    let reconciler = h.reconciler_with(h.store.clone(), status.clone());

    let err = reconciler.sync(&key("ns/app")).await.unwrap_err();
    match err {
        ReconcileError::Status(StatusError::ConflictExhausted { key: k, attempts }) => {
            assert_eq!(k, key("ns/app"));
            assert_eq!(attempts, h.config.controller.status_retry_steps);
        }
        other => panic!("expected exhausted conflicts, got: {other}"),
    }
    assert_eq!(
        status.updates.load(Ordering::SeqCst),
        h.config.controller.status_retry_steps as usize
    );
    assert_eq!(
        h.plane.lock().await.registry.get(&key("ns/app")).expect("registered").state,
        ServiceState::Ready
    );

    h.shutdown().await;
}

#[tokio::test]
async fn worker_gives_up_after_five_failures_until_the_key_is_added_again() {
    let h = Harness::new();
    let ingresses = Arc::new(Unreachable::default());
    let reconciler = Arc::new(h.reconciler_with(ingresses.clone(), h.store.clone()));
    let queue = WorkQueue::new(Duration::from_millis(1), Duration::from_millis(10));
    let worker = tokio::spawn(run_worker(0, queue.clone(), reconciler, 5));

    queue.add(key("ns/app"));
    wait_for("five attempts", || ingresses.reads.load(Ordering::SeqCst) >= 5).await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(ingresses.reads.load(Ordering::SeqCst), 5);
    assert_eq!(queue.num_requeues(&key("ns/app")), 0);

    queue.add(key("ns/app"));
    wait_for("a fresh attempt", || ingresses.reads.load(Ordering::SeqCst) >= 6).await;

    queue.shutdown();
    worker.await.expect("worker");
}
