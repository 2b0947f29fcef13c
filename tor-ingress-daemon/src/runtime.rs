use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::io::ErrorKind;
use std::os::unix::net::UnixStream as StdUnixStream;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use notify::{recommended_watcher, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::OwnedWriteHalf;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use tor_ingress_core::config::LogConfig;
use tor_ingress_core::registry::{derive_service_dir, sweep_orphaned_dirs};
use tor_ingress_core::{ControllerConfig, IngressStore, LogFormat, ServiceKey, ServiceRegistry};
use tor_ingress_sync::TorrcWriter;

use crate::error::{io_err, DaemonError};
use crate::manifest::ManifestStore;
use crate::paths::{is_manifest_file, DEBOUNCE_WINDOW};
use crate::protocol::{DaemonRequest, DaemonResponse, CMD_RESYNC, CMD_STATUS, CMD_STOP};
use crate::queue::WorkQueue;
use crate::reconciler::{run_worker, ControlPlane, Reconciler, SharedControlPlane};
use crate::supervisor::{SupervisorSettings, TorSupervisor};

/// Start the controller runtime and block the current thread until it exits.
pub fn start_blocking(config: ControllerConfig) -> Result<(), DaemonError> {
    init_tracing(&config.log);
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| io_err("tokio-runtime", e))?;
    runtime.block_on(run(config))
}

/// Run the controller: workers, manifest watcher, periodic resync, control
/// socket and signal handling, until a shutdown is requested.
pub async fn run(config: ControllerConfig) -> Result<(), DaemonError> {
    ensure_runtime_dirs(&config)?;

    let store = Arc::new(ManifestStore::new(&config.source));
    let initial_keys = store.full_scan()?;
    sweep_undeclared_service_dirs(&config, &store);

    let mut plane = ControlPlane::new(
        ServiceRegistry::new(&config.tor.services_root),
        TorrcWriter::from_config(&config)?,
        TorSupervisor::new(SupervisorSettings::from_config(&config.tor)),
    );
    plane.writer.persist(&plane.registry)?;
    plane.supervisor.start()?;
    let plane = plane.shared();

    let queue = WorkQueue::new(
        config.controller.backoff_base(),
        config.controller.backoff_max(),
    );
    for key in initial_keys {
        queue.add(key);
    }

    let reconciler = Arc::new(Reconciler::new(
        plane.clone(),
        store.clone(),
        store.clone(),
        store.clone(),
        &config,
    ));

    let (shutdown_tx, _) = broadcast::channel::<()>(16);

    let workers: Vec<JoinHandle<()>> = (0..config.controller.workers)
        .map(|id| {
            tokio::spawn(run_worker(
                id,
                queue.clone(),
                reconciler.clone(),
                config.controller.max_retries,
            ))
        })
        .collect();
    tracing::info!(
        workers = workers.len(),
        manifests = %config.source.manifests_dir.display(),
        torrc = %config.tor.torrc_path.display(),
        "controller started",
    );

    let queue_handle = {
        let queue = queue.clone();
        let mut shutdown_rx = shutdown_tx.subscribe();
        tokio::spawn(async move {
            let _ = shutdown_rx.recv().await;
            queue.shutdown();
            Ok::<(), DaemonError>(())
        })
    };

    let watcher_handle = {
        let shutdown = shutdown_tx.clone();
        let shutdown_rx = shutdown_tx.subscribe();
        let store = store.clone();
        let queue = queue.clone();
        tokio::spawn(async move {
            let result = watcher_task(store, queue, shutdown_rx).await;
            let _ = shutdown.send(());
            result
        })
    };

    let resync_handle = {
        let shutdown = shutdown_tx.clone();
        let shutdown_rx = shutdown_tx.subscribe();
        let store = store.clone();
        let queue = queue.clone();
        let interval = config.source.resync_interval();
        tokio::spawn(async move {
            let result = resync_task(store, queue, interval, shutdown_rx).await;
            let _ = shutdown.send(());
            result
        })
    };

    let socket_handle = {
        let shutdown = shutdown_tx.clone();
        let shutdown_rx = shutdown_tx.subscribe();
        let ctx = ControlContext {
            plane: plane.clone(),
            queue: queue.clone(),
            store: store.clone(),
            started_at: Utc::now(),
            shutdown_tx: shutdown_tx.clone(),
        };
        let socket = config.socket_path.clone();
        tokio::spawn(async move {
            let result = socket_server_task(socket, ctx, shutdown_rx).await;
            let _ = shutdown.send(());
            result
        })
    };

    let signal_handle = {
        let shutdown = shutdown_tx.clone();
        let shutdown_rx = shutdown_tx.subscribe();
        tokio::spawn(signal_task(shutdown, shutdown_rx))
    };

    let (queue_result, watcher_result, resync_result, socket_result, signal_result) = tokio::join!(
        queue_handle,
        watcher_handle,
        resync_handle,
        socket_handle,
        signal_handle
    );

    // Workers drain their current key once the queue has shut down.
    queue.shutdown();
    for worker in workers {
        if let Err(err) = worker.await {
            tracing::error!(error = %err, "worker task join failure");
        }
    }
    plane.lock().await.supervisor.stop().await?;
    tracing::info!("controller stopped");

    handle_join("queue", queue_result)?;
    handle_join("watcher", watcher_result)?;
    handle_join("resync", resync_result)?;
    handle_join("socket_server", socket_result)?;
    handle_join("signal_handler", signal_result)?;
    Ok(())
}

async fn signal_task(
    shutdown: broadcast::Sender<()>,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), DaemonError> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate =
        signal(SignalKind::terminate()).map_err(|e| io_err("SIGTERM handler", e))?;
    tokio::select! {
        _ = shutdown_rx.recv() => {}
        _ = terminate.recv() => {
            tracing::info!("received SIGTERM, shutting down controller");
            let _ = shutdown.send(());
        }
        signal = tokio::signal::ctrl_c() => {
            signal.map_err(|e| io_err("ctrl-c handler", e))?;
            tracing::info!("received ctrl-c, shutting down controller");
            let _ = shutdown.send(());
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Event source
// ---------------------------------------------------------------------------

async fn watcher_task(
    store: Arc<ManifestStore>,
    queue: WorkQueue,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), DaemonError> {
    let configured_root = store.root().to_path_buf();
    if !configured_root.exists() {
        fs::create_dir_all(&configured_root).map_err(|e| io_err(&configured_root, e))?;
    }
    let root = fs::canonicalize(&configured_root).map_err(|e| io_err(&configured_root, e))?;

    let (event_tx, mut event_rx) = mpsc::unbounded_channel::<notify::Result<Event>>();
    let mut watcher: RecommendedWatcher = recommended_watcher(move |event: notify::Result<Event>| {
        let _ = event_tx.send(event);
    })?;
    watcher.watch(&root, RecursiveMode::Recursive)?;
    tracing::debug!(path = %root.display(), "watching manifests");

    let mut debounce = Debouncer::new(DEBOUNCE_WINDOW);

    loop {
        let deadline = debounce.next_deadline();
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            _ = sleep_until_or_forever(deadline) => {
                for path in debounce.take_due(Instant::now()) {
                    rescan_and_enqueue(&store, &queue, path).await;
                }
            }
            event = event_rx.recv() => {
                let Some(event) = event else { break };
                let event = match event {
                    Ok(event) => event,
                    Err(err) => {
                        tracing::warn!(error = %err, "watcher event error");
                        continue;
                    }
                };
                if !is_relevant_event_kind(&event.kind) {
                    continue;
                }
                for path in event.paths {
                    if !is_manifest_file(&path) {
                        continue;
                    }
                    // The store indexes files under the configured root.
                    if let Ok(relative) = path.strip_prefix(&root) {
                        debounce.record(configured_root.join(relative), Instant::now());
                    }
                }
            }
        }
    }

    Ok(())
}

async fn sleep_until_or_forever(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

async fn rescan_and_enqueue(store: &Arc<ManifestStore>, queue: &WorkQueue, path: PathBuf) {
    let scan_store = store.clone();
    let scan_path = path.clone();
    let result = tokio::task::spawn_blocking(move || scan_store.rescan_file(&scan_path)).await;
    match result {
        Ok(Ok(keys)) => {
            tracing::debug!(path = %path.display(), changed = keys.len(), "manifest rescanned");
            for key in keys {
                queue.add(key);
            }
        }
        Ok(Err(err)) => tracing::warn!(path = %path.display(), error = %err, "manifest rescan failed"),
        Err(err) => tracing::error!(error = %err, "manifest rescan task failed"),
    }
}

async fn resync_task(
    store: Arc<ManifestStore>,
    queue: WorkQueue,
    interval: Option<Duration>,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), DaemonError> {
    let Some(period) = interval else {
        let _ = shutdown_rx.recv().await;
        return Ok(());
    };

    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    interval.tick().await; // the startup scan already ran

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            _ = interval.tick() => {
                let scan_store = store.clone();
                match tokio::task::spawn_blocking(move || scan_store.full_scan()).await {
                    Ok(Ok(keys)) => {
                        tracing::debug!(keys = keys.len(), "periodic resync");
                        for key in keys {
                            queue.add(key);
                        }
                    }
                    Ok(Err(err)) => tracing::warn!(error = %err, "periodic resync failed"),
                    Err(err) => tracing::error!(error = %err, "resync task failed"),
                }
            }
        }
    }
    Ok(())
}

/// Trailing-edge debounce: a path becomes due once no event for it has been
/// seen for `window`.
struct Debouncer {
    window: Duration,
    pending: HashMap<PathBuf, Instant>,
}

impl Debouncer {
    fn new(window: Duration) -> Self {
        Self {
            window,
            pending: HashMap::new(),
        }
    }

    fn record(&mut self, path: PathBuf, now: Instant) {
        self.pending.insert(path, now);
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.pending.values().min().map(|seen| *seen + self.window)
    }

    fn take_due(&mut self, now: Instant) -> Vec<PathBuf> {
        let window = self.window;
        let mut due: Vec<PathBuf> = self
            .pending
            .iter()
            .filter(|(_, seen)| now.duration_since(**seen) >= window)
            .map(|(path, _)| path.clone())
            .collect();
        for path in &due {
            self.pending.remove(path);
        }
        due.sort();
        due
    }
}

fn is_relevant_event_kind(kind: &EventKind) -> bool {
    matches!(
        kind,
        EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
    )
}

// ---------------------------------------------------------------------------
// Control socket
// ---------------------------------------------------------------------------

#[derive(Clone)]
struct ControlContext {
    plane: SharedControlPlane,
    queue: WorkQueue,
    store: Arc<ManifestStore>,
    started_at: DateTime<Utc>,
    shutdown_tx: broadcast::Sender<()>,
}

async fn socket_server_task(
    socket: PathBuf,
    ctx: ControlContext,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), DaemonError> {
    if let Some(dir) = socket.parent() {
        fs::create_dir_all(dir).map_err(|e| io_err(dir, e))?;
    }
    prepare_socket_for_bind(&socket)?;

    let listener = UnixListener::bind(&socket).map_err(|e| io_err(&socket, e))?;
    set_socket_permissions(&socket)?;
    tracing::debug!(socket = %socket.display(), "control socket listening");

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            accepted = listener.accept() => {
                let (stream, _) = accepted.map_err(|e| io_err(&socket, e))?;
                let ctx = ctx.clone();
                tokio::spawn(async move {
                    if let Err(err) = handle_socket_client(stream, ctx).await {
                        tracing::error!(error = %err, "socket client error");
                    }
                });
            }
        }
    }

    if socket.exists() {
        let _ = fs::remove_file(&socket);
    }
    Ok(())
}

async fn handle_socket_client(stream: UnixStream, ctx: ControlContext) -> Result<(), DaemonError> {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    while let Some(line) = lines
        .next_line()
        .await
        .map_err(|e| io_err("control socket read", e))?
    {
        if line.trim().is_empty() {
            continue;
        }

        let request = match serde_json::from_str::<DaemonRequest>(&line) {
            Ok(request) => request,
            Err(err) => {
                write_response(
                    &mut writer,
                    &DaemonResponse::error(format!("invalid request JSON: {err}")),
                )
                .await?;
                continue;
            }
        };

        let response = match request.cmd.as_str() {
            CMD_STATUS => DaemonResponse::ok(build_status_payload(&ctx).await),
            CMD_RESYNC => DaemonResponse::ok(resync(&ctx, request.key).await),
            CMD_STOP => {
                let _ = ctx.shutdown_tx.send(());
                DaemonResponse::ok(json!({ "stopping": true }))
            }
            other => DaemonResponse::error(format!("unknown command '{other}'")),
        };

        write_response(&mut writer, &response).await?;
        if request.cmd == CMD_STOP {
            break;
        }
    }

    Ok(())
}

async fn build_status_payload(ctx: &ControlContext) -> Value {
    let snapshot = ctx.plane.lock().await.snapshot();

    let services: Vec<Value> = snapshot
        .services
        .iter()
        .map(|service| {
            json!({
                "key": service.key,
                "state": service.state,
                "hostname": service.hostname,
                "service_dir": service.service_dir.display().to_string(),
                "backend": format!("{}:{}", service.backend_name, service.backend_port),
                "target": service.target(),
                "public_port": service.public_port,
                "updated_at": service.updated_at,
            })
        })
        .collect();

    json!({
        "running": true,
        "started_at": ctx.started_at,
        "tor": snapshot.tor,
        "queue_depth": ctx.queue.len(),
        "services": services,
    })
}

/// Enqueue one key, or every ingress the store knows plus every registered
/// service (so entries whose ingress vanished are cleaned up too).
async fn resync(ctx: &ControlContext, key: Option<String>) -> Value {
    let keys: Vec<ServiceKey> = match key {
        Some(raw) => vec![ServiceKey::parse(&raw)],
        None => {
            let mut keys = ctx.store.ingress_keys();
            let plane = ctx.plane.lock().await;
            keys.extend(plane.registry.iter().map(|s| s.key.clone()));
            keys.sort();
            keys.dedup();
            keys
        }
    };
    for key in &keys {
        ctx.queue.add(key.clone());
    }
    tracing::info!(count = keys.len(), "resync requested");
    json!({ "queued": keys })
}

fn prepare_socket_for_bind(socket: &Path) -> Result<(), DaemonError> {
    if !socket.exists() {
        return Ok(());
    }

    match StdUnixStream::connect(socket) {
        Ok(_) => {
            return Err(DaemonError::Protocol(format!(
                "controller socket already in use: {}",
                socket.display()
            )));
        }
        Err(err) => {
            tracing::warn!(
                socket = %socket.display(),
                error = %err,
                "removing stale controller socket before bind",
            );
        }
    }

    match fs::remove_file(socket) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        Err(err) => Err(io_err(socket, err)),
    }
}

async fn write_response(
    writer: &mut OwnedWriteHalf,
    response: &DaemonResponse,
) -> Result<(), DaemonError> {
    let payload = serde_json::to_string(response)?;
    writer
        .write_all(payload.as_bytes())
        .await
        .map_err(|e| io_err("control socket write", e))?;
    writer
        .write_all(b"\n")
        .await
        .map_err(|e| io_err("control socket write", e))?;
    writer
        .flush()
        .await
        .map_err(|e| io_err("control socket flush", e))?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn ensure_runtime_dirs(config: &ControllerConfig) -> Result<(), DaemonError> {
    let mut dirs = vec![
        config.state_dir.clone(),
        config.source.manifests_dir.clone(),
        config.source.status_dir.clone(),
        config.tor.services_root.clone(),
    ];
    if let Some(parent) = config.tor.torrc_path.parent() {
        dirs.push(parent.to_path_buf());
    }
    for dir in dirs {
        if !dir.as_os_str().is_empty() && !dir.exists() {
            fs::create_dir_all(&dir).map_err(|e| io_err(&dir, e))?;
        }
    }
    Ok(())
}

/// Service directories every servable ingress in `store` maps to.
fn declared_service_dirs(store: &ManifestStore, services_root: &Path) -> BTreeSet<PathBuf> {
    let mut dirs = BTreeSet::new();
    for key in store.ingress_keys() {
        let Ok(Some(ingress)) = store.get_by_key(&key) else {
            continue;
        };
        if let Ok(exposure) = ingress.exposure() {
            dirs.insert(derive_service_dir(
                services_root,
                &key,
                &exposure.backend.service_name,
                exposure.backend.service_port,
            ));
        }
    }
    dirs
}

fn sweep_undeclared_service_dirs(config: &ControllerConfig, store: &ManifestStore) {
    let mut keep = declared_service_dirs(store, &config.tor.services_root);
    if let Some(data_directory) = &config.tor.data_directory {
        keep.insert(data_directory.clone());
    }
    match sweep_orphaned_dirs(&config.tor.services_root, &keep) {
        Ok(removed) => {
            for dir in removed {
                tracing::info!(
                    service_dir = %dir.display(),
                    "removed undeclared service directory",
                );
            }
        }
        Err(err) => tracing::warn!(error = %err, "service directory sweep failed"),
    }
}

fn handle_join(
    task: &str,
    result: Result<Result<(), DaemonError>, tokio::task::JoinError>,
) -> Result<(), DaemonError> {
    match result {
        Ok(inner) => inner,
        Err(err) => Err(DaemonError::Protocol(format!(
            "{task} task join failure: {err}"
        ))),
    }
}

/// Install the global subscriber. `RUST_LOG` overrides the configured filter.
/// Records from crates logging through `log` are forwarded as well.
pub fn init_tracing(log: &LogConfig) {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&log.filter));
    let _ = match log.format {
        LogFormat::Json => fmt()
            .json()
            .with_env_filter(filter)
            .with_target(false)
            .try_init(),
        LogFormat::Text => fmt().with_env_filter(filter).with_target(false).try_init(),
    };
}

#[cfg(unix)]
fn set_socket_permissions(path: &Path) -> Result<(), DaemonError> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600)).map_err(|e| io_err(path, e))
}

#[cfg(not(unix))]
fn set_socket_permissions(_path: &Path) -> Result<(), DaemonError> {
    Ok(())
}
