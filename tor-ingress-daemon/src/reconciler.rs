//! Per-key reconciliation of an exposure declaration against the registry,
//! the torrc and the tor process.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::Mutex;

use tor_ingress_core::registry::write_private_key;
use tor_ingress_core::{
    ControllerConfig, HiddenService, HiddenServiceSpec, IngressStore, SecretStore, ServiceKey,
    ServiceRegistry, SkipReason, StatusWriter,
};
use tor_ingress_sync::TorrcWriter;

use crate::error::ReconcileError;
use crate::hostname::HostnameResolver;
use crate::queue::WorkQueue;
use crate::status::publish_hostname;
use crate::supervisor::{SupervisorState, SupervisorStatus, TorSupervisor};

// ---------------------------------------------------------------------------
// ControlPlane
// ---------------------------------------------------------------------------

/// Registry, torrc writer and tor process. Every mutation of any of them
/// happens through one lock so concurrent keys never interleave a
/// write-render-reload cycle.
pub struct ControlPlane {
    pub registry: ServiceRegistry,
    pub writer: TorrcWriter,
    pub supervisor: TorSupervisor,
    /// Set from the start of an apply until both persist and reload have
    /// succeeded, so a failed attempt is repeated by the next one.
    needs_apply: bool,
}

pub type SharedControlPlane = Arc<Mutex<ControlPlane>>;

impl ControlPlane {
    pub fn new(registry: ServiceRegistry, writer: TorrcWriter, supervisor: TorSupervisor) -> Self {
        Self {
            registry,
            writer,
            supervisor,
            needs_apply: false,
        }
    }

    /// True while an earlier persist or reload has not completed.
    pub fn needs_apply(&self) -> bool {
        self.needs_apply
    }

    pub fn shared(self) -> SharedControlPlane {
        Arc::new(Mutex::new(self))
    }

    /// Persist the torrc and reload tor when the file changed, `force` is
    /// set, a previous apply did not finish, or tor is not running. Returns
    /// whether tor was reloaded.
    pub async fn apply(&mut self, force: bool) -> Result<bool, ReconcileError> {
        let force = force
            || self.needs_apply
            || self.supervisor.state() != SupervisorState::Running;
        self.needs_apply = true;

        let written = self.writer.persist(&self.registry)?.is_written();
        let reloaded = written || force;
        if reloaded {
            self.supervisor.reload().await?;
        }
        self.needs_apply = false;
        Ok(reloaded)
    }

    pub fn snapshot(&self) -> PlaneSnapshot {
        PlaneSnapshot {
            tor: self.supervisor.status(),
            services: self.registry.iter().cloned().collect(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PlaneSnapshot {
    pub tor: SupervisorStatus,
    pub services: Vec<HiddenService>,
}

// ---------------------------------------------------------------------------
// Reconciler
// ---------------------------------------------------------------------------

/// Result of one successful sync.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    /// The key no longer names a servable ingress; any entry is gone.
    Removed,
    /// The ingress exists but is not served.
    Skipped(SkipReason),
    Ready { hostname: String },
}

pub struct Reconciler {
    plane: SharedControlPlane,
    ingresses: Arc<dyn IngressStore>,
    secrets: Arc<dyn SecretStore>,
    status: Arc<dyn StatusWriter>,
    resolver: HostnameResolver,
    status_retry_steps: u32,
    status_retry_delay: Duration,
}

impl Reconciler {
    pub fn new(
        plane: SharedControlPlane,
        ingresses: Arc<dyn IngressStore>,
        secrets: Arc<dyn SecretStore>,
        status: Arc<dyn StatusWriter>,
        config: &ControllerConfig,
    ) -> Self {
        let controller = &config.controller;
        Self {
            plane,
            ingresses,
            secrets,
            status,
            resolver: HostnameResolver::new(
                controller.hostname_poll(),
                controller.hostname_timeout(),
            ),
            status_retry_steps: controller.status_retry_steps,
            status_retry_delay: controller.status_retry_delay(),
        }
    }

    pub fn plane(&self) -> &SharedControlPlane {
        &self.plane
    }

    /// Converge the hidden service for `key` with its declaration.
    pub async fn sync(&self, key: &ServiceKey) -> Result<SyncOutcome, ReconcileError> {
        let Some(ingress) = self.ingresses.get_by_key(key)? else {
            self.remove(key).await?;
            return Ok(SyncOutcome::Removed);
        };

        let exposure = match ingress.exposure() {
            Ok(exposure) => exposure,
            Err(reason) => {
                match &reason {
                    SkipReason::NotTorClass => tracing::debug!(%key, %reason, "skipping ingress"),
                    _ => tracing::warn!(%key, %reason, "skipping ingress"),
                }
                if self.remove(key).await? {
                    return Ok(SyncOutcome::Removed);
                }
                return Ok(SyncOutcome::Skipped(reason));
            }
        };

        let namespace = ingress.namespace();
        let backend = exposure.backend;
        let backend_address = self
            .ingresses
            .backend_address(namespace, &backend.service_name)?;

        let private_key = match exposure.private_key_secret {
            Some(secret) => {
                let found = self.secrets.get_secret(namespace, secret)?;
                if found.is_none() {
                    tracing::warn!(%key, secret, "private key secret not found; tor generates one");
                }
                found
            }
            None => None,
        };

        let spec = HiddenServiceSpec {
            key: key.clone(),
            backend_name: backend.service_name.clone(),
            backend_address,
            backend_port: backend.service_port,
            public_port: exposure.public_port,
            private_key,
        };

        let service = {
            let mut plane = self.plane.lock().await;
            let service = plane.registry.upsert(spec)?;
            let key_changed = write_private_key(&service)?;
            let reloaded = plane.apply(key_changed).await?;
            plane.registry.mark_configured(key);
            tracing::info!(
                %key,
                service_dir = %service.service_dir.display(),
                target = %service.target(),
                reloaded,
                "hidden service configured",
            );
            service
        };

        let hostname = self.resolver.resolve(&service.service_dir).await?;
        self.plane.lock().await.registry.mark_ready(key, &hostname);

        let published = publish_hostname(
            self.ingresses.as_ref(),
            self.status.as_ref(),
            key,
            &hostname,
            self.status_retry_steps,
            self.status_retry_delay,
        )
        .await?;
        if published {
            tracing::info!(%key, %hostname, "hostname published");
        }

        Ok(SyncOutcome::Ready { hostname })
    }

    /// Drop `key` from the registry and apply the change. Returns whether an
    /// entry existed. With no entry, a pending apply from a failed attempt is
    /// still completed.
    async fn remove(&self, key: &ServiceKey) -> Result<bool, ReconcileError> {
        let mut plane = self.plane.lock().await;
        let Some(removed) = plane.registry.remove(key) else {
            if plane.needs_apply() {
                plane.apply(false).await?;
            }
            return Ok(false);
        };
        plane.apply(false).await?;
        tracing::info!(%key, service_dir = %removed.service_dir.display(), "hidden service removed");
        Ok(true)
    }
}

// ---------------------------------------------------------------------------
// Retry accounting
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Success: retry history cleared.
    Forgotten,
    /// Failure, scheduled again after backoff.
    Requeued { attempt: u32 },
    /// Failure number `max_retries`: history cleared, not retried until the
    /// key is added again from outside.
    Dropped,
}

pub fn handle_result(
    queue: &WorkQueue,
    key: &ServiceKey,
    result: Result<SyncOutcome, ReconcileError>,
    max_retries: u32,
) -> RetryDecision {
    match result {
        Ok(outcome) => {
            tracing::debug!(%key, ?outcome, "sync complete");
            queue.forget(key);
            RetryDecision::Forgotten
        }
        Err(err) => {
            let attempt = queue.num_requeues(key) + 1;
            if attempt < max_retries {
                let delay = queue.add_rate_limited(key.clone());
                tracing::info!(%key, attempt, ?delay, error = %err, "sync failed; retrying");
                RetryDecision::Requeued { attempt }
            } else {
                queue.forget(key);
                tracing::error!(%key, attempt, error = %err, "sync failed; dropping key");
                RetryDecision::Dropped
            }
        }
    }
}

/// Pull keys until the queue shuts down.
pub async fn run_worker(
    id: usize,
    queue: WorkQueue,
    reconciler: Arc<Reconciler>,
    max_retries: u32,
) {
    tracing::debug!(worker = id, "worker started");
    while let Some(key) = queue.get().await {
        let result = reconciler.sync(&key).await;
        handle_result(&queue, &key, result, max_retries);
        queue.done(&key);
    }
    tracing::debug!(worker = id, "worker stopped");
}
