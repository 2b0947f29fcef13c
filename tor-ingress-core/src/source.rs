//! Interfaces to the collaborators the reconciler consumes.
//!
//! Implementations must be cheap to call from async code: they are expected
//! to serve reads from a local cache.

use crate::error::StoreError;
use crate::types::{Ingress, ServiceKey};

/// Read-through view of exposure declarations and the services they point at.
pub trait IngressStore: Send + Sync {
    /// `Ok(None)` means the resource does not exist (it was deleted).
    fn get_by_key(&self, key: &ServiceKey) -> Result<Option<Ingress>, StoreError>;

    /// Address traffic for `namespace/service` should be forwarded to.
    fn backend_address(&self, namespace: &str, service: &str) -> Result<String, StoreError>;
}

/// Key-value secret lookup.
pub trait SecretStore: Send + Sync {
    /// `Ok(None)` when no such secret exists.
    fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Vec<u8>>, StoreError>;
}

/// Writes an ingress's status field.
pub trait StatusWriter: Send + Sync {
    /// Persist `ingress.status`. Fails with [`StoreError::Conflict`] when
    /// `ingress.metadata.resource_version` is stale.
    fn update_status(&self, ingress: &Ingress) -> Result<(), StoreError>;
}
