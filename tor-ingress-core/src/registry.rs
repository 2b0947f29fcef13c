//! In-memory service registry.
//!
//! # Storage layout
//!
//! ```text
//! <services_root>/
//!   <namespace>_<name>_<backend>_<port>/   (one per hidden service)
//!     private-key                          (written by us, mode 0600, dir 0700)
//!     hostname                             (written by the daemon)
//! ```
//!
//! Kubernetes object names never contain `_`, so the directory name is an
//! unambiguous function of `(namespace, name, backend, port)`.
//!
//! The registry is the single authority on which hidden services exist. Its
//! iteration order is the key order, which keeps rendering deterministic.
//!
//! The registry starts empty on every run, so directories left behind by
//! ingresses deleted while the controller was down are only found by
//! [`sweep_orphaned_dirs`].

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use chrono::Utc;

use crate::error::{io_err, RegistryError};
use crate::types::{HiddenService, HiddenServiceSpec, ServiceKey, ServiceState};

/// File inside a service directory holding the private key we provision.
pub const PRIVATE_KEY_FILE: &str = "private-key";
/// File inside a service directory the daemon writes the public address to.
pub const HOSTNAME_FILE: &str = "hostname";

// ---------------------------------------------------------------------------
// 1. Path helpers
// ---------------------------------------------------------------------------

/// `<root>/<namespace>_<name>_<backend>_<port>`. Pure, no I/O.
pub fn derive_service_dir(
    root: &Path,
    key: &ServiceKey,
    backend_name: &str,
    backend_port: u16,
) -> PathBuf {
    root.join(format!(
        "{}_{}_{}_{}",
        key.namespace(),
        key.name(),
        backend_name,
        backend_port
    ))
}

pub fn private_key_path(service_dir: &Path) -> PathBuf {
    service_dir.join(PRIVATE_KEY_FILE)
}

pub fn hostname_path(service_dir: &Path) -> PathBuf {
    service_dir.join(HOSTNAME_FILE)
}

// ---------------------------------------------------------------------------
// 2. Registry
// ---------------------------------------------------------------------------

/// Mapping `key -> HiddenService`, plus the root all service directories live under.
#[derive(Debug, Clone)]
pub struct ServiceRegistry {
    services_root: PathBuf,
    services: BTreeMap<ServiceKey, HiddenService>,
}

impl ServiceRegistry {
    pub fn new(services_root: impl Into<PathBuf>) -> Self {
        Self {
            services_root: services_root.into(),
            services: BTreeMap::new(),
        }
    }

    pub fn services_root(&self) -> &Path {
        &self.services_root
    }

    /// Insert or overwrite the entry for `spec.key` and return the stored record.
    ///
    /// An unchanged spec keeps the entry's state and hostname. A changed spec
    /// resets it to [`ServiceState::Pending`]. If the derived service directory
    /// moved, the previous directory is removed (best-effort).
    pub fn upsert(&mut self, spec: HiddenServiceSpec) -> Result<HiddenService, RegistryError> {
        let service_dir = derive_service_dir(
            &self.services_root,
            &spec.key,
            &spec.backend_name,
            spec.backend_port,
        );

        if let Some(owner) = self
            .services
            .values()
            .find(|s| s.service_dir == service_dir && s.key != spec.key)
        {
            return Err(RegistryError::ServiceDirInUse {
                path: service_dir,
                owner: owner.key.clone(),
            });
        }

        if let Some(existing) = self.services.get(&spec.key) {
            if existing.matches(&spec) {
                return Ok(existing.clone());
            }
            if existing.service_dir != service_dir {
                remove_service_dir(&existing.service_dir);
            }
        }

        let service = HiddenService {
            namespace: spec.key.namespace().to_owned(),
            key: spec.key.clone(),
            backend_name: spec.backend_name,
            backend_address: spec.backend_address,
            backend_port: spec.backend_port,
            public_port: spec.public_port,
            service_dir,
            private_key: spec.private_key,
            hostname: None,
            state: ServiceState::Pending,
            updated_at: Utc::now(),
        };
        self.services.insert(spec.key, service.clone());
        Ok(service)
    }

    /// Delete the entry for `key` and its on-disk directory tree.
    ///
    /// Directory removal is best-effort: a failure is logged and the entry is
    /// dropped regardless. Returns the removed record, if any.
    pub fn remove(&mut self, key: &ServiceKey) -> Option<HiddenService> {
        let removed = self.services.remove(key)?;
        remove_service_dir(&removed.service_dir);
        Some(removed)
    }

    pub fn get(&self, key: &ServiceKey) -> Option<&HiddenService> {
        self.services.get(key)
    }

    pub fn contains(&self, key: &ServiceKey) -> bool {
        self.services.contains_key(key)
    }

    /// Entries in key order.
    pub fn iter(&self) -> impl Iterator<Item = &HiddenService> {
        self.services.values()
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }

    /// `Pending -> Configured`. Later states are left alone.
    pub fn mark_configured(&mut self, key: &ServiceKey) {
        if let Some(service) = self.services.get_mut(key) {
            if service.state == ServiceState::Pending {
                service.state = ServiceState::Configured;
                service.updated_at = Utc::now();
            }
        }
    }

    /// Record the resolved hostname and move the entry to `Ready`.
    pub fn mark_ready(&mut self, key: &ServiceKey, hostname: &str) {
        if let Some(service) = self.services.get_mut(key) {
            if service.state != ServiceState::Ready || service.hostname.as_deref() != Some(hostname)
            {
                service.hostname = Some(hostname.to_owned());
                service.state = ServiceState::Ready;
                service.updated_at = Utc::now();
            }
        }
    }
}

// ---------------------------------------------------------------------------
// 3. Private key provisioning
// ---------------------------------------------------------------------------

/// Write `service.private_key` to `<service_dir>/private-key`.
///
/// Creates the service directory (mode `0700`) first. The key file is written
/// via a `.tmp` sibling and renamed, mode `0600`. Returns `true` when the file
/// content changed, `false` when it already held this key or the service has
/// no key.
pub fn write_private_key(service: &HiddenService) -> Result<bool, RegistryError> {
    let Some(key) = service.private_key.as_deref() else {
        return Ok(false);
    };

    let dir = &service.service_dir;
    if !dir.exists() {
        fs::create_dir_all(dir).map_err(|e| io_err(dir, e))?;
    }
    set_dir_permissions(dir)?;

    let path = private_key_path(dir);
    match fs::read(&path) {
        Ok(existing) if existing == key => return Ok(false),
        Ok(_) => {}
        Err(err) if err.kind() == ErrorKind::NotFound => {}
        Err(err) => return Err(io_err(&path, err)),
    }

    let tmp = dir.join(format!("{PRIVATE_KEY_FILE}.tmp"));
    fs::write(&tmp, key).map_err(|e| io_err(&tmp, e))?;
    set_file_permissions(&tmp)?;
    if let Err(err) = fs::rename(&tmp, &path) {
        let _ = fs::remove_file(&tmp);
        return Err(io_err(&path, err));
    }
    Ok(true)
}

/// Remove directories directly under `root` that hold a `hostname` or
/// `private-key` file and are not listed in `keep`. Anything else under
/// `root` is left alone. Returns the removed directories in path order.
pub fn sweep_orphaned_dirs(
    root: &Path,
    keep: &BTreeSet<PathBuf>,
) -> Result<Vec<PathBuf>, RegistryError> {
    let entries = match fs::read_dir(root) {
        Ok(entries) => entries,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(io_err(root, err)),
    };

    let mut removed = Vec::new();
    for entry in entries {
        let path = entry.map_err(|e| io_err(root, e))?.path();
        if !path.is_dir() || keep.contains(&path) {
            continue;
        }
        if hostname_path(&path).is_file() || private_key_path(&path).is_file() {
            remove_service_dir(&path);
            removed.push(path);
        }
    }
    removed.sort();
    Ok(removed)
}

// ---------------------------------------------------------------------------
// Private helpers
// ---------------------------------------------------------------------------

fn remove_service_dir(dir: &Path) {
    match fs::remove_dir_all(dir) {
        Ok(()) => tracing::debug!("removed service directory {}", dir.display()),
        Err(err) if err.kind() == ErrorKind::NotFound => {}
        Err(err) => tracing::warn!("error removing {}: {}", dir.display(), err),
    }
}

#[cfg(unix)]
fn set_dir_permissions(path: &Path) -> Result<(), RegistryError> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o700)).map_err(|e| io_err(path, e))
}
#[cfg(not(unix))]
fn set_dir_permissions(_path: &Path) -> Result<(), RegistryError> {
    Ok(())
}

#[cfg(unix)]
fn set_file_permissions(path: &Path) -> Result<(), RegistryError> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600)).map_err(|e| io_err(path, e))
}
#[cfg(not(unix))]
fn set_file_permissions(_path: &Path) -> Result<(), RegistryError> {
    Ok(())
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn spec(key: &str, backend: &str, port: u16) -> HiddenServiceSpec {
        HiddenServiceSpec {
            key: ServiceKey::from(key),
            backend_name: backend.to_string(),
            backend_address: "10.0.0.7".to_string(),
            backend_port: port,
            public_port: 80,
            private_key: None,
        }
    }

    #[test]
    fn service_dir_is_derived_from_key_and_backend() {
        let dir = derive_service_dir(
            Path::new("/run/tor"),
            &ServiceKey::from("ns/app"),
            "svc",
            8080,
        );
        assert_eq!(dir, PathBuf::from("/run/tor/ns_app_svc_8080"));
    }

    #[test]
    fn upsert_returns_pending_entry() {
        let root = TempDir::new().expect("root");
        let mut registry = ServiceRegistry::new(root.path());
        let stored = registry.upsert(spec("ns/app", "svc", 8080)).expect("upsert");
        assert_eq!(stored.state, ServiceState::Pending);
        assert_eq!(stored.namespace, "ns");
        assert_eq!(stored.service_dir, root.path().join("ns_app_svc_8080"));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn unchanged_upsert_keeps_state_and_hostname() {
        let root = TempDir::new().expect("root");
        let mut registry = ServiceRegistry::new(root.path());
        let key = ServiceKey::from("ns/app");
        registry.upsert(spec("ns/app", "svc", 8080)).expect("upsert");
        registry.mark_configured(&key);
        registry.mark_ready(&key, "abc123.onion");

        let again = registry.upsert(spec("ns/app", "svc", 8080)).expect("upsert");
        assert_eq!(again.state, ServiceState::Ready);
        assert_eq!(again.hostname.as_deref(), Some("abc123.onion"));
    }

    #[test]
    fn changed_backend_moves_directory_and_resets_state() {
        let root = TempDir::new().expect("root");
        let mut registry = ServiceRegistry::new(root.path());
        let key = ServiceKey::from("ns/app");
        let first = registry.upsert(spec("ns/app", "svc", 8080)).expect("upsert");
        fs::create_dir_all(&first.service_dir).expect("mkdir");
        registry.mark_ready(&key, "abc123.onion");

        let second = registry.upsert(spec("ns/app", "svc", 9090)).expect("upsert");
        assert_ne!(first.service_dir, second.service_dir);
        assert!(!first.service_dir.exists(), "old directory must be removed");
        assert_eq!(second.state, ServiceState::Pending);
        assert!(second.hostname.is_none());
    }

    #[test]
    fn remove_deletes_directory_tree() {
        let root = TempDir::new().expect("root");
        let mut registry = ServiceRegistry::new(root.path());
        let stored = registry.upsert(spec("ns/app", "svc", 8080)).expect("upsert");
        fs::create_dir_all(&stored.service_dir).expect("mkdir");
        fs::write(hostname_path(&stored.service_dir), "abc123.onion\n").expect("write");

        let removed = registry.remove(&stored.key).expect("removed");
        assert_eq!(removed.key, stored.key);
        assert!(!stored.service_dir.exists());
        assert!(registry.is_empty());
    }

    #[test]
    fn remove_of_unknown_key_is_none() {
        let root = TempDir::new().expect("root");
        let mut registry = ServiceRegistry::new(root.path());
        assert!(registry.remove(&ServiceKey::from("ns/ghost")).is_none());
    }

    #[test]
    fn mark_configured_does_not_demote_ready() {
        let root = TempDir::new().expect("root");
        let mut registry = ServiceRegistry::new(root.path());
        let key = ServiceKey::from("ns/app");
        registry.upsert(spec("ns/app", "svc", 8080)).expect("upsert");
        registry.mark_ready(&key, "abc123.onion");
        registry.mark_configured(&key);
        assert_eq!(registry.get(&key).map(|s| s.state), Some(ServiceState::Ready));
    }

    #[test]
    fn private_key_written_with_owner_only_permissions() {
        let root = TempDir::new().expect("root");
        let mut registry = ServiceRegistry::new(root.path());
        let mut with_key = spec("ns/app", "svc", 8080);
        with_key.private_key = Some(b"secret-bytes".to_vec());
        let stored = registry.upsert(with_key).expect("upsert");

        assert!(write_private_key(&stored).expect("write"));
        let path = private_key_path(&stored.service_dir);
        assert_eq!(fs::read(&path).expect("read"), b"secret-bytes");
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let dir_mode = fs::metadata(&stored.service_dir).unwrap().permissions().mode() & 0o777;
            assert_eq!(dir_mode, 0o700);
            let file_mode = fs::metadata(&path).unwrap().permissions().mode() & 0o777;
            assert_eq!(file_mode, 0o600);
        }

        assert!(
            !write_private_key(&stored).expect("rewrite"),
            "identical key must not count as a change"
        );
    }

    #[test]
    fn no_private_key_writes_nothing() {
        let root = TempDir::new().expect("root");
        let mut registry = ServiceRegistry::new(root.path());
        let stored = registry.upsert(spec("ns/app", "svc", 8080)).expect("upsert");
        assert!(!write_private_key(&stored).expect("write"));
        assert!(!stored.service_dir.exists());
    }
}
