//! File-backed implementation of the collaborator interfaces.
//!
//! YAML manifests (`Ingress`, `Service`, `Secret`, multi-document allowed)
//! under one directory are parsed into an in-memory cache that serves every
//! read. Status updates are written as JSON next to the cache, one file per
//! ingress.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use tor_ingress_core::config::SourceConfig;
use tor_ingress_core::types::IngressStatus;
use tor_ingress_core::{
    AddressMode, Ingress, IngressStore, Secret, SecretStore, Service, ServiceKey, StatusWriter,
    StoreError,
};

use crate::paths::{is_manifest_file, status_file_path};

/// `stringData` entry preferred when a secret holds several.
pub const PRIVATE_KEY_ENTRY: &str = "private-key";

/// Version assigned to every manifest object: a prefix of the SHA-256 of its
/// YAML document.
pub fn resource_version(document: &str) -> String {
    let mut h = Sha256::new();
    h.update(document.as_bytes());
    let mut digest = hex::encode(h.finalize());
    digest.truncate(16);
    digest
}

/// Persisted status of one ingress.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusDocument {
    pub resource_version: String,
    #[serde(flatten)]
    pub status: IngressStatus,
}

// ---------------------------------------------------------------------------
// Parsed manifests
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Clone)]
struct FileObjects {
    ingresses: Vec<Ingress>,
    services: Vec<Service>,
    secrets: Vec<Secret>,
}

#[derive(Deserialize)]
struct KindHeader {
    #[serde(default)]
    kind: String,
}

fn parse_manifest(path: &Path, text: &str) -> Result<FileObjects, StoreError> {
    let parse_err = |source| StoreError::Parse {
        path: path.to_path_buf(),
        source,
    };

    let mut objects = FileObjects::default();
    for document in serde_yaml::Deserializer::from_str(text) {
        let value = serde_yaml::Value::deserialize(document).map_err(parse_err)?;
        if value.is_null() {
            continue;
        }
        let canonical = serde_yaml::to_string(&value).map_err(parse_err)?;
        let version = resource_version(&canonical);
        let header: KindHeader = serde_yaml::from_value(value.clone()).map_err(parse_err)?;

        match header.kind.as_str() {
            "Ingress" => {
                let mut ingress: Ingress = serde_yaml::from_value(value).map_err(parse_err)?;
                ingress.metadata.resource_version = Some(version);
                objects.ingresses.push(ingress);
            }
            "Service" => {
                let mut service: Service = serde_yaml::from_value(value).map_err(parse_err)?;
                service.metadata.resource_version = Some(version);
                objects.services.push(service);
            }
            "Secret" => {
                let mut secret: Secret = serde_yaml::from_value(value).map_err(parse_err)?;
                secret.metadata.resource_version = Some(version);
                objects.secrets.push(secret);
            }
            other => {
                tracing::debug!(path = %path.display(), kind = other, "ignoring manifest object");
            }
        }
    }
    Ok(objects)
}

/// `Ok(None)` when the file no longer exists.
fn read_manifest(path: &Path) -> Result<Option<FileObjects>, StoreError> {
    match fs::read_to_string(path) {
        Ok(text) => parse_manifest(path, &text).map(Some),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
        Err(source) => Err(StoreError::Io {
            path: path.to_path_buf(),
            source,
        }),
    }
}

fn collect_manifest_files(root: &Path) -> Result<Vec<PathBuf>, StoreError> {
    let mut files = Vec::new();
    let mut dirs = vec![root.to_path_buf()];
    while let Some(dir) = dirs.pop() {
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => continue,
            Err(source) => return Err(StoreError::Io { path: dir, source }),
        };
        for entry in entries {
            let entry = entry.map_err(|source| StoreError::Io {
                path: dir.clone(),
                source,
            })?;
            let path = entry.path();
            if path.is_dir() {
                dirs.push(path);
            } else if is_manifest_file(&path) {
                files.push(path);
            }
        }
    }
    files.sort();
    Ok(files)
}

// ---------------------------------------------------------------------------
// Cache
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct ManifestCache {
    files: BTreeMap<PathBuf, FileObjects>,
    ingresses: BTreeMap<ServiceKey, Ingress>,
    services: BTreeMap<ServiceKey, Service>,
    secrets: BTreeMap<ServiceKey, Secret>,
}

impl ManifestCache {
    /// Rebuild the object indexes from `files`. Later files win on duplicate
    /// keys. Status already known for an unchanged ingress is carried over.
    fn reindex(&mut self, status_dir: &Path) {
        let previous = std::mem::take(&mut self.ingresses);
        self.services.clear();
        self.secrets.clear();

        for objects in self.files.values() {
            for ingress in &objects.ingresses {
                let mut ingress = ingress.clone();
                let key = ingress.key();
                match previous.get(&key) {
                    Some(old)
                        if old.metadata.resource_version == ingress.metadata.resource_version =>
                    {
                        ingress.status = old.status.clone();
                    }
                    _ => load_status(status_dir, &mut ingress),
                }
                self.ingresses.insert(key, ingress);
            }
            for service in &objects.services {
                self.services.insert(service.metadata.key(), service.clone());
            }
            for secret in &objects.secrets {
                self.secrets.insert(secret.metadata.key(), secret.clone());
            }
        }
    }

    /// Ingress keys whose declaration, or the service or secret it points
    /// at, differs between `self` and `before`.
    fn changed_keys(&self, before: &Snapshot) -> BTreeSet<ServiceKey> {
        let mut keys = BTreeSet::new();
        for (key, version) in &before.ingresses {
            let now = self
                .ingresses
                .get(key)
                .and_then(|i| i.metadata.resource_version.clone());
            if now.as_ref() != Some(version) {
                keys.insert(key.clone());
            }
        }
        for (key, ingress) in &self.ingresses {
            if !before.ingresses.contains_key(key) {
                keys.insert(key.clone());
            }
            let ns = ingress.namespace();
            for backend in ingress.backends() {
                let service_key = ServiceKey::new(ns, &backend.service_name);
                let now = self.services.get(&service_key).map(version_of_service);
                if before.services.get(&service_key) != now.as_ref() {
                    keys.insert(key.clone());
                }
            }
            if let Some(secret) = ingress.private_key_secret() {
                let secret_key = ServiceKey::new(ns, secret);
                let now = self.secrets.get(&secret_key).map(version_of_secret);
                if before.secrets.get(&secret_key) != now.as_ref() {
                    keys.insert(key.clone());
                }
            }
        }
        keys
    }

    fn snapshot(&self) -> Snapshot {
        Snapshot {
            ingresses: self
                .ingresses
                .iter()
                .map(|(k, i)| {
                    let version = i.metadata.resource_version.clone().unwrap_or_default();
                    (k.clone(), version)
                })
                .collect(),
            services: self
                .services
                .iter()
                .map(|(k, s)| (k.clone(), version_of_service(s)))
                .collect(),
            secrets: self
                .secrets
                .iter()
                .map(|(k, s)| (k.clone(), version_of_secret(s)))
                .collect(),
        }
    }
}

/// Resource versions only, for change detection.
struct Snapshot {
    ingresses: BTreeMap<ServiceKey, String>,
    services: BTreeMap<ServiceKey, String>,
    secrets: BTreeMap<ServiceKey, String>,
}

fn version_of_service(service: &Service) -> String {
    service.metadata.resource_version.clone().unwrap_or_default()
}

fn version_of_secret(secret: &Secret) -> String {
    secret.metadata.resource_version.clone().unwrap_or_default()
}

fn load_status(status_dir: &Path, ingress: &mut Ingress) {
    let path = status_file_path(status_dir, ingress.namespace(), &ingress.metadata.name);
    let Ok(text) = fs::read_to_string(&path) else {
        return;
    };
    match serde_json::from_str::<StatusDocument>(&text) {
        Ok(doc) if Some(&doc.resource_version) == ingress.metadata.resource_version.as_ref() => {
            ingress.status = doc.status;
        }
        Ok(_) => tracing::debug!(path = %path.display(), "ignoring status for an older version"),
        Err(err) => tracing::warn!(path = %path.display(), error = %err, "unreadable status file"),
    }
}

// ---------------------------------------------------------------------------
// ManifestStore
// ---------------------------------------------------------------------------

pub struct ManifestStore {
    root: PathBuf,
    status_dir: PathBuf,
    address_mode: AddressMode,
    cluster_domain: String,
    cache: RwLock<ManifestCache>,
}

impl ManifestStore {
    pub fn new(source: &SourceConfig) -> Self {
        Self {
            root: source.manifests_dir.clone(),
            status_dir: source.status_dir.clone(),
            address_mode: source.address_mode,
            cluster_domain: source.cluster_domain.clone(),
            cache: RwLock::new(ManifestCache::default()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn read(&self) -> RwLockReadGuard<'_, ManifestCache> {
        self.cache.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, ManifestCache> {
        self.cache.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Re-read every manifest. Returns every ingress key now known plus every
    /// key that disappeared. A file that fails to parse keeps its previous
    /// contents.
    pub fn full_scan(&self) -> Result<Vec<ServiceKey>, StoreError> {
        let paths = collect_manifest_files(&self.root)?;
        let mut cache = self.write();
        let before: BTreeSet<ServiceKey> = cache.ingresses.keys().cloned().collect();

        let mut files = BTreeMap::new();
        for path in paths {
            match read_manifest(&path) {
                Ok(Some(objects)) => {
                    files.insert(path, objects);
                }
                Ok(None) => {}
                Err(err) => {
                    tracing::warn!(path = %path.display(), error = %err, "skipping manifest");
                    if let Some(previous) = cache.files.get(&path) {
                        files.insert(path, previous.clone());
                    }
                }
            }
        }
        cache.files = files;
        cache.reindex(&self.status_dir);

        let mut keys: BTreeSet<ServiceKey> = cache.ingresses.keys().cloned().collect();
        keys.extend(before);
        tracing::debug!(
            files = cache.files.len(),
            ingresses = cache.ingresses.len(),
            "manifest scan complete",
        );
        Ok(keys.into_iter().collect())
    }

    /// Re-read one manifest file (which may have been deleted) and return the
    /// ingress keys affected by the change.
    pub fn rescan_file(&self, path: &Path) -> Result<Vec<ServiceKey>, StoreError> {
        let objects = read_manifest(path)?;
        let mut cache = self.write();
        let before = cache.snapshot();
        match objects {
            Some(objects) => {
                cache.files.insert(path.to_path_buf(), objects);
            }
            None => {
                cache.files.remove(path);
            }
        }
        cache.reindex(&self.status_dir);
        Ok(cache.changed_keys(&before).into_iter().collect())
    }

    pub fn ingress_keys(&self) -> Vec<ServiceKey> {
        self.read().ingresses.keys().cloned().collect()
    }
}

impl IngressStore for ManifestStore {
    fn get_by_key(&self, key: &ServiceKey) -> Result<Option<Ingress>, StoreError> {
        Ok(self.read().ingresses.get(key).cloned())
    }

    fn backend_address(&self, namespace: &str, service: &str) -> Result<String, StoreError> {
        match self.address_mode {
            AddressMode::Dns => Ok(format!(
                "{service}.{namespace}.svc.{}",
                self.cluster_domain
            )),
            AddressMode::ClusterIp => {
                let key = ServiceKey::new(namespace, service);
                self.read()
                    .services
                    .get(&key)
                    .and_then(|s| s.spec.cluster_ip.clone())
                    .filter(|ip| !ip.is_empty() && ip != "None")
                    .ok_or_else(|| StoreError::NotFound {
                        kind: "service cluster IP",
                        key: key.to_string(),
                    })
            }
        }
    }
}

impl SecretStore for ManifestStore {
    fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let cache = self.read();
        let Some(secret) = cache.secrets.get(&ServiceKey::new(namespace, name)) else {
            return Ok(None);
        };
        let value = secret
            .string_data
            .get(PRIVATE_KEY_ENTRY)
            .or_else(|| secret.string_data.values().next());
        Ok(value.map(|v| v.as_bytes().to_vec()))
    }
}

impl StatusWriter for ManifestStore {
    fn update_status(&self, ingress: &Ingress) -> Result<(), StoreError> {
        let key = ingress.key();
        let mut cache = self.write();
        let Some(cached) = cache.ingresses.get_mut(&key) else {
            return Err(StoreError::NotFound {
                kind: "ingress",
                key: key.to_string(),
            });
        };

        let current = cached.metadata.resource_version.clone().unwrap_or_default();
        let given = ingress.metadata.resource_version.clone().unwrap_or_default();
        if current != given {
            return Err(StoreError::Conflict {
                key: key.to_string(),
                expected: given,
                found: current,
            });
        }

        let doc = StatusDocument {
            resource_version: current,
            status: ingress.status.clone(),
        };
        let path = status_file_path(&self.status_dir, ingress.namespace(), &ingress.metadata.name);
        write_status_file(&path, &doc)?;
        cached.status = ingress.status.clone();
        tracing::debug!(%key, path = %path.display(), "status written");
        Ok(())
    }
}

fn write_status_file(path: &Path, doc: &StatusDocument) -> Result<(), StoreError> {
    let io = |path: &Path, source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    };
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir).map_err(|e| io(dir, e))?;
    }
    let json = serde_json::to_string_pretty(doc)
        .map_err(|e| StoreError::Backend(format!("encoding status: {e}")))?;
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, json).map_err(|e| io(&tmp, e))?;
    if let Err(e) = fs::rename(&tmp, path) {
        let _ = fs::remove_file(&tmp);
        return Err(io(path, e));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
