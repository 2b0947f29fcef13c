//! Domain types for tor-ingress.
//!
//! Two families live here: the hidden-service records owned by the
//! [`ServiceRegistry`](crate::registry::ServiceRegistry), and the typed view of
//! the exposure declarations (`Ingress`, `Service`, `Secret`) handed out by the
//! resource API. Declarations deserialize from Kubernetes-shaped YAML/JSON
//! (camelCase field names).

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Annotation selecting which controller handles an ingress.
pub const INGRESS_CLASS_ANNOTATION: &str = "kubernetes.io/ingress.class";
/// Value of [`INGRESS_CLASS_ANNOTATION`] claimed by this controller.
pub const TOR_INGRESS_CLASS: &str = "tor";
/// Names a secret (same namespace) holding the hidden-service private key.
pub const PRIVATE_KEY_ANNOTATION: &str = "tor.ingress/private-key";
/// Older spelling of [`PRIVATE_KEY_ANNOTATION`]; takes precedence when both are set.
pub const LEGACY_PRIVATE_KEY_ANNOTATION: &str = "kragniz.eu/tor-private-key";
/// Overrides the port the hidden service listens on.
pub const PUBLIC_PORT_ANNOTATION: &str = "tor.ingress/public-port";

pub const DEFAULT_PUBLIC_PORT: u16 = 80;
pub const DEFAULT_NAMESPACE: &str = "default";

// ---------------------------------------------------------------------------
// Newtypes
// ---------------------------------------------------------------------------

/// Logical resource key, `"<namespace>/<name>"`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ServiceKey(pub String);

impl ServiceKey {
    pub fn new(namespace: &str, name: &str) -> Self {
        Self(format!("{namespace}/{name}"))
    }

    /// Parse a raw key. A key without `/` lives in the `default` namespace.
    pub fn parse(raw: &str) -> Self {
        if raw.contains('/') {
            Self(raw.to_owned())
        } else {
            Self::new(DEFAULT_NAMESPACE, raw)
        }
    }

    pub fn namespace(&self) -> &str {
        self.0
            .split_once('/')
            .map(|(namespace, _)| namespace)
            .unwrap_or(DEFAULT_NAMESPACE)
    }

    pub fn name(&self) -> &str {
        self.0
            .split_once('/')
            .map(|(_, name)| name)
            .unwrap_or(self.0.as_str())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ServiceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<String> for ServiceKey {
    fn from(s: String) -> Self {
        Self::parse(&s)
    }
}

impl From<&str> for ServiceKey {
    fn from(s: &str) -> Self {
        Self::parse(s)
    }
}

// ---------------------------------------------------------------------------
// Hidden services
// ---------------------------------------------------------------------------

/// Lifecycle of a registry entry. Removal deletes the entry outright.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ServiceState {
    /// Registered, not yet written into the daemon configuration.
    #[default]
    Pending,
    /// Written into the daemon configuration and the daemon reloaded.
    Configured,
    /// Hostname resolved and published.
    Ready,
}

impl fmt::Display for ServiceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServiceState::Pending => write!(f, "pending"),
            ServiceState::Configured => write!(f, "configured"),
            ServiceState::Ready => write!(f, "ready"),
        }
    }
}

/// Desired state of one hidden service, as computed by the reconciler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HiddenServiceSpec {
    pub key: ServiceKey,
    pub backend_name: String,
    pub backend_address: String,
    pub backend_port: u16,
    pub public_port: u16,
    pub private_key: Option<Vec<u8>>,
}

/// A hidden service held by the registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HiddenService {
    pub key: ServiceKey,
    pub namespace: String,
    pub backend_name: String,
    pub backend_address: String,
    pub backend_port: u16,
    pub public_port: u16,
    /// Directory the daemon keeps this service's keys and hostname in.
    pub service_dir: PathBuf,
    #[serde(skip)]
    pub private_key: Option<Vec<u8>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    pub state: ServiceState,
    pub updated_at: DateTime<Utc>,
}

impl HiddenService {
    /// True when `spec` describes exactly what this entry already holds.
    pub fn matches(&self, spec: &HiddenServiceSpec) -> bool {
        self.key == spec.key
            && self.backend_name == spec.backend_name
            && self.backend_address == spec.backend_address
            && self.backend_port == spec.backend_port
            && self.public_port == spec.public_port
            && self.private_key == spec.private_key
    }

    /// `<backend>:<port>` as it appears in the port directive.
    pub fn target(&self) -> String {
        format!("{}:{}", self.backend_address, self.backend_port)
    }
}

// ---------------------------------------------------------------------------
// Declarations
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_version: Option<String>,
}

impl ObjectMeta {
    pub fn namespace_or_default(&self) -> &str {
        self.namespace.as_deref().unwrap_or(DEFAULT_NAMESPACE)
    }

    pub fn key(&self) -> ServiceKey {
        ServiceKey::new(self.namespace_or_default(), &self.name)
    }
}

/// A service backend reference (`serviceName` + `servicePort`).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IngressBackend {
    pub service_name: String,
    pub service_port: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpIngressPath {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    pub backend: IngressBackend,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpIngressRuleValue {
    #[serde(default)]
    pub paths: Vec<HttpIngressPath>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IngressRule {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http: Option<HttpIngressRuleValue>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IngressSpec {
    #[serde(default, alias = "defaultBackend", skip_serializing_if = "Option::is_none")]
    pub backend: Option<IngressBackend>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rules: Vec<IngressRule>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadBalancerIngress {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadBalancerStatus {
    #[serde(default)]
    pub ingress: Vec<LoadBalancerIngress>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IngressStatus {
    #[serde(default)]
    pub load_balancer: LoadBalancerStatus,
}

/// An exposure declaration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Ingress {
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: IngressSpec,
    #[serde(default)]
    pub status: IngressStatus,
}

/// Why a present ingress is not turned into a hidden service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    /// Class annotation missing or naming another controller.
    NotTorClass,
    /// Neither a default backend nor any rule backend.
    NoBackend,
    /// More than one distinct backend; only single-backend ingresses are served.
    MultipleBackends(usize),
    /// The public-port annotation is not a valid port number.
    InvalidPublicPort(String),
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::NotTorClass => write!(f, "not a tor ingress"),
            SkipReason::NoBackend => write!(f, "no backend declared"),
            SkipReason::MultipleBackends(n) => {
                write!(f, "{n} backends declared; only a single backend is supported")
            }
            SkipReason::InvalidPublicPort(raw) => {
                write!(f, "invalid {PUBLIC_PORT_ANNOTATION} annotation '{raw}'")
            }
        }
    }
}

/// The validated exposure an ingress asks for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Exposure<'a> {
    pub backend: &'a IngressBackend,
    pub public_port: u16,
    pub private_key_secret: Option<&'a str>,
}

impl Ingress {
    pub fn key(&self) -> ServiceKey {
        self.metadata.key()
    }

    pub fn namespace(&self) -> &str {
        self.metadata.namespace_or_default()
    }

    pub fn is_tor_class(&self) -> bool {
        self.metadata
            .annotations
            .get(INGRESS_CLASS_ANNOTATION)
            .is_some_and(|class| class == TOR_INGRESS_CLASS)
    }

    /// Distinct backends referenced by the default backend and every rule path.
    pub fn backends(&self) -> Vec<&IngressBackend> {
        let rule_backends = self
            .spec
            .rules
            .iter()
            .filter_map(|rule| rule.http.as_ref())
            .flat_map(|http| http.paths.iter().map(|p| &p.backend));
        let distinct: BTreeSet<&IngressBackend> =
            self.spec.backend.iter().chain(rule_backends).collect();
        distinct.into_iter().collect()
    }

    pub fn private_key_secret(&self) -> Option<&str> {
        [LEGACY_PRIVATE_KEY_ANNOTATION, PRIVATE_KEY_ANNOTATION]
            .iter()
            .filter_map(|annotation| self.metadata.annotations.get(*annotation))
            .map(String::as_str)
            .find(|name| !name.is_empty())
    }

    /// Validate the declaration and extract the single exposure it describes.
    pub fn exposure(&self) -> Result<Exposure<'_>, SkipReason> {
        if !self.is_tor_class() {
            return Err(SkipReason::NotTorClass);
        }
        let backends = self.backends();
        let backend = match backends.as_slice() {
            [] => return Err(SkipReason::NoBackend),
            [single] => *single,
            many => return Err(SkipReason::MultipleBackends(many.len())),
        };
        let public_port = match self.metadata.annotations.get(PUBLIC_PORT_ANNOTATION) {
            None => DEFAULT_PUBLIC_PORT,
            Some(raw) => match raw.trim().parse::<u16>() {
                Ok(port) if port != 0 => port,
                _ => return Err(SkipReason::InvalidPublicPort(raw.clone())),
            },
        };
        Ok(Exposure {
            backend,
            public_port,
            private_key_secret: self.private_key_secret(),
        })
    }

    /// Hostnames currently published on the status field.
    pub fn published_hostnames(&self) -> Vec<&str> {
        self.status
            .load_balancer
            .ingress
            .iter()
            .filter_map(|lb| lb.hostname.as_deref())
            .collect()
    }

    /// Replace the published load-balancer entries with a single hostname.
    pub fn set_hostname(&mut self, hostname: &str) {
        self.status.load_balancer.ingress = vec![LoadBalancerIngress {
            hostname: Some(hostname.to_owned()),
            ip: None,
        }];
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceSpec {
    #[serde(rename = "clusterIP", default, skip_serializing_if = "Option::is_none")]
    pub cluster_ip: Option<String>,
}

/// A cluster service an ingress backend points at.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Service {
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: ServiceSpec,
}

/// A secret; only `stringData` is understood.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Secret {
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub string_data: BTreeMap<String, String>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
