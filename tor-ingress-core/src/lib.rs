//! tor-ingress core library: domain types, service registry, collaborator
//! interfaces, configuration and errors.
//!
//! - [`types`]: keys, hidden-service records, typed ingress declarations
//! - [`registry`]: the in-memory service registry and service directories
//! - [`source`]: traits for the resource, secret and status collaborators
//! - [`config`]: YAML controller configuration
//! - [`error`]: [`RegistryError`], [`ConfigError`], [`StoreError`]

pub mod config;
pub mod error;
pub mod registry;
pub mod source;
pub mod types;

pub use config::{AddressMode, ControllerConfig, LogFormat, ReloadPolicy};
pub use error::{ConfigError, RegistryError, StoreError};
pub use registry::ServiceRegistry;
pub use source::{IngressStore, SecretStore, StatusWriter};
pub use types::{
    Exposure, HiddenService, HiddenServiceSpec, Ingress, IngressBackend, ObjectMeta, Secret,
    Service, ServiceKey, ServiceState, SkipReason,
};
