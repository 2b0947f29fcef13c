//! Template context: serializable rendering payload built from a
//! [`ServiceRegistry`].
//!
//! The context carries nothing time- or order-dependent, so two registries
//! holding the same services always render byte-identical output.

use std::path::Path;

use serde::{Deserialize, Serialize};

use tor_ingress_core::registry::ServiceRegistry;
use tor_ingress_core::types::HiddenService;

use crate::error::RenderError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TorrcContext {
    /// `DataDirectory` line, omitted when `None`.
    pub data_directory: Option<String>,
    /// One block per hidden service, sorted by key.
    pub services: Vec<ServiceBlock>,
}

/// The two directives tor needs for one hidden service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceBlock {
    pub key: String,
    pub service_dir: String,
    pub public_port: u16,
    pub backend_address: String,
    pub backend_port: u16,
}

impl From<&HiddenService> for ServiceBlock {
    fn from(service: &HiddenService) -> Self {
        Self {
            key: service.key.to_string(),
            service_dir: dir_with_separator(&service.service_dir),
            public_port: service.public_port,
            backend_address: service.backend_address.clone(),
            backend_port: service.backend_port,
        }
    }
}

impl TorrcContext {
    pub fn from_registry(registry: &ServiceRegistry, data_directory: Option<&Path>) -> Self {
        let mut services: Vec<ServiceBlock> = registry.iter().map(ServiceBlock::from).collect();
        services.sort_by(|a, b| a.key.cmp(&b.key));
        Self {
            data_directory: data_directory.map(|p| p.display().to_string()),
            services,
        }
    }

    pub fn to_tera_context(&self) -> Result<tera::Context, RenderError> {
        tera::Context::from_serialize(self).map_err(RenderError::from)
    }
}

/// tor accepts `HiddenServiceDir` with or without a trailing slash; always
/// emitting one keeps the rendered text stable.
fn dir_with_separator(dir: &Path) -> String {
    let mut rendered = dir.display().to_string();
    if !rendered.ends_with('/') {
        rendered.push('/');
    }
    rendered
}
