//! Tera rendering engine for the tor configuration file.
//!
//! The default template is embedded at compile time. Operators may replace it
//! with their own file (`torrc_template` in the controller config); the same
//! [`TorrcContext`] is passed to either.

use std::path::Path;

use tera::Tera;

use tor_ingress_core::registry::ServiceRegistry;

use crate::context::TorrcContext;
use crate::error::RenderError;

pub const TORRC_TEMPLATE_NAME: &str = "torrc";

const EMBEDDED_TORRC: &str = include_str!("templates/torrc.tera");

// ---------------------------------------------------------------------------
// Template loading
// ---------------------------------------------------------------------------

fn build_tera(template_override: Option<&Path>) -> Result<Tera, RenderError> {
    let source = match template_override {
        Some(path) => std::fs::read_to_string(path).map_err(|e| RenderError::Io {
            path: path.to_path_buf(),
            source: e,
        })?,
        None => EMBEDDED_TORRC.to_string(),
    };

    let mut tera = Tera::default();
    tera.autoescape_on(vec![]);
    tera.add_raw_template(TORRC_TEMPLATE_NAME, &normalize_line_endings(&source))?;
    Ok(tera)
}

fn normalize_line_endings(text: &str) -> String {
    text.replace("\r\n", "\n").replace('\r', "\n")
}

// ---------------------------------------------------------------------------
// TorrcRenderer
// ---------------------------------------------------------------------------

/// Renders the full torrc from the registry. Create once and reuse.
pub struct TorrcRenderer {
    tera: Tera,
}

impl TorrcRenderer {
    /// Renderer backed by the embedded template.
    pub fn new() -> Result<Self, RenderError> {
        Self::with_template(None)
    }

    /// Renderer backed by `template_override` if given, else the embedded
    /// template. The override is read and parsed once, here.
    pub fn with_template(template_override: Option<&Path>) -> Result<Self, RenderError> {
        Ok(Self {
            tera: build_tera(template_override)?,
        })
    }

    /// Render the torrc for every service in `registry`.
    ///
    /// Output depends only on the registry contents and `data_directory`:
    /// the same set of services always yields the same bytes.
    pub fn render(
        &self,
        registry: &ServiceRegistry,
        data_directory: Option<&Path>,
    ) -> Result<String, RenderError> {
        let ctx = TorrcContext::from_registry(registry, data_directory);
        self.render_context(&ctx)
    }

    pub fn render_context(&self, ctx: &TorrcContext) -> Result<String, RenderError> {
        let tera_ctx = ctx.to_tera_context()?;
        let rendered = self.tera.render(TORRC_TEMPLATE_NAME, &tera_ctx)?;
        Ok(normalize_line_endings(&rendered))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
