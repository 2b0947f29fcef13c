//! # tor-ingress-renderer
//!
//! Tera-based renderer that turns the hidden-service registry into a torrc.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use tor_ingress_core::ServiceRegistry;
//! use tor_ingress_renderer::TorrcRenderer;
//!
//! fn print_torrc(registry: &ServiceRegistry) {
//!     if let Ok(renderer) = TorrcRenderer::new() {
//!         if let Ok(torrc) = renderer.render(registry, None) {
//!             print!("{torrc}");
//!         }
//!     }
//! }
//! ```

pub mod context;
pub mod engine;
pub mod error;

pub use context::{ServiceBlock, TorrcContext};
pub use engine::{TorrcRenderer, TORRC_TEMPLATE_NAME};
pub use error::RenderError;
