//! # tor-ingress-sync
//!
//! Hash-gated atomic persistence of the rendered torrc.
//!
//! The daemon and the CLI both go through [`TorrcWriter`] (or the lower-level
//! [`persist_torrc`]) so a torrc is only rewritten when its content changes.

pub mod diff;
pub mod error;
pub mod hash_store;
pub mod pipeline;
pub mod writer;

pub use diff::{diff_torrc, FileDiff};
pub use error::SyncError;
pub use hash_store::HashStoreFile;
pub use pipeline::{persist_torrc, TorrcWriter};
pub use writer::{atomic_write, WriteResult};
