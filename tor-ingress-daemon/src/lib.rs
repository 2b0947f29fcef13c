//! Controller runtime: work queue, reconciler, tor supervisor, hostname
//! resolution, status publishing, the file-backed manifest store and the
//! control socket.

mod error;
pub mod hostname;
pub mod manifest;
pub mod paths;
pub mod protocol;
pub mod queue;
pub mod reconciler;
mod runtime;
pub mod status;
pub mod supervisor;

pub use error::{DaemonError, HostnameError, ReconcileError, StatusError, SupervisorError};
pub use hostname::HostnameResolver;
pub use manifest::ManifestStore;
pub use protocol::{
    request_resync, request_status, request_stop, send_request, DaemonRequest, DaemonResponse,
};
pub use queue::WorkQueue;
pub use reconciler::{
    handle_result, run_worker, ControlPlane, Reconciler, RetryDecision, SharedControlPlane,
    SyncOutcome,
};
pub use runtime::{init_tracing, run, start_blocking};
pub use supervisor::{SupervisorSettings, SupervisorState, SupervisorStatus, TorSupervisor};
