//! Out-of-process add-on hosting.
//!
//! Add-ons run as separate OS processes and talk to the host over
//! newline-delimited JSON on stdin/stdout.
//!
//! # Architecture
//!
//! - **manifest**: Add-on manifests and the catalogs that provide them
//! - **descriptor**: Resolves a manifest into a sandboxed launch descriptor
//! - **protocol**: Wire messages and built-in method names
//! - **transport**: One child process and its request/response exchange
//! - **supervisor**: Per add-on lifecycle, restart budget and stderr tail
//! - **host**: Registry of supervisors keyed by add-on id

pub mod descriptor;
pub mod host;
pub mod manifest;
pub mod protocol;
pub mod supervisor;
pub mod transport;

use std::io;
use std::path::PathBuf;

use thiserror::Error;

pub use descriptor::{DescriptorResolver, LaunchDescriptor};
pub use host::AddonHost;
pub use manifest::{AddonCatalog, AddonManifest, DirectoryCatalog};
pub use protocol::{AddonCommand, RpcErrorObject, RpcRequest, RpcResponse};
pub use supervisor::{
    AddonInstance, InstanceOptions, InstancePhase, LaunchSource, ManifestLaunch, RestartBudget,
    StatusSnapshot,
};
pub use transport::RpcTransport;

/// Broad category of an [`AddonError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The manifest could not be turned into a launch descriptor.
    Resolution,
    /// The OS refused to start the process.
    ProcessStart,
    /// The add-on answered with something unusable, or an error object.
    Protocol,
    /// No answer within the configured window.
    Timeout,
    /// Refused by the supervisor or the host.
    Supervision,
}

/// Errors produced by the add-on hosting subsystem.
#[derive(Debug, Error)]
pub enum AddonError {
    #[error("Add-on '{id}' has unsupported mode '{mode}'")]
    UnsupportedMode { id: String, mode: String },

    #[error("Install directory does not exist: {}", .0.display())]
    InstallDirMissing(PathBuf),

    #[error("Add-on '{id}' does not declare an entrypoint module for this platform")]
    EntrypointNotDeclared { id: String },

    #[error("Path '{}' escapes install directory '{}'", .path.display(), .root.display())]
    PathEscapesInstallDir { path: PathBuf, root: PathBuf },

    #[error("Entrypoint does not exist: {}", .0.display())]
    EntrypointMissing(PathBuf),

    #[error("Working directory does not exist: {}", .0.display())]
    WorkingDirMissing(PathBuf),

    #[error("Failed to start '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("Transport error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Protocol error: response id '{actual}' does not match request id '{expected}'")]
    IdMismatch { expected: String, actual: String },

    #[error("Add-on error {code}: {message}")]
    Remote { code: i64, message: String },

    #[error("Add-on did not answer '{method}' within {timeout_ms} ms")]
    Timeout { method: String, timeout_ms: u64 },

    #[error("Transport is unusable after an earlier failure")]
    TransportPoisoned,

    #[error("Restart limit exceeded ({limit} per minute)")]
    RestartLimitExceeded { limit: u32 },

    #[error("Add-on '{0}' is not started")]
    NotStarted(String),

    #[error("Add-on host is disposed")]
    HostDisposed,
}

impl AddonError {
    /// Returns the category this error belongs to.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            AddonError::UnsupportedMode { .. }
            | AddonError::InstallDirMissing(_)
            | AddonError::EntrypointNotDeclared { .. }
            | AddonError::PathEscapesInstallDir { .. }
            | AddonError::EntrypointMissing(_)
            | AddonError::WorkingDirMissing(_) => ErrorKind::Resolution,
            AddonError::Spawn { .. } => ErrorKind::ProcessStart,
            AddonError::Io(_)
            | AddonError::Json(_)
            | AddonError::Protocol(_)
            | AddonError::IdMismatch { .. }
            | AddonError::Remote { .. }
            | AddonError::TransportPoisoned => ErrorKind::Protocol,
            AddonError::Timeout { .. } => ErrorKind::Timeout,
            AddonError::RestartLimitExceeded { .. }
            | AddonError::NotStarted(_)
            | AddonError::HostDisposed => ErrorKind::Supervision,
        }
    }

    /// Returns true if the failure leaves the transport unusable.
    ///
    /// A declared error response means the add-on is healthy and simply
    /// refused the call, so it is not a transport failure.
    #[must_use]
    pub fn is_transport_failure(&self) -> bool {
        matches!(self.kind(), ErrorKind::Protocol | ErrorKind::Timeout)
            && !matches!(self, AddonError::Remote { .. })
    }
}
