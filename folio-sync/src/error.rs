//! Error types for the sync layer.

use folio_types::AppVersion;
use std::io;
use thiserror::Error;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur in sync operations.
///
/// Variants carry strings rather than source errors so the error can be
/// cloned into a [`crate::SyncStatus::Failed`] and fanned out to every
/// status subscriber.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SyncError {
    /// The local network is down.
    #[error("network unavailable")]
    NetworkUnavailable,

    /// Handshake or socket failure.
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// The pairing or trust check rejected the peer.
    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),

    /// The two app versions cannot sync with each other.
    #[error("incompatible app versions: local {local}, remote {remote}")]
    IncompatibleVersion { local: String, remote: String },

    /// I/O failure in the middle of a transfer.
    #[error("transfer failed: {0}")]
    TransferFailed(String),

    /// Unresolved manual conflicts or a merge rule failure.
    #[error("conflict resolution failed: {0}")]
    ConflictResolutionFailed(String),

    /// Not enough space to apply the incoming data.
    #[error("insufficient storage: {required} bytes required, {available} available")]
    InsufficientStorage { required: u64, available: u64 },

    /// The target device is no longer on the network.
    #[error("device not found: {0}")]
    DeviceNotFound(String),

    /// The user cancelled the operation.
    #[error("sync cancelled")]
    Cancelled,

    /// The local data store failed.
    #[error("storage error: {0}")]
    Storage(String),

    /// Not yet categorized.
    #[error("unknown error: {0}")]
    Unknown(String),
}

/// How the caller should treat a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryClass {
    /// Retry locally with exponential backoff.
    Backoff,
    /// Retry once the network comes back.
    AfterReconnect,
    /// Retry only after a fresh discovery pass.
    AfterRediscovery,
    /// Surface to the user; never retried automatically.
    Never,
}

impl SyncError {
    pub fn incompatible(local: &str, remote: &str) -> Self {
        Self::IncompatibleVersion {
            local: local.to_string(),
            remote: remote.to_string(),
        }
    }

    pub fn retry_class(&self) -> RetryClass {
        match self {
            Self::ConnectionFailed(_) | Self::TransferFailed(_) => RetryClass::Backoff,
            Self::NetworkUnavailable => RetryClass::AfterReconnect,
            Self::DeviceNotFound(_) => RetryClass::AfterRediscovery,
            Self::AuthenticationFailed(_)
            | Self::IncompatibleVersion { .. }
            | Self::ConflictResolutionFailed(_)
            | Self::InsufficientStorage { .. }
            | Self::Cancelled
            | Self::Storage(_)
            | Self::Unknown(_) => RetryClass::Never,
        }
    }

    /// Whether the core retries this error itself before surfacing it.
    pub fn is_transient(&self) -> bool {
        self.retry_class() == RetryClass::Backoff
    }

    /// Whether this failure came from a user cancel.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(e: serde_json::Error) -> Self {
        Self::TransferFailed(format!("malformed message: {e}"))
    }
}

impl From<io::Error> for SyncError {
    fn from(e: io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::NetworkUnreachable | io::ErrorKind::NetworkDown => {
                Self::NetworkUnavailable
            }
            io::ErrorKind::ConnectionRefused
            | io::ErrorKind::HostUnreachable
            | io::ErrorKind::AddrNotAvailable
            | io::ErrorKind::AddrInUse
            | io::ErrorKind::TimedOut => Self::ConnectionFailed(e.to_string()),
            _ => Self::TransferFailed(e.to_string()),
        }
    }
}

impl From<folio_types::Error> for SyncError {
    fn from(e: folio_types::Error) -> Self {
        match e {
            folio_types::Error::DuplicateItem(id) => {
                Self::TransferFailed(format!("manifest lists {id} twice"))
            }
            other => Self::Unknown(other.to_string()),
        }
    }
}

/// Compares two app versions, returning the handshake error when they cannot sync.
pub(crate) fn check_versions(local: &str, remote: &str) -> SyncResult<()> {
    match (local.parse::<AppVersion>(), remote.parse::<AppVersion>()) {
        (Ok(l), Ok(r)) if l.is_compatible_with(&r) => Ok(()),
        _ => Err(SyncError::incompatible(local, remote)),
    }
}
