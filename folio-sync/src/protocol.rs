//! Messages exchanged over a transfer channel.
//!
//! One sync run on a connection:
//! 1. Client sends `Hello`; server checks version and trust, replies `HelloAck`
//! 2. Both sides swap `Manifest`s, client first
//! 3. Both sides swap `Data`, client first, and confirm with `DataAck`
//!
//! Either side may send `Error` instead of its next message to abort the run.

use crate::error::SyncError;
use folio_types::{DeviceInfo, SyncData, SyncManifest};
use serde::{Deserialize, Serialize};

/// Protocol version for compatibility checking.
pub const PROTOCOL_VERSION: u32 = 1;

/// A transfer protocol message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TransferMessage {
    /// Handshake message sent by the client.
    Hello(HelloMessage),

    /// Server's answer to a Hello.
    HelloAck(HelloAckMessage),

    /// Sender's manifest for this run.
    Manifest(SyncManifest),

    /// Items the receiver is missing plus the sender's side of each conflict.
    Data(SyncData),

    /// Receipt for a Data message.
    DataAck(DataAckMessage),

    /// Aborts the run.
    Error(ErrorMessage),
}

impl TransferMessage {
    /// Short name for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Hello(_) => "Hello",
            Self::HelloAck(_) => "HelloAck",
            Self::Manifest(_) => "Manifest",
            Self::Data(_) => "Data",
            Self::DataAck(_) => "DataAck",
            Self::Error(_) => "Error",
        }
    }
}

/// Initial handshake message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HelloMessage {
    pub protocol_version: u32,
    /// The sender, including its app version.
    pub device: DeviceInfo,
}

impl HelloMessage {
    pub fn new(device: DeviceInfo) -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION,
            device,
        }
    }
}

/// Response to a Hello message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HelloAckMessage {
    pub protocol_version: u32,
    /// The responder.
    pub device: DeviceInfo,
    pub accepted: bool,
    /// Why the connection was refused.
    pub rejection: Option<ErrorMessage>,
}

impl HelloAckMessage {
    pub fn accept(device: DeviceInfo) -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION,
            device,
            accepted: true,
            rejection: None,
        }
    }

    pub fn reject(device: DeviceInfo, rejection: ErrorMessage) -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION,
            device,
            accepted: false,
            rejection: Some(rejection),
        }
    }
}

/// Receipt for a Data message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataAckMessage {
    /// Items received in the Data message.
    pub received_count: usize,
    /// Items written to the receiver's store.
    pub applied_count: usize,
}

/// Error codes carried by [`ErrorMessage`].
pub mod codes {
    pub const PROTOCOL_MISMATCH: u32 = 1;
    pub const INCOMPATIBLE_VERSION: u32 = 2;
    pub const AUTHENTICATION: u32 = 3;
    pub const CANCELLED: u32 = 4;
    pub const CONFLICT_RESOLUTION: u32 = 5;
    pub const INSUFFICIENT_STORAGE: u32 = 6;
    pub const TRANSFER: u32 = 7;
    pub const INTERNAL: u32 = 99;
}

/// Error message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorMessage {
    /// Error code.
    pub code: u32,
    /// Human-readable error message.
    pub message: String,
}

impl ErrorMessage {
    pub fn new(code: u32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// Protocol version mismatch error.
    pub fn version_mismatch(expected: u32, got: u32) -> Self {
        Self::new(
            codes::PROTOCOL_MISMATCH,
            format!("protocol version mismatch: expected {expected}, got {got}"),
        )
    }

    pub fn incompatible_app(local: &str, remote: &str) -> Self {
        Self::new(codes::INCOMPATIBLE_VERSION, format!("{local}|{remote}"))
    }

    pub fn authentication(msg: impl Into<String>) -> Self {
        Self::new(codes::AUTHENTICATION, msg)
    }

    pub fn cancelled() -> Self {
        Self::new(codes::CANCELLED, "sync cancelled by peer")
    }

    /// Internal error.
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::new(codes::INTERNAL, msg)
    }

    /// Encodes a local failure for the peer.
    pub fn from_error(error: &SyncError) -> Self {
        match error {
            SyncError::IncompatibleVersion { local, remote } => {
                Self::incompatible_app(local, remote)
            }
            SyncError::AuthenticationFailed(m) => Self::authentication(m.clone()),
            SyncError::Cancelled => Self::cancelled(),
            SyncError::ConflictResolutionFailed(m) => {
                Self::new(codes::CONFLICT_RESOLUTION, m.clone())
            }
            SyncError::InsufficientStorage { .. } => {
                Self::new(codes::INSUFFICIENT_STORAGE, error.to_string())
            }
            SyncError::TransferFailed(m) => Self::new(codes::TRANSFER, m.clone()),
            other => Self::internal(other.to_string()),
        }
    }

    /// Decodes a failure reported by the peer.
    ///
    /// Version fields are swapped so `local` names this device's version.
    pub fn into_error(self) -> SyncError {
        match self.code {
            codes::PROTOCOL_MISMATCH => SyncError::ConnectionFailed(self.message),
            codes::INCOMPATIBLE_VERSION => match self.message.split_once('|') {
                Some((peer_local, peer_remote)) => SyncError::incompatible(peer_remote, peer_local),
                None => SyncError::incompatible("unknown", &self.message),
            },
            codes::AUTHENTICATION => SyncError::AuthenticationFailed(self.message),
            codes::CANCELLED => SyncError::Cancelled,
            codes::CONFLICT_RESOLUTION => SyncError::ConflictResolutionFailed(self.message),
            codes::TRANSFER | codes::INSUFFICIENT_STORAGE => {
                SyncError::TransferFailed(format!("peer aborted: {}", self.message))
            }
            _ => SyncError::TransferFailed(format!("peer error: {}", self.message)),
        }
    }
}
