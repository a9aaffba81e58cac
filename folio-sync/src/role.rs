//! Client/server role assignment.
//!
//! Roles depend only on the pair of device ids, never on which side dialed.
//! Two peers that connect to each other at the same time still compute
//! opposite roles.

use crate::error::{SyncError, SyncResult};
use folio_types::DeviceId;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use tracing::debug;

/// Side of a connection. The server listens and receives first; the client
/// dials and sends first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Role {
    Server,
    Client,
}

impl Role {
    pub fn opposite(self) -> Self {
        match self {
            Self::Server => Self::Client,
            Self::Client => Self::Server,
        }
    }

    /// Whether this side sends first in each exchange.
    pub fn sends_first(self) -> bool {
        self == Self::Client
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Server => f.write_str("SERVER"),
            Self::Client => f.write_str("CLIENT"),
        }
    }
}

pub struct RoleNegotiator;

impl RoleNegotiator {
    /// The lexicographically smaller id is the server.
    ///
    /// `is_local_initiator` is accepted for diagnostics only.
    pub fn negotiate(
        local: &DeviceId,
        remote: &DeviceId,
        is_local_initiator: bool,
    ) -> SyncResult<Role> {
        let role = match local.cmp(remote) {
            Ordering::Less => Role::Server,
            Ordering::Greater => Role::Client,
            Ordering::Equal => {
                return Err(SyncError::ConnectionFailed(format!(
                    "refusing to connect device {local} to itself"
                )));
            }
        };
        debug!(
            "[SYNC] Negotiated role {} with {} (initiator: {})",
            role, remote, is_local_initiator
        );
        Ok(role)
    }
}
