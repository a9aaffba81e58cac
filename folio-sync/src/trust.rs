//! Pluggable authentication step run during the handshake.

use crate::error::{SyncError, SyncResult};
use crate::store::LocalDataStore;
use async_trait::async_trait;
use folio_types::DeviceInfo;
use std::sync::Arc;

/// Decides whether a peer may sync with us.
#[async_trait]
pub trait TrustPolicy: Send + Sync {
    /// Fails with [`SyncError::AuthenticationFailed`] to refuse the peer.
    async fn authorize(&self, peer: &DeviceInfo) -> SyncResult<()>;
}

/// Open mode: every peer is accepted.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAllTrust;

#[async_trait]
impl TrustPolicy for AllowAllTrust {
    async fn authorize(&self, _peer: &DeviceInfo) -> SyncResult<()> {
        Ok(())
    }
}

/// Only peers on the store's trusted-device list are accepted.
pub struct TrustedDevicesOnly {
    store: Arc<dyn LocalDataStore>,
}

impl TrustedDevicesOnly {
    pub fn new(store: Arc<dyn LocalDataStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl TrustPolicy for TrustedDevicesOnly {
    async fn authorize(&self, peer: &DeviceInfo) -> SyncResult<()> {
        match self.store.get_trusted_device(&peer.device_id).await? {
            Some(_) => Ok(()),
            None => Err(SyncError::AuthenticationFailed(format!(
                "{} ({}) is not a trusted device",
                peer.device_name, peer.device_id
            ))),
        }
    }
}
