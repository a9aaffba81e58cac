//! Device descriptions exchanged during discovery and handshake.

use crate::{DeviceId, Error, Result, Timestamp};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;

/// Kind of installation a peer runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeviceType {
    Android,
    Desktop,
    Ios,
    #[default]
    Unknown,
}

impl fmt::Display for DeviceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Android => "android",
            Self::Desktop => "desktop",
            Self::Ios => "ios",
            Self::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// A peer as it announces itself on the LAN.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceInfo {
    pub device_id: DeviceId,
    pub device_name: String,
    pub device_type: DeviceType,
    pub app_version: String,
    pub ip_address: IpAddr,
    /// Carried opaquely for the transfer channel.
    pub port: u16,
    pub last_seen: Timestamp,
}

impl DeviceInfo {
    /// Creates a device description stamped with the current time.
    pub fn new(
        device_id: DeviceId,
        device_name: impl Into<String>,
        device_type: DeviceType,
        app_version: impl Into<String>,
        ip_address: IpAddr,
        port: u16,
    ) -> Self {
        Self {
            device_id,
            device_name: device_name.into(),
            device_type,
            app_version: app_version.into(),
            ip_address,
            port,
            last_seen: Timestamp::now(),
        }
    }

    /// Address the transfer channel dials to reach this device.
    #[must_use]
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip_address, self.port)
    }

    /// Whether this device's app version can sync with `other`'s.
    #[must_use]
    pub fn is_version_compatible(&self, other: &DeviceInfo) -> bool {
        match (
            self.app_version.parse::<AppVersion>(),
            other.app_version.parse::<AppVersion>(),
        ) {
            (Ok(a), Ok(b)) => a.is_compatible_with(&b),
            _ => false,
        }
    }

    /// Returns a copy with `last_seen` moved to `at`.
    #[must_use]
    pub fn seen_at(mut self, at: Timestamp) -> Self {
        self.last_seen = at;
        self
    }
}

/// A device surfaced by an active discovery session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscoveredDevice {
    pub device_info: DeviceInfo,
    pub is_reachable: bool,
    pub discovered_at: Timestamp,
}

impl DiscoveredDevice {
    pub fn new(device_info: DeviceInfo, discovered_at: Timestamp) -> Self {
        Self {
            device_info,
            is_reachable: true,
            discovered_at,
        }
    }

    #[must_use]
    pub fn device_id(&self) -> &DeviceId {
        &self.device_info.device_id
    }
}

/// Parsed `major.minor.patch` application version.
///
/// Anything after the patch number (`-beta.2`, `+build`) is ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct AppVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl AppVersion {
    pub const fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }

    /// Same major version; while the major is 0, the minor must match too.
    #[must_use]
    pub fn is_compatible_with(&self, other: &AppVersion) -> bool {
        if self.major != other.major {
            return false;
        }
        self.major != 0 || self.minor == other.minor
    }
}

impl FromStr for AppVersion {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let core = s
            .trim()
            .trim_start_matches('v')
            .split(['-', '+'])
            .next()
            .unwrap_or_default();

        let mut parts = core.split('.');
        let mut next = |required: bool| -> Result<u32> {
            match parts.next() {
                Some(p) => p
                    .parse::<u32>()
                    .map_err(|_| Error::InvalidVersion(s.to_string())),
                None if required => Err(Error::InvalidVersion(s.to_string())),
                None => Ok(0),
            }
        };

        let major = next(true)?;
        let minor = next(false)?;
        let patch = next(false)?;
        if parts.next().is_some() {
            return Err(Error::InvalidVersion(s.to_string()));
        }
        Ok(Self::new(major, minor, patch))
    }
}

impl fmt::Display for AppVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}
