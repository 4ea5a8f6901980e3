use std::fmt;

use serde::{Deserialize, Serialize};

/// Stable, opaque device identity. All merge, cache and lookup operations
/// key on it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(String);

impl DeviceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DeviceId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for DeviceId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceType {
    Desktop,
    Mobile,
    Web,
    #[default]
    #[serde(other)]
    Other,
}

impl DeviceType {
    /// Tag used in LAN advertisement metadata.
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceType::Desktop => "desktop",
            DeviceType::Mobile => "mobile",
            DeviceType::Web => "web",
            DeviceType::Other => "other",
        }
    }

    /// Inverse of [`as_str`](Self::as_str). Unknown tags map to `Other`.
    pub fn from_tag(tag: &str) -> Self {
        match tag.trim().to_ascii_lowercase().as_str() {
            "desktop" => DeviceType::Desktop,
            "mobile" => DeviceType::Mobile,
            "web" => DeviceType::Web,
            _ => DeviceType::Other,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceStatus {
    #[default]
    Discovered,
    Connecting,
    Connected,
    Disconnected,
}

/// A peer as seen by discovery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Device {
    pub device_id: DeviceId,
    #[serde(default)]
    pub device_name: String,
    #[serde(default)]
    pub device_type: DeviceType,
    #[serde(default)]
    pub status: DeviceStatus,
    /// Reachable endpoint (`ip:port`), when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_key: Option<String>,
    #[serde(default)]
    pub is_trusted: bool,
}

impl Device {
    pub fn new(
        device_id: impl Into<DeviceId>,
        device_name: impl Into<String>,
        device_type: DeviceType,
    ) -> Self {
        Self {
            device_id: device_id.into(),
            device_name: device_name.into(),
            device_type,
            status: DeviceStatus::Discovered,
            address: None,
            public_key: None,
            is_trusted: false,
        }
    }

    pub fn with_address(mut self, address: impl Into<String>) -> Self {
        self.address = Some(address.into());
        self
    }

    pub fn with_public_key(mut self, public_key: impl Into<String>) -> Self {
        self.public_key = Some(public_key.into());
        self
    }

    pub fn with_status(mut self, status: DeviceStatus) -> Self {
        self.status = status;
        self
    }
}

/// Message type tag of an inbound envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MessageType {
    Heartbeat,
    Data,
    Control,
    Ack,
    /// Any tag this crate does not know.
    #[serde(other)]
    Unknown,
}

/// Envelope of a peer-to-peer message. Only the type tag matters to this
/// crate; the payload belongs to the data channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageEnvelope {
    pub id: String,
    pub from: DeviceId,
    #[serde(rename = "type")]
    pub msg_type: MessageType,
    #[serde(default)]
    pub payload: serde_json::Value,
    pub timestamp: u64,
}

impl MessageEnvelope {
    pub fn new(from: DeviceId, msg_type: MessageType, payload: serde_json::Value) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            from,
            msg_type,
            payload,
            timestamp: now_ms(),
        }
    }
}

/// Wall-clock time in Unix milliseconds.
pub fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
