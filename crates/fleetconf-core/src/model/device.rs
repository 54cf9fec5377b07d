// ── Device domain types ──

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Per-device connection state.
///
/// `Wresp` is reserved: it exists in the device state model but no
/// transition currently enters it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnState {
    Closed,
    Connecting,
    SchemaList,
    /// Fetching schema number `n` of the module set.
    SchemaOne(usize),
    DeviceSync,
    Open,
    PushLock,
    PushEdit,
    PushValidate,
    PushCommit,
    PushDiscard,
    PushUnlock,
    Wresp,
}

impl ConnState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Closed => "CLOSED",
            Self::Connecting => "CONNECTING",
            Self::SchemaList => "SCHEMA_LIST",
            Self::SchemaOne(_) => "SCHEMA_ONE",
            Self::DeviceSync => "DEVICE-SYNC",
            Self::Open => "OPEN",
            Self::PushLock => "PUSH_LOCK",
            Self::PushEdit => "PUSH_EDIT",
            Self::PushValidate => "PUSH_VALIDATE",
            Self::PushCommit => "PUSH_COMMIT",
            Self::PushDiscard => "PUSH_DISCARD",
            Self::PushUnlock => "PUSH_UNLOCK",
            Self::Wresp => "WRESP",
        }
    }

    /// Every state other than CLOSED and OPEN carries a timer.
    pub fn is_transient(&self) -> bool {
        !matches!(self, Self::Closed | Self::Open)
    }

    pub fn is_open(&self) -> bool {
        matches!(self, Self::Open)
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, Self::Closed)
    }
}

impl std::fmt::Display for ConnState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Validation policy applied when device data is committed at sync.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum YangConfig {
    /// Bind device data to the mounted schema, no datastore validation.
    Bind,
    /// Bind and fully validate before commit.
    Validate,
}

/// Transport used to reach the device. NETCONF over SSH is the only
/// connection type in scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConnType {
    NetconfSsh,
}

/// Static (configured) attributes of a device.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    pub name: String,
    pub addr: String,
    pub user: Option<String>,
    pub enabled: bool,
    pub conn_type: ConnType,
    pub yang_config: YangConfig,
}

impl DeviceConfig {
    pub fn new(name: impl Into<String>, addr: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            addr: addr.into(),
            user: None,
            enabled: true,
            conn_type: ConnType::NetconfSsh,
            yang_config: YangConfig::Validate,
        }
    }
}

/// Point-in-time view of a device handle, published on the state watch
/// channel and rendered by `show devices` style clients.
#[derive(Debug, Clone, Serialize)]
pub struct DeviceSummary {
    pub name: String,
    pub state: ConnState,
    pub since: DateTime<Utc>,
    pub logmsg: Option<String>,
}
