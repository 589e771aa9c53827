use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

pub type DeviceId = String;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionType {
    NetconfSsh,
}

impl Default for ConnectionType {
    fn default() -> Self {
        ConnectionType::NetconfSsh
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportParams {
    pub address: String,
    pub username: Option<String>,
    #[serde(default)]
    pub connection_type: ConnectionType,
    #[serde(default)]
    pub port: Option<u16>,
}

/// Per-device state-machine state. Only `Closed` and `Open` are stable;
/// every other variant has a registered timeout (spec.md §4.3).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "state", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnState {
    Closed,
    Connecting,
    SchemaList,
    /// Substate carries the index (0-based) of the module currently being
    /// fetched, mirroring the original C `CS_SCHEMA_ONE(n)` substate.
    SchemaOne(u32),
    DeviceSync,
    Open,
    PushEdit,
    PushValidate,
    PushCommit,
    Wresp,
}

impl ConnState {
    pub fn is_stable(&self) -> bool {
        matches!(self, ConnState::Closed | ConnState::Open)
    }

    pub fn is_transient(&self) -> bool {
        !self.is_stable()
    }
}

impl fmt::Display for ConnState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnState::Closed => write!(f, "CLOSED"),
            ConnState::Connecting => write!(f, "CONNECTING"),
            ConnState::SchemaList => write!(f, "SCHEMA_LIST"),
            ConnState::SchemaOne(n) => write!(f, "SCHEMA_ONE({n})"),
            ConnState::DeviceSync => write!(f, "DEVICE_SYNC"),
            ConnState::Open => write!(f, "OPEN"),
            ConnState::PushEdit => write!(f, "PUSH_EDIT"),
            ConnState::PushValidate => write!(f, "PUSH_VALIDATE"),
            ConnState::PushCommit => write!(f, "PUSH_COMMIT"),
            ConnState::Wresp => write!(f, "WRESP"),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConfigState {
    #[default]
    Closed,
    Yang,
    Validate,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SchemaLocation {
    NetconfReachable,
    Unknown,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchemaCatalogEntry {
    pub module: String,
    pub revision: Option<String>,
    pub namespace: String,
    pub location: SchemaLocation,
    #[serde(default)]
    pub locally_available: bool,
}

impl SchemaCatalogEntry {
    pub fn cache_file_name(&self) -> String {
        match &self.revision {
            Some(rev) => format!("{}@{}.yang", self.module, rev),
            None => format!("{}.yang", self.module),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Device {
    pub name: DeviceId,
    pub transport: TransportParams,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub credential: super::CredentialRef,
}

fn default_enabled() -> bool {
    true
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct CapabilitySet(pub BTreeSet<String>);

impl CapabilitySet {
    pub fn supports_base_netconf(&self) -> bool {
        self.0.iter().any(|c| {
            c == "urn:ietf:params:netconf:base:1.0" || c == "urn:ietf:params:netconf:base:1.1"
        })
    }

    pub fn supports_base_1_1(&self) -> bool {
        self.0.contains("urn:ietf:params:netconf:base:1.1")
    }

    pub fn supports_monitoring(&self) -> bool {
        self.0
            .contains("urn:ietf:params:xml:ns:yang:ietf-netconf-monitoring")
    }
}
