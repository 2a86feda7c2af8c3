//! Collaborator boundary
//!
//! Loaders never talk to a transport directly. They are handed trait objects
//! for the request/response client, the push channel, the external edit
//! state and the host visibility signal; all of them are optional at
//! construction and checked once.
//!
//! Wire payloads use camelCase field names.

use crate::error::LoaderError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tokio::sync::mpsc;

fn connected_by_default() -> bool {
    true
}

/// One equipment row of a snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EquipmentRecord {
    /// Backend equipment id
    pub id: String,
    /// Display name
    #[serde(default)]
    pub name: String,
    /// Raw status string, normalized by the monitoring loader
    #[serde(default)]
    pub status: Option<String>,
    /// Connectivity flag; a disconnected unit reports `Disconnected`
    #[serde(default = "connected_by_default")]
    pub is_connected: bool,
    /// Last update reported by the backend
    #[serde(default)]
    pub last_updated: Option<DateTime<Utc>>,
}

/// Full point-in-time equipment state
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    /// All equipment rows
    #[serde(default)]
    pub equipment: Vec<EquipmentRecord>,
}

/// Incremental status update from the push channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushMessage {
    /// Backend equipment id
    pub id: String,
    /// Raw status string
    #[serde(default)]
    pub status: Option<String>,
    /// Connectivity flag, when the message carries one
    #[serde(default)]
    pub is_connected: Option<bool>,
    /// Backend timestamp
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
    /// Any further fields
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl PushMessage {
    /// Message with only id and status
    pub fn new(id: impl Into<String>, status: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            status: Some(status.into()),
            is_connected: None,
            timestamp: None,
            extra: serde_json::Map::new(),
        }
    }
}

/// One mapping row as delivered by the backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MappingRecord {
    /// Backend id (reverse key)
    pub equipment_id: String,
    /// Display name
    pub equipment_name: String,
    /// Optional equipment code
    #[serde(default)]
    pub equipment_code: Option<String>,
    /// Optional production line
    #[serde(default)]
    pub line_name: Option<String>,
    /// Last edit time
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

/// Site mapping table keyed by frontend id
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MappingPayload {
    /// Whether the backend considers the site connected
    pub connected: bool,
    /// Site the table belongs to
    #[serde(default)]
    pub site_id: Option<String>,
    /// frontend id → record
    #[serde(default)]
    pub mappings: BTreeMap<String, MappingRecord>,
}

/// One resolved mapping, as held by the bidirectional index
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MappingEntry {
    /// UI-facing id (unique)
    pub frontend_id: String,
    /// Backend id (unique reverse key)
    pub equipment_id: String,
    /// Display name
    pub equipment_name: String,
    /// Optional equipment code
    pub equipment_code: Option<String>,
    /// Optional production line
    pub line_name: Option<String>,
    /// Last edit time, load time when the backend omits it
    pub updated_at: DateTime<Utc>,
}

/// Entry of the equipment names list
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EquipmentName {
    /// Backend id
    pub equipment_id: String,
    /// Display name
    pub equipment_name: String,
    /// Optional equipment code
    #[serde(default)]
    pub equipment_code: Option<String>,
}

/// Request/response client for equipment snapshots
#[async_trait]
pub trait MonitoringApi: Send + Sync {
    /// Fetch the full equipment snapshot
    async fn fetch_snapshot(&self) -> Result<Snapshot, LoaderError>;
}

/// Version of the mapping interface implemented by [`MappingApi`]
pub const MAPPING_API_VERSION: u32 = 2;

/// Request/response client for site mapping tables
#[async_trait]
pub trait MappingApi: Send + Sync {
    /// Interface version; adapters over older sources report what they wrap
    fn api_version(&self) -> u32 {
        MAPPING_API_VERSION
    }

    /// Mapping table of the site the backend considers current
    async fn fetch_current_site(&self) -> Result<MappingPayload, LoaderError>;

    /// Mapping table of a specific site
    async fn fetch_site(&self, site_id: &str) -> Result<MappingPayload, LoaderError>;

    /// Equipment names available for mapping
    async fn fetch_equipment_names(&self) -> Result<Vec<EquipmentName>, LoaderError>;
}

/// Request/response client for dashboard widgets
#[async_trait]
pub trait DashboardApi: Send + Sync {
    /// Fetch the current value of one widget
    async fn fetch_widget(&self, widget: &str) -> Result<serde_json::Value, LoaderError>;
}

/// Signals delivered by a push channel
#[derive(Debug, Clone, PartialEq)]
pub enum PushSignal {
    /// Channel (re)established
    Connected,
    /// Channel dropped
    Disconnected {
        /// Reason, if the transport gave one
        reason: Option<String>,
    },
    /// Transport is retrying
    Reconnecting {
        /// Attempt number
        attempt: u32,
    },
    /// Status update
    Message(PushMessage),
    /// Transport error
    Error(String),
}

/// Push-subscription client
#[async_trait]
pub trait PushClient: Send + Sync {
    /// Open the channel; signals arrive on the returned receiver until it
    /// closes or `disconnect` is called
    async fn connect(&self) -> Result<mpsc::UnboundedReceiver<PushSignal>, LoaderError>;

    /// Ask the backend to stream updates for `topics`
    async fn subscribe(&self, topics: &[String]) -> Result<(), LoaderError>;

    /// Close the channel
    async fn disconnect(&self);

    /// Whether the channel is currently open
    fn is_connected(&self) -> bool;
}

/// Editor state that accepts a bulk mapping update
pub trait EditState: Send + Sync {
    /// Apply the full mapping table; returns the number of entries applied
    fn apply_mappings(&self, site_id: Option<&str>, entries: &[MappingEntry]) -> usize;
}

/// Host visibility; hidden hosts skip scheduled refreshes
pub trait HostVisibility: Send + Sync {
    /// Whether the host is backgrounded or hidden
    fn is_hidden(&self) -> bool;
}

/// Translates backend equipment ids to frontend ids
pub trait IdResolver: Send + Sync {
    /// Frontend id mapped to `equipment_id`, if any
    fn frontend_id_for(&self, equipment_id: &str) -> Option<String>;
}
