//! Persisted records and the store contract the sync core is written
//! against. Every write is a single-row statement; nothing here spans rows.

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;

use crate::command::DeviceSettings;
use crate::error::StoreError;
use crate::mqtt::DeviceId;

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HardwareStatus {
    pub device_id: DeviceId,
    pub valve: Vec<bool>,
    pub moisture: Vec<bool>,
    pub uptime: i64,
    /// Unix seconds, UTC.
    pub updated_at: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceConfig {
    pub device_id: DeviceId,
    #[serde(flatten)]
    pub settings: DeviceSettings,
    pub updated_at: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SensorReading {
    pub device_id: DeviceId,
    pub valve: Vec<bool>,
    pub moisture: Vec<bool>,
    pub client_name: String,
    pub created_at: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuditTag {
    Feedback,
    PublishFromCloud,
}

impl AuditTag {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Feedback => "feedback",
            Self::PublishFromCloud => "publish_from_cloud",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AuditEntry {
    pub tag: AuditTag,
    pub device_id: Option<DeviceId>,
    pub topic: String,
    pub payload: Value,
    pub created_at: i64,
}

// ---------------------------------------------------------------------------
// Contract
// ---------------------------------------------------------------------------

/// Keyed persistence for device state.
///
/// The `set_*` methods are update-only: they return `Ok(false)` and change
/// nothing when the device has no status row yet.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Replace-or-insert the whole status row.
    async fn upsert_status(&self, status: &HardwareStatus) -> Result<(), StoreError>;

    async fn set_moisture(
        &self,
        device_id: &DeviceId,
        index: u32,
        value: bool,
    ) -> Result<bool, StoreError>;

    async fn set_valve(
        &self,
        device_id: &DeviceId,
        index: u32,
        value: bool,
    ) -> Result<bool, StoreError>;

    async fn set_uptime(&self, device_id: &DeviceId, uptime: i64) -> Result<bool, StoreError>;

    async fn find_status(&self, device_id: &DeviceId) -> Result<Option<HardwareStatus>, StoreError>;

    /// Update-if-exists, else insert.
    async fn upsert_config(&self, config: &DeviceConfig) -> Result<(), StoreError>;

    async fn find_config(&self, device_id: &DeviceId) -> Result<Option<DeviceConfig>, StoreError>;

    async fn insert_sensor_reading(&self, reading: &SensorReading) -> Result<(), StoreError>;

    /// Newest first.
    async fn recent_sensor_readings(
        &self,
        device_id: &DeviceId,
        limit: i64,
    ) -> Result<Vec<SensorReading>, StoreError>;

    async fn insert_audit(&self, entry: &AuditEntry) -> Result<(), StoreError>;
}
