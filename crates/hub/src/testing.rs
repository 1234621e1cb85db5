//! Fixtures and collaborator doubles shared by the unit tests.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::Value;

use crate::clock::ManualClock;
use crate::command::DeviceSettings;
use crate::db::Db;
use crate::error::{StoreError, TransportError};
use crate::mqtt::{CommandTransport, DeviceId};
use crate::publish::CommandPublisher;
use crate::store::{AuditEntry, DeviceConfig, HardwareStatus, SensorReading, StateStore};

pub const T0: i64 = 1_700_000_000;

pub fn dev(id: &str) -> DeviceId {
    DeviceId::new(id).unwrap()
}

pub fn sample_settings() -> DeviceSettings {
    DeviceSettings {
        watering_duration: 300,
        watering_interval: 30,
        watering_enabled: true,
        watering_times: vec![25200, 61200],
        wifi_ssid: "Flamingo".into(),
        wifi_password: "123456789".into(),
        mqtt_host: "broker.hivemq.com".into(),
        mqtt_port: 1883,
        mqtt_username: "".into(),
        mqtt_password: "".into(),
        mqtt_client_name: "SmartGarden-82FA".into(),
    }
}

// ---------------------------------------------------------------------------
// Transport double
// ---------------------------------------------------------------------------

/// Records every publish; can be switched into a failing mode.
#[derive(Default)]
pub struct RecordingTransport {
    sent: Mutex<Vec<(String, Value)>>,
    fail: AtomicBool,
}

impl RecordingTransport {
    pub fn failing() -> Self {
        let t = Self::default();
        t.fail.store(true, Ordering::SeqCst);
        t
    }

    pub fn sent(&self) -> Vec<(String, Value)> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl CommandTransport for RecordingTransport {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), TransportError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(TransportError::Unavailable("broker unreachable".into()));
        }
        let json: Value = serde_json::from_slice(&payload)?;
        self.sent.lock().unwrap().push((topic.to_string(), json));
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Store double
// ---------------------------------------------------------------------------

/// Delegates to an in-memory [`Db`] but fails device-state writes while
/// `broken` is set. Audit and sensor-history writes keep working so tests can
/// tell the two apart.
pub struct BrokenStore {
    pub inner: Db,
    pub broken: AtomicBool,
}

impl BrokenStore {
    pub async fn new() -> Self {
        Self {
            inner: Db::memory().await,
            broken: AtomicBool::new(true),
        }
    }

    fn check(&self) -> Result<(), StoreError> {
        if self.broken.load(Ordering::SeqCst) {
            Err(StoreError::Unavailable("store offline".into()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl StateStore for BrokenStore {
    async fn upsert_status(&self, status: &HardwareStatus) -> Result<(), StoreError> {
        self.check()?;
        self.inner.upsert_status(status).await
    }

    async fn set_moisture(&self, id: &DeviceId, index: u32, value: bool) -> Result<bool, StoreError> {
        self.check()?;
        self.inner.set_moisture(id, index, value).await
    }

    async fn set_valve(&self, id: &DeviceId, index: u32, value: bool) -> Result<bool, StoreError> {
        self.check()?;
        self.inner.set_valve(id, index, value).await
    }

    async fn set_uptime(&self, id: &DeviceId, uptime: i64) -> Result<bool, StoreError> {
        self.check()?;
        self.inner.set_uptime(id, uptime).await
    }

    async fn find_status(&self, id: &DeviceId) -> Result<Option<HardwareStatus>, StoreError> {
        self.check()?;
        self.inner.find_status(id).await
    }

    async fn upsert_config(&self, config: &DeviceConfig) -> Result<(), StoreError> {
        self.check()?;
        self.inner.upsert_config(config).await
    }

    async fn find_config(&self, id: &DeviceId) -> Result<Option<DeviceConfig>, StoreError> {
        self.check()?;
        self.inner.find_config(id).await
    }

    async fn insert_sensor_reading(&self, reading: &SensorReading) -> Result<(), StoreError> {
        self.inner.insert_sensor_reading(reading).await
    }

    async fn recent_sensor_readings(
        &self,
        id: &DeviceId,
        limit: i64,
    ) -> Result<Vec<SensorReading>, StoreError> {
        self.inner.recent_sensor_readings(id, limit).await
    }

    async fn insert_audit(&self, entry: &AuditEntry) -> Result<(), StoreError> {
        self.inner.insert_audit(entry).await
    }
}

// ---------------------------------------------------------------------------
// Wiring
// ---------------------------------------------------------------------------

/// An in-memory store, a recording transport and a manual clock at [`T0`].
pub struct Harness {
    pub db: Db,
    pub transport: Arc<RecordingTransport>,
    pub clock: Arc<ManualClock>,
}

impl Harness {
    pub async fn new() -> Self {
        Self {
            db: Db::memory().await,
            transport: Arc::new(RecordingTransport::default()),
            clock: Arc::new(ManualClock::new(T0)),
        }
    }

    pub fn store(&self) -> Arc<dyn StateStore> {
        Arc::new(self.db.clone())
    }

    pub fn publisher(&self) -> CommandPublisher {
        CommandPublisher::new(self.transport.clone(), self.store(), self.clock.clone())
    }
}
