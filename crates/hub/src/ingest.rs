use std::sync::Arc;

use tracing::debug;

use crate::clock::Clock;
use crate::command::SensorDataMsg;
use crate::error::SyncError;
use crate::mqtt::DeviceId;
use crate::store::{SensorReading, StateStore};

/// Appends sensor-data messages to the reading history. No dedup: a
/// redelivered message becomes a second row.
#[derive(Clone)]
pub struct SensorIngestor {
    store: Arc<dyn StateStore>,
    clock: Arc<dyn Clock>,
}

impl SensorIngestor {
    pub fn new(store: Arc<dyn StateStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    pub async fn ingest(&self, device_id: &DeviceId, msg: SensorDataMsg) -> Result<(), SyncError> {
        if msg.client_name != device_id.as_str() {
            debug!(device = %device_id, client_name = %msg.client_name, "client name differs from topic id");
        }
        let reading = SensorReading {
            device_id: device_id.clone(),
            valve: msg.valve,
            moisture: msg.moisture,
            client_name: msg.client_name,
            created_at: self.clock.now_unix(),
        };
        self.store
            .insert_sensor_reading(&reading)
            .await
            .map_err(|cause| SyncError::ReconciliationFailed {
                device_id: device_id.clone(),
                cause,
            })
    }
}
