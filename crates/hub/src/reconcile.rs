//! Turns validated feedback into store mutations.
//!
//! Status snapshots and config reports create records; moisture, valve and
//! uptime updates only ever touch an existing status row.

use std::sync::Arc;

use tracing::{debug, info};

use crate::clock::Clock;
use crate::command::{DeviceSettings, FeedbackPayload};
use crate::error::{StoreError, SyncError};
use crate::mqtt::DeviceId;
use crate::store::{DeviceConfig, HardwareStatus, StateStore};

#[derive(Clone)]
pub struct Reconciler {
    store: Arc<dyn StateStore>,
    clock: Arc<dyn Clock>,
}

impl Reconciler {
    pub fn new(store: Arc<dyn StateStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Route a decoded payload to its routine. Returns `false` when an
    /// update-only routine found no status row to update.
    pub async fn apply(&self, device_id: &DeviceId, payload: FeedbackPayload) -> Result<bool, SyncError> {
        match payload {
            FeedbackPayload::StatusSnapshot {
                uptime,
                valve,
                moisture,
            } => {
                self.apply_status_snapshot(device_id, uptime, valve, moisture)
                    .await?;
                Ok(true)
            }
            FeedbackPayload::MoistureReading { sensor, moisture } => {
                self.apply_moisture_reading(device_id, sensor, moisture).await
            }
            FeedbackPayload::ValveState { valve, status } => {
                self.apply_valve_state(device_id, valve, status).await
            }
            FeedbackPayload::Uptime { uptime } => self.apply_uptime(device_id, uptime).await,
            FeedbackPayload::ConfigReport(settings) => {
                self.apply_config_report(device_id, settings).await?;
                Ok(true)
            }
        }
    }

    pub async fn apply_status_snapshot(
        &self,
        device_id: &DeviceId,
        uptime: i64,
        valve: Vec<bool>,
        moisture: Vec<bool>,
    ) -> Result<(), SyncError> {
        let status = HardwareStatus {
            device_id: device_id.clone(),
            valve,
            moisture,
            uptime,
            updated_at: self.clock.now_unix(),
        };
        self.store
            .upsert_status(&status)
            .await
            .map_err(|e| failed(device_id, e))?;
        info!(device = %device_id, uptime, "status snapshot stored");
        Ok(())
    }

    pub async fn apply_moisture_reading(
        &self,
        device_id: &DeviceId,
        sensor: u32,
        moisture: bool,
    ) -> Result<bool, SyncError> {
        let hit = self
            .store
            .set_moisture(device_id, sensor, moisture)
            .await
            .map_err(|e| failed(device_id, e))?;
        log_update(device_id, "moisture", hit);
        Ok(hit)
    }

    pub async fn apply_valve_state(
        &self,
        device_id: &DeviceId,
        valve: u32,
        status: bool,
    ) -> Result<bool, SyncError> {
        let hit = self
            .store
            .set_valve(device_id, valve, status)
            .await
            .map_err(|e| failed(device_id, e))?;
        log_update(device_id, "valve", hit);
        Ok(hit)
    }

    pub async fn apply_uptime(&self, device_id: &DeviceId, uptime: i64) -> Result<bool, SyncError> {
        let hit = self
            .store
            .set_uptime(device_id, uptime)
            .await
            .map_err(|e| failed(device_id, e))?;
        log_update(device_id, "uptime", hit);
        Ok(hit)
    }

    pub async fn apply_config_report(
        &self,
        device_id: &DeviceId,
        settings: DeviceSettings,
    ) -> Result<(), SyncError> {
        let config = DeviceConfig {
            device_id: device_id.clone(),
            settings,
            updated_at: self.clock.now_unix(),
        };
        self.store
            .upsert_config(&config)
            .await
            .map_err(|e| failed(device_id, e))?;
        info!(device = %device_id, "config stored");
        Ok(())
    }
}

fn failed(device_id: &DeviceId, cause: StoreError) -> SyncError {
    SyncError::ReconciliationFailed {
        device_id: device_id.clone(),
        cause,
    }
}

fn log_update(device_id: &DeviceId, field: &str, hit: bool) {
    if hit {
        debug!(device = %device_id, field, "status updated");
    } else {
        debug!(device = %device_id, field, "no status row yet; update skipped");
    }
}

// ===========================================================================
// Tests
// ===========================================================================
