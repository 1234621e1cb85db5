//! Read side of device state, with the re-poll rule for stale status.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::clock::Clock;
use crate::command::DeviceCommand;
use crate::error::SyncError;
use crate::mqtt::DeviceId;
use crate::publish::CommandPublisher;
use crate::store::{DeviceConfig, HardwareStatus, SensorReading, StateStore};

/// Status older than this (strictly) triggers a `get_status` poll.
pub const DEFAULT_STALE_AFTER_SECS: i64 = 30;

/// A status read. `poll` is set when the read kicked off a background
/// `get_status` publish; callers are free to drop it.
#[derive(Debug)]
pub struct StatusRead {
    pub status: HardwareStatus,
    pub poll: Option<JoinHandle<()>>,
}

#[derive(Clone)]
pub struct StatusService {
    store: Arc<dyn StateStore>,
    clock: Arc<dyn Clock>,
    publisher: CommandPublisher,
    stale_after: i64,
}

impl StatusService {
    pub fn new(
        store: Arc<dyn StateStore>,
        clock: Arc<dyn Clock>,
        publisher: CommandPublisher,
        stale_after: i64,
    ) -> Self {
        Self {
            store,
            clock,
            publisher,
            stale_after,
        }
    }

    /// Return the stored status as-is. When it is older than the threshold a
    /// poll is sent in the background; its outcome never affects this read.
    pub async fn read_status(&self, device_id: &DeviceId) -> Result<StatusRead, SyncError> {
        let status = self
            .store
            .find_status(device_id)
            .await?
            .ok_or_else(|| SyncError::DeviceNotFound(device_id.clone()))?;

        let age = self.clock.now_unix() - status.updated_at;
        let poll = if age > self.stale_after {
            debug!(device = %device_id, age, "status stale; requesting refresh");
            Some(self.spawn_poll(device_id.clone()))
        } else {
            None
        };

        Ok(StatusRead { status, poll })
    }

    pub async fn read_config(&self, device_id: &DeviceId) -> Result<DeviceConfig, SyncError> {
        self.store
            .find_config(device_id)
            .await?
            .ok_or_else(|| SyncError::DeviceNotFound(device_id.clone()))
    }

    pub async fn recent_readings(
        &self,
        device_id: &DeviceId,
        limit: i64,
    ) -> Result<Vec<SensorReading>, SyncError> {
        Ok(self.store.recent_sensor_readings(device_id, limit).await?)
    }

    fn spawn_poll(&self, device_id: DeviceId) -> JoinHandle<()> {
        let publisher = self.publisher.clone();
        tokio::spawn(async move {
            if let Err(e) = publisher.send(&device_id, &DeviceCommand::GetStatus).await {
                warn!(device = %device_id, "status poll failed: {e}");
            }
        })
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::AuditTag;
    use crate::testing::{dev, sample_settings, Harness, RecordingTransport, T0};
    use serde_json::json;

    fn service(h: &Harness) -> StatusService {
        StatusService::new(
            h.store(),
            h.clock.clone(),
            h.publisher(),
            DEFAULT_STALE_AFTER_SECS,
        )
    }

    async fn seed(h: &Harness, updated_at: i64) {
        h.db.upsert_status(&HardwareStatus {
            device_id: dev("dev-A"),
            valve: vec![true, false],
            moisture: vec![false, false],
            uptime: 77,
            updated_at,
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn stale_status_triggers_exactly_one_poll() {
        let h = Harness::new().await;
        seed(&h, T0 - 31).await;

        let read = service(&h).read_status(&dev("dev-A")).await.unwrap();
        assert_eq!(read.status.uptime, 77);
        read.poll.expect("poll expected").await.unwrap();

        assert_eq!(
            h.transport.sent(),
            vec![("/dev-A/commands".to_string(), json!({"command": "get_status"}))]
        );
        assert_eq!(h.db.audit_count(AuditTag::PublishFromCloud).await, 1);
    }

    #[tokio::test]
    async fn fresh_status_does_not_poll() {
        let h = Harness::new().await;
        seed(&h, T0 - 10).await;

        let read = service(&h).read_status(&dev("dev-A")).await.unwrap();
        assert!(read.poll.is_none());
        assert!(h.transport.sent().is_empty());
    }

    #[tokio::test]
    async fn threshold_is_strict() {
        let h = Harness::new().await;
        seed(&h, T0 - DEFAULT_STALE_AFTER_SECS).await;

        let read = service(&h).read_status(&dev("dev-A")).await.unwrap();
        assert!(read.poll.is_none());
    }

    #[tokio::test]
    async fn missing_device_is_not_found_and_not_polled() {
        let h = Harness::new().await;

        let err = service(&h).read_status(&dev("nobody")).await.unwrap_err();
        assert!(matches!(err, SyncError::DeviceNotFound(ref id) if id.as_str() == "nobody"));
        assert!(h.transport.sent().is_empty());
    }

    #[tokio::test]
    async fn poll_failure_does_not_affect_read() {
        let h = Harness::new().await;
        seed(&h, T0 - 600).await;
        let publisher = CommandPublisher::new(
            Arc::new(RecordingTransport::failing()),
            h.store(),
            h.clock.clone(),
        );
        let svc = StatusService::new(h.store(), h.clock.clone(), publisher, 30);

        let read = svc.read_status(&dev("dev-A")).await.unwrap();
        read.poll.unwrap().await.unwrap();
        assert_eq!(read.status.valve, vec![true, false]);
        assert_eq!(h.db.audit_count(AuditTag::PublishFromCloud).await, 0);
    }

    #[tokio::test]
    async fn staleness_follows_the_clock() {
        let h = Harness::new().await;
        seed(&h, T0).await;
        let svc = service(&h);

        assert!(svc.read_status(&dev("dev-A")).await.unwrap().poll.is_none());
        h.clock.advance(31);
        assert!(svc.read_status(&dev("dev-A")).await.unwrap().poll.is_some());
    }

    #[tokio::test]
    async fn read_config_maps_absence_to_not_found() {
        let h = Harness::new().await;
        let svc = service(&h);
        assert!(matches!(
            svc.read_config(&dev("dev-A")).await,
            Err(SyncError::DeviceNotFound(_))
        ));

        h.db.upsert_config(&DeviceConfig {
            device_id: dev("dev-A"),
            settings: sample_settings(),
            updated_at: T0,
        })
        .await
        .unwrap();
        assert_eq!(
            svc.read_config(&dev("dev-A")).await.unwrap().settings,
            sample_settings()
        );
    }
}
