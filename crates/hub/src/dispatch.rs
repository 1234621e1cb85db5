//! Inbound message handling: topic → device id, payload → typed feedback,
//! feedback → audit entry then store mutation.

use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, error, info, warn};

use crate::clock::Clock;
use crate::command::{decode_feedback, decode_sensor_data};
use crate::error::SyncError;
use crate::ingest::SensorIngestor;
use crate::mqtt::{parse_topic, DeviceId, TopicKind};
use crate::reconcile::Reconciler;
use crate::state::SharedState;
use crate::store::{AuditEntry, AuditTag, StateStore};

#[derive(Clone)]
pub struct Dispatcher {
    store: Arc<dyn StateStore>,
    clock: Arc<dyn Clock>,
    reconciler: Reconciler,
    ingestor: SensorIngestor,
    health: SharedState,
}

impl Dispatcher {
    pub fn new(store: Arc<dyn StateStore>, clock: Arc<dyn Clock>, health: SharedState) -> Self {
        Self {
            reconciler: Reconciler::new(store.clone(), clock.clone()),
            ingestor: SensorIngestor::new(store.clone(), clock.clone()),
            store,
            clock,
            health,
        }
    }

    /// Entry point for the subscription loop. Never fails: every error is
    /// logged, counted and dropped here so one bad message cannot stall the
    /// next.
    pub async fn route(&self, topic: &str, payload: &[u8]) {
        let result = match parse_topic(topic) {
            Ok((device_id, TopicKind::Feedback)) => {
                self.feedback(&device_id, topic, payload).await.map(|_| ())
            }
            Ok((device_id, TopicKind::SensorData)) => {
                self.sensor_data(&device_id, payload).await
            }
            Ok((_, kind)) => {
                debug!(topic, ?kind, "ignoring message on unhandled topic");
                return;
            }
            Err(e) => Err(e),
        };

        let Err(e) = result else { return };
        if e.is_terminal_for_message() {
            warn!(topic, "dropping message: {e}");
            self.health.write().await.record_dropped(format!("{topic}: {e}"));
        } else {
            error!(topic, "message not applied: {e}");
            self.health.write().await.record_failed(format!("{topic}: {e}"));
        }
    }

    /// Handle one message from `/{device}/feedback`. Returns whether the
    /// store was changed; update-only payloads for unknown devices return
    /// `Ok(false)`.
    pub async fn handle_feedback(&self, topic: &str, payload: &[u8]) -> Result<bool, SyncError> {
        let (device_id, kind) = parse_topic(topic)?;
        if kind != TopicKind::Feedback {
            return Err(SyncError::MalformedTopic(topic.to_string()));
        }
        self.feedback(&device_id, topic, payload).await
    }

    /// Handle one message from `/{device}/sensor-data`. Counted in health
    /// the same as a routed message.
    pub async fn handle_sensor_data(&self, topic: &str, payload: &[u8]) -> Result<(), SyncError> {
        let (device_id, kind) = parse_topic(topic)?;
        if kind != TopicKind::SensorData {
            return Err(SyncError::MalformedTopic(topic.to_string()));
        }
        self.sensor_data(&device_id, payload).await
    }

    async fn feedback(&self, device_id: &DeviceId, topic: &str, payload: &[u8]) -> Result<bool, SyncError> {
        let decoded = decode_feedback(payload)?;
        let tag = decoded.payload.tag();
        info!(device = %device_id, command = tag, "feedback received");

        // Audit precedes reconciliation and is kept even if it fails.
        self.audit(device_id, topic, decoded.raw).await;

        let applied = self.reconciler.apply(device_id, decoded.payload).await?;
        self.health
            .write()
            .await
            .record_feedback(device_id.as_str(), tag);
        Ok(applied)
    }

    async fn sensor_data(&self, device_id: &DeviceId, payload: &[u8]) -> Result<(), SyncError> {
        let msg = decode_sensor_data(payload)?;
        self.ingestor.ingest(device_id, msg).await?;
        self.health
            .write()
            .await
            .record_sensor_data(device_id.as_str());
        Ok(())
    }

    async fn audit(&self, device_id: &DeviceId, topic: &str, raw: Value) {
        let entry = AuditEntry {
            tag: AuditTag::Feedback,
            device_id: Some(device_id.clone()),
            topic: topic.to_string(),
            payload: raw,
            created_at: self.clock.now_unix(),
        };
        if let Err(e) = self.store.insert_audit(&entry).await {
            warn!(device = %device_id, "feedback audit write failed: {e}");
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
