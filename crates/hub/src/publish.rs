//! Outbound commands: serialize, publish on the device's command topic, and
//! record the send in the audit log.

use std::sync::Arc;

use tracing::{info, warn};

use crate::clock::Clock;
use crate::command::DeviceCommand;
use crate::error::{SyncError, TransportError};
use crate::mqtt::{commands_topic, parse_topic, CommandTransport, DeviceId};
use crate::state::SharedState;
use crate::store::{AuditEntry, AuditTag, StateStore};

#[derive(Clone)]
pub struct CommandPublisher {
    transport: Arc<dyn CommandTransport>,
    store: Arc<dyn StateStore>,
    clock: Arc<dyn Clock>,
    health: Option<SharedState>,
}

impl CommandPublisher {
    pub fn new(
        transport: Arc<dyn CommandTransport>,
        store: Arc<dyn StateStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            transport,
            store,
            clock,
            health: None,
        }
    }

    /// Count successful publishes in the hub's health state.
    pub fn with_health(mut self, health: SharedState) -> Self {
        self.health = Some(health);
        self
    }

    /// Publish `command` to `/<device_id>/commands`.
    pub async fn send(&self, device_id: &DeviceId, command: &DeviceCommand) -> Result<(), SyncError> {
        self.publish(&commands_topic(device_id), command).await
    }

    /// Publish first, then audit. A failed publish leaves no audit entry and
    /// is not retried; a failed audit write is logged and swallowed.
    pub async fn publish(&self, topic: &str, command: &DeviceCommand) -> Result<(), SyncError> {
        let failed = |cause: TransportError| SyncError::PublishFailed {
            topic: topic.to_string(),
            cause,
        };

        let body = serde_json::to_value(command).map_err(|e| failed(e.into()))?;
        let bytes = serde_json::to_vec(&body).map_err(|e| failed(e.into()))?;

        self.transport
            .publish(topic, bytes)
            .await
            .map_err(failed)?;

        let sent_at = self.clock.now_unix();
        let name = body["command"].as_str().unwrap_or_default().to_string();
        info!(topic, command = %name, "command published");
        if let Some(health) = &self.health {
            health.write().await.record_command(topic, &name);
        }

        let entry = AuditEntry {
            tag: AuditTag::PublishFromCloud,
            device_id: parse_topic(topic).ok().map(|(id, _)| id),
            topic: topic.to_string(),
            payload: body,
            created_at: sent_at,
        };
        if let Err(e) = self.store.insert_audit(&entry).await {
            warn!(topic, "audit write for published command failed: {e}");
        }

        Ok(())
    }
}

// ===========================================================================
// Tests
// ===========================================================================
