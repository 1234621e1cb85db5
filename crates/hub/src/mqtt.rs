//! Topic addressing and the broker connection.
//!
//! Devices publish on `/<device_id>/feedback` and `/<device_id>/sensor-data`
//! and listen on `/<device_id>/commands`. The hub owns exactly one broker
//! connection, wrapped in [`MqttLink`], which is handed to the publisher as a
//! [`CommandTransport`].

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use rumqttc::{AsyncClient, EventLoop, MqttOptions, QoS};
use serde::Serialize;

use crate::config::MqttSettings;
use crate::error::{SyncError, TransportError};

pub const FEEDBACK_FILTER: &str = "/+/feedback";
pub const SENSOR_DATA_FILTER: &str = "/+/sensor-data";

// ---------------------------------------------------------------------------
// Device identity
// ---------------------------------------------------------------------------

/// Primary key for all per-device state, taken from the topic path.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct DeviceId(String);

impl DeviceId {
    /// Rejects empty ids and anything that cannot sit in a single topic
    /// segment (`/`, or the `+`/`#` wildcards).
    pub fn new(id: impl Into<String>) -> Option<Self> {
        let id = id.into();
        if id.trim().is_empty() || id.contains(&['/', '+', '#'][..]) {
            None
        } else {
            Some(Self(id))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ---------------------------------------------------------------------------
// Topic helpers
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TopicKind {
    Feedback,
    SensorData,
    Commands,
    Other(String),
}

/// Split `/<device_id>/<kind>` into its parts. The device id is the first
/// segment after the leading separator.
pub fn parse_topic(topic: &str) -> Result<(DeviceId, TopicKind), SyncError> {
    let trimmed = topic.strip_prefix('/').unwrap_or(topic);
    let parts: Vec<&str> = trimmed.split('/').collect();
    if parts.len() < 2 {
        return Err(SyncError::MalformedTopic(topic.to_string()));
    }

    let device_id =
        DeviceId::new(parts[0]).ok_or_else(|| SyncError::MalformedTopic(topic.to_string()))?;

    let kind = match &parts[1..] {
        ["feedback"] => TopicKind::Feedback,
        ["sensor-data"] => TopicKind::SensorData,
        ["commands"] => TopicKind::Commands,
        rest => TopicKind::Other(rest.join("/")),
    };

    Ok((device_id, kind))
}

pub fn commands_topic(device_id: &DeviceId) -> String {
    format!("/{device_id}/commands")
}

#[cfg(test)]
pub fn feedback_topic(device_id: &DeviceId) -> String {
    format!("/{device_id}/feedback")
}

#[cfg(test)]
pub fn sensor_data_topic(device_id: &DeviceId) -> String {
    format!("/{device_id}/sensor-data")
}

// ---------------------------------------------------------------------------
// Transport
// ---------------------------------------------------------------------------

/// Outbound half of the broker connection.
#[async_trait]
pub trait CommandTransport: Send + Sync {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), TransportError>;
}

/// The hub's single broker connection. The paired [`EventLoop`] must be
/// polled by the caller for anything to move.
#[derive(Clone)]
pub struct MqttLink {
    client: AsyncClient,
}

impl MqttLink {
    pub fn connect(settings: &MqttSettings) -> (Self, EventLoop) {
        let mut options = MqttOptions::new(&settings.client_id, &settings.host, settings.port);
        options.set_keep_alive(Duration::from_secs(settings.keep_alive_secs));
        if let Some(username) = &settings.username {
            options.set_credentials(username, settings.password.clone().unwrap_or_default());
        }

        let (client, eventloop) = AsyncClient::new(options, settings.channel_capacity);
        (Self { client }, eventloop)
    }

    /// (Re)subscribe to both device topic patterns. Called on every ConnAck
    /// since a clean session drops subscriptions.
    pub async fn subscribe(&self) -> Result<(), TransportError> {
        self.client
            .subscribe(FEEDBACK_FILTER, QoS::AtLeastOnce)
            .await?;
        self.client
            .subscribe(SENSOR_DATA_FILTER, QoS::AtLeastOnce)
            .await?;
        Ok(())
    }

    pub async fn stop(&self) -> Result<(), TransportError> {
        self.client.disconnect().await?;
        Ok(())
    }
}

#[async_trait]
impl CommandTransport for MqttLink {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), TransportError> {
        self.client
            .publish(topic, QoS::AtLeastOnce, false, payload)
            .await?;
        Ok(())
    }
}

// ===========================================================================
// Tests
// ===========================================================================
