//! Error taxonomy for the sync core and its two collaborators.

use thiserror::Error;

use crate::mqtt::DeviceId;

pub type Result<T, E = SyncError> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("malformed topic '{0}'")]
    MalformedTopic(String),

    #[error("could not decode payload: {0}")]
    DecodeError(String),

    #[error("unknown command '{0}'")]
    UnknownCommand(String),

    #[error("reconciliation failed for device {device_id}: {cause}")]
    ReconciliationFailed {
        device_id: DeviceId,
        #[source]
        cause: StoreError,
    },

    #[error("publish to '{topic}' failed: {cause}")]
    PublishFailed {
        topic: String,
        #[source]
        cause: TransportError,
    },

    #[error("device {0} not found")]
    DeviceNotFound(DeviceId),

    /// Store failure on a read path (status/config/history lookups).
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

impl SyncError {
    pub(crate) fn decode(e: impl std::fmt::Display) -> Self {
        Self::DecodeError(e.to_string())
    }

    /// Decode and topic errors end processing of a single message; they are
    /// logged and dropped rather than surfaced to the transport.
    pub fn is_terminal_for_message(&self) -> bool {
        matches!(
            self,
            Self::MalformedTopic(_) | Self::DecodeError(_) | Self::UnknownCommand(_)
        )
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("corrupt {column} column: {detail}")]
    Corrupt { column: &'static str, detail: String },

    /// Raised only by test doubles.
    #[cfg(test)]
    #[error("{0}")]
    Unavailable(String),
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("mqtt client error: {0}")]
    Client(#[from] rumqttc::ClientError),

    #[error("could not encode command: {0}")]
    Encode(#[from] serde_json::Error),

    /// Raised only by test doubles.
    #[cfg(test)]
    #[error("{0}")]
    Unavailable(String),
}
