//! Wire shapes exchanged with devices.
//!
//! Inbound feedback is a JSON object tagged by `command`; outbound commands
//! use the same tagging. Decoding is two-step so an unrecognised tag is told
//! apart from a recognised tag with a bad body.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::SyncError;

// ---------------------------------------------------------------------------
// Device settings
// ---------------------------------------------------------------------------

/// Settings as stored and served by the hub. Inbound reports may use the
/// firmware's own key names, accepted here as aliases.

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceSettings {
    pub watering_duration: i64,
    #[serde(alias = "watering_intreval")]
    pub watering_interval: i64,
    pub watering_enabled: bool,
    pub watering_times: Vec<i64>,
    #[serde(alias = "ssid")]
    pub wifi_ssid: String,
    #[serde(alias = "password")]
    pub wifi_password: String,
    #[serde(alias = "mqtt_server")]
    pub mqtt_host: String,
    pub mqtt_port: u16,
    pub mqtt_username: String,
    pub mqtt_password: String,
    pub mqtt_client_name: String,
}

/// Settings as sent in `set_config`. The firmware saves the body verbatim
/// and reads `ssid`, `password` and `mqtt_server` back out of it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FirmwareSettings {
    pub watering_duration: i64,
    #[serde(alias = "watering_intreval")]
    pub watering_interval: i64,
    pub watering_enabled: bool,
    pub watering_times: Vec<i64>,
    #[serde(rename = "ssid", alias = "wifi_ssid")]
    pub wifi_ssid: String,
    #[serde(rename = "password", alias = "wifi_password")]
    pub wifi_password: String,
    #[serde(rename = "mqtt_server", alias = "mqtt_host")]
    pub mqtt_host: String,
    pub mqtt_port: u16,
    pub mqtt_username: String,
    pub mqtt_password: String,
    pub mqtt_client_name: String,
}

impl From<DeviceSettings> for FirmwareSettings {
    fn from(s: DeviceSettings) -> Self {
        Self {
            watering_duration: s.watering_duration,
            watering_interval: s.watering_interval,
            watering_enabled: s.watering_enabled,
            watering_times: s.watering_times,
            wifi_ssid: s.wifi_ssid,
            wifi_password: s.wifi_password,
            mqtt_host: s.mqtt_host,
            mqtt_port: s.mqtt_port,
            mqtt_username: s.mqtt_username,
            mqtt_password: s.mqtt_password,
            mqtt_client_name: s.mqtt_client_name,
        }
    }
}

// ---------------------------------------------------------------------------
// Inbound feedback
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "command")]
pub enum FeedbackPayload {
    /// Full snapshot; the authoritative resync path.
    #[serde(rename = "status")]
    StatusSnapshot {
        uptime: i64,
        valve: Vec<bool>,
        moisture: Vec<bool>,
    },
    #[serde(rename = "moisture_sensor")]
    MoistureReading { sensor: u32, moisture: bool },
    #[serde(rename = "valve_status")]
    ValveState { valve: u32, status: bool },
    #[serde(rename = "uptime")]
    Uptime { uptime: i64 },
    #[serde(rename = "config")]
    ConfigReport(DeviceSettings),
}

impl FeedbackPayload {
    pub const TAGS: [&'static str; 5] = [
        "status",
        "moisture_sensor",
        "valve_status",
        "uptime",
        "config",
    ];

    pub fn tag(&self) -> &'static str {
        match self {
            Self::StatusSnapshot { .. } => "status",
            Self::MoistureReading { .. } => "moisture_sensor",
            Self::ValveState { .. } => "valve_status",
            Self::Uptime { .. } => "uptime",
            Self::ConfigReport(_) => "config",
        }
    }
}

/// A decoded feedback message together with the JSON it came from, which is
/// what gets written to the audit log.
#[derive(Debug, Clone)]
pub struct DecodedFeedback {
    pub payload: FeedbackPayload,
    pub raw: Value,
}

pub fn decode_feedback(bytes: &[u8]) -> Result<DecodedFeedback, SyncError> {
    let raw: Value = serde_json::from_slice(bytes).map_err(SyncError::decode)?;

    let tag = match raw.get("command") {
        Some(Value::String(tag)) => tag.as_str(),
        Some(other) => {
            return Err(SyncError::DecodeError(format!(
                "command field is not a string: {other}"
            )))
        }
        None if raw.is_object() => {
            return Err(SyncError::DecodeError("missing command field".into()))
        }
        None => return Err(SyncError::DecodeError("payload is not a JSON object".into())),
    };

    if !FeedbackPayload::TAGS.iter().any(|known| *known == tag) {
        return Err(SyncError::UnknownCommand(tag.to_string()));
    }

    let payload = FeedbackPayload::deserialize(&raw).map_err(SyncError::decode)?;
    Ok(DecodedFeedback { payload, raw })
}

// ---------------------------------------------------------------------------
// Inbound sensor data
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SensorDataMsg {
    pub valve: Vec<bool>,
    pub moisture: Vec<bool>,
    /// Device-reported name. The topic-derived id wins when they differ.
    pub client_name: String,
}

pub fn decode_sensor_data(bytes: &[u8]) -> Result<SensorDataMsg, SyncError> {
    serde_json::from_slice(bytes).map_err(SyncError::decode)
}

// ---------------------------------------------------------------------------
// Outbound commands
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum DeviceCommand {
    OpenValve { valve: u32 },
    CloseValve { valve: u32 },
    SetConfig(FirmwareSettings),
    Restart,
    GetStatus,
    GetUptime,
    GetConfig,
    GetValveStatus { valve: u32 },
    GetMoistureSensor { sensor: u32 },
    /// Deep-sleep for `time` seconds.
    Shutdown { time: u32 },
}

impl DeviceCommand {
    pub fn valve(valve: u32, open: bool) -> Self {
        if open {
            Self::OpenValve { valve }
        } else {
            Self::CloseValve { valve }
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
