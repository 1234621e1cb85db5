//! Device-side view of the wire protocol: commands in, feedback and sensor
//! data out.

use serde::{Deserialize, Serialize};

/// Stored config, keyed the way the firmware keys it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settings {
    pub watering_duration: i64,
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

impl Settings {
    /// Factory defaults the firmware ships with.
    pub fn factory(client_name: &str, mqtt_host: &str, mqtt_port: u16) -> Self {
        Self {
            watering_duration: 300,
            watering_interval: 30,
            watering_enabled: true,
            watering_times: vec![7 * 3600, 17 * 3600],
            wifi_ssid: "Flamingo".into(),
            wifi_password: String::new(),
            mqtt_host: mqtt_host.into(),
            mqtt_port,
            mqtt_username: String::new(),
            mqtt_password: String::new(),
            mqtt_client_name: client_name.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum Command {
    OpenValve { valve: u32 },
    CloseValve { valve: u32 },
    SetConfig(Settings),
    Restart,
    GetStatus,
    GetUptime,
    GetConfig,
    GetValveStatus { valve: u32 },
    GetMoistureSensor { sensor: u32 },
    Shutdown { time: u32 },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "command")]
pub enum Feedback {
    #[serde(rename = "status")]
    Status {
        uptime: i64,
        valve: Vec<bool>,
        moisture: Vec<bool>,
    },
    #[serde(rename = "moisture_sensor")]
    MoistureSensor { sensor: u32, moisture: bool },
    #[serde(rename = "valve_status")]
    ValveStatus { valve: u32, status: bool },
    #[serde(rename = "uptime")]
    Uptime { uptime: i64 },
    #[serde(rename = "config")]
    Config(Settings),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SensorData {
    pub valve: Vec<bool>,
    pub moisture: Vec<bool>,
    pub client_name: String,
}

pub fn commands_topic(device_id: &str) -> String {
    format!("/{device_id}/commands")
}

pub fn feedback_topic(device_id: &str) -> String {
    format!("/{device_id}/feedback")
}

pub fn sensor_data_topic(device_id: &str) -> String {
    format!("/{device_id}/sensor-data")
}
