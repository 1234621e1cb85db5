use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Instant;
use time::OffsetDateTime;
use tokio::sync::RwLock;

/// Maximum number of events retained in the ring buffer.
const MAX_EVENTS: usize = 200;

// ---------------------------------------------------------------------------
// Public type alias
// ---------------------------------------------------------------------------

pub type SharedState = Arc<RwLock<HubState>>;

// ---------------------------------------------------------------------------
// Core types
// ---------------------------------------------------------------------------

/// Process diagnostics. Device state lives in the store, never here.
pub struct HubState {
    pub started_at: Instant,
    pub mqtt_connected: bool,
    pub counters: Counters,
    pub devices: HashMap<String, DeviceSeen>,
    pub events: VecDeque<HubEvent>,
}

#[derive(Clone, Copy, Default, Serialize)]
pub struct Counters {
    pub feedback_applied: u64,
    pub feedback_dropped: u64,
    pub feedback_failed: u64,
    pub sensor_readings: u64,
    pub commands_published: u64,
}

#[derive(Clone, Serialize)]
pub struct DeviceSeen {
    #[serde(with = "time::serde::rfc3339")]
    pub last_seen: OffsetDateTime,
    pub last_message: String,
}

#[derive(Clone, Serialize)]
pub struct HubEvent {
    #[serde(with = "time::serde::rfc3339")]
    pub ts: OffsetDateTime,
    pub kind: EventKind,
    pub detail: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Feedback,
    SensorData,
    Command,
    Error,
    System,
}

// ---------------------------------------------------------------------------
// JSON response (what the API returns)
// ---------------------------------------------------------------------------

#[derive(Serialize)]
pub struct HealthResponse {
    pub uptime_secs: u64,
    pub mqtt_connected: bool,
    pub counters: Counters,
    pub devices: HashMap<String, DeviceSeen>,
    pub events: Vec<HubEvent>,
}

// ---------------------------------------------------------------------------
// Construction & mutation
// ---------------------------------------------------------------------------

impl Default for HubState {
    fn default() -> Self {
        Self::new()
    }
}

impl HubState {
    pub fn new() -> Self {
        Self {
            started_at: Instant::now(),
            mqtt_connected: false,
            counters: Counters::default(),
            devices: HashMap::new(),
            events: VecDeque::with_capacity(MAX_EVENTS),
        }
    }

    pub fn shared() -> SharedState {
        Arc::new(RwLock::new(Self::new()))
    }

    /// A feedback message was decoded and reconciled.
    pub fn record_feedback(&mut self, device_id: &str, tag: &str) {
        self.counters.feedback_applied += 1;
        self.touch(device_id, tag);
        self.push_event(EventKind::Feedback, format!("{device_id}: {tag}"));
    }

    /// A message was dropped before reaching the store (bad topic or payload).
    pub fn record_dropped(&mut self, detail: String) {
        self.counters.feedback_dropped += 1;
        self.push_event(EventKind::Error, detail);
    }

    /// A decoded message could not be applied.
    pub fn record_failed(&mut self, detail: String) {
        self.counters.feedback_failed += 1;
        self.push_event(EventKind::Error, detail);
    }

    pub fn record_sensor_data(&mut self, device_id: &str) {
        self.counters.sensor_readings += 1;
        self.touch(device_id, "sensor-data");
        self.push_event(EventKind::SensorData, device_id.to_string());
    }

    pub fn record_command(&mut self, topic: &str, command: &str) {
        self.counters.commands_published += 1;
        self.push_event(EventKind::Command, format!("{topic}: {command}"));
    }

    pub fn record_error(&mut self, detail: String) {
        self.push_event(EventKind::Error, detail);
    }

    pub fn record_system(&mut self, detail: String) {
        self.push_event(EventKind::System, detail);
    }

    pub fn set_connected(&mut self, connected: bool) {
        if self.mqtt_connected != connected {
            self.mqtt_connected = connected;
            let word = if connected { "connected" } else { "disconnected" };
            self.push_event(EventKind::System, format!("mqtt {word}"));
        }
    }

    /// Build the JSON-serialisable health snapshot, newest events first.
    pub fn to_health(&self) -> HealthResponse {
        HealthResponse {
            uptime_secs: self.started_at.elapsed().as_secs(),
            mqtt_connected: self.mqtt_connected,
            counters: self.counters,
            devices: self.devices.clone(),
            events: self.events.iter().rev().cloned().collect(),
        }
    }

    fn touch(&mut self, device_id: &str, message: &str) {
        self.devices.insert(
            device_id.to_string(),
            DeviceSeen {
                last_seen: OffsetDateTime::now_utc(),
                last_message: message.to_string(),
            },
        );
    }

    fn push_event(&mut self, kind: EventKind, detail: String) {
        if self.events.len() >= MAX_EVENTS {
            self.events.pop_front();
        }
        self.events.push_back(HubEvent {
            ts: OffsetDateTime::now_utc(),
            kind,
            detail,
        });
    }
}
