//! Simulated garden controller for local development.
//!
//! Models what the hub can observe of a real controller:
//! - Soil wetness per sensor as a random walk with drying drift
//! - Digital moisture flags (wetness above a threshold), as the real
//!   sensors report
//! - Watering response: an open valve wets the sensor with the same index
//! - Uptime, valve states and the stored settings
//!
//! Command handling follows the firmware: every query or state change is
//! answered with one feedback message.

use std::fmt;

use tracing::{info, warn};

use crate::proto::{Command, Feedback, SensorData, Settings};

// ---------------------------------------------------------------------------
// Gaussian approximation (no extra dependency)
// ---------------------------------------------------------------------------

/// Approximate a sample from N(0,1) using the Irwin-Hall method:
/// sum of 12 uniform [0,1) values minus 6.
fn approx_std_normal() -> f64 {
    let mut sum: f64 = 0.0;
    for _ in 0..12 {
        sum += fastrand::f64();
    }
    sum - 6.0
}

// ---------------------------------------------------------------------------
// Scenario presets
// ---------------------------------------------------------------------------

/// Simulation profiles selectable via the `SIM_SCENARIO` env var.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scenario {
    /// Starts mid-range and dries out within a few hours.
    Drying,
    /// Hovers near the threshold; flags flicker occasionally.
    Stable,
    /// Starts soaked and dries slowly.
    Wet,
}

impl Scenario {
    pub fn from_str_lossy(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "stable" => Self::Stable,
            "wet" => Self::Wet,
            _ => Self::Drying,
        }
    }

    /// (start wetness, drying per hour, walk sigma per sqrt-minute)
    fn params(self) -> (f64, f64, f64) {
        match self {
            Self::Drying => (0.55, 0.08, 0.004),
            Self::Stable => (MOIST_THRESHOLD, 0.0, 0.006),
            Self::Wet => (0.9, 0.02, 0.003),
        }
    }
}

impl fmt::Display for Scenario {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Drying => write!(f, "drying"),
            Self::Stable => write!(f, "stable"),
            Self::Wet => write!(f, "wet"),
        }
    }
}

/// Wetness at or above this reads as moist.
const MOIST_THRESHOLD: f64 = 0.4;
/// Wetness gained per minute of open valve.
const WATERING_PER_MIN: f64 = 0.05;

// ---------------------------------------------------------------------------
// Simulator
// ---------------------------------------------------------------------------

pub struct GardenSim {
    client_name: String,
    wetness: Vec<f64>,
    valves: Vec<bool>,
    uptime_s: i64,
    settings: Settings,
    drying_per_s: f64,
    walk_sigma: f64,
}

impl GardenSim {
    pub fn new(scenario: Scenario, valves: usize, sensors: usize, settings: Settings) -> Self {
        let (start, drying_per_h, walk_sigma) = scenario.params();
        let wetness = (0..sensors)
            .map(|_| (start + 0.05 * approx_std_normal()).clamp(0.0, 1.0))
            .collect();

        Self {
            client_name: settings.mqtt_client_name.clone(),
            wetness,
            valves: vec![false; valves],
            uptime_s: 0,
            settings,
            drying_per_s: drying_per_h / 3600.0,
            walk_sigma,
        }
    }

    /// Advance the garden by `dt_s` seconds.
    pub fn tick(&mut self, dt_s: u64) {
        let dt = dt_s as f64;
        self.uptime_s += dt_s as i64;

        for (i, w) in self.wetness.iter_mut().enumerate() {
            let watering = self.valves.get(i).copied().unwrap_or(false);
            let wet = if watering { WATERING_PER_MIN * dt / 60.0 } else { 0.0 };
            let walk = self.walk_sigma * (dt / 60.0).sqrt() * approx_std_normal();
            *w = (*w - self.drying_per_s * dt + wet + walk).clamp(0.0, 1.0);
        }
    }

    pub fn moisture(&self) -> Vec<bool> {
        self.wetness.iter().map(|w| *w >= MOIST_THRESHOLD).collect()
    }

    pub fn valves(&self) -> &[bool] {
        &self.valves
    }

    pub fn uptime(&self) -> i64 {
        self.uptime_s
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn status(&self) -> Feedback {
        Feedback::Status {
            uptime: self.uptime_s,
            valve: self.valves.clone(),
            moisture: self.moisture(),
        }
    }

    pub fn config(&self) -> Feedback {
        Feedback::Config(self.settings.clone())
    }

    pub fn sensor_data(&self) -> SensorData {
        SensorData {
            valve: self.valves.clone(),
            moisture: self.moisture(),
            client_name: self.client_name.clone(),
        }
    }

    /// Apply one command and return the feedback to publish, if any.
    /// Out-of-range indexes and `shutdown` produce none.
    pub fn handle(&mut self, command: Command) -> Option<Feedback> {
        match command {
            Command::OpenValve { valve } => self.set_valve(valve, true),
            Command::CloseValve { valve } => self.set_valve(valve, false),
            Command::GetValveStatus { valve } => {
                let status = *self.valves.get(valve as usize).or_else(|| {
                    warn!(valve, "no such valve");
                    None
                })?;
                Some(Feedback::ValveStatus { valve, status })
            }
            Command::GetMoistureSensor { sensor } => {
                let wetness = *self.wetness.get(sensor as usize).or_else(|| {
                    warn!(sensor, "no such sensor");
                    None
                })?;
                Some(Feedback::MoistureSensor {
                    sensor,
                    moisture: wetness >= MOIST_THRESHOLD,
                })
            }
            Command::GetStatus => Some(self.status()),
            Command::GetUptime => Some(Feedback::Uptime {
                uptime: self.uptime_s,
            }),
            Command::GetConfig => Some(self.config()),
            Command::SetConfig(settings) => {
                info!(duration = settings.watering_duration, "settings replaced");
                self.settings = settings;
                Some(self.config())
            }
            Command::Restart => {
                info!("restarting");
                self.uptime_s = 0;
                self.valves.iter_mut().for_each(|v| *v = false);
                Some(self.status())
            }
            Command::Shutdown { time } => {
                info!(seconds = time, "deep sleep requested; staying up in simulation");
                None
            }
        }
    }

    fn set_valve(&mut self, valve: u32, open: bool) -> Option<Feedback> {
        let Some(slot) = self.valves.get_mut(valve as usize) else {
            warn!(valve, "no such valve");
            return None;
        };
        *slot = open;
        info!(valve, open, "valve set");
        Some(Feedback::ValveStatus {
            valve,
            status: open,
        })
    }
}

// ===========================================================================
// Tests
// ===========================================================================
