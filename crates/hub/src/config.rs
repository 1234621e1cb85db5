//! Hub settings: optional TOML file, environment overrides, validation.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::Path;

use crate::staleness::DEFAULT_STALE_AFTER_SECS;

// ---------------------------------------------------------------------------
// Settings structures
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub mqtt: MqttSettings,
    pub database: DatabaseSettings,
    pub web: WebSettings,
    pub sync: SyncSettings,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MqttSettings {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub keep_alive_secs: u64,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Request channel size between the client handle and the event loop.
    pub channel_capacity: usize,
}

impl Default for MqttSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 1883,
            client_id: "garden-hub".into(),
            keep_alive_secs: 30,
            username: None,
            password: None,
            channel_capacity: 20,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DatabaseSettings {
    pub url: String,
    pub max_connections: u32,
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        Self {
            url: "sqlite:garden.db?mode=rwc".into(),
            max_connections: 5,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WebSettings {
    pub bind: String,
    pub port: u16,
}

impl Default for WebSettings {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".into(),
            port: 8080,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SyncSettings {
    /// Status older than this many seconds is re-polled on read.
    pub stale_after_secs: i64,
    /// Row cap for the sensor-reading history endpoint.
    pub history_limit: i64,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            stale_after_secs: DEFAULT_STALE_AFTER_SECS,
            history_limit: 100,
        }
    }
}

/// MQTT keep-alive below this is rejected by the client.
const MIN_KEEP_ALIVE_SECS: u64 = 5;
const MAX_HISTORY_LIMIT: i64 = 1000;

// ---------------------------------------------------------------------------
// Environment overrides
// ---------------------------------------------------------------------------

impl Settings {
    /// Overlay environment variables read through `var`. Unset variables
    /// leave the file value alone; unparsable ones are an error.
    pub fn apply_env<F>(&mut self, var: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = var("MQTT_HOST") {
            self.mqtt.host = v;
        }
        if let Some(v) = var("MQTT_PORT") {
            self.mqtt.port = v
                .parse()
                .with_context(|| format!("MQTT_PORT is not a port number: {v:?}"))?;
        }
        if let Some(v) = var("MQTT_CLIENT_ID") {
            self.mqtt.client_id = v;
        }
        if let Some(v) = var("DB_URL") {
            self.database.url = v;
        }
        if let Some(v) = var("WEB_PORT") {
            self.web.port = v
                .parse()
                .with_context(|| format!("WEB_PORT is not a port number: {v:?}"))?;
        }
        if let Some(v) = var("STALE_AFTER_SECS") {
            self.sync.stale_after_secs = v
                .parse()
                .with_context(|| format!("STALE_AFTER_SECS is not an integer: {v:?}"))?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

impl Settings {
    /// Validate all sections. Returns `Ok(())` or an error describing
    /// every violation found (not just the first one).
    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        self.validate_mqtt(&mut errors);
        self.validate_database(&mut errors);
        self.validate_web_and_sync(&mut errors);

        if errors.is_empty() {
            Ok(())
        } else {
            bail!(
                "config validation failed ({} error{}):\n  - {}",
                errors.len(),
                if errors.len() == 1 { "" } else { "s" },
                errors.join("\n  - ")
            );
        }
    }

    fn validate_mqtt(&self, errors: &mut Vec<String>) {
        let m = &self.mqtt;

        if m.host.trim().is_empty() {
            errors.push("mqtt.host is empty".into());
        }
        if m.port == 0 {
            errors.push("mqtt.port must be non-zero".into());
        }
        if m.client_id.trim().is_empty() {
            errors.push("mqtt.client_id is empty".into());
        } else if m.client_id.contains(&['/', '+', '#'][..]) {
            errors.push(format!(
                "mqtt.client_id '{}' contains a topic metacharacter",
                m.client_id
            ));
        }
        if m.keep_alive_secs < MIN_KEEP_ALIVE_SECS {
            errors.push(format!(
                "mqtt.keep_alive_secs must be at least {MIN_KEEP_ALIVE_SECS}, got {}",
                m.keep_alive_secs
            ));
        }
        if m.password.is_some() && m.username.is_none() {
            errors.push("mqtt.password is set without mqtt.username".into());
        }
        if m.channel_capacity == 0 {
            errors.push("mqtt.channel_capacity must be positive".into());
        }
    }

    fn validate_database(&self, errors: &mut Vec<String>) {
        if !self.database.url.starts_with("sqlite:") {
            errors.push(format!(
                "database.url '{}' is not a sqlite: url",
                self.database.url
            ));
        }
        if self.database.max_connections == 0 {
            errors.push("database.max_connections must be positive".into());
        }
    }

    fn validate_web_and_sync(&self, errors: &mut Vec<String>) {
        if self.web.bind.trim().is_empty() {
            errors.push("web.bind is empty".into());
        }
        if self.web.port == 0 {
            errors.push("web.port must be non-zero".into());
        }
        if self.sync.stale_after_secs <= 0 {
            errors.push(format!(
                "sync.stale_after_secs must be positive, got {}",
                self.sync.stale_after_secs
            ));
        }
        if !(1..=MAX_HISTORY_LIMIT).contains(&self.sync.history_limit) {
            errors.push(format!(
                "sync.history_limit {} out of range [1, {MAX_HISTORY_LIMIT}]",
                self.sync.history_limit
            ));
        }
    }
}

// ---------------------------------------------------------------------------
// Load
// ---------------------------------------------------------------------------

/// Read and parse a TOML settings file. A missing file yields defaults.
pub fn read_file(path: &str) -> Result<Settings> {
    if !Path::new(path).exists() {
        tracing::info!(path, "no config file; using defaults");
        return Ok(Settings::default());
    }
    let contents =
        std::fs::read_to_string(path).with_context(|| format!("failed to read config: {path}"))?;
    toml::from_str(&contents).with_context(|| format!("failed to parse config: {path}"))
}

/// File, then process environment, then validation.
pub fn load(path: &str) -> Result<Settings> {
    let mut settings = read_file(path)?;
    settings.apply_env(|key| std::env::var(key).ok())?;
    settings
        .validate()
        .with_context(|| format!("invalid config: {path}"))?;
    Ok(settings)
}

// ===========================================================================
// Tests
// ===========================================================================
