use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{FromRow, Pool, Sqlite};
use std::str::FromStr;

use crate::command::DeviceSettings;
use crate::error::StoreError;
use crate::mqtt::DeviceId;
use crate::store::{AuditEntry, DeviceConfig, HardwareStatus, SensorReading, StateStore};

#[derive(Clone)]
pub struct Db {
    pool: Pool<Sqlite>,
}

// ----------------------------
// Row types
// ----------------------------

#[derive(FromRow)]
struct StatusRow {
    device_id: String,
    valve: String,
    moisture: String,
    uptime: i64,
    updated_at: i64,
}

#[derive(FromRow)]
struct ConfigRow {
    device_id: String,
    watering_duration: i64,
    watering_interval: i64,
    watering_enabled: bool,
    watering_times: String,
    wifi_ssid: String,
    wifi_password: String,
    mqtt_host: String,
    mqtt_port: i64,
    mqtt_username: String,
    mqtt_password: String,
    mqtt_client_name: String,
    updated_at: i64,
}

#[derive(FromRow)]
struct ReadingRow {
    device_id: String,
    valve: String,
    moisture: String,
    client_name: String,
    created_at: i64,
}

fn decode_json<T: serde::de::DeserializeOwned>(
    column: &'static str,
    text: &str,
) -> Result<T, StoreError> {
    serde_json::from_str(text).map_err(|e| StoreError::Corrupt {
        column,
        detail: e.to_string(),
    })
}

fn encode_json<T: serde::Serialize>(column: &'static str, value: &T) -> Result<String, StoreError> {
    serde_json::to_string(value).map_err(|e| StoreError::Corrupt {
        column,
        detail: e.to_string(),
    })
}

fn row_device_id(id: String) -> Result<DeviceId, StoreError> {
    DeviceId::new(id.clone()).ok_or(StoreError::Corrupt {
        column: "device_id",
        detail: format!("invalid device id {id:?}"),
    })
}

impl TryFrom<StatusRow> for HardwareStatus {
    type Error = StoreError;

    fn try_from(r: StatusRow) -> Result<Self, StoreError> {
        Ok(HardwareStatus {
            device_id: row_device_id(r.device_id)?,
            valve: decode_json("valve", &r.valve)?,
            moisture: decode_json("moisture", &r.moisture)?,
            uptime: r.uptime,
            updated_at: r.updated_at,
        })
    }
}

impl TryFrom<ConfigRow> for DeviceConfig {
    type Error = StoreError;

    fn try_from(r: ConfigRow) -> Result<Self, StoreError> {
        let mqtt_port = u16::try_from(r.mqtt_port).map_err(|_| StoreError::Corrupt {
            column: "mqtt_port",
            detail: format!("{} is not a port", r.mqtt_port),
        })?;
        Ok(DeviceConfig {
            device_id: row_device_id(r.device_id)?,
            settings: DeviceSettings {
                watering_duration: r.watering_duration,
                watering_interval: r.watering_interval,
                watering_enabled: r.watering_enabled,
                watering_times: decode_json("watering_times", &r.watering_times)?,
                wifi_ssid: r.wifi_ssid,
                wifi_password: r.wifi_password,
                mqtt_host: r.mqtt_host,
                mqtt_port,
                mqtt_username: r.mqtt_username,
                mqtt_password: r.mqtt_password,
                mqtt_client_name: r.mqtt_client_name,
            },
            updated_at: r.updated_at,
        })
    }
}

impl TryFrom<ReadingRow> for SensorReading {
    type Error = StoreError;

    fn try_from(r: ReadingRow) -> Result<Self, StoreError> {
        Ok(SensorReading {
            device_id: row_device_id(r.device_id)?,
            valve: decode_json("valve", &r.valve)?,
            moisture: decode_json("moisture", &r.moisture)?,
            client_name: r.client_name,
            created_at: r.created_at,
        })
    }
}

impl Db {
    /// db_url examples:
    /// - "sqlite:/var/lib/garden-hub/garden.db"
    /// - "sqlite::memory:" (tests)
    pub async fn connect(db_url: &str, max_connections: u32) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(db_url)
            .with_context(|| format!("invalid sqlite connection string: {db_url}"))?
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await
            .with_context(|| format!("failed to connect to sqlite db: {db_url}"))?;

        Ok(Self { pool })
    }

    /// Runs SQLx migrations from ./migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("failed to run migrations")?;
        Ok(())
    }

    /// Patch one element of a JSON bool array column in place.
    async fn set_array_element(
        &self,
        column: &'static str,
        device_id: &DeviceId,
        index: u32,
        value: bool,
    ) -> Result<bool, StoreError> {
        // Column names come from a fixed set; only values are bound.
        let sql = format!(
            "UPDATE hardware_status SET {column} = json_set({column}, ?, json(?)) WHERE device_id = ?"
        );
        let done = sqlx::query(&sql)
            .bind(format!("$[{index}]"))
            .bind(if value { "true" } else { "false" })
            .bind(device_id.as_str())
            .execute(&self.pool)
            .await?;
        Ok(done.rows_affected() > 0)
    }
}

#[async_trait]
impl StateStore for Db {
    // ----------------------------
    // Hardware status
    // ----------------------------

    async fn upsert_status(&self, s: &HardwareStatus) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO hardware_status (device_id, valve, moisture, uptime, updated_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(device_id) DO UPDATE SET
              valve=excluded.valve,
              moisture=excluded.moisture,
              uptime=excluded.uptime,
              updated_at=excluded.updated_at
            "#,
        )
        .bind(s.device_id.as_str())
        .bind(encode_json("valve", &s.valve)?)
        .bind(encode_json("moisture", &s.moisture)?)
        .bind(s.uptime)
        .bind(s.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn set_moisture(
        &self,
        device_id: &DeviceId,
        index: u32,
        value: bool,
    ) -> Result<bool, StoreError> {
        self.set_array_element("moisture", device_id, index, value)
            .await
    }

    async fn set_valve(
        &self,
        device_id: &DeviceId,
        index: u32,
        value: bool,
    ) -> Result<bool, StoreError> {
        self.set_array_element("valve", device_id, index, value).await
    }

    async fn set_uptime(&self, device_id: &DeviceId, uptime: i64) -> Result<bool, StoreError> {
        let done = sqlx::query("UPDATE hardware_status SET uptime = ? WHERE device_id = ?")
            .bind(uptime)
            .bind(device_id.as_str())
            .execute(&self.pool)
            .await?;
        Ok(done.rows_affected() > 0)
    }

    async fn find_status(&self, device_id: &DeviceId) -> Result<Option<HardwareStatus>, StoreError> {
        let row = sqlx::query_as::<_, StatusRow>(
            r#"
            SELECT device_id, valve, moisture, uptime, updated_at
            FROM hardware_status
            WHERE device_id = ?
            "#,
        )
        .bind(device_id.as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.map(HardwareStatus::try_from).transpose()
    }

    // ----------------------------
    // Device config
    // ----------------------------

    async fn upsert_config(&self, c: &DeviceConfig) -> Result<(), StoreError> {
        let s = &c.settings;
        sqlx::query(
            r#"
            INSERT INTO device_configs (
              device_id,
              watering_duration, watering_interval, watering_enabled, watering_times,
              wifi_ssid, wifi_password,
              mqtt_host, mqtt_port, mqtt_username, mqtt_password, mqtt_client_name,
              updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(device_id) DO UPDATE SET
              watering_duration=excluded.watering_duration,
              watering_interval=excluded.watering_interval,
              watering_enabled=excluded.watering_enabled,
              watering_times=excluded.watering_times,
              wifi_ssid=excluded.wifi_ssid,
              wifi_password=excluded.wifi_password,
              mqtt_host=excluded.mqtt_host,
              mqtt_port=excluded.mqtt_port,
              mqtt_username=excluded.mqtt_username,
              mqtt_password=excluded.mqtt_password,
              mqtt_client_name=excluded.mqtt_client_name,
              updated_at=excluded.updated_at
            "#,
        )
        .bind(c.device_id.as_str())
        .bind(s.watering_duration)
        .bind(s.watering_interval)
        .bind(s.watering_enabled)
        .bind(encode_json("watering_times", &s.watering_times)?)
        .bind(&s.wifi_ssid)
        .bind(&s.wifi_password)
        .bind(&s.mqtt_host)
        .bind(i64::from(s.mqtt_port))
        .bind(&s.mqtt_username)
        .bind(&s.mqtt_password)
        .bind(&s.mqtt_client_name)
        .bind(c.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn find_config(&self, device_id: &DeviceId) -> Result<Option<DeviceConfig>, StoreError> {
        let row = sqlx::query_as::<_, ConfigRow>(
            r#"
            SELECT device_id,
                   watering_duration, watering_interval, watering_enabled, watering_times,
                   wifi_ssid, wifi_password,
                   mqtt_host, mqtt_port, mqtt_username, mqtt_password, mqtt_client_name,
                   updated_at
            FROM device_configs
            WHERE device_id = ?
            "#,
        )
        .bind(device_id.as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.map(DeviceConfig::try_from).transpose()
    }

    // ----------------------------
    // Sensor history
    // ----------------------------

    async fn insert_sensor_reading(&self, r: &SensorReading) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO sensor_readings (device_id, valve, moisture, client_name, created_at)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(r.device_id.as_str())
        .bind(encode_json("valve", &r.valve)?)
        .bind(encode_json("moisture", &r.moisture)?)
        .bind(&r.client_name)
        .bind(r.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn recent_sensor_readings(
        &self,
        device_id: &DeviceId,
        limit: i64,
    ) -> Result<Vec<SensorReading>, StoreError> {
        let rows = sqlx::query_as::<_, ReadingRow>(
            r#"
            SELECT device_id, valve, moisture, client_name, created_at
            FROM sensor_readings
            WHERE device_id = ?
            ORDER BY created_at DESC, id DESC
            LIMIT ?
            "#,
        )
        .bind(device_id.as_str())
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(SensorReading::try_from).collect()
    }

    // ----------------------------
    // Audit log
    // ----------------------------

    async fn insert_audit(&self, e: &AuditEntry) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO audit_log (tag, device_id, topic, payload, created_at)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(e.tag.as_str())
        .bind(e.device_id.as_ref().map(DeviceId::as_str))
        .bind(&e.topic)
        .bind(encode_json("payload", &e.payload)?)
        .bind(e.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

// ----------------------------
// Test-only inspection
// ----------------------------

#[cfg(test)]
impl Db {
    pub async fn memory() -> Self {
        let db = Db::connect("sqlite::memory:", 1).await.unwrap();
        db.migrate().await.unwrap();
        db
    }

    pub async fn audit_count(&self, tag: crate::store::AuditTag) -> i64 {
        sqlx::query_scalar("SELECT COUNT(*) FROM audit_log WHERE tag = ?")
            .bind(tag.as_str())
            .fetch_one(&self.pool)
            .await
            .unwrap()
    }

    /// (device_id, topic, payload, created_at) for every row with `tag`,
    /// oldest first.
    pub async fn audit_rows(
        &self,
        tag: crate::store::AuditTag,
    ) -> Vec<(Option<String>, String, serde_json::Value, i64)> {
        let rows: Vec<(Option<String>, String, String, i64)> = sqlx::query_as(
            "SELECT device_id, topic, payload, created_at FROM audit_log WHERE tag = ? ORDER BY id",
        )
        .bind(tag.as_str())
        .fetch_all(&self.pool)
        .await
        .unwrap();
        rows.into_iter()
            .map(|(d, t, p, c)| (d, t, serde_json::from_str(&p).unwrap(), c))
            .collect()
    }

    pub async fn table_count(&self, table: &str) -> i64 {
        sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {table}"))
            .fetch_one(&self.pool)
            .await
            .unwrap()
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::AuditTag;
    use crate::testing::{dev, sample_settings};
    use serde_json::json;

    fn status(id: &str, updated_at: i64) -> HardwareStatus {
        HardwareStatus {
            device_id: dev(id),
            valve: vec![false; 5],
            moisture: vec![false; 5],
            uptime: 100,
            updated_at,
        }
    }

    // -- hardware status ----------------------------------------------------

    #[tokio::test]
    async fn upsert_then_find_status() {
        let db = Db::memory().await;
        db.upsert_status(&status("dev-A", 1_000)).await.unwrap();

        let found = db.find_status(&dev("dev-A")).await.unwrap().unwrap();
        assert_eq!(found, status("dev-A", 1_000));
    }

    #[tokio::test]
    async fn upsert_status_replaces_whole_row() {
        let db = Db::memory().await;
        db.upsert_status(&status("dev-A", 1_000)).await.unwrap();

        let replacement = HardwareStatus {
            valve: vec![true, true],
            moisture: vec![true],
            uptime: 5,
            ..status("dev-A", 2_000)
        };
        db.upsert_status(&replacement).await.unwrap();

        assert_eq!(db.find_status(&dev("dev-A")).await.unwrap(), Some(replacement));
        assert_eq!(db.table_count("hardware_status").await, 1);
    }

    #[tokio::test]
    async fn find_status_missing_is_none() {
        let db = Db::memory().await;
        assert!(db.find_status(&dev("nobody")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn set_moisture_patches_one_element() {
        let db = Db::memory().await;
        db.upsert_status(&status("dev-A", 1_000)).await.unwrap();

        assert!(db.set_moisture(&dev("dev-A"), 2, true).await.unwrap());

        let found = db.find_status(&dev("dev-A")).await.unwrap().unwrap();
        assert_eq!(found.moisture, vec![false, false, true, false, false]);
        assert_eq!(found.valve, vec![false; 5]);
        assert_eq!(found.updated_at, 1_000);
    }

    #[tokio::test]
    async fn set_valve_patches_one_element() {
        let db = Db::memory().await;
        db.upsert_status(&status("dev-A", 1_000)).await.unwrap();

        assert!(db.set_valve(&dev("dev-A"), 4, true).await.unwrap());
        assert!(db.set_valve(&dev("dev-A"), 4, false).await.unwrap());
        assert!(db.set_valve(&dev("dev-A"), 0, true).await.unwrap());

        let found = db.find_status(&dev("dev-A")).await.unwrap().unwrap();
        assert_eq!(found.valve, vec![true, false, false, false, false]);
    }

    #[tokio::test]
    async fn partial_updates_do_not_insert() {
        let db = Db::memory().await;
        assert!(!db.set_moisture(&dev("ghost"), 0, true).await.unwrap());
        assert!(!db.set_valve(&dev("ghost"), 0, true).await.unwrap());
        assert!(!db.set_uptime(&dev("ghost"), 9).await.unwrap());
        assert!(db.find_status(&dev("ghost")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn set_uptime_only_touches_uptime() {
        let db = Db::memory().await;
        db.upsert_status(&status("dev-A", 1_000)).await.unwrap();
        assert!(db.set_uptime(&dev("dev-A"), 42).await.unwrap());

        let found = db.find_status(&dev("dev-A")).await.unwrap().unwrap();
        assert_eq!(found.uptime, 42);
        assert_eq!(found.updated_at, 1_000);
    }

    // -- device config ------------------------------------------------------

    #[tokio::test]
    async fn upsert_config_inserts_then_updates() {
        let db = Db::memory().await;
        let mut cfg = DeviceConfig {
            device_id: dev("dev-A"),
            settings: sample_settings(),
            updated_at: 1,
        };
        db.upsert_config(&cfg).await.unwrap();

        cfg.settings.watering_enabled = false;
        cfg.settings.watering_times = vec![];
        cfg.updated_at = 2;
        db.upsert_config(&cfg).await.unwrap();

        assert_eq!(db.table_count("device_configs").await, 1);
        assert_eq!(db.find_config(&dev("dev-A")).await.unwrap(), Some(cfg));
    }

    #[tokio::test]
    async fn find_config_missing_is_none() {
        let db = Db::memory().await;
        assert!(db.find_config(&dev("dev-A")).await.unwrap().is_none());
    }

    // -- sensor history -----------------------------------------------------

    #[tokio::test]
    async fn sensor_readings_are_append_only_newest_first() {
        let db = Db::memory().await;
        for ts in [10, 30, 20] {
            db.insert_sensor_reading(&SensorReading {
                device_id: dev("dev-A"),
                valve: vec![ts == 30],
                moisture: vec![false],
                client_name: "dev-A".into(),
                created_at: ts,
            })
            .await
            .unwrap();
        }
        db.insert_sensor_reading(&SensorReading {
            device_id: dev("dev-B"),
            valve: vec![],
            moisture: vec![],
            client_name: "dev-B".into(),
            created_at: 99,
        })
        .await
        .unwrap();

        let rows = db.recent_sensor_readings(&dev("dev-A"), 2).await.unwrap();
        let stamps: Vec<i64> = rows.iter().map(|r| r.created_at).collect();
        assert_eq!(stamps, vec![30, 20]);
        assert_eq!(rows[0].valve, vec![true]);
        assert_eq!(db.table_count("sensor_readings").await, 4);
    }

    // -- audit log ----------------------------------------------------------

    #[tokio::test]
    async fn audit_entries_keep_tag_and_payload() {
        let db = Db::memory().await;
        db.insert_audit(&AuditEntry {
            tag: AuditTag::Feedback,
            device_id: Some(dev("dev-A")),
            topic: "/dev-A/feedback".into(),
            payload: json!({"command": "uptime", "uptime": 3}),
            created_at: 77,
        })
        .await
        .unwrap();

        assert_eq!(db.audit_count(AuditTag::Feedback).await, 1);
        assert_eq!(db.audit_count(AuditTag::PublishFromCloud).await, 0);

        let rows = db.audit_rows(AuditTag::Feedback).await;
        assert_eq!(
            rows,
            vec![(
                Some("dev-A".to_string()),
                "/dev-A/feedback".to_string(),
                json!({"command": "uptime", "uptime": 3}),
                77
            )]
        );
    }
}
