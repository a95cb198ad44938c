use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Pool, Sqlite};
use std::str::FromStr;
use std::sync::Arc;
use time::OffsetDateTime;

use crate::model::{
    Garden, NotificationClientConfig, WaterSchedule, WeatherClientConfig, Zone,
};
use crate::notify::{self, NotificationClient};
use crate::weather::{self, WeatherClient};

#[derive(Clone)]
pub struct Db {
    pool: Pool<Sqlite>,
}

impl Db {
    /// db_url examples:
    /// - "sqlite:/var/lib/garden/garden.db"
    /// - "sqlite::memory:" (tests)
    pub async fn connect(db_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(db_url)
            .with_context(|| format!("invalid sqlite connection string: {db_url}"))?
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true);

        // An in-memory database lives only as long as its connection.
        let in_memory = db_url.contains(":memory:");
        let pool = SqlitePoolOptions::new()
            .max_connections(if in_memory { 1 } else { 5 })
            .idle_timeout(None)
            .max_lifetime(None)
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

    // ----------------------------
    // JSON document helpers
    // ----------------------------

    async fn get_doc<T: DeserializeOwned>(&self, table: &str, id: &str) -> Result<Option<T>> {
        let body: Option<String> =
            sqlx::query_scalar(&format!("SELECT body FROM {table} WHERE id = ?"))
                .bind(id)
                .fetch_optional(&self.pool)
                .await
                .with_context(|| format!("get from {table} failed"))?;

        body.map(|b| {
            serde_json::from_str(&b).with_context(|| format!("corrupt {table} row {id}"))
        })
        .transpose()
    }

    async fn load_docs<T: DeserializeOwned>(&self, table: &str) -> Result<Vec<T>> {
        let bodies: Vec<String> =
            sqlx::query_scalar(&format!("SELECT body FROM {table} ORDER BY id"))
                .fetch_all(&self.pool)
                .await
                .with_context(|| format!("load {table} failed"))?;

        bodies
            .iter()
            .map(|b| serde_json::from_str(b).with_context(|| format!("corrupt {table} row")))
            .collect()
    }

    async fn put_doc<T: Serialize>(&self, table: &str, id: &str, doc: &T) -> Result<()> {
        let body = serde_json::to_string(doc)?;
        sqlx::query(&format!(
            "INSERT INTO {table} (id, body) VALUES (?, ?)
             ON CONFLICT(id) DO UPDATE SET body=excluded.body"
        ))
        .bind(id)
        .bind(body)
        .execute(&self.pool)
        .await
        .with_context(|| format!("save to {table} failed"))?;
        Ok(())
    }

    // ----------------------------
    // Gardens
    // ----------------------------

    pub async fn get_garden(&self, id: &str) -> Result<Option<Garden>> {
        self.get_doc("gardens", id).await
    }

    pub async fn save_garden(&self, g: &Garden) -> Result<()> {
        let body = serde_json::to_string(g)?;
        sqlx::query(
            r#"
            INSERT INTO gardens (id, topic_prefix, body) VALUES (?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
              topic_prefix=excluded.topic_prefix,
              body=excluded.body
            "#,
        )
        .bind(&g.id)
        .bind(&g.topic_prefix)
        .bind(body)
        .execute(&self.pool)
        .await
        .context("save_garden failed")?;
        Ok(())
    }

    pub async fn load_gardens(&self) -> Result<Vec<Garden>> {
        self.load_docs("gardens").await
    }

    pub async fn get_garden_by_topic_prefix(&self, prefix: &str) -> Result<Option<Garden>> {
        let body: Option<String> =
            sqlx::query_scalar("SELECT body FROM gardens WHERE topic_prefix = ? ORDER BY id LIMIT 1")
                .bind(prefix)
                .fetch_optional(&self.pool)
                .await
                .context("get_garden_by_topic_prefix failed")?;

        body.map(|b| serde_json::from_str(&b).context("corrupt gardens row"))
            .transpose()
    }

    // ----------------------------
    // Zones
    // ----------------------------

    pub async fn get_zone(&self, id: &str) -> Result<Option<Zone>> {
        self.get_doc("zones", id).await
    }

    pub async fn save_zone(&self, z: &Zone) -> Result<()> {
        let body = serde_json::to_string(z)?;
        sqlx::query(
            r#"
            INSERT INTO zones (id, garden_id, body) VALUES (?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
              garden_id=excluded.garden_id,
              body=excluded.body
            "#,
        )
        .bind(&z.id)
        .bind(&z.garden_id)
        .bind(body)
        .execute(&self.pool)
        .await
        .context("save_zone failed")?;
        Ok(())
    }

    pub async fn load_zones(&self) -> Result<Vec<Zone>> {
        self.load_docs("zones").await
    }

    pub async fn zones_for_garden(&self, garden_id: &str) -> Result<Vec<Zone>> {
        let bodies: Vec<String> =
            sqlx::query_scalar("SELECT body FROM zones WHERE garden_id = ? ORDER BY id")
                .bind(garden_id)
                .fetch_all(&self.pool)
                .await
                .context("zones_for_garden failed")?;

        bodies
            .iter()
            .map(|b| serde_json::from_str(b).context("corrupt zones row"))
            .collect()
    }

    /// Every zone that references the schedule, paired with its garden.
    pub async fn get_zones_using_water_schedule(&self, ws_id: &str) -> Result<Vec<(Zone, Garden)>> {
        let mut out = Vec::new();
        for zone in self.load_zones().await? {
            if !zone.water_schedule_ids.iter().any(|id| id == ws_id) {
                continue;
            }
            let garden = self
                .get_garden(&zone.garden_id)
                .await?
                .with_context(|| format!("garden {} for zone {} not found", zone.garden_id, zone.id))?;
            out.push((zone, garden));
        }
        Ok(out)
    }

    // ----------------------------
    // Water schedules
    // ----------------------------

    pub async fn get_water_schedule(&self, id: &str) -> Result<Option<WaterSchedule>> {
        self.get_doc("water_schedules", id).await
    }

    pub async fn save_water_schedule(&self, ws: &WaterSchedule) -> Result<()> {
        self.put_doc("water_schedules", &ws.id, ws).await
    }

    pub async fn load_water_schedules(&self) -> Result<Vec<WaterSchedule>> {
        self.load_docs("water_schedules").await
    }

    // ----------------------------
    // Weather / notification clients
    // ----------------------------

    pub async fn save_weather_client(&self, c: &WeatherClientConfig) -> Result<()> {
        self.put_doc("weather_clients", &c.id, c).await
    }

    pub async fn get_weather_client_config(&self, id: &str) -> Result<Option<WeatherClientConfig>> {
        self.get_doc("weather_clients", id).await
    }

    pub async fn get_weather_client(&self, id: &str) -> Result<Arc<dyn WeatherClient>> {
        let config = self
            .get_weather_client_config(id)
            .await?
            .with_context(|| format!("weather client {id} not found"))?;
        weather::new_client(&config).with_context(|| format!("error initializing weather client {id}"))
    }

    pub async fn save_notification_client(&self, c: &NotificationClientConfig) -> Result<()> {
        self.put_doc("notification_clients", &c.id, c).await
    }

    pub async fn get_notification_client_config(&self, id: &str) -> Result<Option<NotificationClientConfig>> {
        self.get_doc("notification_clients", id).await
    }

    pub async fn get_notification_client(&self, id: &str) -> Result<Arc<dyn NotificationClient>> {
        let config = self
            .get_notification_client_config(id)
            .await?
            .with_context(|| format!("notification client {id} not found"))?;
        notify::new_client(&config).with_context(|| format!("error initializing notification client {id}"))
    }

    // ----------------------------
    // Soil moisture
    // ----------------------------

    pub async fn insert_moisture_reading(
        &self,
        prefix: &str,
        position: u32,
        value: f64,
        at: OffsetDateTime,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO moisture_readings (ts, topic_prefix, position, value)
            VALUES (?, ?, ?, ?)
            "#,
        )
        .bind(at.unix_timestamp())
        .bind(prefix)
        .bind(position as i64)
        .bind(value)
        .execute(&self.pool)
        .await
        .context("insert_moisture_reading failed")?;
        Ok(())
    }

    /// Drop readings taken before `before`; returns how many were removed.
    pub async fn prune_moisture_readings(&self, before: OffsetDateTime) -> Result<u64> {
        let done = sqlx::query("DELETE FROM moisture_readings WHERE ts < ?")
            .bind(before.unix_timestamp())
            .execute(&self.pool)
            .await
            .context("prune_moisture_readings failed")?;
        Ok(done.rows_affected())
    }

    /// Average moisture for a zone over readings taken at or after `since`.
    pub async fn average_moisture(
        &self,
        prefix: &str,
        position: u32,
        since: OffsetDateTime,
    ) -> Result<Option<f64>> {
        let avg: Option<f64> = sqlx::query_scalar(
            r#"
            SELECT AVG(value)
            FROM moisture_readings
            WHERE topic_prefix = ? AND position = ? AND ts >= ?
            "#,
        )
        .bind(prefix)
        .bind(position as i64)
        .bind(since.unix_timestamp())
        .fetch_one(&self.pool)
        .await
        .context("average_moisture failed")?;
        Ok(avg)
    }
}
