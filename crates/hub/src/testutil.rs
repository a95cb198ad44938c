//! Shared fixtures for unit tests.

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use time::macros::{datetime, offset, time};
use time::OffsetDateTime;

use crate::clock::FakeClock;
use crate::db::Db;
use crate::model::{
    Garden, LightSchedule, NotificationClientConfig, NotificationSettings, StartTime,
    WaterSchedule, WeatherClientConfig, Zone,
};
use crate::mqtt::Publisher;
use crate::scheduler::Worker;
use crate::state::SystemState;

pub const NOW: OffsetDateTime = datetime!(2023-08-23 10:00 UTC);

pub async fn test_db() -> Db {
    let db = Db::connect("sqlite::memory:").await.unwrap();
    db.migrate().await.unwrap();
    db
}

/// "Front Yard": lights on 06:00-20:00 UTC.
pub fn garden() -> Garden {
    Garden {
        id: "g1".into(),
        name: "Front Yard".into(),
        topic_prefix: "garden".into(),
        created_at: datetime!(2023-08-01 00:00 UTC),
        light_schedule: Some(LightSchedule {
            duration: Duration::from_secs(14 * 3600),
            start_time: StartTime {
                time: time!(06:00),
                offset: offset!(UTC),
            },
            adhoc_on_time: None,
        }),
        notification_client_id: None,
        notification_settings: NotificationSettings::default(),
    }
}

pub fn zone() -> Zone {
    Zone {
        id: "z1".into(),
        garden_id: "g1".into(),
        name: "Tomatoes".into(),
        position: 0,
        skip_count: None,
        water_schedule_ids: vec!["ws1".into()],
    }
}

/// One second of water every day at 06:00 UTC.
pub fn water_schedule() -> WaterSchedule {
    WaterSchedule {
        id: "ws1".into(),
        name: "Daily".into(),
        duration: Duration::from_millis(1000),
        interval: Duration::from_secs(24 * 3600),
        start_time: datetime!(2023-08-01 06:00 UTC),
        weather_control: None,
        active_period: None,
        notification_client_id: None,
    }
}

/// Fake weather client reporting `rain_mm` per day and a fixed average high.
pub fn weather_client(id: &str, rain_mm: f64, avg_high_temperature: f64) -> WeatherClientConfig {
    WeatherClientConfig {
        id: id.into(),
        kind: "fake".into(),
        options: json!({
            "rain_mm": rain_mm,
            "rain_interval": "24h",
            "avg_high_temperature": avg_high_temperature,
        }),
    }
}

pub fn notification_client(id: &str) -> NotificationClientConfig {
    NotificationClientConfig {
        id: id.into(),
        name: "phone".into(),
        kind: "fake".into(),
        options: json!({}),
    }
}

// ---------------------------------------------------------------------------
// Recording publisher
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct RecordingPublisher {
    messages: Mutex<Vec<(String, String)>>,
    failing: AtomicBool,
}

impl RecordingPublisher {
    /// Every (topic, payload) published so far, oldest first.
    pub fn messages(&self) -> Vec<(String, String)> {
        self.messages.lock().unwrap().clone()
    }

    /// JSON payloads published on `topic`.
    pub fn json_on(&self, topic: &str) -> Vec<Value> {
        self.messages()
            .into_iter()
            .filter(|(t, _)| t == topic)
            .map(|(_, p)| serde_json::from_str(&p).unwrap())
            .collect()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

#[async_trait]
impl Publisher for RecordingPublisher {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            bail!("broker unavailable");
        }
        self.messages
            .lock()
            .unwrap()
            .push((topic.to_string(), String::from_utf8_lossy(&payload).into_owned()));
        Ok(())
    }
}

/// Worker at `NOW` with the default garden, zone and water schedule stored
/// but nothing scheduled.
pub async fn seeded_worker() -> (FakeClock, Worker, Arc<RecordingPublisher>) {
    let db = test_db().await;
    db.save_garden(&garden()).await.unwrap();
    db.save_zone(&zone()).await.unwrap();
    db.save_water_schedule(&water_schedule()).await.unwrap();

    let clock = FakeClock::new(NOW);
    let publisher = Arc::new(RecordingPublisher::default());
    let worker = Worker::new(
        db,
        publisher.clone(),
        Arc::new(clock.clone()),
        SystemState::shared(),
    );
    (clock, worker, publisher)
}

/// Poll `check` until it yields a value, giving spawned tasks a chance to run.
pub async fn eventually<T, F, Fut>(mut check: F) -> T
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Option<T>>,
{
    for _ in 0..200 {
        if let Some(v) = check().await {
            return v;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not met in time");
}
