//! Scheduling worker: owns the job store and everything a job body needs to
//! run (storage, publisher, clock, shared state). Water, light, action and
//! health behaviour live in their own modules as `impl Worker` blocks.
//!
//! Job bodies never hold a job store lock while doing I/O: `run_pending`
//! hands back payloads and each one runs on its own task, re-fetching its
//! entity by id.

use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use time::OffsetDateTime;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};

use crate::clock::{Clock, SharedClock, Timer};
use crate::db::Db;
use crate::jobs::{JobStore, Tag};
use crate::model::LightState;
use crate::mqtt::Publisher;
use crate::state::SharedState;
use crate::weather::{WeatherCache, WeatherClient, WeatherSource};

/// What a due job runs.
#[derive(Debug, Clone, PartialEq)]
pub enum JobAction {
    Water { water_schedule_id: String },
    Light { garden_id: String, state: LightState },
    /// One-time ON override due at `at`.
    AdhocLight { garden_id: String, at: OffsetDateTime },
}

#[derive(Clone)]
pub struct Worker {
    pub(crate) jobs: Arc<JobStore<JobAction>>,
    pub(crate) db: Db,
    pub(crate) publisher: Arc<dyn Publisher>,
    pub(crate) clock: SharedClock,
    pub(crate) shared: SharedState,
    weather_cache: WeatherCache,
    garden_locks: Arc<Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>>,
    pub(crate) down_timers: Arc<Mutex<HashMap<String, Timer>>>,
}

impl Worker {
    pub fn new(db: Db, publisher: Arc<dyn Publisher>, clock: SharedClock, shared: SharedState) -> Self {
        Self {
            jobs: Arc::new(JobStore::new(Arc::clone(&clock))),
            weather_cache: WeatherCache::new(Arc::clone(&clock)),
            db,
            publisher,
            clock,
            shared,
            garden_locks: Arc::new(Mutex::new(HashMap::new())),
            down_timers: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn now(&self) -> OffsetDateTime {
        self.clock.now()
    }

    pub fn job_count(&self) -> usize {
        self.jobs.len()
    }

    /// Serialises read-modify-write of a garden's adhoc override.
    pub(crate) fn garden_lock(&self, garden_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.garden_locks.lock().unwrap_or_else(|e| e.into_inner());
        Arc::clone(locks.entry(garden_id.to_string()).or_default())
    }

    /// Drop every job tagged with `id` (garden or water schedule).
    pub fn remove_jobs_by_id(&self, id: &str) -> usize {
        let removed = self.jobs.remove_by_tags(&[Tag::entity(id)]);
        info!(id, removed, "removed jobs");
        removed
    }

    /// Register jobs for every persisted light and water schedule.
    pub async fn schedule_all(&self) -> Result<()> {
        let gardens = self.db.load_gardens().await?;
        for garden in gardens.iter().filter(|g| g.light_schedule.is_some()) {
            if let Err(e) = self.schedule_light_actions(garden).await {
                error!(garden_id = %garden.id, error = %e, "failed to schedule light actions");
                self.shared
                    .write()
                    .await
                    .record_error(format!("light schedule for {}: {e}", garden.id));
            }
        }

        let schedules = self.db.load_water_schedules().await?;
        for ws in &schedules {
            if let Err(e) = self.schedule_water_action(ws) {
                error!(water_schedule_id = %ws.id, error = %e, "failed to schedule water action");
                self.shared
                    .write()
                    .await
                    .record_error(format!("water schedule {}: {e}", ws.id));
            }
        }

        info!(
            gardens = gardens.len(),
            water_schedules = schedules.len(),
            jobs = self.job_count(),
            "initial scheduling complete"
        );
        self.shared.write().await.record_scheduler(format!(
            "scheduled {} job(s) at startup",
            self.job_count()
        ));
        Ok(())
    }

    // ----------------------------
    // Runner
    // ----------------------------

    /// Start every due job on its own task.
    pub fn run_pending_jobs(&self) -> Vec<JoinHandle<()>> {
        self.jobs
            .run_pending()
            .into_iter()
            .map(|action| {
                let worker = self.clone();
                tokio::spawn(async move { worker.execute_job(action).await })
            })
            .collect()
    }

    /// Runner loop. Intended to be `tokio::spawn`-ed from main.
    pub async fn run(self, poll: Duration) {
        let mut ticker = tokio::time::interval(poll);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(poll_ms = poll.as_millis() as u64, "job runner started");

        loop {
            ticker.tick().await;
            self.run_pending_jobs();
        }
    }

    pub(crate) async fn execute_job(&self, action: JobAction) {
        match action {
            JobAction::Water { water_schedule_id } => {
                self.execute_scheduled_water_job(&water_schedule_id).await
            }
            JobAction::Light { garden_id, state } => {
                self.execute_scheduled_light_job(&garden_id, state).await
            }
            JobAction::AdhocLight { garden_id, at } => {
                self.execute_adhoc_light_job(&garden_id, at).await
            }
        }
    }

    // ----------------------------
    // Notifications
    // ----------------------------

    /// Best-effort send; failures are logged and recorded, never returned.
    pub(crate) async fn send_notification(&self, client_id: &str, title: &str, message: &str) {
        let client = match self.db.get_notification_client(client_id).await {
            Ok(c) => c,
            Err(e) => {
                error!(notification_client_id = client_id, error = %format!("{e:#}"), "error getting notification client");
                self.shared
                    .write()
                    .await
                    .record_error(format!("notification client {client_id}: {e}"));
                return;
            }
        };

        match client.send_message(title, message).await {
            Ok(()) => {
                info!(notification_client_id = client_id, title, "sent notification");
                self.shared.write().await.record_notification(title, message);
            }
            Err(e) => {
                warn!(notification_client_id = client_id, error = %e, "error sending notification");
                self.shared
                    .write()
                    .await
                    .record_error(format!("notification {title:?} failed: {e}"));
            }
        }
    }
}

/// Weather clients come from storage and are served through the
/// worker's response cache.
#[async_trait]
impl WeatherSource for Worker {
    async fn weather_client(&self, client_id: &str) -> Result<Arc<dyn WeatherClient>> {
        let client = self.db.get_weather_client(client_id).await?;
        Ok(self.weather_cache.wrap(client_id, client))
    }
}

// ===========================================================================
// Tests
// ===========================================================================
