//! Controller health and inbound controller messages: heartbeats, down
//! notifications, startup, soil moisture and water-complete reports.

use serde::Serialize;
use std::fmt;
use std::time::Duration;
use time::OffsetDateTime;
use tracing::{debug, error, info, warn};

use crate::actions::LightAction;
use crate::duration::format_duration;
use crate::model::Garden;
use crate::mqtt::{Inbound, STARTUP_MESSAGE};
use crate::scheduler::Worker;
use crate::water::MOISTURE_WINDOW;

/// A controller is considered up if it checked in within this window.
pub const HEALTH_THRESHOLD: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum HealthStatus {
    #[serde(rename = "UP")]
    Up,
    #[serde(rename = "DOWN")]
    Down,
    #[serde(rename = "N/A")]
    Unknown,
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            HealthStatus::Up => "UP",
            HealthStatus::Down => "DOWN",
            HealthStatus::Unknown => "N/A",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GardenHealth {
    pub status: HealthStatus,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_contact: Option<OffsetDateTime>,
    pub details: String,
}

pub fn garden_health(last_contact: Option<OffsetDateTime>, now: OffsetDateTime) -> GardenHealth {
    match last_contact {
        None => GardenHealth {
            status: HealthStatus::Unknown,
            last_contact: None,
            details: "no health messages received".into(),
        },
        Some(at) => {
            let since = now - at;
            let up = since < HEALTH_THRESHOLD;
            GardenHealth {
                status: if up { HealthStatus::Up } else { HealthStatus::Down },
                last_contact: Some(at),
                details: if up {
                    "last contact within 5 minutes".into()
                } else {
                    "last contact more than 5 minutes ago".into()
                },
            }
        }
    }
}

impl Worker {
    pub async fn garden_health(&self, garden: &Garden) -> GardenHealth {
        let last = self.shared.read().await.last_contact(&garden.topic_prefix);
        garden_health(last, self.now())
    }

    /// Warn the garden's notification client that an action is about to be
    /// sent to a controller that is not known to be up.
    pub(crate) async fn send_down_notification(&self, garden: &Garden, action_name: &str) {
        let Some(client_id) = &garden.notification_client_id else {
            return;
        };
        let health = self.garden_health(garden).await;
        if health.status == HealthStatus::Up {
            return;
        }

        let last = health
            .last_contact
            .map(|t| t.to_string())
            .unwrap_or_else(|| "never".into());
        let title = format!("{}: {}", garden.name, health.status);
        let message = format!(
            "Attempting to execute {action_name} Action, but last contact was {last}.\nDetails: {}",
            health.details
        );
        self.send_notification(client_id, &title, &message).await;
    }

    // ----------------------------
    // Inbound dispatch
    // ----------------------------

    pub async fn handle_inbound(&self, msg: Inbound) {
        match msg {
            Inbound::Health { prefix } => self.handle_health_message(&prefix).await,
            Inbound::Moisture { prefix, position, value } => {
                self.handle_moisture(&prefix, position, value).await
            }
            Inbound::Log { prefix, message } => {
                if message == STARTUP_MESSAGE {
                    self.handle_controller_startup(&prefix).await;
                } else {
                    debug!(prefix = %prefix, message = %message, "controller log");
                }
            }
            Inbound::WaterComplete { prefix, position, duration } => {
                self.handle_water_complete(&prefix, position, duration).await
            }
        }
    }

    async fn garden_for_prefix(&self, prefix: &str) -> Option<Garden> {
        match self.db.get_garden_by_topic_prefix(prefix).await {
            Ok(Some(g)) => Some(g),
            Ok(None) => {
                warn!(prefix, "no garden for topic prefix");
                None
            }
            Err(e) => {
                error!(prefix, error = %format!("{e:#}"), "error getting garden for topic prefix");
                None
            }
        }
    }

    /// Record last contact and re-arm the downtime timer.
    pub async fn handle_health_message(&self, prefix: &str) {
        self.shared.write().await.record_health(prefix, self.now());

        let Some(garden) = self.garden_for_prefix(prefix).await else {
            return;
        };
        let Some(downtime) = garden.notification_settings.downtime else {
            return;
        };

        let worker = self.clone();
        let garden_id = garden.id.clone();
        let timer = self.clock.after_func(
            downtime,
            Box::new(move || {
                tokio::spawn(async move { worker.handle_downtime_notification(&garden_id).await });
            }),
        );

        let mut timers = self.down_timers.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(old) = timers.insert(garden.id, timer) {
            old.stop();
        }
    }

    /// Fired when a garden has been silent for its configured downtime.
    pub(crate) async fn handle_downtime_notification(&self, garden_id: &str) {
        let garden = match self.db.get_garden(garden_id).await {
            Ok(Some(g)) => g,
            Ok(None) => return,
            Err(e) => {
                error!(garden_id, error = %format!("{e:#}"), "error getting garden for downtime notification");
                return;
            }
        };
        let (Some(client_id), Some(downtime)) = (
            &garden.notification_client_id,
            garden.notification_settings.downtime,
        ) else {
            return;
        };

        warn!(garden_id, "garden controller is down");
        self.send_notification(
            client_id,
            &format!("{} is down", garden.name),
            &format!("Garden has been down for > {}", format_duration(downtime)),
        )
        .await;
    }

    /// Controller (re)connected: re-send the light state it should be in and
    /// optionally announce the connection.
    pub async fn handle_controller_startup(&self, prefix: &str) {
        let Some(garden) = self.garden_for_prefix(prefix).await else {
            return;
        };
        info!(garden_id = %garden.id, "controller startup");
        self.shared
            .write()
            .await
            .record_system(format!("{} controller started", garden.name));

        let mut message = STARTUP_MESSAGE.to_string();
        if garden.light_schedule.is_some() {
            if let Some(state) = self.light_state(&garden.id) {
                let action = LightAction {
                    state,
                    for_duration: None,
                };
                if let Err(e) = self.execute_light_action(&garden, &action).await {
                    warn!(garden_id = %garden.id, error = %e, "unable to set expected light state");
                    message.push_str(&format!(" Error setting LightState: {e}"));
                }
            }
        }

        if !garden.notification_settings.controller_startup {
            return;
        }
        if let Some(client_id) = &garden.notification_client_id {
            self.send_notification(client_id, &format!("{} connected", garden.name), &message)
                .await;
        }
    }

    /// Store a reading and drop any that have aged out of the averaging window.
    pub async fn handle_moisture(&self, prefix: &str, position: u32, value: f64) {
        let now = self.now();
        let stored = match self.db.insert_moisture_reading(prefix, position, value, now).await {
            Ok(()) => self.db.prune_moisture_readings(now - MOISTURE_WINDOW).await.map(|_| ()),
            Err(e) => Err(e),
        };
        if let Err(e) = stored {
            error!(prefix, position, error = %format!("{e:#}"), "error storing moisture reading");
            self.shared
                .write()
                .await
                .record_error(format!("moisture reading from {prefix}: {e}"));
        }
    }

    pub async fn handle_water_complete(&self, prefix: &str, position: u32, duration: Duration) {
        let Some(garden) = self.garden_for_prefix(prefix).await else {
            return;
        };
        let zones = match self.db.zones_for_garden(&garden.id).await {
            Ok(z) => z,
            Err(e) => {
                error!(garden_id = %garden.id, error = %format!("{e:#}"), "error getting zones");
                return;
            }
        };
        let Some(zone) = zones.into_iter().find(|z| z.position == position) else {
            warn!(garden_id = %garden.id, position, "no zone at position");
            return;
        };

        info!(garden_id = %garden.id, zone_id = %zone.id, duration_ms = duration.as_millis() as u64, "watering complete");
        self.shared.write().await.record_water(format!(
            "{} / {} finished watering after {}",
            garden.name,
            zone.name,
            format_duration(duration)
        ));

        if let Some(client_id) = &garden.notification_client_id {
            self.send_notification(
                client_id,
                &format!("{} finished watering", zone.name),
                &format!("watered for {}", format_duration(duration)),
            )
            .await;
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
