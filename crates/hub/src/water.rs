//! Water schedules: recurring job registration and the scheduled watering
//! cycle (skip count, soil moisture, weather scaling, dispatch).

use std::time::Duration;
use time::OffsetDateTime;
use tracing::{error, info, warn};

use crate::actions::ActionError;
use crate::jobs::{add_duration, EntityKind, JobError, Tag};
use crate::model::{Garden, WaterSchedule, Zone};
use crate::mqtt::WaterSource;
use crate::scheduler::{JobAction, Worker};
use crate::weather::scale_watering_duration;

/// Window of soil moisture readings averaged before a cycle.
pub(crate) const MOISTURE_WINDOW: Duration = Duration::from_secs(15 * 60);

/// How far ahead `get_next_water_time` searches for an active slot.
const ACTIVE_SEARCH_HORIZON: Duration = Duration::from_secs(366 * 24 * 60 * 60);

fn water_tags(ws_id: &str) -> [Tag; 2] {
    [Tag::Kind(EntityKind::Zone), Tag::entity(ws_id)]
}

/// Outcome of one scheduled cycle for one zone.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum WaterOutcome {
    Skipped { remaining: u32 },
    TooWet { moisture: f64 },
    ZeroDuration,
    Watered { duration: Duration, degraded: bool },
}

impl Worker {
    pub fn schedule_water_action(&self, ws: &WaterSchedule) -> Result<(), JobError> {
        self.jobs.schedule_recurring(
            &water_tags(&ws.id),
            ws.interval,
            ws.start_time,
            JobAction::Water {
                water_schedule_id: ws.id.clone(),
            },
        )?;
        info!(water_schedule_id = %ws.id, interval = ?ws.interval, "scheduled water action");
        Ok(())
    }

    pub fn reset_water_schedule(&self, ws: &WaterSchedule) -> Result<(), JobError> {
        self.jobs.remove_by_tags(&[Tag::entity(&ws.id)]);
        self.schedule_water_action(ws)
    }

    /// Next time the schedule will actually water, skipping slots outside
    /// its active period.
    pub fn get_next_water_time(&self, ws: &WaterSchedule) -> Option<OffsetDateTime> {
        let id = *self.jobs.find_by_tags(&water_tags(&ws.id)).first()?;
        let first = self.jobs.next_run(id)?;
        if ws.active_period.is_none() || ws.interval.is_zero() {
            return Some(first);
        }

        let horizon = add_duration(first, ACTIVE_SEARCH_HORIZON).ok()?;
        let mut next = first;
        while next <= horizon {
            if ws.is_active(next) {
                return Some(next);
            }
            next = add_duration(next, ws.interval).ok()?;
        }
        None
    }

    /// Among a zone's schedules, the one that waters soonest.
    pub async fn next_active_water_schedule(
        &self,
        zone: &Zone,
    ) -> anyhow::Result<Option<(WaterSchedule, OffsetDateTime)>> {
        let mut best: Option<(WaterSchedule, OffsetDateTime)> = None;
        for id in &zone.water_schedule_ids {
            let Some(ws) = self.db.get_water_schedule(id).await? else {
                continue;
            };
            let Some(next) = self.get_next_water_time(&ws) else {
                continue;
            };
            if best.as_ref().map_or(true, |(_, t)| next < *t) {
                best = Some((ws, next));
            }
        }
        Ok(best)
    }

    // ----------------------------
    // Job body
    // ----------------------------

    pub(crate) async fn execute_scheduled_water_job(&self, ws_id: &str) {
        let ws = match self.db.get_water_schedule(ws_id).await {
            Ok(Some(ws)) => ws,
            Ok(None) => {
                warn!(water_schedule_id = ws_id, "water schedule no longer exists");
                return;
            }
            Err(e) => {
                error!(water_schedule_id = ws_id, error = %format!("{e:#}"), "error getting water schedule");
                self.shared
                    .write()
                    .await
                    .record_error(format!("water job {ws_id}: {e}"));
                return;
            }
        };

        if !ws.is_active(self.now()) {
            info!(water_schedule_id = ws_id, "outside active period, skipping");
            self.shared
                .write()
                .await
                .record_scheduler(format!("{ws_id} skipped: outside active period"));
            return;
        }

        let targets = match self.db.get_zones_using_water_schedule(ws_id).await {
            Ok(t) => t,
            Err(e) => {
                error!(water_schedule_id = ws_id, error = %format!("{e:#}"), "error getting zones for water schedule");
                self.water_error(&ws, &e.to_string()).await;
                return;
            }
        };

        for (mut zone, garden) in targets {
            if let Err(e) = self.execute_scheduled_water_action(&garden, &mut zone, &ws).await {
                error!(water_schedule_id = ws_id, zone_id = %zone.id, error = %e, "error executing scheduled water action");
                self.water_error(&ws, &e.to_string()).await;
            }
        }
    }

    async fn water_error(&self, ws: &WaterSchedule, detail: &str) {
        self.shared
            .write()
            .await
            .record_error(format!("water schedule {}: {detail}", ws.id));
        if let Some(client_id) = &ws.notification_client_id {
            self.send_notification(client_id, &format!("{}: Water Action Error", ws.name), detail)
                .await;
        }
    }

    /// One scheduled cycle for one zone.
    pub async fn execute_scheduled_water_action(
        &self,
        garden: &Garden,
        zone: &mut Zone,
        ws: &WaterSchedule,
    ) -> Result<WaterOutcome, ActionError> {
        if let Some(remaining) = zone.skip_count.filter(|n| *n > 0) {
            let remaining = remaining - 1;
            zone.skip_count = Some(remaining);
            self.db.save_zone(zone).await?;
            info!(zone_id = %zone.id, remaining, "skip count set, skipping watering");
            self.shared
                .write()
                .await
                .record_scheduler(format!("{} skipped ({remaining} skip(s) left)", zone.name));
            return Ok(WaterOutcome::Skipped { remaining });
        }

        let mut degraded = false;
        if let Some(control) = ws.soil_moisture_control() {
            let since = self.now() - MOISTURE_WINDOW;
            match self
                .db
                .average_moisture(&garden.topic_prefix, zone.position, since)
                .await
            {
                Ok(Some(moisture)) if moisture > control.minimum_moisture => {
                    info!(zone_id = %zone.id, moisture, minimum = control.minimum_moisture, "soil is wet enough, skipping watering");
                    self.shared
                        .write()
                        .await
                        .record_scheduler(format!("{} skipped: moisture {moisture:.1}%", zone.name));
                    return Ok(WaterOutcome::TooWet { moisture });
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(zone_id = %zone.id, error = %format!("{e:#}"), "unable to get soil moisture");
                    degraded = true;
                }
            }
        }

        let duration = if degraded {
            ws.duration
        } else {
            let scaled = scale_watering_duration(ws, self).await;
            if scaled.had_error {
                warn!(water_schedule_id = %ws.id, "weather scaling failed, using configured duration");
                degraded = true;
                ws.duration
            } else {
                scaled.duration
            }
        };

        if duration.is_zero() {
            info!(zone_id = %zone.id, "scaled duration is zero, skipping watering");
            self.shared
                .write()
                .await
                .record_scheduler(format!("{} skipped: scaled duration is zero", zone.name));
            return Ok(WaterOutcome::ZeroDuration);
        }

        self.send_down_notification(garden, "Water").await;
        self.execute_water_action(garden, zone, duration, WaterSource::Schedule)
            .await?;
        Ok(WaterOutcome::Watered { duration, degraded })
    }
}

// ===========================================================================
// Tests
// ===========================================================================
