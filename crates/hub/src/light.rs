//! Light schedule state machine.
//!
//! The light state is never stored. It is inferred from the next ON and next
//! OFF job instants: whichever edge comes first tells us which state the
//! light is in now. A delay ("turn off for X, then resume") is an adhoc
//! one-shot ON job plus, when needed, pushing the regular ON job a day out so
//! it does not fire before the override.

use std::time::Duration;
use thiserror::Error;
use time::OffsetDateTime;
use tracing::{error, info, warn};

use crate::actions::LightAction;
use crate::duration::{parse_duration, ParseDurationError};
use crate::jobs::{add_duration, EntityKind, JobError, JobId, Tag};
use crate::model::{Garden, LightState};
use crate::scheduler::{JobAction, Worker};

const DAY: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, Error)]
pub enum LightError {
    #[error("unable to use delay when state is not OFF")]
    DelayStateNotOff,
    #[error("unable to execute delay that lasts longer than light_schedule")]
    DelayLongerThanSchedule,
    #[error("unable to schedule delay that extends past the light turning back on")]
    DelayExtendsPastOn,
    #[error("unable to find next ON Job for Garden {0}")]
    NoNextOn(String),
    #[error("unable to find next OFF Job for Garden {0}")]
    NoNextOff(String),
    #[error("garden {0} does not have a light schedule")]
    NoLightSchedule(String),
    #[error("garden {0} does not have an adhoc ON time")]
    NoAdhocTime(String),
    #[error("garden {0} not found")]
    GardenNotFound(String),
    #[error("invalid delay: {0}")]
    InvalidDelay(#[from] ParseDurationError),
    #[error(transparent)]
    Job(#[from] JobError),
    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

/// Current light state given the next ON and next OFF instants: if the OFF
/// edge comes first the light is on now, otherwise it is off.
pub fn infer_light_state(next_on: OffsetDateTime, next_off: OffsetDateTime) -> LightState {
    if next_off < next_on {
        LightState::On
    } else {
        LightState::Off
    }
}

fn light_tags(garden_id: &str, state: LightState) -> Vec<Tag> {
    vec![
        Tag::Kind(EntityKind::Garden),
        Tag::entity(garden_id),
        Tag::Light(state),
    ]
}

impl Worker {
    // ----------------------------
    // Registration
    // ----------------------------

    /// Register the recurring ON/OFF pair for a garden and re-arm a pending
    /// adhoc override, clearing it if it has already passed.
    pub async fn schedule_light_actions(&self, garden: &Garden) -> Result<(), LightError> {
        let ls = garden
            .light_schedule
            .as_ref()
            .ok_or_else(|| LightError::NoLightSchedule(garden.id.clone()))?;

        let on_anchor = ls.start_time.on_date(garden.created_at);
        let off_anchor = add_duration(on_anchor, ls.duration)?;

        self.jobs.schedule_recurring(
            &light_tags(&garden.id, LightState::On),
            DAY,
            on_anchor,
            JobAction::Light {
                garden_id: garden.id.clone(),
                state: LightState::On,
            },
        )?;
        self.jobs.schedule_recurring(
            &light_tags(&garden.id, LightState::Off),
            DAY,
            off_anchor,
            JobAction::Light {
                garden_id: garden.id.clone(),
                state: LightState::Off,
            },
        )?;
        info!(garden_id = %garden.id, on = %on_anchor, off = %off_anchor, "scheduled light actions");

        let Some(adhoc_at) = ls.adhoc_on_time else {
            return Ok(());
        };

        if adhoc_at <= self.now() {
            info!(garden_id = %garden.id, adhoc = %adhoc_at, "clearing expired adhoc ON time");
            let mut updated = garden.clone();
            if let Some(ls) = updated.light_schedule.as_mut() {
                ls.adhoc_on_time = None;
            }
            self.db.save_garden(&updated).await?;
            return Ok(());
        }

        if let Some(regular_on) = self.regular_light_job(&garden.id, LightState::On) {
            if let Some(next) = self.jobs.next_run(regular_on) {
                if next < adhoc_at {
                    self.jobs.reschedule(regular_on, add_duration(next, DAY)?)?;
                }
            }
        }
        self.schedule_adhoc_light_action(garden)
    }

    /// Replace any pending adhoc ON job with one at the garden's adhoc time.
    pub fn schedule_adhoc_light_action(&self, garden: &Garden) -> Result<(), LightError> {
        let at = garden
            .light_schedule
            .as_ref()
            .and_then(|ls| ls.adhoc_on_time)
            .ok_or_else(|| LightError::NoAdhocTime(garden.id.clone()))?;

        self.jobs
            .remove_by_tags(&[Tag::entity(&garden.id), Tag::Adhoc]);

        let mut tags = light_tags(&garden.id, LightState::On);
        tags.push(Tag::Adhoc);
        self.jobs.schedule_once(
            &tags,
            at,
            JobAction::AdhocLight {
                garden_id: garden.id.clone(),
                at,
            },
        );
        info!(garden_id = %garden.id, adhoc = %at, "scheduled adhoc light action");
        Ok(())
    }

    pub async fn reset_light_schedule(&self, garden: &Garden) -> Result<(), LightError> {
        self.jobs
            .remove_by_tags(&[Tag::Kind(EntityKind::Garden), Tag::entity(&garden.id)]);
        self.schedule_light_actions(garden).await
    }

    // ----------------------------
    // Queries
    // ----------------------------

    /// Soonest next run among jobs for `state`, adhoc overrides included.
    pub fn get_next_light_time(&self, garden_id: &str, state: LightState) -> Option<OffsetDateTime> {
        let id = *self.jobs.find_by_tags(&light_tags(garden_id, state)).first()?;
        self.jobs.next_run(id)
    }

    fn regular_light_job(&self, garden_id: &str, state: LightState) -> Option<JobId> {
        self.jobs
            .find_by_tags(&light_tags(garden_id, state))
            .into_iter()
            .find(|id| !self.jobs.has_tag(*id, &Tag::Adhoc))
    }

    /// Inferred current state, `None` when the garden has no light jobs.
    pub fn light_state(&self, garden_id: &str) -> Option<LightState> {
        let next_on = self.get_next_light_time(garden_id, LightState::On)?;
        let next_off = self.get_next_light_time(garden_id, LightState::Off)?;
        Some(infer_light_state(next_on, next_off))
    }

    // ----------------------------
    // Delay
    // ----------------------------

    /// Keep the light off for `action.for_duration`, then turn it back on.
    /// Everything is validated before any job or storage mutation.
    pub async fn schedule_light_delay(&self, garden_id: &str, action: &LightAction) -> Result<(), LightError> {
        if action.state != LightState::Off {
            return Err(LightError::DelayStateNotOff);
        }
        let delay = match &action.for_duration {
            Some(s) => parse_duration(s)?,
            None => Duration::ZERO,
        };

        let lock = self.garden_lock(garden_id);
        let _guard = lock.lock().await;

        let mut garden = self
            .db
            .get_garden(garden_id)
            .await?
            .ok_or_else(|| LightError::GardenNotFound(garden_id.to_string()))?;
        let ls = garden
            .light_schedule
            .as_mut()
            .ok_or_else(|| LightError::NoLightSchedule(garden_id.to_string()))?;

        if delay > ls.duration {
            return Err(LightError::DelayLongerThanSchedule);
        }

        let regular_on = self
            .regular_light_job(garden_id, LightState::On)
            .ok_or_else(|| LightError::NoNextOn(garden_id.to_string()))?;
        let regular_on_time = self
            .jobs
            .next_run(regular_on)
            .ok_or_else(|| LightError::NoNextOn(garden_id.to_string()))?;
        let next_on = self
            .get_next_light_time(garden_id, LightState::On)
            .unwrap_or(regular_on_time);
        let next_off = self
            .get_next_light_time(garden_id, LightState::Off)
            .ok_or_else(|| LightError::NoNextOff(garden_id.to_string()))?;

        let adhoc_at = match infer_light_state(next_on, next_off) {
            LightState::On => add_duration(self.now(), delay)?,
            _ => add_duration(next_on, delay)?,
        };
        if adhoc_at > next_off {
            return Err(LightError::DelayExtendsPastOn);
        }

        if regular_on_time < adhoc_at {
            self.jobs.reschedule(regular_on, add_duration(regular_on_time, DAY)?)?;
        }
        ls.adhoc_on_time = Some(adhoc_at);
        self.schedule_adhoc_light_action(&garden)?;
        self.db.save_garden(&garden).await?;

        info!(garden_id, delay = ?delay, adhoc = %adhoc_at, "scheduled light delay");
        Ok(())
    }

    // ----------------------------
    // Job bodies
    // ----------------------------

    pub(crate) async fn execute_scheduled_light_job(&self, garden_id: &str, state: LightState) {
        let garden = match self.db.get_garden(garden_id).await {
            Ok(Some(g)) => g,
            Ok(None) => {
                warn!(garden_id, "garden for scheduled light action no longer exists");
                return;
            }
            Err(e) => {
                error!(garden_id, error = %format!("{e:#}"), "error getting garden for light action");
                self.shared
                    .write()
                    .await
                    .record_error(format!("light job for {garden_id}: {e}"));
                return;
            }
        };

        info!(garden_id, %state, "executing scheduled light action");
        self.send_down_notification(&garden, "Light").await;

        let action = LightAction {
            state,
            for_duration: None,
        };
        if let Err(e) = self.execute_light_action(&garden, &action).await {
            error!(garden_id, error = %e, "error executing scheduled light action");
            self.shared
                .write()
                .await
                .record_error(format!("light action for {garden_id}: {e}"));
            if let Some(client_id) = &garden.notification_client_id {
                self.send_notification(
                    client_id,
                    &format!("{}: Light Action Error", garden.name),
                    &e.to_string(),
                )
                .await;
            }
            return;
        }

        if let Some(client_id) = &garden.notification_client_id {
            if garden.notification_settings.light_schedule {
                self.send_notification(
                    client_id,
                    &format!("{}: Light {}", garden.name, state),
                    "Successfully executed LightAction",
                )
                .await;
            }
        }
    }

    /// Fire an adhoc ON override and clear it from the garden. A firing whose
    /// time no longer matches the stored override was superseded and does
    /// nothing.
    pub(crate) async fn execute_adhoc_light_job(&self, garden_id: &str, at: OffsetDateTime) {
        let lock = self.garden_lock(garden_id);
        let _guard = lock.lock().await;

        let mut garden = match self.db.get_garden(garden_id).await {
            Ok(Some(g)) => g,
            Ok(None) => {
                warn!(garden_id, "garden for adhoc light action no longer exists");
                return;
            }
            Err(e) => {
                error!(garden_id, error = %format!("{e:#}"), "error getting garden for adhoc light action");
                return;
            }
        };

        let current = garden.light_schedule.as_ref().and_then(|ls| ls.adhoc_on_time);
        if current != Some(at) {
            info!(garden_id, fired = %at, "adhoc light action superseded, skipping");
            return;
        }

        let action = LightAction {
            state: LightState::On,
            for_duration: None,
        };
        if let Err(e) = self.execute_light_action(&garden, &action).await {
            error!(garden_id, error = %e, "error executing adhoc light action");
            self.shared
                .write()
                .await
                .record_error(format!("adhoc light action for {garden_id}: {e}"));
            return;
        }

        if let Some(ls) = garden.light_schedule.as_mut() {
            ls.adhoc_on_time = None;
        }
        if let Err(e) = self.db.save_garden(&garden).await {
            error!(garden_id, error = %format!("{e:#}"), "error clearing adhoc ON time");
            self.shared
                .write()
                .await
                .record_error(format!("clearing adhoc ON time for {garden_id}: {e}"));
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
