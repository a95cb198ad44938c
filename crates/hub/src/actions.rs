//! Action dispatcher: builds and publishes water, light and stop commands.
//! Used both by the HTTP layer and by scheduled job bodies.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tracing::info;
use uuid::Uuid;

use crate::duration::{self, parse_duration, ParseDurationError};
use crate::light::LightError;
use crate::model::{Garden, LightState, Zone};
use crate::mqtt::{self, LightMessage, TopicError, WaterMessage, WaterSource, STOP_PAYLOAD};
use crate::scheduler::Worker;

// ---------------------------------------------------------------------------
// Request types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LightAction {
    #[serde(default)]
    pub state: LightState,
    /// When set with state OFF, turn the light back on after this long.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub for_duration: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StopAction {
    #[serde(default)]
    pub all: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WaterAction {
    #[serde(with = "humantime_serde")]
    pub duration: Duration,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GardenAction {
    #[serde(default)]
    pub light: Option<LightAction>,
    #[serde(default)]
    pub stop: Option<StopAction>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ZoneAction {
    #[serde(default)]
    pub water: Option<WaterAction>,
}

#[derive(Debug, Error)]
pub enum ActionError {
    #[error("garden {0} not found")]
    GardenNotFound(String),
    #[error("zone {0} not found")]
    ZoneNotFound(String),
    #[error("action must contain at least one sub-action")]
    Empty,
    #[error(transparent)]
    Topic(#[from] TopicError),
    #[error(transparent)]
    InvalidDuration(#[from] ParseDurationError),
    #[error(transparent)]
    Light(#[from] LightError),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Worker {
    // ----------------------------
    // Single actions
    // ----------------------------

    pub async fn execute_water_action(
        &self,
        garden: &Garden,
        zone: &Zone,
        duration: Duration,
        source: WaterSource,
    ) -> Result<(), ActionError> {
        let topic = mqtt::water_topic(&garden.topic_prefix)?;
        let msg = WaterMessage {
            duration: duration.as_millis() as u64,
            zone_id: zone.id.clone(),
            position: zone.position,
            id: Uuid::new_v4().to_string(),
            source,
        };
        let payload = serde_json::to_vec(&msg).map_err(anyhow::Error::from)?;
        self.publisher.publish(&topic, payload).await?;

        info!(garden_id = %garden.id, zone_id = %zone.id, duration_ms = msg.duration, event_id = %msg.id, "water action published");
        self.shared.write().await.record_water(format!(
            "{} / {} watering for {}",
            garden.name,
            zone.name,
            duration::format_duration(duration)
        ));
        Ok(())
    }

    pub async fn execute_stop_action(&self, garden: &Garden, all: bool) -> Result<(), ActionError> {
        let topic = if all {
            mqtt::stop_all_topic(&garden.topic_prefix)?
        } else {
            mqtt::stop_topic(&garden.topic_prefix)?
        };
        self.publisher.publish(&topic, STOP_PAYLOAD.to_vec()).await?;

        info!(garden_id = %garden.id, all, "stop action published");
        self.shared.write().await.record_stop(format!(
            "{} stop{}",
            garden.name,
            if all { " all" } else { "" }
        ));
        Ok(())
    }

    /// Publish a light command. A non-zero `for_duration` then schedules the
    /// delayed return to ON; a failure there is reported even though the
    /// command was already sent.
    pub async fn execute_light_action(&self, garden: &Garden, action: &LightAction) -> Result<(), ActionError> {
        let delay = action
            .for_duration
            .as_deref()
            .map(parse_duration)
            .transpose()?
            .filter(|d| !d.is_zero());

        let topic = mqtt::light_topic(&garden.topic_prefix)?;
        let msg = LightMessage {
            state: action.state,
            for_duration: delay.map(duration::format_duration),
        };
        let payload = serde_json::to_vec(&msg).map_err(anyhow::Error::from)?;
        self.publisher.publish(&topic, payload).await?;

        info!(garden_id = %garden.id, state = %action.state, "light action published");
        self.shared.write().await.record_light(format!(
            "{} light {}",
            garden.name,
            match action.state {
                LightState::Toggle => "TOGGLE",
                s => s.as_str(),
            }
        ));

        if delay.is_some() {
            self.schedule_light_delay(&garden.id, action).await?;
        }
        Ok(())
    }

    // ----------------------------
    // Bundled entry points
    // ----------------------------

    /// Run a garden's sub-actions: stop first, then light.
    pub async fn execute_garden_action(&self, garden_id: &str, action: &GardenAction) -> Result<(), ActionError> {
        if action.stop.is_none() && action.light.is_none() {
            return Err(ActionError::Empty);
        }
        let garden = self
            .db
            .get_garden(garden_id)
            .await?
            .ok_or_else(|| ActionError::GardenNotFound(garden_id.to_string()))?;

        if let Some(stop) = &action.stop {
            self.execute_stop_action(&garden, stop.all).await?;
        }
        if let Some(light) = &action.light {
            self.execute_light_action(&garden, light).await?;
        }
        Ok(())
    }

    pub async fn execute_zone_action(
        &self,
        garden_id: &str,
        zone_id: &str,
        action: &ZoneAction,
    ) -> Result<(), ActionError> {
        let water = action.water.as_ref().ok_or(ActionError::Empty)?;
        let garden = self
            .db
            .get_garden(garden_id)
            .await?
            .ok_or_else(|| ActionError::GardenNotFound(garden_id.to_string()))?;
        let zone = self
            .db
            .get_zone(zone_id)
            .await?
            .filter(|z| z.garden_id == garden.id)
            .ok_or_else(|| ActionError::ZoneNotFound(zone_id.to_string()))?;

        self.execute_water_action(&garden, &zone, water.duration, WaterSource::Command)
            .await
    }
}

// ===========================================================================
// Tests
// ===========================================================================
