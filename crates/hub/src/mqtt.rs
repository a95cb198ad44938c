use anyhow::{Context, Result};
use async_trait::async_trait;
use rumqttc::{AsyncClient, QoS};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

use crate::model::LightState;

/// Payload sent on stop topics; controllers ignore the body.
pub const STOP_PAYLOAD: &[u8] = b"no message";

/// Log line a controller publishes once its setup finishes.
pub const STARTUP_MESSAGE: &str = "garden-controller setup complete";

/// Subscriptions covering every garden's inbound data topics.
pub const SUBSCRIPTIONS: [&str; 4] = [
    "+/data/health",
    "+/data/moisture",
    "+/data/logs",
    "+/data/water",
];

// ---------------------------------------------------------------------------
// Outbound topics
// ---------------------------------------------------------------------------

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TopicError {
    #[error("topic prefix is empty")]
    EmptyPrefix,
    #[error("topic prefix {0:?} contains a wildcard or separator")]
    InvalidPrefix(String),
}

fn command_topic(prefix: &str, command: &str) -> Result<String, TopicError> {
    if prefix.is_empty() {
        return Err(TopicError::EmptyPrefix);
    }
    if prefix.contains(['+', '#', '/']) {
        return Err(TopicError::InvalidPrefix(prefix.to_string()));
    }
    Ok(format!("{prefix}/command/{command}"))
}

pub fn water_topic(prefix: &str) -> Result<String, TopicError> {
    command_topic(prefix, "water")
}

pub fn stop_topic(prefix: &str) -> Result<String, TopicError> {
    command_topic(prefix, "stop")
}

pub fn stop_all_topic(prefix: &str) -> Result<String, TopicError> {
    command_topic(prefix, "stop_all")
}

pub fn light_topic(prefix: &str) -> Result<String, TopicError> {
    command_topic(prefix, "light")
}

// ---------------------------------------------------------------------------
// Outbound messages
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WaterSource {
    Command,
    Schedule,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WaterMessage {
    /// Milliseconds.
    pub duration: u64,
    pub zone_id: String,
    pub position: u32,
    /// Unique per dispatch so controllers can report against it.
    pub id: String,
    pub source: WaterSource,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LightMessage {
    pub state: LightState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub for_duration: Option<String>,
}

// ---------------------------------------------------------------------------
// Publisher
// ---------------------------------------------------------------------------

#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<()>;
}

#[async_trait]
impl Publisher for AsyncClient {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<()> {
        AsyncClient::publish(self, topic, QoS::AtLeastOnce, false, payload)
            .await
            .with_context(|| format!("publish to {topic} failed"))
    }
}

// ---------------------------------------------------------------------------
// Inbound topic / payload helpers
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    /// Controller heartbeat.
    Health { prefix: String },
    /// Soil moisture percentage for the zone at `position`.
    Moisture { prefix: String, position: u32, value: f64 },
    /// Free-form controller log line.
    Log { prefix: String, message: String },
    /// Controller finished watering the zone at `position`.
    WaterComplete { prefix: String, position: u32, duration: Duration },
}

/// Extract the garden prefix from "<prefix>/data/<kind>".
pub(crate) fn extract_prefix<'a>(topic: &'a str, kind: &str) -> Option<&'a str> {
    let prefix = topic.strip_suffix(kind)?.strip_suffix("/data/")?;
    if prefix.is_empty() || prefix.contains('/') {
        None
    } else {
        Some(prefix)
    }
}

/// Value of `key=<value>` in an influx-style line such as
/// `moisture,zone=1 value=42.5`.
fn line_field<'a>(line: &'a str, key: &str) -> Option<&'a str> {
    line.split([',', ' '])
        .filter_map(|part| part.split_once('='))
        .find(|(k, _)| *k == key)
        .map(|(_, v)| v.trim())
}

/// `health garden="<prefix>"` -> `<prefix>`.
pub(crate) fn parse_health(payload: &str) -> Option<&str> {
    payload
        .trim()
        .strip_prefix("health garden=\"")?
        .strip_suffix('"')
}

/// `moisture,zone=<position> value=<percent>`.
pub(crate) fn parse_moisture(payload: &str) -> Result<(u32, f64), String> {
    let position = line_field(payload, "zone")
        .ok_or("missing zone")?
        .parse::<u32>()
        .map_err(|e| format!("invalid zone: {e}"))?;
    let value = line_field(payload, "value")
        .ok_or("missing value")?
        .parse::<f64>()
        .map_err(|e| format!("invalid value: {e}"))?;
    Ok((position, value))
}

/// `logs message="<text>"` -> `<text>`.
pub(crate) fn parse_log(payload: &str) -> Option<&str> {
    payload
        .trim()
        .strip_prefix("logs message=\"")?
        .strip_suffix('"')
}

/// `water,zone=<position> millis=<ms>`.
pub(crate) fn parse_water_complete(payload: &str) -> Result<(u32, Duration), String> {
    let position = line_field(payload, "zone")
        .ok_or("missing zone")?
        .parse::<u32>()
        .map_err(|e| format!("invalid zone: {e}"))?;
    let millis = line_field(payload, "millis")
        .ok_or("missing millis")?
        .parse::<u64>()
        .map_err(|e| format!("invalid millis: {e}"))?;
    Ok((position, Duration::from_millis(millis)))
}

/// Classify an inbound publish.
pub fn parse_inbound(topic: &str, payload: &[u8]) -> Result<Inbound, String> {
    let text = String::from_utf8_lossy(payload);

    if let Some(prefix) = extract_prefix(topic, "health") {
        let garden = parse_health(&text).ok_or_else(|| format!("bad health payload '{text}'"))?;
        if garden != prefix {
            return Err(format!("health payload for '{garden}' on topic of '{prefix}'"));
        }
        return Ok(Inbound::Health { prefix: prefix.to_string() });
    }
    if let Some(prefix) = extract_prefix(topic, "moisture") {
        let (position, value) = parse_moisture(&text)?;
        return Ok(Inbound::Moisture {
            prefix: prefix.to_string(),
            position,
            value,
        });
    }
    if let Some(prefix) = extract_prefix(topic, "logs") {
        let message = parse_log(&text).ok_or_else(|| format!("bad logs payload '{text}'"))?;
        return Ok(Inbound::Log {
            prefix: prefix.to_string(),
            message: message.to_string(),
        });
    }
    if let Some(prefix) = extract_prefix(topic, "water") {
        let (position, duration) = parse_water_complete(&text)?;
        return Ok(Inbound::WaterComplete {
            prefix: prefix.to_string(),
            position,
            duration,
        });
    }
    Err(format!("unhandled topic {topic}"))
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    // -- topics -------------------------------------------------------------

    #[test]
    fn command_topics() {
        assert_eq!(water_topic("garden").unwrap(), "garden/command/water");
        assert_eq!(stop_topic("garden").unwrap(), "garden/command/stop");
        assert_eq!(stop_all_topic("garden").unwrap(), "garden/command/stop_all");
        assert_eq!(light_topic("garden").unwrap(), "garden/command/light");
    }

    #[test]
    fn topic_empty_prefix() {
        assert_eq!(water_topic(""), Err(TopicError::EmptyPrefix));
    }

    #[test]
    fn topic_wildcard_prefix() {
        assert!(matches!(light_topic("a/#"), Err(TopicError::InvalidPrefix(_))));
        assert!(matches!(stop_topic("+"), Err(TopicError::InvalidPrefix(_))));
    }

    // -- messages -----------------------------------------------------------

    #[test]
    fn water_message_json() {
        let msg = WaterMessage {
            duration: 15000,
            zone_id: "z1".into(),
            position: 2,
            id: "evt".into(),
            source: WaterSource::Schedule,
        };
        let v: serde_json::Value = serde_json::to_value(&msg).unwrap();
        assert_eq!(
            v,
            serde_json::json!({
                "duration": 15000,
                "zone_id": "z1",
                "position": 2,
                "id": "evt",
                "source": "schedule"
            })
        );
    }

    #[test]
    fn light_message_omits_missing_duration() {
        let msg = LightMessage {
            state: LightState::On,
            for_duration: None,
        };
        assert_eq!(serde_json::to_string(&msg).unwrap(), r#"{"state":"ON"}"#);
    }

    // -- extract_prefix -----------------------------------------------------

    #[test]
    fn extract_prefix_valid() {
        assert_eq!(extract_prefix("front-yard/data/health", "health"), Some("front-yard"));
    }

    #[test]
    fn extract_prefix_wrong_kind() {
        assert_eq!(extract_prefix("front-yard/data/logs", "health"), None);
    }

    #[test]
    fn extract_prefix_nested() {
        assert_eq!(extract_prefix("a/b/data/health", "health"), None);
    }

    #[test]
    fn extract_prefix_empty() {
        assert_eq!(extract_prefix("/data/health", "health"), None);
        assert_eq!(extract_prefix("", "health"), None);
    }

    // -- payloads -----------------------------------------------------------

    #[test]
    fn health_payload() {
        assert_eq!(parse_health(r#"health garden="garden""#), Some("garden"));
        assert_eq!(parse_health("health"), None);
    }

    #[test]
    fn moisture_payload() {
        assert_eq!(parse_moisture("moisture,zone=1 value=42.5"), Ok((1, 42.5)));
        assert!(parse_moisture("moisture,zone=x value=1").is_err());
        assert!(parse_moisture("moisture,zone=1").is_err());
    }

    #[test]
    fn log_payload() {
        assert_eq!(
            parse_log(r#"logs message="garden-controller setup complete""#),
            Some(STARTUP_MESSAGE)
        );
        assert_eq!(parse_log("message=hi"), None);
    }

    #[test]
    fn water_complete_payload() {
        assert_eq!(
            parse_water_complete("water,zone=0 millis=6000"),
            Ok((0, Duration::from_secs(6)))
        );
        assert!(parse_water_complete("water,zone=0").is_err());
    }

    // -- parse_inbound ------------------------------------------------------

    #[test]
    fn inbound_health() {
        let msg = parse_inbound("garden/data/health", br#"health garden="garden""#).unwrap();
        assert_eq!(msg, Inbound::Health { prefix: "garden".into() });
    }

    #[test]
    fn inbound_health_mismatched_prefix() {
        assert!(parse_inbound("garden/data/health", br#"health garden="other""#).is_err());
    }

    #[test]
    fn inbound_moisture() {
        let msg = parse_inbound("garden/data/moisture", b"moisture,zone=3 value=61").unwrap();
        assert_eq!(
            msg,
            Inbound::Moisture {
                prefix: "garden".into(),
                position: 3,
                value: 61.0
            }
        );
    }

    #[test]
    fn inbound_unknown_topic() {
        assert!(parse_inbound("garden/data/temperature", b"x").is_err());
    }
}
