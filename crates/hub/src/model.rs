//! Persisted entities: gardens with their light schedule, zones, water
//! schedules, and the configs used to build weather/notification clients.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use time::macros::format_description;
use time::{Date, Month, OffsetDateTime, Time, UtcOffset};

use crate::weather::ScaleControl;

// ---------------------------------------------------------------------------
// Light state
// ---------------------------------------------------------------------------

/// Light state as sent to a controller. `Toggle` (empty string on the wire)
/// asks the controller to flip whatever state it is in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum LightState {
    Off,
    On,
    #[default]
    Toggle,
}

impl LightState {
    pub fn as_str(self) -> &'static str {
        match self {
            LightState::Off => "OFF",
            LightState::On => "ON",
            LightState::Toggle => "",
        }
    }
}

impl fmt::Display for LightState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LightState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_uppercase().as_str() {
            "OFF" => Ok(LightState::Off),
            "ON" => Ok(LightState::On),
            "" => Ok(LightState::Toggle),
            other => Err(format!("unknown light state '{other}'")),
        }
    }
}

impl Serialize for LightState {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for LightState {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(d)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

// ---------------------------------------------------------------------------
// Start time (time-of-day with offset, no date)
// ---------------------------------------------------------------------------

/// Time of day in `HH:MM:SS±hh:mm` form.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StartTime {
    pub time: Time,
    pub offset: UtcOffset,
}

impl StartTime {
    /// The instant this time of day falls on for the calendar date `on`
    /// observes in this start time's offset.
    pub fn on_date(&self, on: OffsetDateTime) -> OffsetDateTime {
        let date: Date = on.to_offset(self.offset).date();
        date.with_time(self.time)
            .assume_offset(self.offset)
            .to_offset(UtcOffset::UTC)
    }
}

impl FromStr for StartTime {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.len() < 9 || !s.is_char_boundary(8) {
            return Err(format!("invalid start time '{s}', expected HH:MM:SS+hh:mm"));
        }
        let (clock, offset) = s.split_at(8);
        let time = Time::parse(clock, format_description!("[hour]:[minute]:[second]"))
            .map_err(|e| format!("invalid start time '{s}': {e}"))?;
        let offset = if offset == "Z" {
            UtcOffset::UTC
        } else {
            UtcOffset::parse(
                offset,
                format_description!("[offset_hour sign:mandatory]:[offset_minute]"),
            )
            .map_err(|e| format!("invalid start time offset '{s}': {e}"))?
        };
        Ok(Self { time, offset })
    }
}

impl fmt::Display for StartTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let clock = self
            .time
            .format(format_description!("[hour]:[minute]:[second]"))
            .map_err(|_| fmt::Error)?;
        let offset = self
            .offset
            .format(format_description!(
                "[offset_hour sign:mandatory]:[offset_minute]"
            ))
            .map_err(|_| fmt::Error)?;
        write!(f, "{clock}{offset}")
    }
}

impl Serialize for StartTime {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for StartTime {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(d)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

// ---------------------------------------------------------------------------
// Garden
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LightSchedule {
    #[serde(with = "humantime_serde")]
    pub duration: Duration,
    pub start_time: StartTime,
    /// Present only while a one-time ON override is pending.
    #[serde(
        default,
        with = "time::serde::rfc3339::option",
        skip_serializing_if = "Option::is_none"
    )]
    pub adhoc_on_time: Option<OffsetDateTime>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NotificationSettings {
    #[serde(default)]
    pub controller_startup: bool,
    #[serde(default)]
    pub light_schedule: bool,
    #[serde(
        default,
        with = "humantime_serde",
        skip_serializing_if = "Option::is_none"
    )]
    pub downtime: Option<Duration>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Garden {
    pub id: String,
    pub name: String,
    pub topic_prefix: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub light_schedule: Option<LightSchedule>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notification_client_id: Option<String>,
    #[serde(default)]
    pub notification_settings: NotificationSettings,
}

// ---------------------------------------------------------------------------
// Zone
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Zone {
    pub id: String,
    pub garden_id: String,
    pub name: String,
    pub position: u32,
    /// Number of upcoming scheduled waterings to silently skip.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip_count: Option<u32>,
    #[serde(default)]
    pub water_schedule_ids: Vec<String>,
}

// ---------------------------------------------------------------------------
// Water schedule
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WeatherControl {
    #[serde(rename = "rain_control", default, skip_serializing_if = "Option::is_none")]
    pub rain: Option<ScaleControl>,
    #[serde(
        rename = "temperature_control",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub temperature: Option<ScaleControl>,
    #[serde(
        rename = "moisture_control",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub soil_moisture: Option<SoilMoistureControl>,
}

/// Skip watering while the soil is wetter than `minimum_moisture` percent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SoilMoistureControl {
    pub minimum_moisture: f64,
}

/// Months (inclusive) during which a water schedule runs. May wrap across
/// the new year, e.g. November through February.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivePeriod {
    pub start_month: String,
    pub end_month: String,
}

impl ActivePeriod {
    pub fn months(&self) -> Result<(Month, Month), String> {
        let start = parse_month(&self.start_month)?;
        let end = parse_month(&self.end_month)?;
        if start == end {
            return Err("start_month and end_month must be different".to_string());
        }
        Ok((start, end))
    }

    pub fn contains(&self, at: OffsetDateTime) -> bool {
        let Ok((start, end)) = self.months() else {
            return true;
        };
        let (s, e, m) = (start as u8, end as u8, at.month() as u8);
        if s <= e {
            (s..=e).contains(&m)
        } else {
            m >= s || m <= e
        }
    }
}

fn parse_month(name: &str) -> Result<Month, String> {
    let month = match name.trim().to_lowercase().as_str() {
        "january" => Month::January,
        "february" => Month::February,
        "march" => Month::March,
        "april" => Month::April,
        "may" => Month::May,
        "june" => Month::June,
        "july" => Month::July,
        "august" => Month::August,
        "september" => Month::September,
        "october" => Month::October,
        "november" => Month::November,
        "december" => Month::December,
        _ => return Err(format!("invalid month '{name}'")),
    };
    Ok(month)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WaterSchedule {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(with = "humantime_serde")]
    pub duration: Duration,
    #[serde(with = "humantime_serde")]
    pub interval: Duration,
    /// Absolute anchor of the recurrence.
    #[serde(with = "time::serde::rfc3339")]
    pub start_time: OffsetDateTime,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weather_control: Option<WeatherControl>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_period: Option<ActivePeriod>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notification_client_id: Option<String>,
}

impl WaterSchedule {
    pub fn rain_control(&self) -> Option<&ScaleControl> {
        self.weather_control.as_ref()?.rain.as_ref()
    }

    pub fn temperature_control(&self) -> Option<&ScaleControl> {
        self.weather_control.as_ref()?.temperature.as_ref()
    }

    pub fn soil_moisture_control(&self) -> Option<&SoilMoistureControl> {
        self.weather_control.as_ref()?.soil_moisture.as_ref()
    }

    pub fn is_active(&self, at: OffsetDateTime) -> bool {
        self.active_period.as_ref().map_or(true, |p| p.contains(at))
    }
}

// ---------------------------------------------------------------------------
// Client configs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeatherClientConfig {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub options: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationClientConfig {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub options: serde_json::Value,
}
