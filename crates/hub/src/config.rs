//! TOML config file loading, validation, and database seeding for gardens,
//! zones, water schedules and collaborator clients.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::HashSet;
use std::time::Duration;

use crate::db::Db;
use crate::model::{
    Garden, NotificationClientConfig, WaterSchedule, WeatherClientConfig, Zone,
};
use crate::weather::ScaleControl;
use crate::{mqtt, notify, weather};

const DAY: Duration = Duration::from_secs(24 * 60 * 60);
const MAX_INTERVAL: Duration = Duration::from_secs(366 * 24 * 60 * 60);

// ---------------------------------------------------------------------------
// Config file structures
// ---------------------------------------------------------------------------

/// Timestamps (`created_at`, `start_time`, `adhoc_on_time`) are RFC 3339
/// strings and must be quoted in TOML.
#[derive(Debug, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub gardens: Vec<Garden>,
    #[serde(default)]
    pub zones: Vec<Zone>,
    #[serde(default)]
    pub water_schedules: Vec<WaterSchedule>,
    #[serde(default)]
    pub weather_clients: Vec<WeatherClientConfig>,
    #[serde(default)]
    pub notification_clients: Vec<NotificationClientConfig>,
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

fn check_ids<'a>(kind: &str, ids: impl Iterator<Item = &'a str>, errors: &mut Vec<String>) {
    let mut seen = HashSet::new();
    for (i, id) in ids.enumerate() {
        if id.trim().is_empty() {
            errors.push(format!("{kind} #{i}: id is empty"));
        } else if !seen.insert(id) {
            errors.push(format!("{kind} '{id}': duplicate id"));
        }
    }
}

impl Config {
    /// Validate all config entries. Returns `Ok(())` or an error describing
    /// every violation found (not just the first one).
    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        self.validate_clients(&mut errors);
        self.validate_gardens(&mut errors);
        self.validate_water_schedules(&mut errors);
        self.validate_zones(&mut errors);

        if errors.is_empty() {
            Ok(())
        } else {
            bail!(
                "config validation failed ({} error{}):\n  - {}",
                errors.len(),
                if errors.len() == 1 { "" } else { "s" },
                errors.join("\n  - ")
            );
        }
    }

    fn notification_client_ids(&self) -> HashSet<&str> {
        self.notification_clients.iter().map(|c| c.id.as_str()).collect()
    }

    fn validate_clients(&self, errors: &mut Vec<String>) {
        check_ids(
            "weather client",
            self.weather_clients.iter().map(|c| c.id.as_str()),
            errors,
        );
        for c in &self.weather_clients {
            if let Err(e) = weather::new_client(c) {
                errors.push(format!("weather client '{}': {e:#}", c.id));
            }
        }

        check_ids(
            "notification client",
            self.notification_clients.iter().map(|c| c.id.as_str()),
            errors,
        );
        for c in &self.notification_clients {
            if let Err(e) = notify::new_client(c) {
                errors.push(format!("notification client '{}': {e:#}", c.id));
            }
        }
    }

    fn validate_gardens(&self, errors: &mut Vec<String>) {
        check_ids("garden", self.gardens.iter().map(|g| g.id.as_str()), errors);
        let clients = self.notification_client_ids();
        let mut prefixes: HashSet<&str> = HashSet::new();

        for g in &self.gardens {
            let ctx = format!("garden '{}'", g.id);
            errors.extend(garden_errors(g).into_iter().map(|e| format!("{ctx}: {e}")));

            if mqtt::water_topic(&g.topic_prefix).is_ok() && !prefixes.insert(g.topic_prefix.as_str()) {
                errors.push(format!(
                    "{ctx}: topic_prefix '{}' is already used by another garden",
                    g.topic_prefix
                ));
            }
            if let Some(id) = &g.notification_client_id {
                if !clients.contains(id.as_str()) {
                    errors.push(format!("{ctx}: notification client '{id}' does not exist"));
                }
            }
        }
    }

    fn validate_water_schedules(&self, errors: &mut Vec<String>) {
        check_ids(
            "water schedule",
            self.water_schedules.iter().map(|ws| ws.id.as_str()),
            errors,
        );
        let weather: HashSet<&str> = self.weather_clients.iter().map(|c| c.id.as_str()).collect();
        let clients = self.notification_client_ids();

        for ws in &self.water_schedules {
            let ctx = format!("water schedule '{}'", ws.id);
            errors.extend(water_schedule_errors(ws).into_iter().map(|e| format!("{ctx}: {e}")));

            for (name, sc) in weather_controls(ws) {
                if !weather.contains(sc.client_id.as_str()) {
                    errors.push(format!(
                        "{ctx}: {name}: weather client '{}' does not exist",
                        sc.client_id
                    ));
                }
            }
            if let Some(id) = &ws.notification_client_id {
                if !clients.contains(id.as_str()) {
                    errors.push(format!("{ctx}: notification client '{id}' does not exist"));
                }
            }
        }
    }

    fn validate_zones(&self, errors: &mut Vec<String>) {
        check_ids("zone", self.zones.iter().map(|z| z.id.as_str()), errors);
        let gardens: HashSet<&str> = self.gardens.iter().map(|g| g.id.as_str()).collect();
        let schedules: HashSet<&str> = self.water_schedules.iter().map(|ws| ws.id.as_str()).collect();
        let mut positions: HashSet<(&str, u32)> = HashSet::new();

        for z in &self.zones {
            let ctx = format!("zone '{}'", z.id);

            if z.name.trim().is_empty() {
                errors.push(format!("{ctx}: name is empty"));
            }

            if !gardens.contains(z.garden_id.as_str()) {
                errors.push(format!("{ctx}: garden '{}' does not exist", z.garden_id));
            } else if !positions.insert((z.garden_id.as_str(), z.position)) {
                errors.push(format!(
                    "{ctx}: position {} is already used in garden '{}'",
                    z.position, z.garden_id
                ));
            }

            for id in &z.water_schedule_ids {
                if !schedules.contains(id.as_str()) {
                    errors.push(format!("{ctx}: water schedule '{id}' does not exist"));
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Per-entity checks
// ---------------------------------------------------------------------------
//
// Shared by config validation and the HTTP PUT handlers. References to other
// entities are checked by the caller against whatever it has at hand.

/// Problems with a garden that need no other entity to detect.
pub fn garden_errors(g: &Garden) -> Vec<String> {
    let mut errors = Vec::new();

    if g.name.trim().is_empty() {
        errors.push("name is empty".to_string());
    }
    if let Err(e) = mqtt::water_topic(&g.topic_prefix) {
        errors.push(e.to_string());
    }
    if let Some(ls) = &g.light_schedule {
        if ls.duration.is_zero() || ls.duration >= DAY {
            errors.push("light_schedule.duration must be between 0 and 24h".to_string());
        }
    }
    if let Some(downtime) = g.notification_settings.downtime {
        if downtime > MAX_INTERVAL {
            errors.push("notification_settings.downtime must be at most 366 days".to_string());
        }
    }
    errors
}

/// Problems with a water schedule that need no other entity to detect.
pub fn water_schedule_errors(ws: &WaterSchedule) -> Vec<String> {
    let mut errors = Vec::new();

    if ws.duration.is_zero() {
        errors.push("duration must be positive".to_string());
    } else if ws.duration > DAY {
        errors.push("duration must be at most 24h".to_string());
    }
    if ws.interval.is_zero() {
        errors.push("interval must be positive".to_string());
    } else if ws.interval > MAX_INTERVAL {
        errors.push("interval must be at most 366 days".to_string());
    }

    if let Some(period) = &ws.active_period {
        if let Err(e) = period.months() {
            errors.push(format!("active_period: {e}"));
        }
    }

    for (name, sc) in weather_controls(ws) {
        if sc.range <= 0.0 {
            errors.push(format!("{name}: range must be positive, got {}", sc.range));
        }
        if !(0.0..=1.0).contains(&sc.factor) {
            errors.push(format!("{name}: factor {} out of range [0.0, 1.0]", sc.factor));
        }
    }
    if let Some(m) = ws.soil_moisture_control() {
        if !(0.0..=100.0).contains(&m.minimum_moisture) {
            errors.push(format!(
                "moisture_control: minimum_moisture {} out of range [0, 100]",
                m.minimum_moisture
            ));
        }
    }
    errors
}

fn weather_controls(ws: &WaterSchedule) -> impl Iterator<Item = (&'static str, &ScaleControl)> {
    [
        ("temperature_control", ws.temperature_control()),
        ("rain_control", ws.rain_control()),
    ]
    .into_iter()
    .filter_map(|(name, sc)| sc.map(|sc| (name, sc)))
}

// ---------------------------------------------------------------------------
// Load + apply
// ---------------------------------------------------------------------------

/// Read, parse, and validate a TOML config file.
pub fn load(path: &str) -> Result<Config> {
    let contents =
        std::fs::read_to_string(path).with_context(|| format!("failed to read config: {path}"))?;
    let config: Config =
        toml::from_str(&contents).with_context(|| format!("failed to parse config: {path}"))?;
    config
        .validate()
        .with_context(|| format!("invalid config: {path}"))?;
    Ok(config)
}

/// Upsert every entity from the config into the database. Clients go first
/// so entities never reference a missing client.
pub async fn apply(config: &Config, db: &Db) -> Result<()> {
    for c in &config.weather_clients {
        db.save_weather_client(c)
            .await
            .with_context(|| format!("failed to save weather client '{}'", c.id))?;
    }
    for c in &config.notification_clients {
        db.save_notification_client(c)
            .await
            .with_context(|| format!("failed to save notification client '{}'", c.id))?;
    }
    for g in &config.gardens {
        db.save_garden(g)
            .await
            .with_context(|| format!("failed to save garden '{}'", g.id))?;
    }
    for ws in &config.water_schedules {
        db.save_water_schedule(ws)
            .await
            .with_context(|| format!("failed to save water schedule '{}'", ws.id))?;
    }
    for z in &config.zones {
        db.save_zone(z)
            .await
            .with_context(|| format!("failed to save zone '{}'", z.id))?;
    }

    tracing::info!(
        gardens = config.gardens.len(),
        zones = config.zones.len(),
        water_schedules = config.water_schedules.len(),
        weather_clients = config.weather_clients.len(),
        notification_clients = config.notification_clients.len(),
        "config applied"
    );

    Ok(())
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ActivePeriod, WeatherControl};
    use crate::testutil;
    use crate::weather::ScaleControl;

    const SAMPLE: &str = r#"
[[notification_clients]]
id = "nc1"
name = "phone"
type = "log"

[[weather_clients]]
id = "wc1"
type = "fake"
options = { rain_mm = 5.0, rain_interval = "24h", avg_high_temperature = 80.0 }

[[gardens]]
id = "g1"
name = "Front Yard"
topic_prefix = "front-yard"
created_at = "2023-08-01T00:00:00Z"
notification_client_id = "nc1"

[gardens.light_schedule]
duration = "14h"
start_time = "06:00:00-07:00"

[gardens.notification_settings]
controller_startup = true
downtime = "15m"

[[water_schedules]]
id = "ws1"
name = "Morning"
duration = "15m"
interval = "72h"
start_time = "2023-08-01T05:00:00-07:00"

[water_schedules.weather_control.temperature_control]
baseline_value = 27.0
factor = 0.5
range = 10.0
client_id = "wc1"

[water_schedules.active_period]
start_month = "April"
end_month = "October"

[[zones]]
id = "z1"
garden_id = "g1"
name = "Tomatoes"
position = 0
water_schedule_ids = ["ws1"]
"#;

    fn sample() -> Config {
        toml::from_str(SAMPLE).unwrap()
    }

    /// Assert validation fails and the error message contains `needle`.
    fn assert_validation_err(cfg: &Config, needle: &str) {
        let err = cfg.validate().unwrap_err();
        let msg = format!("{err:#}");
        assert!(
            msg.contains(needle),
            "expected error containing {needle:?}, got: {msg}"
        );
    }

    // -- Parsing ----------------------------------------------------------

    #[test]
    fn parse_sample_config() {
        let config = sample();
        assert_eq!(config.gardens.len(), 1);
        assert_eq!(config.zones.len(), 1);

        let g = &config.gardens[0];
        let ls = g.light_schedule.as_ref().unwrap();
        assert_eq!(ls.duration, Duration::from_secs(14 * 3600));
        assert_eq!(ls.start_time.to_string(), "06:00:00-07:00");
        assert_eq!(
            g.notification_settings.downtime,
            Some(Duration::from_secs(15 * 60))
        );

        let ws = &config.water_schedules[0];
        assert_eq!(ws.interval, Duration::from_secs(72 * 3600));
        assert_eq!(ws.temperature_control().unwrap().client_id, "wc1");
        assert!(ws.rain_control().is_none());

        config.validate().unwrap();
    }

    #[test]
    fn parse_empty_config() {
        let config: Config = toml::from_str("").unwrap();
        assert!(config.gardens.is_empty());
        config.validate().unwrap();
    }

    #[test]
    fn bad_duration_is_a_parse_error() {
        let broken = SAMPLE.replace("interval = \"72h\"", "interval = \"three days\"");
        assert!(toml::from_str::<Config>(&broken).is_err());
    }

    // -- Validation -------------------------------------------------------

    #[test]
    fn duplicate_ids_rejected() {
        let mut config = sample();
        config.gardens.push(config.gardens[0].clone());
        assert_validation_err(&config, "garden 'g1': duplicate id");
    }

    #[test]
    fn bad_topic_prefix_rejected() {
        let mut config = sample();
        config.gardens[0].topic_prefix = "front/#".into();
        assert_validation_err(&config, "garden 'g1'");
    }

    #[test]
    fn light_schedule_must_fit_in_a_day() {
        let mut config = sample();
        if let Some(ls) = config.gardens[0].light_schedule.as_mut() {
            ls.duration = Duration::from_secs(25 * 3600);
        }
        assert_validation_err(&config, "light_schedule.duration");
    }

    #[test]
    fn zero_interval_rejected() {
        let mut config = sample();
        config.water_schedules[0].interval = Duration::ZERO;
        assert_validation_err(&config, "interval must be positive");
    }

    #[test]
    fn unknown_references_rejected() {
        let mut config = sample();
        config.zones[0].garden_id = "nope".into();
        config.zones[0].water_schedule_ids.push("ws9".into());
        config.water_schedules[0].weather_control = Some(WeatherControl {
            rain: Some(ScaleControl {
                baseline_value: 0.0,
                factor: 0.0,
                range: 50.0,
                client_id: "wc9".into(),
            }),
            ..Default::default()
        });

        let msg = format!("{:#}", config.validate().unwrap_err());
        assert!(msg.contains("garden 'nope' does not exist"), "{msg}");
        assert!(msg.contains("water schedule 'ws9' does not exist"), "{msg}");
        assert!(msg.contains("weather client 'wc9' does not exist"), "{msg}");
        assert!(msg.contains("3 errors"), "{msg}");
    }

    #[test]
    fn duplicate_zone_position_rejected() {
        let mut config = sample();
        let mut z2 = config.zones[0].clone();
        z2.id = "z2".into();
        config.zones.push(z2);
        assert_validation_err(&config, "position 0 is already used");
    }

    #[test]
    fn invalid_active_period_rejected() {
        let mut config = sample();
        config.water_schedules[0].active_period = Some(ActivePeriod {
            start_month: "Smarch".into(),
            end_month: "May".into(),
        });
        assert_validation_err(&config, "active_period");
    }

    #[test]
    fn unknown_client_type_rejected() {
        let mut config = sample();
        config.notification_clients[0].kind = "carrier-pigeon".into();
        assert_validation_err(&config, "notification client 'nc1'");
    }

    // -- Apply ------------------------------------------------------------

    #[tokio::test]
    async fn apply_seeds_database() {
        let db = testutil::test_db().await;
        let config = sample();
        apply(&config, &db).await.unwrap();

        assert_eq!(db.get_garden("g1").await.unwrap(), Some(config.gardens[0].clone()));
        assert_eq!(db.load_zones().await.unwrap().len(), 1);
        assert_eq!(
            db.get_water_schedule("ws1").await.unwrap(),
            Some(config.water_schedules[0].clone())
        );
        assert!(db.get_weather_client("wc1").await.is_ok());
        assert!(db.get_notification_client("nc1").await.is_ok());

        // Re-applying is an upsert.
        apply(&config, &db).await.unwrap();
        assert_eq!(db.load_gardens().await.unwrap().len(), 1);
    }
}
