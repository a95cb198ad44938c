//! Weather-adjusted watering durations.
//!
//! A `ScaleControl` turns one observed metric into a multiplier; the engine
//! compounds the temperature and rain multipliers into a single factor.
//! Weather collaborator failures never abort a cycle: the affected control
//! is skipped and the result is flagged with `had_error`.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use moka::future::Cache;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;
use tracing::{debug, warn};

use crate::clock::{Clock, SharedClock};
use crate::duration::parse_duration;
use crate::model::{WaterSchedule, WeatherClientConfig};

/// How long a weather response is reused before asking the client again.
const CACHE_TTL: Duration = Duration::from_secs(5 * 60);
const CACHE_CAPACITY: u64 = 1_000;

// ---------------------------------------------------------------------------
// Scale control
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScaleControl {
    pub baseline_value: f64,
    /// Maximum proportion to scale by, between 0 and 1.
    pub factor: f64,
    /// Distance from the baseline at which scaling saturates.
    pub range: f64,
    pub client_id: String,
}

impl ScaleControl {
    fn proportion(&self, observed: f64) -> f64 {
        if self.range <= 0.0 {
            return 0.0;
        }
        (observed - self.baseline_value) / self.range
    }

    /// Symmetric linear scale in `[1 - factor, 1 + factor]`.
    pub fn scale(&self, observed: f64) -> f64 {
        1.0 + self.factor * self.proportion(observed).clamp(-1.0, 1.0)
    }

    /// Scale that only ever reduces: 1 at or below the baseline, shrinking to
    /// `factor` once the observation is a full range above it.
    pub fn inverted_scale_down_only(&self, observed: f64) -> f64 {
        1.0 - self.proportion(observed).clamp(0.0, 1.0) * (1.0 - self.factor)
    }
}

// ---------------------------------------------------------------------------
// Clients
// ---------------------------------------------------------------------------

#[async_trait]
pub trait WeatherClient: Send + Sync {
    /// Total rainfall in millimetres over the trailing period.
    async fn total_rain(&self, since: Duration) -> Result<f64>;

    /// Average daily high temperature over the trailing period.
    async fn average_high_temperature(&self, since: Duration) -> Result<f64>;
}

/// Resolves the weather client a `ScaleControl` refers to.
#[async_trait]
pub trait WeatherSource: Send + Sync {
    async fn weather_client(&self, client_id: &str) -> Result<Arc<dyn WeatherClient>>;
}

/// Client returning configured data. Options:
/// `rain_mm`, `rain_interval`, `avg_high_temperature`, and `error` which,
/// when set, makes every query fail with that message.
#[derive(Debug, Clone, PartialEq)]
pub struct FakeWeatherClient {
    pub rain_mm: f64,
    pub rain_interval: Duration,
    pub avg_high_temperature: f64,
    pub error: Option<String>,
}

#[derive(Deserialize)]
struct FakeOptions {
    #[serde(default)]
    rain_mm: f64,
    rain_interval: String,
    #[serde(default)]
    avg_high_temperature: f64,
    #[serde(default)]
    error: Option<String>,
}

impl FakeWeatherClient {
    pub fn from_options(options: &serde_json::Value) -> Result<Self> {
        let opts: FakeOptions = serde_json::from_value(options.clone())
            .context("invalid fake weather client options")?;
        let rain_interval = parse_duration(&opts.rain_interval)?;
        if rain_interval.is_zero() {
            bail!("rain_interval must be greater than zero");
        }
        Ok(Self {
            rain_mm: opts.rain_mm,
            rain_interval,
            avg_high_temperature: opts.avg_high_temperature,
            error: opts.error,
        })
    }

    fn check(&self) -> Result<()> {
        match &self.error {
            Some(msg) => bail!("{msg}"),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl WeatherClient for FakeWeatherClient {
    async fn total_rain(&self, since: Duration) -> Result<f64> {
        self.check()?;
        let intervals = since.as_secs_f64() / self.rain_interval.as_secs_f64();
        Ok(intervals * self.rain_mm)
    }

    async fn average_high_temperature(&self, _since: Duration) -> Result<f64> {
        self.check()?;
        Ok(self.avg_high_temperature)
    }
}

/// Build a client from its stored config.
pub fn new_client(config: &WeatherClientConfig) -> Result<Arc<dyn WeatherClient>> {
    match config.kind.as_str() {
        "fake" => Ok(Arc::new(FakeWeatherClient::from_options(&config.options)?)),
        other => bail!("invalid weather client type '{other}'"),
    }
}

// ---------------------------------------------------------------------------
// Response cache
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Metric {
    Rain,
    Temperature,
}

type CacheKey = (String, Metric, Duration);

/// Successful responses shared across client instances, keyed by client id.
/// Freshness is judged against the injected clock; moka's own TTL only
/// bounds how long stale entries stay resident.
#[derive(Clone)]
pub struct WeatherCache {
    entries: Cache<CacheKey, (f64, OffsetDateTime)>,
    clock: SharedClock,
}

impl WeatherCache {
    pub fn new(clock: SharedClock) -> Self {
        Self {
            entries: Cache::builder()
                .max_capacity(CACHE_CAPACITY)
                .time_to_live(CACHE_TTL)
                .build(),
            clock,
        }
    }

    async fn get(&self, key: &CacheKey) -> Option<f64> {
        let (value, fetched_at) = self.entries.get(key).await?;
        (self.clock.now() - fetched_at < CACHE_TTL).then_some(value)
    }

    async fn put(&self, key: CacheKey, value: f64) {
        self.entries.insert(key, (value, self.clock.now())).await;
    }

    /// Wrap `client` so its responses are served from this cache.
    pub fn wrap(&self, client_id: &str, client: Arc<dyn WeatherClient>) -> Arc<dyn WeatherClient> {
        Arc::new(CachedClient {
            client_id: client_id.to_string(),
            inner: client,
            cache: self.clone(),
        })
    }
}

struct CachedClient {
    client_id: String,
    inner: Arc<dyn WeatherClient>,
    cache: WeatherCache,
}

impl CachedClient {
    fn key(&self, metric: Metric, since: Duration) -> CacheKey {
        (self.client_id.clone(), metric, since)
    }
}

#[async_trait]
impl WeatherClient for CachedClient {
    async fn total_rain(&self, since: Duration) -> Result<f64> {
        let key = self.key(Metric::Rain, since);
        if let Some(v) = self.cache.get(&key).await {
            return Ok(v);
        }
        let v = self.inner.total_rain(since).await?;
        self.cache.put(key, v).await;
        Ok(v)
    }

    async fn average_high_temperature(&self, since: Duration) -> Result<f64> {
        let key = self.key(Metric::Temperature, since);
        if let Some(v) = self.cache.get(&key).await {
            return Ok(v);
        }
        let v = self.inner.average_high_temperature(since).await?;
        self.cache.put(key, v).await;
        Ok(v)
    }
}

// ---------------------------------------------------------------------------
// Scaling engine
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScaledDuration {
    pub duration: Duration,
    pub had_error: bool,
}

/// Multiply `base` by every multiplier. Negative products floor at zero.
pub fn apply_multipliers(base: Duration, multipliers: &[f64]) -> Duration {
    let m: f64 = multipliers.iter().product();
    if !m.is_finite() || m <= 0.0 {
        return Duration::ZERO;
    }
    base.mul_f64(m)
}

async fn rain_multiplier(ws: &WaterSchedule, sc: &ScaleControl, source: &dyn WeatherSource) -> Result<f64> {
    let client = source
        .weather_client(&sc.client_id)
        .await
        .context("error getting weather client for rain control")?;
    let mm = client
        .total_rain(ws.interval)
        .await
        .context("unable to get rain data from weather client")?;
    let scale = sc.inverted_scale_down_only(mm);
    debug!(water_schedule_id = %ws.id, rain_mm = mm, scale, "rain scale");
    Ok(scale)
}

async fn temperature_multiplier(
    ws: &WaterSchedule,
    sc: &ScaleControl,
    source: &dyn WeatherSource,
) -> Result<f64> {
    let client = source
        .weather_client(&sc.client_id)
        .await
        .context("error getting weather client for temperature control")?;
    let temp = client
        .average_high_temperature(ws.interval)
        .await
        .context("unable to get average high temperature from weather client")?;
    let scale = sc.scale(temp);
    debug!(water_schedule_id = %ws.id, temperature = temp, scale, "temperature scale");
    Ok(scale)
}

/// Scale a schedule's duration by its temperature and rain controls.
pub async fn scale_watering_duration(ws: &WaterSchedule, source: &dyn WeatherSource) -> ScaledDuration {
    let mut multipliers = Vec::with_capacity(2);
    let mut had_error = false;

    if let Some(sc) = ws.temperature_control() {
        match temperature_multiplier(ws, sc, source).await {
            Ok(m) => multipliers.push(m),
            Err(e) => {
                warn!(water_schedule_id = %ws.id, error = %format!("{e:#}"), "temperature scaling skipped");
                had_error = true;
            }
        }
    }

    if let Some(sc) = ws.rain_control() {
        match rain_multiplier(ws, sc, source).await {
            Ok(m) => multipliers.push(m),
            Err(e) => {
                warn!(water_schedule_id = %ws.id, error = %format!("{e:#}"), "rain scaling skipped");
                had_error = true;
            }
        }
    }

    ScaledDuration {
        duration: apply_multipliers(ws.duration, &multipliers),
        had_error,
    }
}

// ---------------------------------------------------------------------------
// Weather data view
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RainData {
    pub mm: f64,
    pub scale_factor: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TemperatureData {
    pub celsius: f64,
    pub scale_factor: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct WeatherData {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rain: Option<RainData>,
    #[serde(rename = "average_temperature", skip_serializing_if = "Option::is_none")]
    pub temperature: Option<TemperatureData>,
}

/// Current observations for a schedule's controls and the factor each would
/// apply. Unavailable data is omitted.
pub async fn weather_data(ws: &WaterSchedule, source: &dyn WeatherSource) -> WeatherData {
    let mut data = WeatherData::default();

    if let Some(sc) = ws.rain_control() {
        let mm = match source.weather_client(&sc.client_id).await {
            Ok(client) => client.total_rain(ws.interval).await,
            Err(e) => Err(e),
        };
        match mm {
            Ok(mm) => {
                data.rain = Some(RainData {
                    mm,
                    scale_factor: sc.inverted_scale_down_only(mm),
                })
            }
            Err(e) => warn!(water_schedule_id = %ws.id, error = %e, "unable to get rain data"),
        }
    }

    if let Some(sc) = ws.temperature_control() {
        let celsius = match source.weather_client(&sc.client_id).await {
            Ok(client) => client.average_high_temperature(ws.interval).await,
            Err(e) => Err(e),
        };
        match celsius {
            Ok(celsius) => {
                data.temperature = Some(TemperatureData {
                    celsius,
                    scale_factor: sc.scale(celsius),
                })
            }
            Err(e) => warn!(water_schedule_id = %ws.id, error = %e, "unable to get temperature data"),
        }
    }

    data
}

// ===========================================================================
// Tests
// ===========================================================================
