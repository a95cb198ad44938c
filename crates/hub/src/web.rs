use anyhow::{Context, Result};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use serde::Serialize;
use std::net::SocketAddr;
use time::OffsetDateTime;
use tokio::net::TcpListener;
use tracing::{error, info};

use crate::actions::{ActionError, GardenAction, ZoneAction};
use crate::health::GardenHealth;
use crate::light::LightError;
use crate::model::{Garden, LightState, WaterSchedule, Zone};
use crate::config;
use crate::scheduler::Worker;
use crate::weather::{self, WeatherData};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn not_found(what: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: what.into(),
        }
    }

    fn bad_request(what: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: what.into(),
        }
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(e: anyhow::Error) -> Self {
        error!(error = %format!("{e:#}"), "request failed");
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: e.to_string(),
        }
    }
}

impl From<ActionError> for ApiError {
    fn from(e: ActionError) -> Self {
        let status = match &e {
            ActionError::GardenNotFound(_) | ActionError::ZoneNotFound(_) => StatusCode::NOT_FOUND,
            ActionError::Empty | ActionError::InvalidDuration(_) => StatusCode::BAD_REQUEST,
            ActionError::Light(
                LightError::DelayStateNotOff
                | LightError::DelayLongerThanSchedule
                | LightError::DelayExtendsPastOn
                | LightError::InvalidDelay(_),
            ) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            error!(error = %e, "action failed");
        }
        Self {
            status,
            message: e.to_string(),
        }
    }
}

/// Turn collected validation messages into a single 400.
fn reject_invalid(errors: Vec<String>) -> Result<(), ApiError> {
    if errors.is_empty() {
        Ok(())
    } else {
        Err(ApiError::bad_request(errors.join("; ")))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(serde_json::json!({ "error": self.message })),
        )
            .into_response()
    }
}

// ---------------------------------------------------------------------------
// Responses
// ---------------------------------------------------------------------------

#[derive(Serialize)]
struct GardenResponse {
    #[serde(flatten)]
    garden: Garden,
    #[serde(with = "time::serde::rfc3339::option")]
    next_on: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    next_off: Option<OffsetDateTime>,
    light_state: Option<LightState>,
    health: GardenHealth,
}

#[derive(Serialize)]
struct NextWater {
    water_schedule_id: String,
    #[serde(with = "time::serde::rfc3339")]
    time: OffsetDateTime,
    #[serde(with = "humantime_serde")]
    duration: std::time::Duration,
}

#[derive(Serialize)]
struct ZoneResponse {
    #[serde(flatten)]
    zone: Zone,
    next_water: Option<NextWater>,
}

#[derive(Serialize)]
struct WaterScheduleResponse {
    #[serde(flatten)]
    water_schedule: WaterSchedule,
    #[serde(with = "time::serde::rfc3339::option")]
    next_water_time: Option<OffsetDateTime>,
    #[serde(skip_serializing_if = "Option::is_none")]
    weather_data: Option<WeatherData>,
}

// ---------------------------------------------------------------------------
// Routes
// ---------------------------------------------------------------------------

pub fn router(worker: Worker) -> Router {
    Router::new()
        .route("/api/status", get(api_status))
        .route("/api/gardens/{id}", get(get_garden).put(put_garden))
        .route("/api/gardens/{id}/action", post(garden_action))
        .route("/api/gardens/{id}/zones/{zone_id}", get(get_zone))
        .route("/api/gardens/{id}/zones/{zone_id}/action", post(zone_action))
        .route(
            "/api/water_schedules/{id}",
            get(get_water_schedule).put(put_water_schedule),
        )
        .with_state(worker)
}

async fn api_status(State(worker): State<Worker>) -> impl IntoResponse {
    let st = worker.shared.read().await;
    Json(st.to_status(worker.job_count()))
}

async fn get_garden(
    State(worker): State<Worker>,
    Path(id): Path<String>,
) -> Result<Json<GardenResponse>, ApiError> {
    let garden = worker
        .db
        .get_garden(&id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("garden {id} not found")))?;

    let health = worker.garden_health(&garden).await;
    Ok(Json(GardenResponse {
        next_on: worker.get_next_light_time(&id, LightState::On),
        next_off: worker.get_next_light_time(&id, LightState::Off),
        light_state: worker.light_state(&id),
        health,
        garden,
    }))
}

/// Replace a garden and re-register its light jobs from the new schedule.
async fn put_garden(
    State(worker): State<Worker>,
    Path(id): Path<String>,
    Json(garden): Json<Garden>,
) -> Result<Json<Garden>, ApiError> {
    if garden.id != id {
        return Err(ApiError::bad_request("garden id does not match path"));
    }
    let mut errors = config::garden_errors(&garden);
    if let Some(client_id) = &garden.notification_client_id {
        if worker.db.get_notification_client_config(client_id).await?.is_none() {
            errors.push(format!("notification client '{client_id}' does not exist"));
        }
    }
    reject_invalid(errors)?;

    let lock = worker.garden_lock(&id);
    let _guard = lock.lock().await;
    worker.db.save_garden(&garden).await?;
    if garden.light_schedule.is_some() {
        worker
            .reset_light_schedule(&garden)
            .await
            .map_err(ActionError::from)?;
    } else {
        worker.remove_jobs_by_id(&id);
    }
    info!(garden_id = %id, "garden updated");
    Ok(Json(garden))
}

async fn garden_action(
    State(worker): State<Worker>,
    Path(id): Path<String>,
    Json(action): Json<GardenAction>,
) -> Result<StatusCode, ApiError> {
    info!(garden_id = %id, ?action, "garden action requested");
    worker.execute_garden_action(&id, &action).await?;
    Ok(StatusCode::ACCEPTED)
}

async fn get_zone(
    State(worker): State<Worker>,
    Path((garden_id, zone_id)): Path<(String, String)>,
) -> Result<Json<ZoneResponse>, ApiError> {
    let zone = worker
        .db
        .get_zone(&zone_id)
        .await?
        .filter(|z| z.garden_id == garden_id)
        .ok_or_else(|| ApiError::not_found(format!("zone {zone_id} not found")))?;

    let next_water = worker
        .next_active_water_schedule(&zone)
        .await?
        .map(|(ws, time)| NextWater {
            water_schedule_id: ws.id,
            time,
            duration: ws.duration,
        });
    Ok(Json(ZoneResponse { zone, next_water }))
}

async fn zone_action(
    State(worker): State<Worker>,
    Path((garden_id, zone_id)): Path<(String, String)>,
    Json(action): Json<ZoneAction>,
) -> Result<StatusCode, ApiError> {
    info!(garden_id = %garden_id, zone_id = %zone_id, ?action, "zone action requested");
    worker
        .execute_zone_action(&garden_id, &zone_id, &action)
        .await?;
    Ok(StatusCode::ACCEPTED)
}

async fn get_water_schedule(
    State(worker): State<Worker>,
    Path(id): Path<String>,
) -> Result<Json<WaterScheduleResponse>, ApiError> {
    let ws = worker
        .db
        .get_water_schedule(&id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("water schedule {id} not found")))?;

    let weather_data = if ws.rain_control().is_some() || ws.temperature_control().is_some() {
        Some(weather::weather_data(&ws, &worker).await)
    } else {
        None
    };
    Ok(Json(WaterScheduleResponse {
        next_water_time: worker.get_next_water_time(&ws),
        weather_data,
        water_schedule: ws,
    }))
}

async fn put_water_schedule(
    State(worker): State<Worker>,
    Path(id): Path<String>,
    Json(ws): Json<WaterSchedule>,
) -> Result<Json<WaterSchedule>, ApiError> {
    if ws.id != id {
        return Err(ApiError::bad_request("water schedule id does not match path"));
    }
    let mut errors = config::water_schedule_errors(&ws);
    for sc in [ws.temperature_control(), ws.rain_control()].into_iter().flatten() {
        if worker.db.get_weather_client_config(&sc.client_id).await?.is_none() {
            errors.push(format!("weather client '{}' does not exist", sc.client_id));
        }
    }
    if let Some(client_id) = &ws.notification_client_id {
        if worker.db.get_notification_client_config(client_id).await?.is_none() {
            errors.push(format!("notification client '{client_id}' does not exist"));
        }
    }
    reject_invalid(errors)?;

    worker.db.save_water_schedule(&ws).await?;
    worker
        .reset_water_schedule(&ws)
        .map_err(|e| ApiError::bad_request(e.to_string()))?;
    info!(water_schedule_id = %id, "water schedule updated");
    Ok(Json(ws))
}

// ---------------------------------------------------------------------------
// Server entry-point
// ---------------------------------------------------------------------------

pub async fn serve(worker: Worker, port: u16) -> Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind web port {port}"))?;

    info!(%addr, "http api listening");

    axum::serve(listener, router(worker))
        .await
        .context("web server error")
}

// ===========================================================================
// Tests
// ===========================================================================
