//! Single-run read endpoint.
//!
//! - GET /api/v1/runs/{run_id}

use axum::extract::{Path, State};
use axum::Json;
use serde::Serialize;
use sqlx::PgPool;
use utoipa::ToSchema;

use crate::db::models::TrainRun;
use crate::db::queries;
use crate::errors::{AppError, ErrorResponse};
use crate::helpers;

/// One error counter, decoded for API consumption.
#[derive(Debug, Serialize, ToSchema)]
pub struct ErrorCounterView {
    pub count: i32,
    pub last_seen: Option<String>,
    pub reason: Option<String>,
}

impl From<&crate::db::models::ErrorCounter> for ErrorCounterView {
    fn from(c: &crate::db::models::ErrorCounter) -> Self {
        Self {
            count: c.count,
            last_seen: c.last_seen.map(|t| t.to_rfc3339()),
            reason: c.reason.clone(),
        }
    }
}

/// The three independent error counters tracked for a run.
#[derive(Debug, Serialize, ToSchema)]
pub struct RunErrorsView {
    pub static_response: ErrorCounterView,
    pub api_error: ErrorCounterView,
    pub unknown: ErrorCounterView,
}

/// A condensed view of a run, used in list responses.
#[derive(Debug, Serialize, ToSchema)]
pub struct RunSummary {
    pub run_id: String,
    pub train_no: i32,
    pub run_date: String,
    pub has_started: bool,
    pub has_arrived: bool,
    pub current_status: String,
    pub last_update_timestamp_iso: Option<String>,
}

impl From<TrainRun> for RunSummary {
    fn from(r: TrainRun) -> Self {
        Self {
            run_id: r.run_id,
            train_no: r.train_no,
            run_date: r.run_date.to_string(),
            has_started: r.has_started,
            has_arrived: r.has_arrived,
            current_status: r.current_status,
            last_update_timestamp_iso: r.last_update_timestamp_iso.map(|t| t.to_rfc3339()),
        }
    }
}

/// Full run detail, with geo fields decoded back to plain degrees/km.
#[derive(Debug, Serialize, ToSchema)]
pub struct RunResponse {
    pub run_id: String,
    pub train_no: i32,
    pub run_date: String,
    pub has_started: bool,
    pub has_arrived: bool,
    pub current_status: String,
    pub last_known_lat: Option<f64>,
    pub last_known_lng: Option<f64>,
    pub last_known_snapped_lat: Option<f64>,
    pub last_known_snapped_lng: Option<f64>,
    pub last_route_frac: Option<f64>,
    pub last_bearing_deg: Option<f64>,
    pub last_known_distance_km: Option<f64>,
    pub last_updated_sno: Option<String>,
    pub errors: RunErrorsView,
    pub last_update_timestamp_iso: Option<String>,
    pub updated_at: String,
}

impl From<TrainRun> for RunResponse {
    fn from(r: TrainRun) -> Self {
        Self {
            run_id: r.run_id,
            train_no: r.train_no,
            run_date: r.run_date.to_string(),
            has_started: r.has_started,
            has_arrived: r.has_arrived,
            current_status: r.current_status,
            last_known_lat: helpers::opt_from_u6(r.last_known_lat_u6),
            last_known_lng: helpers::opt_from_u6(r.last_known_lng_u6),
            last_known_snapped_lat: helpers::opt_from_u6(r.last_known_snapped_lat_u6),
            last_known_snapped_lng: helpers::opt_from_u6(r.last_known_snapped_lng_u6),
            last_route_frac: helpers::opt_from_u4(r.last_route_frac_u4),
            last_bearing_deg: r.last_bearing_deg,
            last_known_distance_km: helpers::opt_from_u4(r.last_known_distance_km_u4),
            last_updated_sno: r.last_updated_sno,
            errors: RunErrorsView {
                static_response: ErrorCounterView::from(&r.errors.static_response),
                api_error: ErrorCounterView::from(&r.errors.api_error),
                unknown: ErrorCounterView::from(&r.errors.unknown),
            },
            last_update_timestamp_iso: r.last_update_timestamp_iso.map(|t| t.to_rfc3339()),
            updated_at: r.updated_at.to_rfc3339(),
        }
    }
}

/// Get the current tracked state of a single run.
#[utoipa::path(
    get,
    path = "/api/v1/runs/{run_id}",
    tag = "Runs",
    params(
        ("run_id" = String, Path, description = "Run id, formatted \"<train_no>_<run_date>\""),
    ),
    responses(
        (status = 200, description = "Run detail", body = RunResponse),
        (status = 404, description = "Run not found", body = ErrorResponse),
    )
)]
pub async fn get_run(
    State(pool): State<PgPool>,
    Path(run_id): Path<String>,
) -> Result<Json<RunResponse>, AppError> {
    let run = queries::get_run(&pool, &run_id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("run {} not found", run_id)))?;
    Ok(Json(RunResponse::from(run)))
}
