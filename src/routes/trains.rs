//! Train and schedule read endpoints.
//!
//! - GET /api/v1/trains
//! - GET /api/v1/trains/{train_no}/schedule
//! - GET /api/v1/trains/{train_no}/runs?date=YYYY-MM-DD

use axum::extract::{Path, Query, State};
use axum::Json;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use utoipa::{IntoParams, ToSchema};

use crate::db::queries;
use crate::errors::{AppError, ErrorResponse};
use crate::routes::runs::RunSummary;

/// Response item for GET /api/v1/trains.
#[derive(Debug, Serialize, ToSchema)]
pub struct TrainListItem {
    pub train_no: i32,
    pub origin_station_code: String,
    pub terminus_station_code: String,
    /// Minutes past midnight, in [0, 1440).
    pub origin_sch_departure_min: i32,
    pub total_distance_km: f64,
    pub total_runtime_min: i32,
    /// bit 0 = Sunday .. bit 6 = Saturday.
    pub running_days_bitmap: i32,
}

impl From<crate::db::models::TrainSchedule> for TrainListItem {
    fn from(s: crate::db::models::TrainSchedule) -> Self {
        Self {
            train_no: s.train_no,
            origin_station_code: s.origin_station_code,
            terminus_station_code: s.terminus_station_code,
            origin_sch_departure_min: s.origin_sch_departure_min,
            total_distance_km: s.total_distance_km,
            total_runtime_min: s.total_runtime_min,
            running_days_bitmap: s.running_days_bitmap,
        }
    }
}

/// A single point along a schedule's route polyline.
#[derive(Debug, Serialize, ToSchema)]
pub struct RoutePoint {
    pub seq: i32,
    pub lat: f64,
    pub lng: f64,
}

/// Response for GET /api/v1/trains/{train_no}/schedule.
#[derive(Debug, Serialize, ToSchema)]
pub struct ScheduleResponse {
    #[serde(flatten)]
    pub train: TrainListItem,
    pub route: Vec<RoutePoint>,
}

#[derive(Debug, Deserialize, IntoParams)]
pub struct RunListQuery {
    /// Filter to a single service day (YYYY-MM-DD). Omit to list all runs.
    pub date: Option<String>,
}

/// List all scheduled trains.
#[utoipa::path(
    get,
    path = "/api/v1/trains",
    tag = "Trains",
    responses(
        (status = 200, description = "All train schedules", body = Vec<TrainListItem>),
    )
)]
pub async fn list_trains(State(pool): State<PgPool>) -> Result<Json<Vec<TrainListItem>>, AppError> {
    let schedules = queries::list_trains(&pool).await?;
    Ok(Json(schedules.into_iter().map(TrainListItem::from).collect()))
}

/// Get a train's static schedule and route polyline.
#[utoipa::path(
    get,
    path = "/api/v1/trains/{train_no}/schedule",
    tag = "Trains",
    params(
        ("train_no" = i32, Path, description = "Train number"),
    ),
    responses(
        (status = 200, description = "Schedule and route", body = ScheduleResponse),
        (status = 404, description = "Train not found", body = ErrorResponse),
    )
)]
pub async fn get_train_schedule(
    State(pool): State<PgPool>,
    Path(train_no): Path<i32>,
) -> Result<Json<ScheduleResponse>, AppError> {
    let schedule = queries::get_train_schedule(&pool, train_no)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("train {} not found", train_no)))?;
    let points = queries::get_route_polyline(&pool, schedule.schedule_id).await?;
    let route = points
        .into_iter()
        .map(|p| RoutePoint { seq: p.seq, lat: p.lat, lng: p.lng })
        .collect();
    Ok(Json(ScheduleResponse { train: TrainListItem::from(schedule), route }))
}

/// List a train's runs, optionally filtered to a single service day.
#[utoipa::path(
    get,
    path = "/api/v1/trains/{train_no}/runs",
    tag = "Trains",
    params(
        ("train_no" = i32, Path, description = "Train number"),
        RunListQuery,
    ),
    responses(
        (status = 200, description = "Matching runs", body = Vec<RunSummary>),
        (status = 400, description = "Invalid date", body = ErrorResponse),
    )
)]
pub async fn list_runs_for_train(
    State(pool): State<PgPool>,
    Path(train_no): Path<i32>,
    Query(params): Query<RunListQuery>,
) -> Result<Json<Vec<RunSummary>>, AppError> {
    let run_date = match params.date {
        Some(d) => Some(
            NaiveDate::parse_from_str(&d, "%Y-%m-%d")
                .map_err(|e| AppError::BadRequest(format!("invalid date: {}", e)))?,
        ),
        None => None,
    };
    let runs = queries::list_runs_for_train(&pool, train_no, run_date).await?;
    Ok(Json(runs.into_iter().map(RunSummary::from).collect()))
}
