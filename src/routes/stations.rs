//! Station read endpoint.
//!
//! - GET /api/v1/stations

use axum::extract::State;
use axum::Json;
use serde::Serialize;
use sqlx::PgPool;
use utoipa::ToSchema;

use crate::db::queries;
use crate::errors::AppError;

/// Response item for GET /api/v1/stations.
#[derive(Debug, Serialize, ToSchema)]
pub struct StationItem {
    pub station_code: String,
    pub name: String,
    pub lat: f64,
    pub lng: f64,
}

impl From<crate::db::models::Station> for StationItem {
    fn from(s: crate::db::models::Station) -> Self {
        Self { station_code: s.station_code, name: s.name, lat: s.lat, lng: s.lng }
    }
}

/// List all stations referenced by schedules and routes.
#[utoipa::path(
    get,
    path = "/api/v1/stations",
    tag = "Stations",
    responses(
        (status = 200, description = "All stations", body = Vec<StationItem>),
    )
)]
pub async fn list_stations(State(pool): State<PgPool>) -> Result<Json<Vec<StationItem>>, AppError> {
    let stations = queries::list_stations(&pool).await?;
    Ok(Json(stations.into_iter().map(StationItem::from).collect()))
}
