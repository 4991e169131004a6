use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// A station referenced by schedules, routes, and the read-only API.
#[derive(Debug, Clone, Serialize, FromRow)]
pub struct Station {
    pub station_code: String,
    pub name: String,
    pub lat: f64,
    pub lng: f64,
}

/// A static, assumed-populated schedule a train's runs are generated from.
#[derive(Debug, Clone, Serialize, FromRow)]
pub struct TrainSchedule {
    pub schedule_id: Uuid,
    pub train_no: i32,
    pub origin_station_code: String,
    pub terminus_station_code: String,
    /// Minutes past midnight, in [0, 1440).
    pub origin_sch_departure_min: i32,
    pub total_distance_km: f64,
    pub total_runtime_min: i32,
    /// bit 0 = Sunday .. bit 6 = Saturday. Monotonically non-increasing;
    /// only the reconciler clears bits, never sets them.
    pub running_days_bitmap: i32,
}

/// One point of a schedule's route polyline, used to build the
/// `LineString` the snap operation projects onto.
#[derive(Debug, Clone, Serialize, FromRow)]
pub struct TrainRoutePoint {
    pub schedule_id: Uuid,
    pub seq: i32,
    pub lat: f64,
    pub lng: f64,
}

/// A single counter within a run's `errors` column: how many times a given
/// failure class has been observed, and when it was last observed.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ErrorCounter {
    #[serde(default)]
    pub count: i32,
    #[serde(default)]
    pub last_seen: Option<DateTime<Utc>>,
    #[serde(default)]
    pub reason: Option<String>,
}

/// The structured error record persisted alongside a run. Three independent
/// counters; absence of a key in the stored JSON is equivalent to a zero
/// counter (handled by `#[serde(default)]` on every field).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunErrors {
    #[serde(default)]
    pub static_response: ErrorCounter,
    #[serde(default)]
    pub api_error: ErrorCounter,
    #[serde(default)]
    pub unknown: ErrorCounter,
}

impl RunErrors {
    /// Sum of all three counters, used for the total-error poll gate.
    pub fn total(&self) -> i32 {
        self.static_response.count + self.api_error.count + self.unknown.count
    }
}

/// The mutable entity the core owns: one scheduled operation of a train on
/// a specific date. `run_id` is deterministic (`"<train_no>_<run_date>"`).
#[derive(Debug, Clone, Serialize, FromRow)]
pub struct TrainRun {
    pub run_id: String,
    pub schedule_id: Uuid,
    pub train_no: i32,
    pub run_date: NaiveDate,
    pub has_started: bool,
    pub has_arrived: bool,
    pub current_status: String,
    pub last_known_lat_u6: Option<i64>,
    pub last_known_lng_u6: Option<i64>,
    pub last_known_snapped_lat_u6: Option<i64>,
    pub last_known_snapped_lng_u6: Option<i64>,
    pub last_route_frac_u4: Option<i64>,
    pub last_bearing_deg: Option<f64>,
    pub last_known_distance_km_u4: Option<i64>,
    pub last_updated_sno: Option<String>,
    #[sqlx(json)]
    pub errors: sqlx::types::Json<RunErrors>,
    pub last_update_timestamp_iso: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Append-only location sample for a run, one row per upstream timestamp.
#[derive(Debug, Clone, Serialize, FromRow)]
pub struct TrainRunLocation {
    pub run_id: String,
    pub timestamp_iso: DateTime<Utc>,
    pub lat_u6: i64,
    pub lng_u6: i64,
    pub snapped_lat_u6: Option<i64>,
    pub snapped_lng_u6: Option<i64>,
    pub distance_km_u4: i64,
    pub segment_station_code: String,
    pub at_station: bool,
}
