//! The Store: a typed wrapper over a single PostgreSQL database. Every
//! operation here is a free function taking an executor (`&PgPool` for
//! reads, a transaction handle for multi-statement writes), following the
//! weather service's `db::queries` conventions — explicit column lists,
//! `sqlx::query_as`, and transactions built with `pool.begin()` /
//! `tx.commit()`.

use chrono::{DateTime, NaiveDate, Utc, Weekday};
use chrono_tz::Tz;
use geo::algorithm::{HaversineBearing, HaversineDistance};
use geo::Point;
use sqlx::{PgExecutor, PgPool, Postgres, Transaction};
use uuid::Uuid;

use crate::db::models::{RunErrors, Station, TrainRoutePoint, TrainRun, TrainRunLocation, TrainSchedule};

const RUN_COLS: &str = "run_id, schedule_id, train_no, run_date, has_started, has_arrived, \
    current_status, last_known_lat_u6, last_known_lng_u6, last_known_snapped_lat_u6, \
    last_known_snapped_lng_u6, last_route_frac_u4, last_bearing_deg, \
    last_known_distance_km_u4, last_updated_sno, errors, last_update_timestamp_iso, \
    created_at, updated_at";

// ---------------------------------------------------------------------------
// Poll-loop support
// ---------------------------------------------------------------------------

/// Runs eligible for the current poll cycle: not yet arrived, within the
/// 5-day lookback window, under both error thresholds, and past their
/// scheduled origin departure. Stalest (or never-polled) runs come first.
///
/// `run_date`, the lookback window, and the origin-departure gate are all
/// calendar/wall-clock concepts in `timezone` (e.g. a Wednesday 17:00
/// departure means 17:00 *Asia/Kolkata*, not UTC) — both the calendar-date
/// boundaries and the composed departure instant are evaluated in that
/// zone rather than in UTC.
pub async fn list_runs_to_poll(
    pool: &PgPool,
    now: DateTime<Utc>,
    timezone: Tz,
    static_threshold: i32,
    total_threshold: i32,
) -> Result<Vec<TrainRun>, sqlx::Error> {
    let now_local = now.with_timezone(&timezone);
    let lookback_start = (now_local - chrono::Duration::days(5)).date_naive();
    let today = now_local.date_naive();

    sqlx::query_as::<_, TrainRun>(
        "SELECT r.run_id, r.schedule_id, r.train_no, r.run_date, r.has_started, r.has_arrived, \
            r.current_status, r.last_known_lat_u6, r.last_known_lng_u6, \
            r.last_known_snapped_lat_u6, r.last_known_snapped_lng_u6, r.last_route_frac_u4, \
            r.last_bearing_deg, r.last_known_distance_km_u4, r.last_updated_sno, r.errors, \
            r.last_update_timestamp_iso, r.created_at, r.updated_at \
        FROM train_runs r \
        JOIN train_schedules s ON s.schedule_id = r.schedule_id \
        WHERE r.has_arrived = false \
          AND r.run_date BETWEEN $1 AND $2 \
          AND ((r.run_date::timestamp + (s.origin_sch_departure_min || ' minutes')::interval) \
              AT TIME ZONE $6) <= $3 \
          AND COALESCE((r.errors->'static_response'->>'count')::int, 0) < $4 \
          AND (COALESCE((r.errors->'static_response'->>'count')::int, 0) \
             + COALESCE((r.errors->'api_error'->>'count')::int, 0) \
             + COALESCE((r.errors->'unknown'->>'count')::int, 0)) < $5 \
        ORDER BY r.last_update_timestamp_iso ASC NULLS FIRST",
    )
    .bind(lookback_start)
    .bind(today)
    .bind(now)
    .bind(static_threshold)
    .bind(total_threshold)
    .bind(timezone.name())
    .fetch_all(pool)
    .await
}

/// Result of projecting a raw GPS fix onto a schedule's route polyline.
#[derive(Debug, Clone, Copy)]
pub struct RunSnap {
    pub snapped_lat: f64,
    pub snapped_lng: f64,
    /// Fraction of total route length traveled, in [0.0, 1.0].
    pub route_frac: f64,
    pub bearing_deg: f64,
}

/// Project `(lat, lng)` onto the `LineString` built from the schedule's
/// route points. Returns `None` when there is no usable geometry (fewer
/// than two points, or a degenerate zero-length route) rather than failing
/// — per §4.1 this is a pure, best-effort operation, not a full map-matcher.
pub async fn get_run_snap<'e, E>(
    executor: E,
    schedule_id: Uuid,
    lat: f64,
    lng: f64,
) -> Result<Option<RunSnap>, sqlx::Error>
where
    E: PgExecutor<'e>,
{
    let points = get_route_polyline(executor, schedule_id).await?;
    Ok(project_onto_route(&points, lat, lng))
}

fn project_onto_route(points: &[TrainRoutePoint], lat: f64, lng: f64) -> Option<RunSnap> {
    if points.len() < 2 {
        return None;
    }
    let target = Point::new(lng, lat);

    let mut best_dist = f64::INFINITY;
    let mut best_frac = 0.0;
    let mut best_point = target;
    let mut best_bearing = 0.0;
    let mut cumulative = 0.0;
    let mut total_length = 0.0;

    let segments: Vec<(Point<f64>, Point<f64>)> = points
        .windows(2)
        .map(|w| (Point::new(w[0].lng, w[0].lat), Point::new(w[1].lng, w[1].lat)))
        .collect();

    for (a, b) in &segments {
        total_length += a.haversine_distance(b);
    }
    if total_length <= 0.0 {
        return None;
    }

    for (a, b) in &segments {
        let seg_len = a.haversine_distance(b);
        let (proj, t) = project_point_on_segment(*a, *b, target);
        let dist = proj.haversine_distance(&target);
        if dist < best_dist {
            best_dist = dist;
            best_frac = (cumulative + seg_len * t) / total_length;
            best_point = proj;
            best_bearing = a.haversine_bearing(*b);
        }
        cumulative += seg_len;
    }

    Some(RunSnap {
        snapped_lat: best_point.y(),
        snapped_lng: best_point.x(),
        route_frac: best_frac.clamp(0.0, 1.0),
        bearing_deg: best_bearing,
    })
}

/// Planar projection of `p` onto segment `a..b`, clamped to the segment.
/// Good enough at route scale; not a geodesic projection.
fn project_point_on_segment(a: Point<f64>, b: Point<f64>, p: Point<f64>) -> (Point<f64>, f64) {
    let (ax, ay) = a.x_y();
    let (bx, by) = b.x_y();
    let (px, py) = p.x_y();
    let dx = bx - ax;
    let dy = by - ay;
    let len_sq = dx * dx + dy * dy;
    if len_sq == 0.0 {
        return (a, 0.0);
    }
    let t = (((px - ax) * dx) + ((py - ay) * dy)) / len_sq;
    let t = t.clamp(0.0, 1.0);
    (Point::new(ax + t * dx, ay + t * dy), t)
}

/// Partial, idempotent update to a run row. Every field is optional and
/// coalesces with the existing value: `None` leaves the column untouched,
/// `Some` replaces it.
#[derive(Debug, Default, Clone)]
pub struct RunStatusUpdate {
    pub has_started: Option<bool>,
    pub has_arrived: Option<bool>,
    pub current_status: Option<String>,
    pub last_known_lat_u6: Option<i64>,
    pub last_known_lng_u6: Option<i64>,
    pub last_known_snapped_lat_u6: Option<i64>,
    pub last_known_snapped_lng_u6: Option<i64>,
    pub last_route_frac_u4: Option<i64>,
    pub last_bearing_deg: Option<f64>,
    pub last_known_distance_km_u4: Option<i64>,
    pub last_updated_sno: Option<String>,
    pub errors: Option<RunErrors>,
    pub last_update_timestamp_iso: Option<DateTime<Utc>>,
}

pub async fn update_run_status<'e, E>(
    executor: E,
    run_id: &str,
    partial: &RunStatusUpdate,
) -> Result<(), sqlx::Error>
where
    E: PgExecutor<'e>,
{
    sqlx::query(
        "UPDATE train_runs SET \
            has_started = COALESCE($2, has_started), \
            has_arrived = COALESCE($3, has_arrived), \
            current_status = COALESCE($4, current_status), \
            last_known_lat_u6 = COALESCE($5, last_known_lat_u6), \
            last_known_lng_u6 = COALESCE($6, last_known_lng_u6), \
            last_known_snapped_lat_u6 = COALESCE($7, last_known_snapped_lat_u6), \
            last_known_snapped_lng_u6 = COALESCE($8, last_known_snapped_lng_u6), \
            last_route_frac_u4 = COALESCE($9, last_route_frac_u4), \
            last_bearing_deg = COALESCE($10, last_bearing_deg), \
            last_known_distance_km_u4 = COALESCE($11, last_known_distance_km_u4), \
            last_updated_sno = COALESCE($12, last_updated_sno), \
            errors = COALESCE($13, errors), \
            last_update_timestamp_iso = COALESCE($14, last_update_timestamp_iso), \
            updated_at = now() \
        WHERE run_id = $1",
    )
    .bind(run_id)
    .bind(partial.has_started)
    .bind(partial.has_arrived)
    .bind(&partial.current_status)
    .bind(partial.last_known_lat_u6)
    .bind(partial.last_known_lng_u6)
    .bind(partial.last_known_snapped_lat_u6)
    .bind(partial.last_known_snapped_lng_u6)
    .bind(partial.last_route_frac_u4)
    .bind(partial.last_bearing_deg)
    .bind(partial.last_known_distance_km_u4)
    .bind(&partial.last_updated_sno)
    .bind(partial.errors.as_ref().map(sqlx::types::Json))
    .bind(partial.last_update_timestamp_iso)
    .execute(executor)
    .await?;
    Ok(())
}

pub async fn log_run_location<'e, E>(
    executor: E,
    row: &TrainRunLocation,
) -> Result<(), sqlx::Error>
where
    E: PgExecutor<'e>,
{
    sqlx::query(
        "INSERT INTO train_run_locations \
            (run_id, timestamp_iso, lat_u6, lng_u6, snapped_lat_u6, snapped_lng_u6, \
             distance_km_u4, segment_station_code, at_station) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9) \
         ON CONFLICT (run_id, timestamp_iso) DO NOTHING",
    )
    .bind(&row.run_id)
    .bind(row.timestamp_iso)
    .bind(row.lat_u6)
    .bind(row.lng_u6)
    .bind(row.snapped_lat_u6)
    .bind(row.snapped_lng_u6)
    .bind(row.distance_km_u4)
    .bind(&row.segment_station_code)
    .bind(row.at_station)
    .execute(executor)
    .await?;
    Ok(())
}

/// Clear the weekday bit on a schedule corresponding to `run_date`. Bits are
/// only ever cleared, never set, by the reconciler.
pub async fn clear_running_day_bit<'e, E>(
    executor: E,
    schedule_id: Uuid,
    run_date: NaiveDate,
) -> Result<(), sqlx::Error>
where
    E: PgExecutor<'e>,
{
    let bit = weekday_bit(run_date.weekday());
    sqlx::query(
        "UPDATE train_schedules SET running_days_bitmap = running_days_bitmap & ~(1 << $2) \
         WHERE schedule_id = $1",
    )
    .bind(schedule_id)
    .bind(bit)
    .execute(executor)
    .await?;
    Ok(())
}

/// bit 0 = Sunday .. bit 6 = Saturday.
pub fn weekday_bit(weekday: Weekday) -> i32 {
    weekday.num_days_from_sunday() as i32
}

/// Materialise one `train_runs` row per schedule whose weekday bit is set
/// for `run_date`. No-op on conflict — a schedule already expanded for that
/// date is left untouched.
pub async fn generate_runs_for_date(pool: &PgPool, run_date: NaiveDate) -> Result<u64, sqlx::Error> {
    let bit = weekday_bit(run_date.weekday());
    let result = sqlx::query(
        "INSERT INTO train_runs (run_id, schedule_id, train_no, run_date, has_started, \
            has_arrived, current_status, errors, created_at, updated_at) \
         SELECT s.train_no::text || '_' || $1::text, s.schedule_id, s.train_no, $1, \
            false, false, 'unknown', '{}'::jsonb, now(), now() \
         FROM train_schedules s \
         WHERE (s.running_days_bitmap & (1 << $2)) <> 0 \
         ON CONFLICT (train_no, run_date) DO NOTHING",
    )
    .bind(run_date)
    .bind(bit)
    .execute(pool)
    .await?;
    Ok(result.rows_affected())
}

pub async fn begin_tx(pool: &PgPool) -> Result<Transaction<'_, Postgres>, sqlx::Error> {
    pool.begin().await
}

// ---------------------------------------------------------------------------
// Ambient read-only helpers, backing the HTTP API
// ---------------------------------------------------------------------------

pub async fn list_trains(pool: &PgPool) -> Result<Vec<TrainSchedule>, sqlx::Error> {
    sqlx::query_as::<_, TrainSchedule>(
        "SELECT schedule_id, train_no, origin_station_code, terminus_station_code, \
            origin_sch_departure_min, total_distance_km, total_runtime_min, running_days_bitmap \
         FROM train_schedules ORDER BY train_no",
    )
    .fetch_all(pool)
    .await
}

pub async fn get_train_schedule(
    pool: &PgPool,
    train_no: i32,
) -> Result<Option<TrainSchedule>, sqlx::Error> {
    sqlx::query_as::<_, TrainSchedule>(
        "SELECT schedule_id, train_no, origin_station_code, terminus_station_code, \
            origin_sch_departure_min, total_distance_km, total_runtime_min, running_days_bitmap \
         FROM train_schedules WHERE train_no = $1",
    )
    .bind(train_no)
    .fetch_optional(pool)
    .await
}

pub async fn get_route_polyline<'e, E>(
    executor: E,
    schedule_id: Uuid,
) -> Result<Vec<TrainRoutePoint>, sqlx::Error>
where
    E: PgExecutor<'e>,
{
    sqlx::query_as::<_, TrainRoutePoint>(
        "SELECT schedule_id, seq, lat, lng FROM train_routes \
         WHERE schedule_id = $1 ORDER BY seq",
    )
    .bind(schedule_id)
    .fetch_all(executor)
    .await
}

pub async fn get_run(pool: &PgPool, run_id: &str) -> Result<Option<TrainRun>, sqlx::Error> {
    sqlx::query_as::<_, TrainRun>(&format!(
        "SELECT {RUN_COLS} FROM train_runs WHERE run_id = $1"
    ))
    .bind(run_id)
    .fetch_optional(pool)
    .await
}

pub async fn list_runs_for_train(
    pool: &PgPool,
    train_no: i32,
    run_date: Option<NaiveDate>,
) -> Result<Vec<TrainRun>, sqlx::Error> {
    match run_date {
        Some(date) => {
            sqlx::query_as::<_, TrainRun>(&format!(
                "SELECT {RUN_COLS} FROM train_runs WHERE train_no = $1 AND run_date = $2"
            ))
            .bind(train_no)
            .bind(date)
            .fetch_all(pool)
            .await
        }
        None => {
            sqlx::query_as::<_, TrainRun>(&format!(
                "SELECT {RUN_COLS} FROM train_runs WHERE train_no = $1 ORDER BY run_date DESC"
            ))
            .bind(train_no)
            .fetch_all(pool)
            .await
        }
    }
}

pub async fn list_stations(pool: &PgPool) -> Result<Vec<Station>, sqlx::Error> {
    sqlx::query_as::<_, Station>(
        "SELECT station_code, name, lat, lng FROM stations ORDER BY station_code",
    )
    .fetch_all(pool)
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    #[test]
    fn test_weekday_bit_sunday_is_zero() {
        let sunday = NaiveDate::from_ymd_opt(2025, 5, 11).unwrap();
        assert_eq!(sunday.weekday(), Weekday::Sun);
        assert_eq!(weekday_bit(sunday.weekday()), 0);
    }

    #[test]
    fn test_weekday_bit_saturday_is_six() {
        let saturday = NaiveDate::from_ymd_opt(2025, 5, 10).unwrap();
        assert_eq!(saturday.weekday(), Weekday::Sat);
        assert_eq!(weekday_bit(saturday.weekday()), 6);
    }

    #[test]
    fn test_project_onto_route_straight_line() {
        let points = vec![
            TrainRoutePoint { schedule_id: Uuid::nil(), seq: 0, lat: 19.0, lng: 72.0 },
            TrainRoutePoint { schedule_id: Uuid::nil(), seq: 1, lat: 19.0, lng: 73.0 },
        ];
        let snap = project_onto_route(&points, 19.0001, 72.5).unwrap();
        assert!((snap.snapped_lat - 19.0).abs() < 0.01);
        assert!((snap.route_frac - 0.5).abs() < 0.02);
    }

    #[test]
    fn test_project_onto_route_too_few_points() {
        let points = vec![TrainRoutePoint { schedule_id: Uuid::nil(), seq: 0, lat: 19.0, lng: 72.0 }];
        assert!(project_onto_route(&points, 19.0, 72.0).is_none());
    }

    #[test]
    fn test_project_onto_route_zero_length() {
        let points = vec![
            TrainRoutePoint { schedule_id: Uuid::nil(), seq: 0, lat: 19.0, lng: 72.0 },
            TrainRoutePoint { schedule_id: Uuid::nil(), seq: 1, lat: 19.0, lng: 72.0 },
        ];
        assert!(project_onto_route(&points, 19.0, 72.0).is_none());
    }
}
