//! Idempotent dev/test seeding of `stations`, `train_schedules`, and
//! `train_routes` from a small static fixture. Mirrors the weather
//! service's GPX-seed-on-boot pattern (load → upsert → log outcome per
//! item) but is not the real catalog ingest path — that HTML-scraping
//! pipeline populates these tables in production and is out of scope here.

use sqlx::PgPool;
use uuid::Uuid;

struct FixtureStation {
    code: &'static str,
    name: &'static str,
    lat: f64,
    lng: f64,
}

struct FixtureSchedule {
    train_no: i32,
    origin: &'static str,
    terminus: &'static str,
    origin_sch_departure_min: i32,
    total_distance_km: f64,
    total_runtime_min: i32,
    /// bit 0 = Sunday .. bit 6 = Saturday; 127 = runs every day.
    running_days_bitmap: i32,
    route: &'static [(f64, f64)],
}

const STATIONS: &[FixtureStation] = &[
    FixtureStation { code: "BCT", name: "Mumbai Central", lat: 18.9696, lng: 72.8194 },
    FixtureStation { code: "BRC", name: "Vadodara Junction", lat: 22.3072, lng: 73.1812 },
    FixtureStation { code: "NDLS", name: "New Delhi", lat: 28.6434, lng: 77.2197 },
];

const SCHEDULES: &[FixtureSchedule] = &[FixtureSchedule {
    train_no: 12951,
    origin: "BCT",
    terminus: "NDLS",
    origin_sch_departure_min: 17 * 60,
    total_distance_km: 1384.0,
    total_runtime_min: 15 * 60 + 50,
    running_days_bitmap: 127,
    route: &[(18.9696, 72.8194), (22.3072, 73.1812), (28.6434, 77.2197)],
}];

/// Seed the fixture tables if they're empty. Safe to call on every boot —
/// each statement upserts on its natural key.
pub async fn seed_if_empty(pool: &PgPool) -> Result<(), sqlx::Error> {
    let existing: i64 = sqlx::query_scalar("SELECT count(*) FROM train_schedules")
        .fetch_one(pool)
        .await?;
    if existing > 0 {
        tracing::info!("train_schedules already populated, skipping fixture seed");
        return Ok(());
    }

    for station in STATIONS {
        sqlx::query(
            "INSERT INTO stations (station_code, name, lat, lng) VALUES ($1, $2, $3, $4) \
             ON CONFLICT (station_code) DO UPDATE SET name = EXCLUDED.name, \
                lat = EXCLUDED.lat, lng = EXCLUDED.lng",
        )
        .bind(station.code)
        .bind(station.name)
        .bind(station.lat)
        .bind(station.lng)
        .execute(pool)
        .await?;
    }

    for schedule in SCHEDULES {
        let schedule_id = Uuid::new_v4();
        sqlx::query(
            "INSERT INTO train_schedules (schedule_id, train_no, origin_station_code, \
                terminus_station_code, origin_sch_departure_min, total_distance_km, \
                total_runtime_min, running_days_bitmap) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8) \
             ON CONFLICT (train_no) DO NOTHING",
        )
        .bind(schedule_id)
        .bind(schedule.train_no)
        .bind(schedule.origin)
        .bind(schedule.terminus)
        .bind(schedule.origin_sch_departure_min)
        .bind(schedule.total_distance_km)
        .bind(schedule.total_runtime_min)
        .bind(schedule.running_days_bitmap)
        .execute(pool)
        .await?;

        for (seq, (lat, lng)) in schedule.route.iter().enumerate() {
            sqlx::query(
                "INSERT INTO train_routes (schedule_id, seq, lat, lng) VALUES ($1, $2, $3, $4) \
                 ON CONFLICT (schedule_id, seq) DO NOTHING",
            )
            .bind(schedule_id)
            .bind(seq as i32)
            .bind(lat)
            .bind(lng)
            .execute(pool)
            .await?;
        }

        tracing::info!(
            train_no = schedule.train_no,
            points = schedule.route.len(),
            "seeded train schedule fixture"
        );
    }

    Ok(())
}
