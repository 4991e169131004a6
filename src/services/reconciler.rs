//! Reconciler: turns one classified upstream response into exactly one
//! state transition on a run, computed as a pure function and then
//! committed through a single database transaction. The pure half
//! (`compute_transition`) never touches Postgres, so the decision logic for
//! every classification — including the full valid-response path — can be
//! unit tested without a live database, mirroring the weather service's
//! practice of keeping DB-free logic tests beside DB-touching query
//! modules.

use chrono::{DateTime, Utc};

use crate::db::models::{ErrorCounter, RunErrors, TrainRun, TrainRunLocation};
use crate::db::queries::{self, RunSnap, RunStatusUpdate};
use crate::errors::{PollError, ReconcileError};
use crate::helpers::{to_u4, to_u6};
use crate::services::upstream::{Classification, ParsedStatus};

/// Geographic bounding box the service area's coordinates must fall within.
const LAT_RANGE: (f64, f64) = (6.0, 37.0);
const LNG_RANGE: (f64, f64) = (68.0, 97.0);

/// What a single poll attempt produced, before classification-independent
/// handling. `Failed` covers both transport failure and a non-success HTTP
/// status; both accrue to the `api_error` counter identically.
pub enum PollOutcome {
    Classified(Classification),
    Failed(PollError),
}

/// The computed state transition for one run, ready to be applied in a
/// single transaction.
#[derive(Debug, Default)]
pub struct Transition {
    pub update: RunStatusUpdate,
    pub location: Option<TrainRunLocation>,
    pub clear_weekday_bit: bool,
}

/// Candidate raw coordinates extracted from a valid response, pending a
/// route-snap lookup. `None` when no snap is needed or possible.
pub struct PendingSnap {
    pub lat: f64,
    pub lng: f64,
}

/// Decide whether this response needs a route-geometry snap before the
/// transition can be finalised — i.e. there are valid, in-bounds
/// coordinates and the incoming reading is newer than what's stored. Pure;
/// the reconciler calls `queries::get_run_snap` only when this returns
/// `Some`.
pub fn pending_snap(run: &TrainRun, outcome: &PollOutcome, now: DateTime<Utc>) -> Option<PendingSnap> {
    let PollOutcome::Classified(Classification::Valid(parsed)) = outcome else {
        return None;
    };
    if !location_allowed(run, parsed, now) {
        return None;
    }
    valid_coords(parsed).map(|(lat, lng)| PendingSnap { lat, lng })
}

/// Compute the full state transition. `snap` must be `Some` result of
/// `queries::get_run_snap` iff `pending_snap` returned `Some` for the same
/// `(run, outcome, now)` — pass `None` otherwise.
pub fn compute_transition(
    run: &TrainRun,
    outcome: &PollOutcome,
    now: DateTime<Utc>,
    snap: Option<RunSnap>,
) -> Transition {
    match outcome {
        PollOutcome::Classified(Classification::ShortNotRunning) => Transition {
            update: RunStatusUpdate {
                has_arrived: Some(true),
                current_status: Some("not_running_today".to_string()),
                ..Default::default()
            },
            location: None,
            clear_weekday_bit: true,
        },
        PollOutcome::Classified(Classification::ShortTimetable) => Transition {
            update: RunStatusUpdate {
                has_arrived: Some(true),
                current_status: Some("timetable_update".to_string()),
                ..Default::default()
            },
            ..Default::default()
        },
        PollOutcome::Classified(Classification::ShortUnknown) => Transition {
            update: RunStatusUpdate {
                has_arrived: Some(true),
                current_status: Some("unknown_short_response".to_string()),
                ..Default::default()
            },
            ..Default::default()
        },
        PollOutcome::Classified(Classification::Static) => Transition {
            update: RunStatusUpdate {
                errors: Some(bump_counter(&run.errors, ErrorKind::Static, now, None)),
                ..Default::default()
            },
            ..Default::default()
        },
        PollOutcome::Classified(Classification::Malformed) => Transition {
            update: RunStatusUpdate {
                errors: Some(bump_counter(
                    &run.errors,
                    ErrorKind::Unknown,
                    now,
                    Some("structured decode failed"),
                )),
                ..Default::default()
            },
            ..Default::default()
        },
        PollOutcome::Failed(err) => {
            let reason = match err {
                PollError::NetworkError(msg) => truncate(msg),
                PollError::UpstreamStatus(code) => format!("http {code}"),
                // Intercepted by `process_run` before reaching here; a
                // shutdown-in-flight isn't a run failure and must never
                // bump its error counters.
                PollError::Cancelled => unreachable!("cancellation is handled before reconciliation"),
            };
            Transition {
                update: RunStatusUpdate {
                    errors: Some(bump_counter(&run.errors, ErrorKind::Api, now, Some(&reason))),
                    ..Default::default()
                },
                ..Default::default()
            }
        }
        PollOutcome::Classified(Classification::Valid(parsed)) => {
            compute_valid_transition(run, parsed, now, snap)
        }
    }
}

fn compute_valid_transition(
    run: &TrainRun,
    parsed: &ParsedStatus,
    now: DateTime<Utc>,
    snap: Option<RunSnap>,
) -> Transition {
    let (status, terminal) = canonical_status(parsed);
    let location_allowed = location_allowed(run, parsed, now);

    let mut errors = run.errors.0.clone();
    errors.static_response = ErrorCounter::default();

    let cursor = current_station_entry(parsed).and_then(|entry| build_cursor(entry));
    let accepted_cursor = cursor.filter(|c| accept_cursor(run.last_updated_sno.as_deref(), c));

    let mut update = RunStatusUpdate {
        has_started: Some(true),
        has_arrived: Some(terminal),
        current_status: Some(status),
        errors: Some(errors),
        last_updated_sno: accepted_cursor.clone().or_else(|| run.last_updated_sno.clone()),
        ..Default::default()
    };

    let mut location = None;

    if location_allowed {
        if let Some(parsed_ts) = parsed
            .last_update_iso_date
            .as_deref()
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        {
            let ts = parsed_ts.with_timezone(&Utc);
            update.last_update_timestamp_iso = Some(ts);

            if let Some((lat, lng)) = valid_coords(parsed) {
                let lat_u6 = to_u6(lat);
                let lng_u6 = to_u6(lng);
                let distance_u4 = to_u4(parsed.distance.unwrap_or(0.0));

                update.last_known_lat_u6 = Some(lat_u6);
                update.last_known_lng_u6 = Some(lng_u6);
                update.last_known_distance_km_u4 = Some(distance_u4);

                if let Some(snap) = snap {
                    update.last_known_snapped_lat_u6 = Some(to_u6(snap.snapped_lat));
                    update.last_known_snapped_lng_u6 = Some(to_u6(snap.snapped_lng));
                    update.last_route_frac_u4 = Some(to_u4(snap.route_frac));
                    update.last_bearing_deg = Some(snap.bearing_deg);
                }

                let segment_station_code = current_station_entry(parsed)
                    .map(|e| e.station_code.clone())
                    .unwrap_or_default();
                let at_station = !parsed.departed_cur_stn.unwrap_or(false);

                location = Some(TrainRunLocation {
                    run_id: run.run_id.clone(),
                    timestamp_iso: ts,
                    lat_u6,
                    lng_u6,
                    snapped_lat_u6: snap.map(|s| to_u6(s.snapped_lat)),
                    snapped_lng_u6: snap.map(|s| to_u6(s.snapped_lng)),
                    distance_km_u4: distance_u4,
                    segment_station_code,
                    at_station,
                });
            }
        }
    }

    Transition {
        update,
        location,
        clear_weekday_bit: false,
    }
}

/// `location_allowed` = no existing timestamp, OR the incoming timestamp is
/// strictly after it, OR the existing value is unparseable (trust
/// incoming). Both instants are compared as absolute time; the
/// configured zone only matters for how the upstream formatted them, not
/// for the comparison itself.
fn location_allowed(run: &TrainRun, parsed: &ParsedStatus, _now: DateTime<Utc>) -> bool {
    let Some(incoming_str) = parsed.last_update_iso_date.as_deref() else {
        return false;
    };
    let Ok(incoming) = DateTime::parse_from_rfc3339(incoming_str) else {
        return false;
    };
    match run.last_update_timestamp_iso {
        None => true,
        Some(existing) => incoming.with_timezone(&Utc) > existing,
    }
}

fn valid_coords(parsed: &ParsedStatus) -> Option<(f64, f64)> {
    let lat = parsed.lat?;
    let lng = parsed.lng?;
    if lat == 0.0 && lng == 0.0 {
        return None;
    }
    if !(LAT_RANGE.0..=LAT_RANGE.1).contains(&lat) {
        return None;
    }
    if !(LNG_RANGE.0..=LNG_RANGE.1).contains(&lng) {
        return None;
    }
    Some((lat, lng))
}

fn canonical_status(parsed: &ParsedStatus) -> (String, bool) {
    let raw = parsed
        .running_status
        .as_deref()
        .filter(|s| !s.trim().is_empty())
        .or(parsed.running_status_alt.as_deref())
        .unwrap_or("")
        .trim()
        .to_lowercase();

    match raw.as_str() {
        "end" => ("completed".to_string(), true),
        "cancelled" => ("cancelled".to_string(), true),
        "terminated" => ("terminated".to_string(), true),
        "rescheduled" => ("rescheduled".to_string(), false),
        "" => ("unknown".to_string(), false),
        other => (other.to_string(), false),
    }
}

fn current_station_entry(
    parsed: &ParsedStatus,
) -> Option<&crate::services::upstream::DayScheduleEntry> {
    parsed.days_schedule.iter().find(|e| e.cur_stn == Some(true))
}

fn build_cursor(entry: &crate::services::upstream::DayScheduleEntry) -> Option<String> {
    let sch_arr = entry.sch_arrival_tm?;
    let act_arr = entry.actual_arrival_tm?;
    let sch_dep = entry.sch_departure_tm?;
    let act_dep = entry.actual_departure_tm?;
    Some(format!(
        "{}|{}|{}|{}|{}|{}",
        entry.sno, entry.station_code, sch_arr, act_arr, sch_dep, act_dep
    ))
}

/// Accept `candidate` only if there is no existing cursor or its leading
/// ordinal strictly exceeds the existing one.
fn accept_cursor(existing: Option<&str>, candidate: &str) -> bool {
    let Some(existing) = existing.filter(|s| !s.is_empty()) else {
        return true;
    };
    let existing_sno = leading_sno(existing);
    let candidate_sno = leading_sno(candidate);
    match (existing_sno, candidate_sno) {
        (Some(e), Some(c)) => c > e,
        _ => true,
    }
}

fn leading_sno(cursor: &str) -> Option<i64> {
    cursor.split('|').next()?.parse().ok()
}

enum ErrorKind {
    Static,
    Api,
    Unknown,
}

fn bump_counter(
    current: &RunErrors,
    kind: ErrorKind,
    now: DateTime<Utc>,
    reason: Option<&str>,
) -> RunErrors {
    let mut errors = current.clone();
    let counter = match kind {
        ErrorKind::Static => &mut errors.static_response,
        ErrorKind::Api => &mut errors.api_error,
        ErrorKind::Unknown => &mut errors.unknown,
    };
    counter.count += 1;
    counter.last_seen = Some(now);
    if let Some(reason) = reason {
        counter.reason = Some(truncate(reason));
    }
    errors
}

fn truncate(s: &str) -> String {
    const MAX: usize = 256;
    if s.len() <= MAX {
        s.to_string()
    } else {
        format!("{}…", &s[..MAX])
    }
}

/// Apply a computed transition in a single transaction: run-status update,
/// location-log insert, and the schedule's weekday-bit clear, all or
/// nothing.
pub async fn apply(
    pool: &sqlx::PgPool,
    run_id: &str,
    schedule_id: uuid::Uuid,
    run_date: chrono::NaiveDate,
    transition: &Transition,
) -> Result<(), ReconcileError> {
    let mut tx = queries::begin_tx(pool).await?;

    queries::update_run_status(&mut *tx, run_id, &transition.update).await?;

    if let Some(location) = &transition.location {
        queries::log_run_location(&mut *tx, location).await?;
    }

    if transition.clear_weekday_bit {
        queries::clear_running_day_bit(&mut *tx, schedule_id, run_date).await?;
    }

    tx.commit().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::upstream::DayScheduleEntry;
    use chrono::NaiveDate;
    use uuid::Uuid;

    fn base_run() -> TrainRun {
        TrainRun {
            run_id: "12345_2025-05-10".to_string(),
            schedule_id: Uuid::nil(),
            train_no: 12345,
            run_date: NaiveDate::from_ymd_opt(2025, 5, 10).unwrap(),
            has_started: false,
            has_arrived: false,
            current_status: "unknown".to_string(),
            last_known_lat_u6: None,
            last_known_lng_u6: None,
            last_known_snapped_lat_u6: None,
            last_known_snapped_lng_u6: None,
            last_route_frac_u4: None,
            last_bearing_deg: None,
            last_known_distance_km_u4: None,
            last_updated_sno: None,
            errors: sqlx::types::Json(RunErrors::default()),
            last_update_timestamp_iso: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn entry(sno: i64, cur_stn: bool) -> DayScheduleEntry {
        DayScheduleEntry {
            sno,
            station_code: "BCT".to_string(),
            cur_stn: Some(cur_stn),
            sch_arrival_tm: Some(1),
            actual_arrival_tm: Some(1),
            sch_departure_tm: Some(2),
            actual_departure_tm: Some(2),
        }
    }

    #[test]
    fn s1_happy_path() {
        let run = base_run();
        let parsed = ParsedStatus {
            running_status: Some("running".to_string()),
            last_update_iso_date: Some("2025-05-10T08:30:00+05:30".to_string()),
            lat: Some(19.1),
            lng: Some(72.9),
            distance: Some(12.3456),
            departed_cur_stn: Some(false),
            days_schedule: vec![entry(3, true)],
            ..Default::default()
        };
        let outcome = PollOutcome::Classified(Classification::Valid(Box::new(parsed)));
        let now = Utc::now();
        let transition = compute_transition(&run, &outcome, now, None);

        assert_eq!(transition.update.has_started, Some(true));
        assert_eq!(transition.update.has_arrived, Some(false));
        assert_eq!(transition.update.current_status.as_deref(), Some("running"));
        assert_eq!(transition.update.last_known_lat_u6, Some(19_100_000));
        assert_eq!(transition.update.last_known_lng_u6, Some(72_900_000));
        assert_eq!(transition.update.last_known_distance_km_u4, Some(123_456));
        assert!(transition.update.last_updated_sno.as_deref().unwrap().starts_with("3|BCT"));
        let location = transition.location.expect("expected a location row");
        assert!(location.at_station);
    }

    #[test]
    fn s2_terminal_end() {
        let run = base_run();
        let parsed = ParsedStatus {
            running_status: Some("end".to_string()),
            last_update_iso_date: Some("2025-05-10T09:00:00+05:30".to_string()),
            ..Default::default()
        };
        let outcome = PollOutcome::Classified(Classification::Valid(Box::new(parsed)));
        let transition = compute_transition(&run, &outcome, Utc::now(), None);
        assert_eq!(transition.update.has_arrived, Some(true));
        assert_eq!(transition.update.current_status.as_deref(), Some("completed"));
    }

    #[test]
    fn s3_not_running_today() {
        let run = base_run();
        let outcome = PollOutcome::Classified(Classification::ShortNotRunning);
        let transition = compute_transition(&run, &outcome, Utc::now(), None);
        assert_eq!(transition.update.has_arrived, Some(true));
        assert_eq!(
            transition.update.current_status.as_deref(),
            Some("not_running_today")
        );
        assert!(transition.clear_weekday_bit);
    }

    #[test]
    fn s4_static_page_hysteresis_increments_once() {
        let run = base_run();
        let outcome = PollOutcome::Classified(Classification::Static);
        let transition = compute_transition(&run, &outcome, Utc::now(), None);
        let errors = transition.update.errors.unwrap();
        assert_eq!(errors.static_response.count, 1);
    }

    #[test]
    fn s4_valid_response_resets_static_counter() {
        let mut run = base_run();
        run.errors.0.static_response.count = 5;
        let parsed = ParsedStatus {
            running_status: Some("running".to_string()),
            last_update_iso_date: Some("2025-05-10T08:30:00+05:30".to_string()),
            ..Default::default()
        };
        let outcome = PollOutcome::Classified(Classification::Valid(Box::new(parsed)));
        let transition = compute_transition(&run, &outcome, Utc::now(), None);
        assert_eq!(transition.update.errors.unwrap().static_response.count, 0);
    }

    #[test]
    fn s5_stale_upstream_timestamp_discards_location() {
        let mut run = base_run();
        run.last_update_timestamp_iso = DateTime::parse_from_rfc3339("2025-05-10T08:30:00+05:30")
            .ok()
            .map(|d| d.with_timezone(&Utc));
        let parsed = ParsedStatus {
            running_status: Some("running".to_string()),
            last_update_iso_date: Some("2025-05-10T08:29:00+05:30".to_string()),
            lat: Some(19.2),
            lng: Some(73.0),
            days_schedule: vec![entry(4, true)],
            ..Default::default()
        };
        let outcome = PollOutcome::Classified(Classification::Valid(Box::new(parsed)));
        let transition = compute_transition(&run, &outcome, Utc::now(), None);

        assert!(transition.update.last_known_lat_u6.is_none());
        assert!(transition.location.is_none());
        assert_eq!(transition.update.current_status.as_deref(), Some("running"));
        assert!(transition.update.last_updated_sno.is_some());
    }

    #[test]
    fn s6_out_of_bounds_coordinates_discarded() {
        let run = base_run();
        let parsed = ParsedStatus {
            running_status: Some("running".to_string()),
            last_update_iso_date: Some("2025-05-10T08:30:00+05:30".to_string()),
            lat: Some(0.0),
            lng: Some(0.0),
            ..Default::default()
        };
        let outcome = PollOutcome::Classified(Classification::Valid(Box::new(parsed)));
        let transition = compute_transition(&run, &outcome, Utc::now(), None);
        assert!(transition.update.last_known_lat_u6.is_none());
        assert!(transition.location.is_none());
        assert_eq!(transition.update.current_status.as_deref(), Some("running"));
    }

    #[test]
    fn cursor_monotonicity_rejects_non_increasing() {
        assert!(accept_cursor(Some("5|BCT|1|1|2|2"), "5|BCT|1|1|2|2") == false);
        assert!(accept_cursor(Some("5|BCT|1|1|2|2"), "6|BCT|1|1|2|2"));
        assert!(accept_cursor(None, "1|BCT|1|1|2|2"));
        assert!(accept_cursor(Some(""), "1|BCT|1|1|2|2"));
    }

    #[test]
    fn idempotent_application_of_static_twice_increments_each_time() {
        let run = base_run();
        let outcome = PollOutcome::Classified(Classification::Static);
        let t1 = compute_transition(&run, &outcome, Utc::now(), None);
        let mut run2 = run;
        run2.errors = sqlx::types::Json(t1.update.errors.clone().unwrap());
        let t2 = compute_transition(&run2, &outcome, Utc::now(), None);
        assert_eq!(t2.update.errors.unwrap().static_response.count, 2);
    }
}
