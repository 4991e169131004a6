//! The poll loop: one cycle asks the Store for eligible runs, paces and
//! bounds dispatch to the upstream client, reconciles each result, and
//! sleeps to the cycle floor. State is in-memory
//! (`Arc<RwLock<PollerState>>`), exposed through the status endpoint the
//! same way the weather service's background poller exposes its own
//! `PollerState`.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono_tz::Tz;
use serde::Serialize;
use sqlx::PgPool;
use tokio::sync::{RwLock, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use utoipa::ToSchema;

use crate::db::queries;
use crate::services::reconciler::{self, PollOutcome};
use crate::services::upstream::{classify_response, UpstreamClient};

/// Pace never drops below this, even for a tiny eligible set against a
/// large window — prevents a thundering-herd burst.
const MIN_PACE_MS: u64 = 20;

/// Per-cycle outcome counters, aggregated across all tasks in the cycle.
#[derive(Debug, Clone, Default, Serialize, ToSchema)]
pub struct CycleCounters {
    pub processed: u64,
    pub success: u64,
    pub short_not_running: u64,
    pub short_timetable: u64,
    pub short_unknown: u64,
    pub static_response: u64,
    pub api_error: u64,
    pub unknown_error: u64,
    pub no_coords: u64,
    pub coords_logged: u64,
    pub became_arrived: u64,
}

/// Global poller state, exposed via the status endpoint.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct PollerState {
    pub active: bool,
    pub last_cycle_started_at: Option<chrono::DateTime<chrono::Utc>>,
    pub last_cycle_completed_at: Option<chrono::DateTime<chrono::Utc>>,
    pub last_cycle_duration_ms: Option<u64>,
    pub last_cycle_counters: CycleCounters,
    pub total_cycles: u64,
}

impl PollerState {
    pub fn new() -> Self {
        Self {
            active: true,
            last_cycle_started_at: None,
            last_cycle_completed_at: None,
            last_cycle_duration_ms: None,
            last_cycle_counters: CycleCounters::default(),
            total_cycles: 0,
        }
    }
}

impl Default for PollerState {
    fn default() -> Self {
        Self::new()
    }
}

pub type SharedPollerState = Arc<RwLock<PollerState>>;

/// Run the poll loop until `cancel` fires. Every suspension point (pace
/// tick, permit acquisition, HTTP wait, cycle-floor sleep) is raced against
/// the token so shutdown is prompt.
pub async fn run_poller(
    pool: PgPool,
    upstream: UpstreamClient,
    timezone: Tz,
    concurrency: usize,
    window: Duration,
    static_threshold: i32,
    total_threshold: i32,
    state: SharedPollerState,
    cancel: CancellationToken,
) {
    loop {
        if cancel.is_cancelled() {
            break;
        }

        let cycle_started = Instant::now();
        let now_utc = chrono::Utc::now();
        {
            let mut s = state.write().await;
            s.last_cycle_started_at = Some(now_utc);
        }

        let runs = match queries::list_runs_to_poll(
            &pool,
            now_utc,
            timezone,
            static_threshold,
            total_threshold,
        )
        .await
        {
            Ok(runs) => runs,
            Err(e) => {
                tracing::error!("failed to list runs to poll: {}", e);
                Vec::new()
            }
        };

        let counters = if runs.is_empty() {
            CycleCounters::default()
        } else {
            let pace = Duration::from_millis(
                (window.as_millis() as u64 / runs.len() as u64).max(MIN_PACE_MS),
            );
            run_cycle(&pool, &upstream, runs, pace, concurrency, &cancel).await
        };

        tracing::info!(
            processed = counters.processed,
            success = counters.success,
            short_not_running = counters.short_not_running,
            short_timetable = counters.short_timetable,
            short_unknown = counters.short_unknown,
            static_response = counters.static_response,
            api_error = counters.api_error,
            unknown_error = counters.unknown_error,
            coords_logged = counters.coords_logged,
            became_arrived = counters.became_arrived,
            "poll cycle complete"
        );

        let elapsed = cycle_started.elapsed();
        {
            let mut s = state.write().await;
            s.last_cycle_completed_at = Some(chrono::Utc::now());
            s.last_cycle_duration_ms = Some(elapsed.as_millis() as u64);
            s.last_cycle_counters = counters;
            s.total_cycles += 1;
        }

        if elapsed < window {
            let remaining = window - elapsed;
            tokio::select! {
                _ = tokio::time::sleep(remaining) => {}
                _ = cancel.cancelled() => break,
            }
        }
    }

    let mut s = state.write().await;
    s.active = false;
}

async fn run_cycle(
    pool: &PgPool,
    upstream: &UpstreamClient,
    runs: Vec<crate::db::models::TrainRun>,
    pace: Duration,
    concurrency: usize,
    cancel: &CancellationToken,
) -> CycleCounters {
    let semaphore = Arc::new(Semaphore::new(concurrency));
    let mut ticker = tokio::time::interval(pace);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut tasks: JoinSet<CycleCounters> = JoinSet::new();

    for run in runs {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = cancel.cancelled() => break,
        }

        let Ok(permit) = tokio::select! {
            p = semaphore.clone().acquire_owned() => p,
            _ = cancel.cancelled() => break,
        } else {
            break;
        };

        let pool = pool.clone();
        let upstream = upstream.clone();
        let run_id = run.run_id.clone();
        let cancel_clone = cancel.clone();

        tasks.spawn(async move {
            let _permit = permit;
            match process_run(&pool, &upstream, &run, &cancel_clone).await {
                Ok(counters) => counters,
                Err(e) => {
                    tracing::error!(run_id = %run_id, "store error during reconciliation: {}", e);
                    CycleCounters {
                        processed: 1,
                        ..Default::default()
                    }
                }
            }
        });
    }

    let mut totals = CycleCounters::default();
    while let Some(result) = tasks.join_next().await {
        if let Ok(counters) = result {
            merge_counters(&mut totals, &counters);
        }
    }
    totals
}

async fn process_run(
    pool: &PgPool,
    upstream: &UpstreamClient,
    run: &crate::db::models::TrainRun,
    cancel: &CancellationToken,
) -> Result<CycleCounters, crate::errors::ReconcileError> {
    let schedule = queries::get_train_schedule(pool, run.train_no).await?;
    let (from_station, to_station) = schedule
        .map(|s| (s.origin_station_code, s.terminus_station_code))
        .unwrap_or_default();

    let outcome = match upstream
        .fetch_status(run.train_no, &from_station, &to_station, run.run_date, cancel)
        .await
    {
        // A shutdown in flight is not a run failure — skip reconciliation
        // entirely rather than let it bump the run's error counters.
        Err(crate::errors::PollError::Cancelled) => return Ok(CycleCounters::default()),
        Ok(bytes) => PollOutcome::Classified(classify_response(&bytes)),
        Err(e) => PollOutcome::Failed(e),
    };

    let now = chrono::Utc::now();
    let snap = if let Some(pending) = reconciler::pending_snap(run, &outcome, now) {
        queries::get_run_snap(pool, run.schedule_id, pending.lat, pending.lng)
            .await
            .unwrap_or(None)
    } else {
        None
    };

    let transition = reconciler::compute_transition(run, &outcome, now, snap);
    let mut counters = counters_for(&outcome, &transition);
    reconciler::apply(pool, &run.run_id, run.schedule_id, run.run_date, &transition).await?;
    counters.processed = 1;
    Ok(counters)
}

fn counters_for(
    outcome: &PollOutcome,
    transition: &reconciler::Transition,
) -> CycleCounters {
    let mut c = CycleCounters::default();
    match outcome {
        PollOutcome::Classified(crate::services::upstream::Classification::ShortNotRunning) => {
            c.short_not_running = 1;
            c.became_arrived = 1;
        }
        PollOutcome::Classified(crate::services::upstream::Classification::ShortTimetable) => {
            c.short_timetable = 1;
            c.became_arrived = 1;
        }
        PollOutcome::Classified(crate::services::upstream::Classification::ShortUnknown) => {
            c.short_unknown = 1;
            c.became_arrived = 1;
        }
        PollOutcome::Classified(crate::services::upstream::Classification::Static) => {
            c.static_response = 1;
        }
        PollOutcome::Classified(crate::services::upstream::Classification::Malformed) => {
            c.unknown_error = 1;
        }
        PollOutcome::Failed(_) => {
            c.api_error = 1;
        }
        PollOutcome::Classified(crate::services::upstream::Classification::Valid(_)) => {
            c.success = 1;
            if transition.location.is_some() {
                c.coords_logged = 1;
            } else {
                c.no_coords = 1;
            }
            if transition.update.has_arrived == Some(true) {
                c.became_arrived = 1;
            }
        }
    }
    c
}

fn merge_counters(totals: &mut CycleCounters, other: &CycleCounters) {
    totals.processed += other.processed;
    totals.success += other.success;
    totals.short_not_running += other.short_not_running;
    totals.short_timetable += other.short_timetable;
    totals.short_unknown += other.short_unknown;
    totals.static_response += other.static_response;
    totals.api_error += other.api_error;
    totals.unknown_error += other.unknown_error;
    totals.no_coords += other.no_coords;
    totals.coords_logged += other.coords_logged;
    totals.became_arrived += other.became_arrived;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pace_floor_applies_for_small_window() {
        let window = Duration::from_millis(10);
        let runs = 1usize;
        let pace = Duration::from_millis((window.as_millis() as u64 / runs as u64).max(MIN_PACE_MS));
        assert_eq!(pace, Duration::from_millis(MIN_PACE_MS));
    }

    #[test]
    fn test_pace_scales_with_set_size() {
        let window = Duration::from_secs(60);
        let runs = 100usize;
        let pace = Duration::from_millis((window.as_millis() as u64 / runs as u64).max(MIN_PACE_MS));
        assert_eq!(pace, Duration::from_millis(600));
    }

    #[test]
    fn test_merge_counters_sums_fields() {
        let mut totals = CycleCounters::default();
        let a = CycleCounters { processed: 3, success: 2, ..Default::default() };
        let b = CycleCounters { processed: 1, static_response: 1, ..Default::default() };
        merge_counters(&mut totals, &a);
        merge_counters(&mut totals, &b);
        assert_eq!(totals.processed, 4);
        assert_eq!(totals.success, 2);
        assert_eq!(totals.static_response, 1);
    }
}
