//! Schedule expander: a daily tick that materialises `train_runs` rows for
//! the following service day. Modeled on the poller's "compute next
//! wakeup, sleep that long, repeat" idiom, retargeted to a fixed local
//! wall-clock time instead of a cache-expiry-driven wakeup.

use chrono::{Duration as ChronoDuration, NaiveTime, TimeZone};
use chrono_tz::Tz;
use sqlx::PgPool;
use tokio_util::sync::CancellationToken;

use crate::db::queries;

/// Next-day runs are materialised at 20:00 local time — late enough in the
/// day that any schedule edits made during the day are reflected before
/// the following day's runs are generated.
const EXPANSION_HOUR: u32 = 20;

pub async fn run_expander(pool: PgPool, timezone: Tz, cancel: CancellationToken) {
    loop {
        let wait = time_until_next_tick(chrono::Utc::now(), timezone);
        tracing::info!(wait_secs = wait.num_seconds(), "schedule expander sleeping");

        tokio::select! {
            _ = tokio::time::sleep(wait.to_std().unwrap_or_default()) => {}
            _ = cancel.cancelled() => break,
        }

        let target_date = chrono::Utc::now().with_timezone(&timezone).date_naive() + ChronoDuration::days(1);
        match queries::generate_runs_for_date(&pool, target_date).await {
            Ok(n) => tracing::info!(run_date = %target_date, inserted = n, "expanded schedules into runs"),
            Err(e) => tracing::error!(run_date = %target_date, "failed to expand schedules: {}", e),
        }
    }
}

/// Duration until the next 20:00-local tick, rolling to the following day
/// if already past today's.
fn time_until_next_tick(now_utc: chrono::DateTime<chrono::Utc>, timezone: Tz) -> ChronoDuration {
    let now_local = now_utc.with_timezone(&timezone);
    let today_target = timezone
        .from_local_datetime(
            &now_local
                .date_naive()
                .and_time(NaiveTime::from_hms_opt(EXPANSION_HOUR, 0, 0).unwrap()),
        )
        .single()
        .unwrap_or(now_local);

    let target = if today_target > now_local {
        today_target
    } else {
        today_target + ChronoDuration::days(1)
    };

    target.with_timezone(&chrono::Utc) - now_utc
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone as _;

    #[test]
    fn test_rolls_to_next_day_when_past_target() {
        let tz = chrono_tz::Asia::Kolkata;
        let now = chrono::Utc.with_ymd_and_hms(2025, 5, 10, 16, 0, 0).unwrap(); // 21:30 IST
        let wait = time_until_next_tick(now, tz);
        assert!(wait.num_hours() >= 22 && wait.num_hours() <= 24);
    }

    #[test]
    fn test_waits_until_target_same_day() {
        let tz = chrono_tz::Asia::Kolkata;
        let now = chrono::Utc.with_ymd_and_hms(2025, 5, 10, 5, 0, 0).unwrap(); // 10:30 IST
        let wait = time_until_next_tick(now, tz);
        assert!(wait.num_hours() < 12);
    }
}
