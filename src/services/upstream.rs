//! Upstream running-status client and response classifier.
//!
//! `UpstreamClient` issues the single GET this system depends on — fetching
//! a train's current running status — under a shared rate limiter, with a
//! randomised device identity per request. `classify_response` then turns
//! the raw bytes into one of a small set of outcomes the reconciler acts on.

use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDate;
use governor::{Quota, RateLimiter};
use rand::seq::SliceRandom;
use rand::Rng;
use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};
use serde::Deserialize;
use tokio_util::sync::CancellationToken;

use crate::errors::PollError;

const UPSTREAM_URL: &str = "https://enquiry.indianrail.gov.in/ntes/trainStatus";
const UPSTREAM_HTTP_TIMEOUT_SECS: u64 = 30;
const UPSTREAM_APP_VERSION: &str = "15.0.0";
const UPSTREAM_USER: &str = "trano-tracker";
const UPSTREAM_REQUESTED_WITH: &str = "com.indianrail.ntes";
const SHORT_BODY_THRESHOLD: usize = 150;

const USER_AGENT_POOL: &[&str] = &[
    "Mozilla/5.0 (Linux; Android 13; SM-G991B) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0 Mobile Safari/537.36",
    "Mozilla/5.0 (Linux; Android 12; Pixel 6) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/119.0 Mobile Safari/537.36",
    "Mozilla/5.0 (iPhone; CPU iPhone OS 17_0 like Mac OS X) AppleWebKit/605.1.15 (KHTML, like Gecko) Mobile/15E148",
    "Mozilla/5.0 (Linux; Android 11; Redmi Note 10) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/117.0 Mobile Safari/537.36",
];

type Limiter = RateLimiter<
    governor::state::NotKeyed,
    governor::state::InMemoryState,
    governor::clock::DefaultClock,
>;

/// Client for the upstream running-status endpoint. `Clone` is cheap — the
/// rate limiter and `reqwest::Client` are both internally `Arc`-backed.
#[derive(Clone)]
pub struct UpstreamClient {
    client: reqwest::Client,
    limiter: Arc<Limiter>,
    base_url: String,
}

impl UpstreamClient {
    pub fn new(proxy_url: Option<&str>, rate_limit_period_ms: u64, rate_limit_burst: u32) -> Self {
        Self::with_base_url(UPSTREAM_URL, proxy_url, rate_limit_period_ms, rate_limit_burst)
    }

    /// Same as `new`, but against an arbitrary endpoint. Exists so tests can
    /// point the client at a local mock server instead of the real upstream.
    pub fn with_base_url(
        base_url: &str,
        proxy_url: Option<&str>,
        rate_limit_period_ms: u64,
        rate_limit_burst: u32,
    ) -> Self {
        let mut builder = reqwest::Client::builder()
            .timeout(Duration::from_secs(UPSTREAM_HTTP_TIMEOUT_SECS));
        if let Some(proxy) = proxy_url {
            builder = builder
                .proxy(reqwest::Proxy::all(proxy).expect("invalid POLLER_PROXY_URL"));
        }
        let client = builder.build().expect("failed to build HTTP client");

        let burst = NonZeroU32::new(rate_limit_burst.max(1)).unwrap();
        let quota = Quota::with_period(Duration::from_millis(rate_limit_period_ms.max(1)))
            .unwrap()
            .allow_burst(burst);
        let limiter = Arc::new(RateLimiter::direct(quota));

        Self { client, limiter, base_url: base_url.to_string() }
    }

    /// Fetch the raw running-status body for one run. Every suspension point
    /// — the rate-limiter wait and the HTTP round trip — races the shared
    /// `cancel` token so a shutdown doesn't have to wait out either one.
    pub async fn fetch_status(
        &self,
        train_no: i32,
        from_station: &str,
        to_station: &str,
        run_date: NaiveDate,
        cancel: &CancellationToken,
    ) -> Result<Vec<u8>, PollError> {
        tokio::select! {
            _ = self.limiter.until_ready() => {}
            _ = cancel.cancelled() => return Err(PollError::Cancelled),
        }

        let url = self.build_url(train_no, from_station, to_station, run_date);
        let user_agent = USER_AGENT_POOL
            .choose(&mut rand::thread_rng())
            .copied()
            .unwrap_or(USER_AGENT_POOL[0]);

        let mut headers = HeaderMap::new();
        headers.insert(USER_AGENT, HeaderValue::from_static(user_agent));
        headers.insert(
            "X-Requested-With",
            HeaderValue::from_static(UPSTREAM_REQUESTED_WITH),
        );

        let response = tokio::select! {
            r = self.client.get(&url).headers(headers).send() => {
                r.map_err(|e| PollError::NetworkError(e.to_string()))?
            }
            _ = cancel.cancelled() => return Err(PollError::Cancelled),
        };

        if !response.status().is_success() {
            return Err(PollError::UpstreamStatus(response.status().as_u16()));
        }

        let bytes = tokio::select! {
            b = response.bytes() => b.map_err(|e| PollError::NetworkError(e.to_string()))?,
            _ = cancel.cancelled() => return Err(PollError::Cancelled),
        };
        Ok(bytes.to_vec())
    }

    fn build_url(
        &self,
        train_no: i32,
        from_station: &str,
        to_station: &str,
        run_date: NaiveDate,
    ) -> String {
        let train_no_str = format!("{:05}", train_no);
        let date_str = run_date.format("%d-%m-%Y").to_string();
        let qid = random_hex_qid();
        let cb = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();
        let from_day = 1;
        let wid = compute_wid(
            UPSTREAM_USER,
            UPSTREAM_APP_VERSION,
            &qid,
            &train_no_str,
            from_station,
            to_station,
            &date_str,
            from_day,
        );
        let base_url = &self.base_url;

        format!(
            "{base_url}?train_no={train_no_str}&date={date_str}&appVersion={UPSTREAM_APP_VERSION}\
             &from_day={from_day}&from={from_station}&to={to_station}&lang=en&user={UPSTREAM_USER}\
             &qid={qid}&cb={cb}&flow=regular&wid={wid}"
        )
    }
}

fn random_hex_qid() -> String {
    let mut rng = rand::thread_rng();
    (0..32)
        .map(|_| std::char::from_digit(rng.gen_range(0..16), 16).unwrap())
        .collect()
}

/// Adler-32 checksum (decimal) of the concatenated signing fields, matching
/// the upstream app's request-signing scheme.
fn compute_wid(
    user: &str,
    app_version: &str,
    qid: &str,
    train_no: &str,
    from: &str,
    to: &str,
    date: &str,
    from_day: u8,
) -> u32 {
    let concat = format!("{user}{app_version}{qid}{train_no}{from}{to}{date}{from_day}");
    adler::adler32_slice(concat.as_bytes())
}

// ---------------------------------------------------------------------------
// Response classifier
// ---------------------------------------------------------------------------

/// One entry in the upstream's day-schedule array.
#[derive(Debug, Clone, Deserialize)]
pub struct DayScheduleEntry {
    pub sno: i64,
    pub station_code: String,
    #[serde(default)]
    pub cur_stn: Option<bool>,
    pub sch_arrival_tm: Option<i64>,
    pub actual_arrival_tm: Option<i64>,
    pub sch_departure_tm: Option<i64>,
    pub actual_departure_tm: Option<i64>,
}

/// The structured shape of a successfully decoded upstream response.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct ParsedStatus {
    #[serde(default)]
    pub running_status: Option<String>,
    #[serde(default, rename = "running status")]
    pub running_status_alt: Option<String>,
    #[serde(default)]
    pub last_update_iso_date: Option<String>,
    #[serde(default)]
    pub lat: Option<f64>,
    #[serde(default)]
    pub lng: Option<f64>,
    #[serde(default)]
    pub distance: Option<f64>,
    #[serde(default)]
    pub departed_cur_stn: Option<bool>,
    #[serde(default)]
    pub days_schedule: Vec<DayScheduleEntry>,
}

/// Outcome of classifying a raw upstream body.
#[derive(Debug, Clone)]
pub enum Classification {
    ShortNotRunning,
    ShortTimetable,
    ShortUnknown,
    Static,
    Malformed,
    Valid(Box<ParsedStatus>),
}

/// Classify a raw upstream response. Byte-length and substring heuristics,
/// not structural JSON inspection — the upstream returns compact HTML error
/// blurbs under 150 bytes for "not running"/"check back later" conditions,
/// and longer bodies lacking the status marker are cached static pages
/// served by an intermediary rather than the live service.
pub fn classify_response(body: &[u8]) -> Classification {
    let text = String::from_utf8_lossy(body);
    let lower = text.to_lowercase();

    if body.len() < SHORT_BODY_THRESHOLD {
        if lower.contains("not running") {
            return Classification::ShortNotRunning;
        }
        if lower.contains("update the timetable") {
            return Classification::ShortTimetable;
        }
        return Classification::ShortUnknown;
    }

    if !lower.contains("running_status") && !lower.contains("running status") {
        return Classification::Static;
    }

    match serde_json::from_slice::<ParsedStatus>(body) {
        Ok(parsed) => Classification::Valid(Box::new(parsed)),
        Err(_) => Classification::Malformed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_short_not_running() {
        let body = b"Train 12345 is not running today. Please check tomorrow.";
        assert!(matches!(
            classify_response(body),
            Classification::ShortNotRunning
        ));
    }

    #[test]
    fn test_classify_short_timetable() {
        let body = b"Please update the timetable in your app to continue.";
        assert!(matches!(
            classify_response(body),
            Classification::ShortTimetable
        ));
    }

    #[test]
    fn test_classify_short_unknown() {
        let body = b"Service temporarily unavailable.";
        assert!(matches!(classify_response(body), Classification::ShortUnknown));
    }

    #[test]
    fn test_classify_static_long_body_without_marker() {
        let body = vec![b'x'; 200];
        assert!(matches!(classify_response(&body), Classification::Static));
    }

    #[test]
    fn test_classify_malformed_with_marker_bad_json() {
        let mut body = b"{ running_status: not valid json at all ".to_vec();
        body.extend(vec![b' '; 150]);
        assert!(matches!(classify_response(&body), Classification::Malformed));
    }

    #[test]
    fn test_classify_valid() {
        let json = serde_json::json!({
            "running_status": "Running",
            "last_update_iso_date": "2025-05-10T08:30:00+05:30",
            "lat": 19.1,
            "lng": 72.9,
            "distance": 12.3456,
            "departed_cur_stn": false,
            "days_schedule": [
                {"sno": 3, "station_code": "BCT", "cur_stn": true,
                 "sch_arrival_tm": 1, "actual_arrival_tm": 1,
                 "sch_departure_tm": 1, "actual_departure_tm": 1}
            ]
        });
        let body = json.to_string().into_bytes();
        match classify_response(&body) {
            Classification::Valid(parsed) => {
                assert_eq!(parsed.running_status.as_deref(), Some("Running"));
                assert_eq!(parsed.days_schedule.len(), 1);
            }
            other => panic!("expected Valid, got {other:?}"),
        }
    }

    #[test]
    fn test_compute_wid_deterministic() {
        let a = compute_wid("u", "1.0", "qid", "12345", "BCT", "NDLS", "10-05-2025", 1);
        let b = compute_wid("u", "1.0", "qid", "12345", "BCT", "NDLS", "10-05-2025", 1);
        assert_eq!(a, b);
    }
}
