//! Fault injection.
//!
//! Each call gets a [FaultDecision] when it starts. A decision may delay the
//! call, abort it, or both. Delays always run before aborts.

use std::{
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use meridian_api::{
    fault::{grpc_code_for_http_status, AbortSource, DelaySource, FaultConfig},
    matcher::header_value,
    FractionalPercent,
};
use once_cell::sync::Lazy;

use crate::rand::random_below;

const ABORT_GRPC_HEADER: &str = "x-envoy-fault-abort-grpc-request";
const ABORT_HTTP_HEADER: &str = "x-envoy-fault-abort-request";
const ABORT_PERCENTAGE_HEADER: &str = "x-envoy-fault-abort-percentage";
const DELAY_HEADER: &str = "x-envoy-fault-delay-request";
const DELAY_PERCENTAGE_HEADER: &str = "x-envoy-fault-delay-request-percentage";

/// The number of calls with a fault in progress, across every filter in
/// the process.
static ACTIVE_FAULTS: Lazy<Arc<AtomicU32>> = Lazy::new(|| Arc::new(AtomicU32::new(0)));

/// What to do to a single call.
#[derive(Debug, Default)]
pub struct FaultDecision {
    delay: Option<Duration>,
    abort: Option<tonic::Status>,
    _active: Option<ActiveFault>,
}

/// Marks a call as having an active fault until dropped.
#[derive(Debug)]
struct ActiveFault(Arc<AtomicU32>);

impl Drop for ActiveFault {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

impl FaultDecision {
    /// Returns `true` if no fault will be injected.
    pub fn is_none(&self) -> bool {
        self.delay.is_none() && self.abort.is_none()
    }

    pub fn delay(&self) -> Option<Duration> {
        self.delay
    }

    pub fn abort(&self) -> Option<&tonic::Status> {
        self.abort.as_ref()
    }

    /// Apply the decision: wait out the delay, then abort.
    ///
    /// A delay never outlasts the call's deadline. A call whose deadline
    /// passes while it's delayed fails with `DEADLINE_EXCEEDED`.
    pub async fn apply(&self, deadline: Option<Instant>) -> Result<(), tonic::Status> {
        if let Some(delay) = self.delay {
            let delay_until = tokio::time::Instant::now() + delay;

            match deadline.map(tokio::time::Instant::from_std) {
                Some(deadline) if deadline < delay_until => {
                    tokio::time::sleep_until(deadline).await;
                    return Err(tonic::Status::deadline_exceeded("Deadline Exceeded"));
                }
                _ => tokio::time::sleep_until(delay_until).await,
            }
        }

        match &self.abort {
            Some(status) => Err(status.clone()),
            None => Ok(()),
        }
    }
}

/// Decide whether to inject a fault into a call.
///
/// Once `max_active_faults` calls have a fault in progress no new faults are
/// injected. A fault stays active until its decision is dropped, which
/// should happen when the call completes.
pub fn decide(config: &FaultConfig, headers: &http::HeaderMap) -> FaultDecision {
    decide_with(config, headers, &ACTIVE_FAULTS)
}

fn decide_with(
    config: &FaultConfig,
    headers: &http::HeaderMap,
    active: &Arc<AtomicU32>,
) -> FaultDecision {
    if let Some(max) = config.max_active_faults {
        if active.load(Ordering::Acquire) >= max {
            return FaultDecision::default();
        }
    }

    let delay = config.delay.as_ref().and_then(|delay| {
        let (duration, percentage) = match &delay.source {
            DelaySource::Fixed(duration) => (Some(**duration), delay.percentage),
            DelaySource::Header => {
                let duration = header_value(headers, DELAY_HEADER)
                    .and_then(|v| v.parse::<u64>().ok())
                    .map(Duration::from_millis);
                let percentage =
                    header_percentage(headers, DELAY_PERCENTAGE_HEADER, delay.percentage);
                (duration, percentage)
            }
        };
        duration.filter(|d| !d.is_zero() && under_ratio(percentage))
    });

    let abort = config.abort.as_ref().and_then(|abort| {
        let (code, percentage) = match &abort.source {
            AbortSource::Status(code) => (Some(*code), abort.percentage),
            AbortSource::Header => {
                let percentage =
                    header_percentage(headers, ABORT_PERCENTAGE_HEADER, abort.percentage);
                (header_abort_code(headers), percentage)
            }
        };

        let code = tonic::Code::from_i32(code?);
        (code != tonic::Code::Ok && under_ratio(percentage))
            .then(|| tonic::Status::new(code, "Fault injected"))
    });

    let mut decision = FaultDecision {
        delay,
        abort,
        _active: None,
    };
    if !decision.is_none() {
        active.fetch_add(1, Ordering::AcqRel);
        decision._active = Some(ActiveFault(active.clone()));
    }
    decision
}

// the gRPC status header wins over the HTTP status header.
fn header_abort_code(headers: &http::HeaderMap) -> Option<i32> {
    if let Some(code) = header_value(headers, ABORT_GRPC_HEADER) {
        return code.parse().ok();
    }

    header_value(headers, ABORT_HTTP_HEADER)
        .and_then(|status| status.parse::<u16>().ok())
        .map(grpc_code_for_http_status)
}

// a percentage from a header is capped at the configured percentage, and
// shares its denominator.
fn header_percentage(
    headers: &http::HeaderMap,
    name: &str,
    configured: FractionalPercent,
) -> FractionalPercent {
    match header_value(headers, name).and_then(|v| v.parse::<u32>().ok()) {
        Some(numerator) => FractionalPercent {
            numerator: numerator.min(configured.numerator),
            denominator: configured.denominator,
        },
        None => configured,
    }
}

fn under_ratio(percentage: FractionalPercent) -> bool {
    random_below(1_000_000) < percentage.parts_per_million() as u64
}

#[cfg(test)]
mod test {
    use super::*;
    use meridian_api::fault::{FaultAbort, FaultDelay};
    use pretty_assertions::assert_eq;

    fn fixed_delay(secs: u64, percent: u32) -> FaultConfig {
        FaultConfig {
            delay: Some(FaultDelay {
                source: DelaySource::Fixed(meridian_api::Duration::from_secs(secs)),
                percentage: FractionalPercent::per_hundred(percent),
            }),
            ..Default::default()
        }
    }

    fn abort(code: i32, percent: u32) -> FaultConfig {
        FaultConfig {
            abort: Some(FaultAbort {
                source: AbortSource::Status(code),
                percentage: FractionalPercent::per_hundred(percent),
            }),
            ..Default::default()
        }
    }

    fn headers(pairs: &[(&'static str, &str)]) -> http::HeaderMap {
        let mut headers = http::HeaderMap::new();
        for (name, value) in pairs {
            headers.insert(*name, value.parse().unwrap());
        }
        headers
    }

    #[test]
    fn test_no_fault() {
        let active = Arc::new(AtomicU32::new(0));
        let decision = decide_with(&FaultConfig::default(), &headers(&[]), &active);
        assert!(decision.is_none());
        assert_eq!(active.load(Ordering::Relaxed), 0);

        let decision = decide_with(&abort(10, 0), &headers(&[]), &active);
        assert!(decision.is_none());
    }

    #[test]
    fn test_abort_status() {
        let active = Arc::new(AtomicU32::new(0));
        let decision = decide_with(&abort(10, 100), &headers(&[]), &active);

        let status = decision.abort().unwrap();
        assert_eq!(status.code(), tonic::Code::Aborted);
        assert_eq!(status.message(), "Fault injected");
        assert_eq!(decision.delay(), None);

        // OK isn't an abort
        assert!(decide_with(&abort(0, 100), &headers(&[]), &active).is_none());
    }

    #[test]
    fn test_abort_from_headers() {
        let active = Arc::new(AtomicU32::new(0));
        let config = FaultConfig {
            abort: Some(FaultAbort {
                source: AbortSource::Header,
                percentage: FractionalPercent::per_hundred(100),
            }),
            ..Default::default()
        };

        assert!(decide_with(&config, &headers(&[]), &active).is_none());

        let decision = decide_with(
            &config,
            &headers(&[(ABORT_GRPC_HEADER, "14"), (ABORT_HTTP_HEADER, "403")]),
            &active,
        );
        assert_eq!(decision.abort().unwrap().code(), tonic::Code::Unavailable);

        let decision = decide_with(&config, &headers(&[(ABORT_HTTP_HEADER, "403")]), &active);
        assert_eq!(
            decision.abort().unwrap().code(),
            tonic::Code::PermissionDenied
        );

        let decision = decide_with(
            &config,
            &headers(&[(ABORT_GRPC_HEADER, "14"), (ABORT_PERCENTAGE_HEADER, "0")]),
            &active,
        );
        assert!(decision.is_none());
    }

    #[test]
    fn test_header_percentage_is_capped() {
        let percentage = header_percentage(
            &headers(&[(DELAY_PERCENTAGE_HEADER, "80")]),
            DELAY_PERCENTAGE_HEADER,
            FractionalPercent::per_hundred(50),
        );
        assert_eq!(percentage, FractionalPercent::per_hundred(50));

        let percentage = header_percentage(
            &headers(&[(DELAY_PERCENTAGE_HEADER, "20")]),
            DELAY_PERCENTAGE_HEADER,
            FractionalPercent::per_hundred(50),
        );
        assert_eq!(percentage, FractionalPercent::per_hundred(20));
    }

    #[test]
    fn test_abort_percentage() {
        let active = Arc::new(AtomicU32::new(0));
        let config = abort(10, 50);

        let aborted = (0..10_000)
            .filter(|_| !decide_with(&config, &headers(&[]), &active).is_none())
            .count();
        let rate = aborted as f64 / 10_000.0;
        assert!((0.45..0.55).contains(&rate), "abort rate was {rate}");
    }

    #[test]
    fn test_max_active_faults() {
        let active = Arc::new(AtomicU32::new(0));
        let config = FaultConfig {
            max_active_faults: Some(2),
            ..abort(10, 100)
        };

        let a = decide_with(&config, &headers(&[]), &active);
        let b = decide_with(&config, &headers(&[]), &active);
        let c = decide_with(&config, &headers(&[]), &active);
        assert!(!a.is_none());
        assert!(!b.is_none());
        assert!(c.is_none());
        assert_eq!(active.load(Ordering::Relaxed), 2);

        drop(a);
        let d = decide_with(&config, &headers(&[]), &active);
        assert!(!d.is_none());

        drop((b, c, d));
        assert_eq!(active.load(Ordering::Relaxed), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_delay() {
        let active = Arc::new(AtomicU32::new(0));
        let decision = decide_with(&fixed_delay(5, 100), &headers(&[]), &active);
        assert_eq!(decision.delay(), Some(Duration::from_secs(5)));

        let start = tokio::time::Instant::now();
        decision.apply(None).await.unwrap();
        assert_eq!(start.elapsed(), Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_delay_from_header() {
        let active = Arc::new(AtomicU32::new(0));
        let config = FaultConfig {
            delay: Some(FaultDelay {
                source: DelaySource::Header,
                percentage: FractionalPercent::per_hundred(100),
            }),
            ..Default::default()
        };

        let decision = decide_with(&config, &headers(&[(DELAY_HEADER, "250")]), &active);
        assert_eq!(decision.delay(), Some(Duration::from_millis(250)));

        let decision = decide_with(&config, &headers(&[]), &active);
        assert!(decision.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_delay_respects_deadline() {
        let active = Arc::new(AtomicU32::new(0));
        let decision = decide_with(&fixed_delay(20, 100), &headers(&[]), &active);

        let start = tokio::time::Instant::now();
        let deadline = (start + Duration::from_secs(4)).into_std();
        let status = decision.apply(Some(deadline)).await.unwrap_err();
        assert_eq!(status.code(), tonic::Code::DeadlineExceeded);
        assert_eq!(start.elapsed(), Duration::from_secs(4));
    }

    #[tokio::test(start_paused = true)]
    async fn test_delay_then_abort() {
        let active = Arc::new(AtomicU32::new(0));
        let config = FaultConfig {
            delay: fixed_delay(1, 100).delay,
            ..abort(10, 100)
        };
        let decision = decide_with(&config, &headers(&[]), &active);

        let start = tokio::time::Instant::now();
        let status = decision.apply(None).await.unwrap_err();
        assert_eq!(status.code(), tonic::Code::Aborted);
        assert_eq!(start.elapsed(), Duration::from_secs(1));
    }
}
