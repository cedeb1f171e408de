//! Per-instance rate limiting and backoff state
//!
//! Pure state-transition logic for one upstream mirror: a continuously
//! refilled token bucket, exponential backoff with jitter, and the
//! eligibility/selection rules. All I/O-free so it can be unit tested
//! without a runtime; the actor in `pool::mod` owns these records.

use crate::config::PoolConfig;
use rand::Rng;
use std::cmp::Ordering;
use std::time::{Duration, Instant};

/// Tracks rate-allowance and health for one upstream mirror
#[derive(Debug, Clone)]
pub struct InstanceState {
    /// Base URL of the mirror, without a trailing slash
    pub base_url: String,

    /// Currently available request tokens
    pub tokens: f64,

    /// Token bucket capacity
    pub capacity: f64,

    /// Tokens accrued per second
    pub refill_per_second: f64,

    /// When tokens were last refilled
    pub last_refill: Instant,

    /// Instance is ineligible until this time passes
    pub backoff_until: Option<Instant>,

    /// Failures since the last success
    pub consecutive_failures: u32,

    /// Round-trip time of the last successful request
    pub last_rtt: Option<Duration>,

    /// Message of the most recent failure, cleared on success
    pub last_error: Option<String>,
}

impl InstanceState {
    /// Creates a fresh state with a full token bucket
    pub fn new(base_url: &str, config: &PoolConfig, now: Instant) -> Self {
        let capacity = f64::from(config.max_requests_per_minute);
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            tokens: capacity,
            capacity,
            refill_per_second: capacity / 60.0,
            last_refill: now,
            backoff_until: None,
            consecutive_failures: 0,
            last_rtt: None,
            last_error: None,
        }
    }

    /// Accrues tokens continuously up to capacity
    pub fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill);
        self.tokens = (self.tokens + self.refill_per_second * elapsed.as_secs_f64())
            .min(self.capacity);
        self.last_refill = now;
    }

    /// Whether this instance may serve a request right now
    ///
    /// Callers must `refill` first; eligibility requires an elapsed backoff
    /// and at least one whole token.
    pub fn is_eligible(&self, now: Instant) -> bool {
        if let Some(until) = self.backoff_until {
            if now < until {
                return false;
            }
        }
        self.tokens >= 1.0
    }

    /// Consumes one token for a granted request
    pub fn take_token(&mut self) {
        self.tokens -= 1.0;
    }

    /// Records a successful request: RTT stored, failure streak cleared
    pub fn record_success(&mut self, rtt: Duration) {
        self.consecutive_failures = 0;
        self.backoff_until = None;
        self.last_error = None;
        self.last_rtt = Some(rtt);
    }

    /// Records a failed request and applies jittered exponential backoff
    ///
    /// Rate limits get a doubled penalty. Returns the applied backoff.
    pub fn record_failure(
        &mut self,
        now: Instant,
        message: String,
        rate_limited: bool,
        base: Duration,
        max: Duration,
    ) -> Duration {
        self.consecutive_failures += 1;
        self.last_error = Some(message);

        let penalty = backoff_penalty(self.consecutive_failures, rate_limited, base, max);
        let jittered = apply_jitter(penalty);
        self.backoff_until = Some(now + jittered);
        jittered
    }

    /// Seconds remaining until the backoff elapses (0 if not backed off)
    pub fn backoff_remaining(&self, now: Instant) -> Duration {
        self.backoff_until
            .map(|until| until.saturating_duration_since(now))
            .unwrap_or(Duration::ZERO)
    }
}

/// Computes the raw (un-jittered) backoff for a failure streak
///
/// `min(max, base * 2^(failures - 1))`, with rate limits doubled before
/// the cap is applied.
pub fn backoff_penalty(
    consecutive_failures: u32,
    rate_limited: bool,
    base: Duration,
    max: Duration,
) -> Duration {
    let exponent = consecutive_failures.saturating_sub(1).min(20);
    let mut penalty = base.saturating_mul(1u32 << exponent);
    if rate_limited {
        penalty = penalty.saturating_mul(2);
    }
    penalty.min(max)
}

/// Applies ±20% jitter so backed-off instances do not retry in lockstep
fn apply_jitter(duration: Duration) -> Duration {
    let factor: f64 = rand::rng().random_range(0.8..=1.2);
    duration.mul_f64(factor)
}

/// Picks the eligible instance with the most tokens, tie-broken by RTT
///
/// Refills every bucket first. Instances with no recorded RTT lose ties
/// against measured ones. Returns the index into `states`, or None when
/// nothing is eligible (caller retries later; never an error).
pub fn select_eligible(states: &mut [InstanceState], now: Instant) -> Option<usize> {
    for state in states.iter_mut() {
        state.refill(now);
    }

    let mut best: Option<usize> = None;
    for (i, state) in states.iter().enumerate() {
        if !state.is_eligible(now) {
            continue;
        }
        best = match best {
            None => Some(i),
            Some(j) => {
                if prefer(state, &states[j]) {
                    Some(i)
                } else {
                    Some(j)
                }
            }
        };
    }
    best
}

fn prefer(a: &InstanceState, b: &InstanceState) -> bool {
    match a.tokens.partial_cmp(&b.tokens) {
        Some(Ordering::Greater) => true,
        Some(Ordering::Less) => false,
        _ => match (a.last_rtt, b.last_rtt) {
            (Some(x), Some(y)) => x < y,
            (Some(_), None) => true,
            _ => false,
        },
    }
}
