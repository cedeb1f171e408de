//! Mirror instance pool
//!
//! Owns the rate-limit and health state for every configured upstream
//! mirror. The pool runs as a single task that serializes all state
//! changes: callers send `acquire` / `report` / `snapshot` requests over
//! a channel and never touch instance state directly, so selection and
//! bookkeeping cannot interleave.

mod instance;

pub use instance::{backoff_penalty, select_eligible, InstanceState};

use crate::config::PoolConfig;
use serde::Serialize;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};

/// Result of one fetch attempt against an instance, as reported back to
/// the pool
#[derive(Debug, Clone)]
pub enum FetchOutcome {
    /// Usable content was retrieved
    Success { rtt: Duration },
    /// The instance refused us (HTTP 403 or 429); penalized harder
    RateLimited { status: u16 },
    /// Transport failure, server error, or unparseable content
    Error { message: String },
}

impl FetchOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }

    /// Short description for logs and failure summaries
    pub fn describe(&self) -> String {
        match self {
            Self::Success { rtt } => format!("ok in {}ms", rtt.as_millis()),
            Self::RateLimited { status } => format!("rate limited (HTTP {status})"),
            Self::Error { message } => message.clone(),
        }
    }
}

/// Permission to make one request against a specific instance
///
/// The token is consumed when the lease is granted; the caller must
/// `report` the outcome afterwards so health state stays accurate.
#[derive(Debug, Clone)]
pub struct InstanceLease {
    pub base_url: String,
}

/// Point-in-time health of one instance, for the health report
#[derive(Debug, Clone, Serialize)]
pub struct InstanceHealth {
    pub base_url: String,
    pub tokens: f64,
    pub last_rtt_ms: Option<u64>,
    pub last_error: Option<String>,
    pub backoff_remaining_seconds: u64,
    pub consecutive_failures: u32,
    pub eligible: bool,
}

/// Overall pool status: "ok" while at least one instance is eligible
pub fn overall_status(instances: &[InstanceHealth]) -> &'static str {
    if instances.iter().any(|i| i.eligible) {
        "ok"
    } else {
        "degraded"
    }
}

enum PoolRequest {
    Acquire {
        reply: oneshot::Sender<Option<InstanceLease>>,
    },
    Report {
        base_url: String,
        outcome: FetchOutcome,
    },
    Snapshot {
        reply: oneshot::Sender<Vec<InstanceHealth>>,
    },
}

/// Handle to the pool task; cheap to clone and share across drivers
#[derive(Clone)]
pub struct InstancePool {
    tx: mpsc::Sender<PoolRequest>,
}

impl InstancePool {
    /// Spawns the pool task for the configured instances
    pub fn spawn(config: &PoolConfig) -> Self {
        let (tx, rx) = mpsc::channel(64);
        let now = Instant::now();
        let states: Vec<InstanceState> = config
            .instances
            .iter()
            .map(|url| InstanceState::new(url, config, now))
            .collect();
        let base = Duration::from_secs(config.backoff_base_seconds);
        let max = Duration::from_secs(config.backoff_max_seconds);

        tokio::spawn(run_pool(rx, states, base, max));
        Self { tx }
    }

    /// Requests a lease on the best eligible instance
    ///
    /// Returns None when every instance is drained or backed off; this
    /// is an expected condition, never an error. Callers wait and retry.
    pub async fn acquire(&self) -> Option<InstanceLease> {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(PoolRequest::Acquire { reply }).await.is_err() {
            return None;
        }
        rx.await.unwrap_or(None)
    }

    /// Reports the outcome of a leased request
    pub async fn report(&self, base_url: &str, outcome: FetchOutcome) {
        let _ = self
            .tx
            .send(PoolRequest::Report {
                base_url: base_url.to_string(),
                outcome,
            })
            .await;
    }

    /// Returns the current health of every instance
    pub async fn health_snapshot(&self) -> Vec<InstanceHealth> {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(PoolRequest::Snapshot { reply }).await.is_err() {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }
}

async fn run_pool(
    mut rx: mpsc::Receiver<PoolRequest>,
    mut states: Vec<InstanceState>,
    backoff_base: Duration,
    backoff_max: Duration,
) {
    while let Some(request) = rx.recv().await {
        let now = Instant::now();
        match request {
            PoolRequest::Acquire { reply } => {
                let lease = select_eligible(&mut states, now).map(|i| {
                    let state = &mut states[i];
                    state.take_token();
                    tracing::debug!(
                        instance = %state.base_url,
                        tokens_left = state.tokens,
                        "Leased instance"
                    );
                    InstanceLease {
                        base_url: state.base_url.clone(),
                    }
                });
                if lease.is_none() {
                    tracing::debug!("No eligible instance available");
                }
                let _ = reply.send(lease);
            }
            PoolRequest::Report { base_url, outcome } => {
                let Some(state) = states.iter_mut().find(|s| s.base_url == base_url) else {
                    tracing::warn!(instance = %base_url, "Report for unknown instance");
                    continue;
                };
                match outcome {
                    FetchOutcome::Success { rtt } => {
                        state.record_success(rtt);
                        tracing::debug!(
                            instance = %base_url,
                            rtt_ms = rtt.as_millis() as u64,
                            "Instance healthy"
                        );
                    }
                    FetchOutcome::RateLimited { status } => {
                        let applied = state.record_failure(
                            now,
                            format!("rate limited (HTTP {status})"),
                            true,
                            backoff_base,
                            backoff_max,
                        );
                        tracing::warn!(
                            instance = %base_url,
                            status,
                            backoff_seconds = applied.as_secs(),
                            failures = state.consecutive_failures,
                            "Instance rate limited, backing off"
                        );
                    }
                    FetchOutcome::Error { message } => {
                        let applied = state.record_failure(
                            now,
                            message.clone(),
                            false,
                            backoff_base,
                            backoff_max,
                        );
                        tracing::warn!(
                            instance = %base_url,
                            error = %message,
                            backoff_seconds = applied.as_secs(),
                            failures = state.consecutive_failures,
                            "Instance failed, backing off"
                        );
                    }
                }
            }
            PoolRequest::Snapshot { reply } => {
                for state in states.iter_mut() {
                    state.refill(now);
                }
                let healths = states
                    .iter()
                    .map(|state| InstanceHealth {
                        base_url: state.base_url.clone(),
                        tokens: state.tokens,
                        last_rtt_ms: state.last_rtt.map(|rtt| rtt.as_millis() as u64),
                        last_error: state.last_error.clone(),
                        backoff_remaining_seconds: state.backoff_remaining(now).as_secs(),
                        consecutive_failures: state.consecutive_failures,
                        eligible: state.is_eligible(now),
                    })
                    .collect();
                let _ = reply.send(healths);
            }
        }
    }
}
