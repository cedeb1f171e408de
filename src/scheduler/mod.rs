//! Target scheduler
//!
//! Runs one driver task per registered target. Each driver loops
//! through Idle → Running → (Idle | Cooldown): acquire an instance,
//! fetch, report the outcome, store new posts, publish events, then
//! sleep until the next run. Cycles for one target never overlap; a
//! per-target mutex is shared between the driver and `fetch_once`.
//!
//! Failures never stop a driver. A failed cycle publishes an `error`
//! event and the target simply waits out its normal interval; when no
//! instance is eligible the target retries after a short jittered
//! cooldown instead.

use crate::config::{SchedulerConfig, MIN_POLL_INTERVAL_SECONDS};
use crate::events::{Event, EventBus};
use crate::fetcher::ContentFetcher;
use crate::pool::{FetchOutcome, InstancePool};
use crate::storage::{NewPost, SqliteStore, TargetRecord};
use crate::{HarvestError, Result};
use chrono::Utc;
use rand::Rng;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;

/// Result of one manual harvest pass over all targets
#[derive(Debug, Serialize)]
pub struct FetchOnceSummary {
    /// Newly inserted post count per target label ("kind:value")
    pub new_by_target: BTreeMap<String, usize>,

    /// Targets whose cycle failed this pass
    pub failures: Vec<FetchFailure>,
}

/// One failed cycle in a fetch-once pass
#[derive(Debug, Serialize)]
pub struct FetchFailure {
    pub target_id: i64,
    pub target: String,
    /// Instance that served the failing request, when one was leased
    pub instance: Option<String>,
    pub message: String,
}

struct DriverHandle {
    cancel: watch::Sender<bool>,
    cycle_lock: Arc<tokio::sync::Mutex<()>>,
    join: JoinHandle<()>,
}

struct Inner {
    pool: InstancePool,
    fetcher: ContentFetcher,
    store: Arc<Mutex<SqliteStore>>,
    bus: EventBus,
    config: SchedulerConfig,
    keep_last_per_target: Option<u32>,
    drivers: Mutex<HashMap<i64, DriverHandle>>,
}

/// Handle to the scheduler; cheap to clone
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

enum CycleResult {
    /// Fetch succeeded; `inserted` rows were new
    Fetched { inserted: usize },
    /// No instance was eligible; retry shortly
    NoInstance,
    /// The leased instance failed or returned unusable content
    Failed {
        instance: Option<String>,
        message: String,
    },
}

impl Scheduler {
    pub fn new(
        pool: InstancePool,
        fetcher: ContentFetcher,
        store: Arc<Mutex<SqliteStore>>,
        bus: EventBus,
        config: SchedulerConfig,
        keep_last_per_target: Option<u32>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                pool,
                fetcher,
                store,
                bus,
                config,
                keep_last_per_target,
                drivers: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Starts a driver task for a target
    ///
    /// The poll interval is re-checked here so a row edited out-of-band
    /// below the minimum can never become a tight polling loop.
    pub fn register_target(&self, target: TargetRecord) -> Result<()> {
        if target.poll_interval_seconds < MIN_POLL_INTERVAL_SECONDS {
            return Err(HarvestError::InvalidPollInterval {
                target: target.label(),
                seconds: target.poll_interval_seconds,
            });
        }

        let mut drivers = self.inner.drivers.lock().unwrap();
        if let Some(previous) = drivers.remove(&target.id) {
            tracing::warn!(target_id = target.id, "Replacing existing driver");
            let _ = previous.cancel.send(true);
        }

        let (cancel_tx, cancel_rx) = watch::channel(false);
        let cycle_lock = Arc::new(tokio::sync::Mutex::new(()));
        let join = tokio::spawn(drive_target(
            self.inner.clone(),
            target.clone(),
            cancel_rx,
            cycle_lock.clone(),
        ));

        drivers.insert(
            target.id,
            DriverHandle {
                cancel: cancel_tx,
                cycle_lock,
                join,
            },
        );

        tracing::info!(
            target_id = target.id,
            target_label = %target.label(),
            interval_seconds = target.poll_interval_seconds,
            "Target registered"
        );
        Ok(())
    }

    /// Stops a target's driver
    ///
    /// Returns false when no driver was registered for the id. An
    /// in-flight cycle finishes normally and its store write stands;
    /// only future cycles are prevented.
    pub fn cancel_target(&self, target_id: i64) -> bool {
        let removed = self.inner.drivers.lock().unwrap().remove(&target_id);
        match removed {
            Some(handle) => {
                let _ = handle.cancel.send(true);
                tracing::info!(target_id, "Target cancelled");
                true
            }
            None => false,
        }
    }

    /// Runs one cycle for every stored target and waits for all of them
    ///
    /// Cycles run concurrently, bounded by `fetch-once-concurrency`.
    /// Targets that found no eligible instance count zero new posts but
    /// are not failures.
    pub async fn fetch_once(&self) -> Result<FetchOnceSummary> {
        let targets = self.inner.store.lock().unwrap().list_targets()?;
        let semaphore = Arc::new(Semaphore::new(self.inner.config.fetch_once_concurrency));

        let mut joins = Vec::with_capacity(targets.len());
        for target in targets {
            let inner = self.inner.clone();
            let semaphore = semaphore.clone();
            let cycle_lock = inner
                .drivers
                .lock()
                .unwrap()
                .get(&target.id)
                .map(|h| h.cycle_lock.clone());

            joins.push(tokio::spawn(async move {
                let _permit = semaphore.acquire().await.ok();
                // Serialize with the target's driver, if one is running
                let _cycle = match &cycle_lock {
                    Some(lock) => Some(lock.lock().await),
                    None => None,
                };
                let result = run_cycle(&inner, &target).await;
                (target, result)
            }));
        }

        let mut summary = FetchOnceSummary {
            new_by_target: BTreeMap::new(),
            failures: Vec::new(),
        };
        for join in joins {
            let (target, result) = match join.await {
                Ok(pair) => pair,
                Err(e) => {
                    tracing::error!(error = %e, "Fetch-once cycle task failed");
                    continue;
                }
            };
            match result {
                CycleResult::Fetched { inserted } => {
                    summary.new_by_target.insert(target.label(), inserted);
                }
                CycleResult::NoInstance => {
                    let delay = cooldown_delay(&self.inner.config);
                    self.inner.bus.publish(Event::Cooldown {
                        target_id: target.id,
                        next_run_in_seconds: delay.as_secs(),
                    });
                    summary.new_by_target.insert(target.label(), 0);
                }
                CycleResult::Failed { instance, message } => {
                    summary.new_by_target.insert(target.label(), 0);
                    summary.failures.push(FetchFailure {
                        target_id: target.id,
                        target: target.label(),
                        instance,
                        message,
                    });
                }
            }
        }
        Ok(summary)
    }

    /// Stops all drivers and waits for their current cycles to finish
    pub async fn shutdown(&self) {
        let handles: Vec<DriverHandle> = {
            let mut drivers = self.inner.drivers.lock().unwrap();
            drivers.drain().map(|(_, handle)| handle).collect()
        };

        for handle in &handles {
            let _ = handle.cancel.send(true);
        }
        for handle in handles {
            if let Err(e) = handle.join.await {
                tracing::warn!(error = %e, "Driver task ended abnormally");
            }
        }
        tracing::info!("Scheduler stopped");
    }

    /// Number of currently registered drivers
    pub fn active_targets(&self) -> usize {
        self.inner.drivers.lock().unwrap().len()
    }
}

async fn drive_target(
    inner: Arc<Inner>,
    target: TargetRecord,
    mut cancel: watch::Receiver<bool>,
    cycle_lock: Arc<tokio::sync::Mutex<()>>,
) {
    let interval = Duration::from_secs(target.poll_interval_seconds);
    tracing::debug!(target_label = %target.label(), "Driver started");

    loop {
        if *cancel.borrow() {
            break;
        }

        let delay = {
            let _cycle = cycle_lock.lock().await;
            match run_cycle(&inner, &target).await {
                CycleResult::NoInstance => {
                    let delay = cooldown_delay(&inner.config);
                    inner.bus.publish(Event::Cooldown {
                        target_id: target.id,
                        next_run_in_seconds: delay.as_secs(),
                    });
                    tracing::debug!(
                        target_label = %target.label(),
                        retry_in_seconds = delay.as_secs(),
                        "No eligible instance, cooling down"
                    );
                    delay
                }
                // Success and failure both advance by the normal interval
                CycleResult::Fetched { .. } | CycleResult::Failed { .. } => interval,
            }
        };

        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            changed = cancel.changed() => {
                if changed.is_err() || *cancel.borrow() {
                    break;
                }
            }
        }
    }

    tracing::debug!(target_label = %target.label(), "Driver stopped");
}

/// One full poll cycle: acquire, fetch, report, store, publish
async fn run_cycle(inner: &Inner, target: &TargetRecord) -> CycleResult {
    let Some(lease) = inner.pool.acquire().await else {
        return CycleResult::NoInstance;
    };

    let (posts, outcome) = inner.fetcher.fetch(target, &lease).await;
    inner.pool.report(&lease.base_url, outcome.clone()).await;

    match outcome {
        FetchOutcome::Success { rtt } => {
            let newest_key = newest_dedup_key(&posts);
            let store_result = {
                let mut store = inner.store.lock().unwrap();
                store.insert_posts(&posts).and_then(|inserted| {
                    store.update_target_fetch_state(
                        target.id,
                        newest_key.as_deref(),
                        Utc::now(),
                    )?;
                    if let Some(keep) = inner.keep_last_per_target {
                        store.prune_posts(keep)?;
                    }
                    Ok(inserted)
                })
            };

            let inserted = match store_result {
                Ok(inserted) => inserted,
                Err(e) => {
                    tracing::error!(
                        target_label = %target.label(),
                        error = %e,
                        "Failed to persist harvested posts"
                    );
                    let message = format!("storage: {e}");
                    inner.bus.publish(Event::Error {
                        target_id: Some(target.id),
                        instance: Some(lease.base_url.clone()),
                        message: message.clone(),
                    });
                    return CycleResult::Failed {
                        instance: Some(lease.base_url),
                        message,
                    };
                }
            };

            tracing::info!(
                target_label = %target.label(),
                instance = %lease.base_url,
                fetched = posts.len(),
                inserted,
                rtt_ms = rtt.as_millis() as u64,
                "Cycle complete"
            );

            if inserted > 0 {
                inner.bus.publish(Event::NewPost {
                    target_id: target.id,
                    count: inserted,
                });
            }
            inner.bus.publish(Event::Tick {
                target_id: target.id,
            });
            CycleResult::Fetched { inserted }
        }
        failure => {
            let message = failure.describe();
            tracing::warn!(
                target_label = %target.label(),
                instance = %lease.base_url,
                error = %message,
                "Cycle failed"
            );
            inner.bus.publish(Event::Error {
                target_id: Some(target.id),
                instance: Some(lease.base_url.clone()),
                message: message.clone(),
            });
            CycleResult::Failed {
                instance: Some(lease.base_url),
                message,
            }
        }
    }
}

/// Dedup key of the newest post in a batch (by created_at, first wins ties)
fn newest_dedup_key(posts: &[NewPost]) -> Option<String> {
    let mut best: Option<&NewPost> = None;
    for post in posts {
        match best {
            None => best = Some(post),
            Some(current) if post.created_at > current.created_at => best = Some(post),
            _ => {}
        }
    }
    best.map(|post| post.dedup_key.clone())
}

fn cooldown_delay(config: &SchedulerConfig) -> Duration {
    let min = config.cooldown_min_seconds;
    let max = config.cooldown_max_seconds.max(min);
    Duration::from_secs(rand::rng().random_range(min..=max))
}
