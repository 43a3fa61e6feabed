//! Scan lifecycle: `Idle -> Scanning -> Reconciling -> Publishing -> Idle`.
//!
//! A cycle sweeps every address of the inventory with a bounded worker pool,
//! waits for all of them, drops orphans and republishes the full result set.
//! Cycles are never interrupted; shutdown is only observed while idle.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{watch, RwLock, Semaphore};
use tokio::task::JoinSet;
use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::cache;
use crate::scanner::Sweeper;
use crate::sink::EventSink;
use crate::store::ResultStore;
use crate::types::{Address, Target};

/// Extra wait added to the cycle interval while the inventory stays empty.
pub const EMPTY_INVENTORY_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Idle,
    Scanning,
    Reconciling,
    Publishing,
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Addresses swept at the same time.
    pub parallel: usize,
    pub cycle_interval: Duration,
    /// Wait before the first retry when no targets are known yet.
    pub first_run_delay: Duration,
    pub cache_path: Option<PathBuf>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            parallel: 2,
            cycle_interval: Duration::from_secs(3 * 60 * 60),
            first_run_delay: Duration::from_secs(10),
            cache_path: None,
        }
    }
}

/// Counters exposed through the status API.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CycleStats {
    pub cycles_completed: u64,
    pub last_cycle_started: Option<String>,
    pub last_cycle_finished: Option<String>,
    pub last_cycle_duration_secs: Option<f64>,
    pub last_cycle_targets: usize,
    pub last_cycle_partial: usize,
}

/// What one cycle did.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CycleSummary {
    pub targets: usize,
    pub partial: usize,
    pub removed: Vec<Address>,
    pub duration_secs: f64,
}

/// Cheap, cloneable view of a running scheduler for readers such as the HTTP API.
#[derive(Debug, Clone)]
pub struct SchedulerHandle {
    store: Arc<ResultStore>,
    phase: watch::Receiver<Phase>,
    stats: Arc<RwLock<CycleStats>>,
}

impl SchedulerHandle {
    pub fn phase(&self) -> Phase {
        *self.phase.borrow()
    }

    pub async fn stats(&self) -> CycleStats {
        self.stats.read().await.clone()
    }

    pub fn store(&self) -> &Arc<ResultStore> {
        &self.store
    }

    /// Replace the inventory. Takes effect for the next cycle's target list;
    /// sweeps of a running cycle re-check eligibility before probing.
    pub async fn set_inventory(&self, targets: Vec<Target>) {
        self.store.set_inventory(targets).await;
    }
}

pub struct ScanScheduler<S: Sweeper> {
    store: Arc<ResultStore>,
    sweeper: Arc<S>,
    sink: Arc<dyn EventSink>,
    config: SchedulerConfig,
    phase: watch::Sender<Phase>,
    stats: Arc<RwLock<CycleStats>>,
}

impl<S: Sweeper> std::fmt::Debug for ScanScheduler<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScanScheduler")
            .field("config", &self.config)
            .field("phase", &*self.phase.borrow())
            .finish_non_exhaustive()
    }
}

impl<S: Sweeper> ScanScheduler<S> {
    pub fn new(
        store: Arc<ResultStore>,
        sweeper: S,
        sink: Arc<dyn EventSink>,
        config: SchedulerConfig,
    ) -> Self {
        let (phase, _) = watch::channel(Phase::Idle);
        Self {
            store,
            sweeper: Arc::new(sweeper),
            sink,
            config,
            phase,
            stats: Arc::new(RwLock::new(CycleStats::default())),
        }
    }

    pub fn handle(&self) -> SchedulerHandle {
        SchedulerHandle {
            store: self.store.clone(),
            phase: self.phase.subscribe(),
            stats: self.stats.clone(),
        }
    }

    pub fn store(&self) -> &Arc<ResultStore> {
        &self.store
    }

    pub fn phase(&self) -> Phase {
        *self.phase.borrow()
    }

    pub async fn set_inventory(&self, targets: Vec<Target>) {
        self.store.set_inventory(targets).await;
    }

    /// Load the cache file, if one is configured, into the store.
    /// A broken or missing cache leaves the store empty.
    pub async fn restore_cache(&self) {
        if let Some(path) = &self.config.cache_path {
            let state = cache::restore_or_empty(path).await;
            self.store.restore(state).await;
        }
    }

    /// Persist the current state if a cache path is configured. Failures are
    /// logged; the in-memory state stays authoritative.
    pub async fn save_cache(&self) {
        let Some(path) = &self.config.cache_path else {
            return;
        };
        let state = self.store.snapshot().await;
        match cache::save(path, &state).await {
            Ok(()) => info!(path = %path.display(), "saved state to cache"),
            Err(e) => error!("failed to persist portscan cache: {e}"),
        }
    }

    /// Drop orphans and push the reconciled set to the sink.
    pub async fn reconcile_and_publish(&self) -> Vec<Address> {
        self.phase.send_replace(Phase::Reconciling);
        let removed = self.store.cleanup().await;
        if !removed.is_empty() {
            info!(count = removed.len(), "removed results of addresses no longer in inventory");
        }
        for address in &removed {
            notify("address-removed", self.sink.on_address_removed(address));
        }

        self.phase.send_replace(Phase::Publishing);
        self.publish().await;
        self.phase.send_replace(Phase::Idle);
        removed
    }

    async fn publish(&self) {
        let state = self.store.snapshot().await;
        notify("results-reset", self.sink.on_results_reset());
        for result in state.results.values().flatten() {
            notify("result", self.sink.on_result(result));
        }
    }

    /// Run one full cycle over the current inventory.
    pub async fn run_cycle(&self) -> CycleSummary {
        let started = Instant::now();
        let targets = self.store.targets().await;
        let count = targets.len();
        {
            let mut stats = self.stats.write().await;
            stats.last_cycle_started = Some(now_rfc3339());
        }

        notify("cycle-start", self.sink.on_cycle_start(count));
        self.phase.send_replace(Phase::Scanning);
        let partial = self.sweep_all(targets).await;
        let removed = self.reconcile_and_publish().await;
        notify("cycle-finish", self.sink.on_cycle_finish(count));

        let duration_secs = started.elapsed().as_secs_f64();
        {
            let mut stats = self.stats.write().await;
            stats.cycles_completed += 1;
            stats.last_cycle_finished = Some(now_rfc3339());
            stats.last_cycle_duration_secs = Some(duration_secs);
            stats.last_cycle_targets = count;
            stats.last_cycle_partial = partial;
        }

        self.save_cache().await;

        CycleSummary {
            targets: count,
            partial,
            removed,
            duration_secs,
        }
    }

    /// Sweep every target with at most `parallel` sweeps in flight and wait
    /// for all of them. Returns how many sweeps ran out of time.
    async fn sweep_all(&self, targets: Vec<Target>) -> usize {
        let sem = Arc::new(Semaphore::new(self.config.parallel.max(1)));
        let mut set = JoinSet::new();

        for target in targets {
            let Ok(permit) = sem.clone().acquire_owned().await else {
                break;
            };
            let store = self.store.clone();
            let sweeper = self.sweeper.clone();
            let sink = self.sink.clone();

            set.spawn(async move {
                let _permit = permit; // keep permit until the sweep is stored
                let address = target.address;

                notify("address-start", sink.on_address_start(&address));
                let report = sweeper.sweep(&address, &store).await;
                notify(
                    "address-finish",
                    sink.on_address_finish(&address, report.elapsed_secs, report.partial),
                );

                if report.skipped {
                    notify("address-removed", sink.on_address_removed(&address));
                    return false;
                }
                if report.partial {
                    warn!(address = %address, "sweep hit the timeout, unprobed ports count as closed");
                }
                store.put(&address, report.results).await;
                report.partial
            });
        }

        let mut partial = 0;
        while let Some(res) = set.join_next().await {
            match res {
                Ok(true) => partial += 1,
                Ok(false) => {}
                Err(e) => error!("sweep task failed: {e}"),
            }
        }
        partial
    }

    /// Run until `cancel` fires. Reconciles once before the first scan so
    /// restored state never reaches the sink unreconciled, and saves the
    /// cache on the way out.
    ///
    /// While the inventory is empty an inventory update ends the wait early.
    pub async fn run(self, cancel: CancellationToken) {
        self.reconcile_and_publish().await;

        let mut first_attempt = true;
        loop {
            let changed = self.store.inventory_changed();
            let wait = if self.store.inventory_len().await > 0 {
                let summary = self.run_cycle().await;
                debug!(?summary, "cycle finished");
                None
            } else {
                debug!(first_attempt, "inventory empty, waiting for targets");
                Some(idle_delay(&self.config, first_attempt))
            };
            first_attempt = false;

            match wait {
                None => tokio::select! {
                    _ = time::sleep(self.config.cycle_interval) => {}
                    _ = cancel.cancelled() => break,
                },
                Some(delay) => tokio::select! {
                    _ = time::sleep(delay) => {}
                    _ = changed => debug!("inventory updated, starting cycle"),
                    _ = cancel.cancelled() => break,
                },
            }
        }

        info!("scheduler shutting down");
        self.save_cache().await;
    }
}

/// Wait before looking at an empty inventory again.
fn idle_delay(config: &SchedulerConfig, first_attempt: bool) -> Duration {
    if first_attempt {
        config.first_run_delay
    } else {
        config.cycle_interval.saturating_add(EMPTY_INVENTORY_GRACE)
    }
}

fn notify(event: &'static str, res: anyhow::Result<()>) {
    if let Err(e) = res {
        warn!(event, "event sink notification failed: {e:#}");
    }
}

fn now_rfc3339() -> String {
    use ::time::{format_description::well_known::Rfc3339, OffsetDateTime};
    OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .unwrap_or_else(|_| String::from("1970-01-01T00:00:00Z"))
}
