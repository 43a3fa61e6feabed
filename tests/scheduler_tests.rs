use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use portwatch_rs::cache;
use portwatch_rs::metrics::PrometheusSink;
use portwatch_rs::scanner::{SweepReport, Sweeper};
use portwatch_rs::scheduler::{Phase, ScanScheduler, SchedulerConfig};
use portwatch_rs::sink::EventSink;
use portwatch_rs::store::ResultStore;
use portwatch_rs::types::{ScanResult, ScannerState, Target};
use tempfile::tempdir;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, PartialEq)]
enum Event {
    CycleStart(usize),
    AddressStart(String),
    AddressFinish(String),
    CycleFinish(usize),
    Removed(String),
    Reset,
    Result(String, u16),
}

#[derive(Default)]
struct RecordingSink {
    events: Mutex<Vec<Event>>,
}

impl RecordingSink {
    fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }

    fn record(&self, e: Event) -> anyhow::Result<()> {
        self.events.lock().unwrap().push(e);
        Ok(())
    }
}

impl EventSink for RecordingSink {
    fn on_cycle_start(&self, targets: usize) -> anyhow::Result<()> {
        self.record(Event::CycleStart(targets))
    }
    fn on_address_start(&self, address: &str) -> anyhow::Result<()> {
        self.record(Event::AddressStart(address.to_string()))
    }
    fn on_address_finish(&self, address: &str, _: f64, _: bool) -> anyhow::Result<()> {
        self.record(Event::AddressFinish(address.to_string()))
    }
    fn on_cycle_finish(&self, targets: usize) -> anyhow::Result<()> {
        self.record(Event::CycleFinish(targets))
    }
    fn on_address_removed(&self, address: &str) -> anyhow::Result<()> {
        self.record(Event::Removed(address.to_string()))
    }
    fn on_results_reset(&self) -> anyhow::Result<()> {
        self.record(Event::Reset)
    }
    fn on_result(&self, result: &ScanResult) -> anyhow::Result<()> {
        self.record(Event::Result(result.address.clone(), result.port))
    }
}

struct FailingSink;

impl EventSink for FailingSink {
    fn on_cycle_start(&self, _: usize) -> anyhow::Result<()> {
        anyhow::bail!("down")
    }
    fn on_address_start(&self, _: &str) -> anyhow::Result<()> {
        anyhow::bail!("down")
    }
    fn on_address_finish(&self, _: &str, _: f64, _: bool) -> anyhow::Result<()> {
        anyhow::bail!("down")
    }
    fn on_cycle_finish(&self, _: usize) -> anyhow::Result<()> {
        anyhow::bail!("down")
    }
    fn on_results_reset(&self) -> anyhow::Result<()> {
        anyhow::bail!("down")
    }
    fn on_result(&self, _: &ScanResult) -> anyhow::Result<()> {
        anyhow::bail!("down")
    }
}

#[derive(Default)]
struct SweepCounters {
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    sweeps: AtomicUsize,
}

/// Sweeper that reports port 22 open after a per-address delay.
#[derive(Default)]
struct FakeSweeper {
    delays: HashMap<String, Duration>,
    counters: Arc<SweepCounters>,
    /// Address removed from the inventory while its own sweep is running.
    drop_during_sweep: Option<String>,
    /// While sweeping `.0`, remove `.1` from the inventory.
    drop_other: Option<(String, String)>,
}

#[async_trait]
impl Sweeper for FakeSweeper {
    async fn sweep(&self, address: &str, store: &ResultStore) -> SweepReport {
        if !store.is_tracked(address).await {
            return SweepReport::skipped();
        }
        let c = &self.counters;
        let now = c.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        c.max_in_flight.fetch_max(now, Ordering::SeqCst);

        if self.drop_during_sweep.as_deref() == Some(address) {
            let remaining = store
                .targets()
                .await
                .into_iter()
                .filter(|t| t.address != address)
                .collect();
            store.set_inventory(remaining).await;
        }
        if let Some((sweeping, other)) = &self.drop_other {
            if sweeping == address {
                let remaining = store
                    .targets()
                    .await
                    .into_iter()
                    .filter(|t| &t.address != other)
                    .collect();
                store.set_inventory(remaining).await;
            }
        }

        let delay = self
            .delays
            .get(address)
            .copied()
            .unwrap_or(Duration::from_millis(1));
        tokio::time::sleep(delay).await;

        c.in_flight.fetch_sub(1, Ordering::SeqCst);
        c.sweeps.fetch_add(1, Ordering::SeqCst);
        SweepReport {
            results: vec![ScanResult::open_tcp(address, 22)],
            elapsed_secs: delay.as_secs_f64(),
            partial: false,
            skipped: false,
        }
    }
}

fn targets(addrs: &[&str]) -> Vec<Target> {
    addrs.iter().map(|a| Target::new(*a)).collect()
}

fn config(parallel: usize) -> SchedulerConfig {
    SchedulerConfig {
        parallel,
        cycle_interval: Duration::from_secs(3600),
        first_run_delay: Duration::from_secs(3600),
        cache_path: None,
    }
}

fn position(events: &[Event], wanted: &Event) -> usize {
    events
        .iter()
        .position(|e| e == wanted)
        .unwrap_or_else(|| panic!("{wanted:?} not found in {events:?}"))
}

#[tokio::test]
async fn cleanup_waits_for_every_sweep() {
    let addrs = ["10.0.0.1", "10.0.0.2", "10.0.0.3", "10.0.0.4", "10.0.0.5"];
    let delays = [60, 5, 35, 15, 25];
    let counters = Arc::new(SweepCounters::default());
    let sweeper = FakeSweeper {
        counters: counters.clone(),
        delays: addrs
            .iter()
            .zip(delays)
            .map(|(a, ms)| (a.to_string(), Duration::from_millis(ms)))
            .collect(),
        ..FakeSweeper::default()
    };
    let sink = Arc::new(RecordingSink::default());
    let scheduler = ScanScheduler::new(
        Arc::new(ResultStore::new()),
        sweeper,
        sink.clone(),
        config(2),
    );
    scheduler.set_inventory(targets(&addrs)).await;

    let summary = scheduler.run_cycle().await;
    assert_eq!(summary.targets, 5);
    assert_eq!(counters.sweeps.load(Ordering::SeqCst), 5);
    assert!(counters.max_in_flight.load(Ordering::SeqCst) <= 2);
    assert!(summary.removed.is_empty());
    assert_eq!(scheduler.phase(), Phase::Idle);

    let events = sink.events();
    let reset = position(&events, &Event::Reset);
    for a in addrs {
        assert!(position(&events, &Event::AddressFinish(a.to_string())) < reset);
        assert!(position(&events, &Event::AddressStart(a.to_string())) > 0);
    }
    assert_eq!(events.first(), Some(&Event::CycleStart(5)));
    assert_eq!(events.last(), Some(&Event::CycleFinish(5)));

    let published: Vec<_> = events
        .iter()
        .filter(|e| matches!(e, Event::Result(..)))
        .collect();
    assert_eq!(published.len(), 5);
    assert!(events[reset + 1..].iter().all(|e| !matches!(e, Event::AddressFinish(_))));
}

#[tokio::test]
async fn worker_pool_respects_parallel_limit() {
    let addrs: Vec<String> = (1..=6).map(|i| format!("10.0.1.{i}")).collect();
    let counters = Arc::new(SweepCounters::default());
    let sweeper = FakeSweeper {
        counters: counters.clone(),
        delays: addrs
            .iter()
            .map(|a| (a.clone(), Duration::from_millis(20)))
            .collect(),
        ..FakeSweeper::default()
    };
    let store = Arc::new(ResultStore::new());
    let scheduler = ScanScheduler::new(
        store.clone(),
        sweeper,
        Arc::new(RecordingSink::default()),
        config(2),
    );
    scheduler
        .set_inventory(addrs.iter().map(|a| Target::new(a.as_str())).collect())
        .await;

    scheduler.run_cycle().await;
    assert_eq!(store.result_count().await, 6);
    assert_eq!(counters.sweeps.load(Ordering::SeqCst), 6);
    let max = counters.max_in_flight.load(Ordering::SeqCst);
    assert!((1..=2).contains(&max), "max in flight was {max}");
}

#[tokio::test]
async fn orphans_are_removed_before_publishing() {
    let store = Arc::new(ResultStore::new());
    let mut restored = ScannerState::default();
    for a in ["A", "B", "C"] {
        restored.inventory.insert(a.to_string());
        restored
            .results
            .insert(a.to_string(), vec![ScanResult::open_tcp(a, 80)]);
    }
    store.restore(restored).await;
    store.set_inventory(targets(&["A", "B"])).await;

    let sink = Arc::new(RecordingSink::default());
    let scheduler = ScanScheduler::new(store.clone(), FakeSweeper::default(), sink.clone(), config(2));

    let removed = scheduler.reconcile_and_publish().await;
    assert_eq!(removed, vec!["C".to_string()]);
    assert_eq!(
        sink.events(),
        vec![
            Event::Removed("C".into()),
            Event::Reset,
            Event::Result("A".into(), 80),
            Event::Result("B".into(), 80),
        ]
    );
    let snap = store.snapshot().await;
    assert_eq!(snap.results.keys().cloned().collect::<Vec<_>>(), vec!["A", "B"]);
}

#[tokio::test]
async fn address_removed_mid_sweep_does_not_reappear() {
    let store = Arc::new(ResultStore::new());
    let sink = Arc::new(RecordingSink::default());
    let sweeper = FakeSweeper {
        drop_during_sweep: Some("X".to_string()),
        ..FakeSweeper::default()
    };
    let scheduler = ScanScheduler::new(store.clone(), sweeper, sink.clone(), config(2));
    scheduler.set_inventory(targets(&["X", "Y"])).await;

    let summary = scheduler.run_cycle().await;
    assert_eq!(summary.removed, vec!["X".to_string()]);

    let snap = store.snapshot().await;
    assert!(!snap.results.contains_key("X"));
    assert!(snap.results.contains_key("Y"));
    assert!(!sink
        .events()
        .iter()
        .any(|e| matches!(e, Event::Result(a, _) if a == "X")));

    scheduler.run_cycle().await;
    assert!(!store.snapshot().await.results.contains_key("X"));
}

#[tokio::test]
async fn sink_failures_do_not_abort_cycle() {
    let store = Arc::new(ResultStore::new());
    let scheduler = ScanScheduler::new(store.clone(), FakeSweeper::default(), Arc::new(FailingSink), config(1));
    scheduler.set_inventory(targets(&["A", "B"])).await;

    let summary = scheduler.run_cycle().await;
    assert_eq!(summary.targets, 2);
    assert_eq!(store.result_count().await, 2);
    assert_eq!(scheduler.handle().stats().await.cycles_completed, 1);
}

#[tokio::test]
async fn rescanning_unchanged_address_is_idempotent() {
    let store = Arc::new(ResultStore::new());
    let scheduler = ScanScheduler::new(store.clone(), FakeSweeper::default(), Arc::new(RecordingSink::default()), config(2));
    scheduler.set_inventory(targets(&["A"])).await;

    scheduler.run_cycle().await;
    let first = store.snapshot().await;
    scheduler.run_cycle().await;
    let second = store.snapshot().await;

    assert_eq!(first, second);
    assert_eq!(
        serde_json::to_vec(&first).unwrap(),
        serde_json::to_vec(&second).unwrap()
    );
}

#[tokio::test]
async fn run_reconciles_restored_cache_before_first_scan() {
    let dir = tempdir().expect("tempdir");
    let path = dir.path().join("state.json");

    let mut stale = ScannerState::default();
    for a in ["A", "C"] {
        stale.inventory.insert(a.to_string());
        stale.results.insert(a.to_string(), vec![ScanResult::open_tcp(a, 8080)]);
    }
    cache::save(&path, &stale).await.unwrap();

    let sink = Arc::new(RecordingSink::default());
    let scheduler = ScanScheduler::new(
        Arc::new(ResultStore::new()),
        FakeSweeper::default(),
        sink.clone(),
        SchedulerConfig {
            cache_path: Some(path.clone()),
            ..config(2)
        },
    );
    scheduler.restore_cache().await;
    scheduler.set_inventory(targets(&["A"])).await;

    let handle = scheduler.handle();
    let cancel = CancellationToken::new();
    let task = tokio::spawn(scheduler.run(cancel.clone()));

    tokio::time::timeout(Duration::from_secs(5), async {
        while handle.stats().await.cycles_completed == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("first cycle finished");
    cancel.cancel();
    tokio::time::timeout(Duration::from_secs(5), task)
        .await
        .expect("scheduler stopped")
        .unwrap();

    let events = sink.events();
    assert_eq!(
        &events[..3],
        &[
            Event::Removed("C".into()),
            Event::Reset,
            Event::Result("A".into(), 8080)
        ]
    );
    assert!(position(&events, &Event::CycleStart(1)) > 2);
    assert!(!events
        .iter()
        .any(|e| matches!(e, Event::Result(a, _) if a == "C")));

    let saved = cache::load(&path).await.unwrap();
    assert_eq!(saved.inventory.iter().cloned().collect::<Vec<_>>(), vec!["A"]);
    assert_eq!(saved.results["A"], vec![ScanResult::open_tcp("A", 22)]);
}

#[tokio::test]
async fn metrics_forget_addresses_that_left_the_inventory() {
    let metrics = Arc::new(PrometheusSink::new().unwrap());
    let scheduler = ScanScheduler::new(
        Arc::new(ResultStore::new()),
        FakeSweeper::default(),
        metrics.clone(),
        config(2),
    );

    scheduler.set_inventory(targets(&["10.0.0.1", "10.0.0.2"])).await;
    scheduler.run_cycle().await;
    let text = metrics.render().unwrap();
    assert!(text.contains(r#"portscan_status{ipAddress="10.0.0.1"} 1"#));

    scheduler.set_inventory(targets(&["10.0.0.2"])).await;
    let summary = scheduler.run_cycle().await;
    assert_eq!(summary.removed, vec!["10.0.0.1".to_string()]);

    let text = metrics.render().unwrap();
    assert!(!text.contains(r#"ipAddress="10.0.0.1""#), "{text}");
    assert!(text.contains(r#"portscan_status{ipAddress="10.0.0.2"} 1"#));
    assert!(text.contains(r#"portscan_updated{ipAddress="10.0.0.2"}"#));
}

#[tokio::test]
async fn skipped_address_is_reported_as_removed() {
    let sink = Arc::new(RecordingSink::default());
    let store = Arc::new(ResultStore::new());
    let sweeper = FakeSweeper {
        drop_other: Some(("A".to_string(), "B".to_string())),
        ..FakeSweeper::default()
    };
    let scheduler = ScanScheduler::new(store.clone(), sweeper, sink.clone(), config(1));
    scheduler.set_inventory(targets(&["A", "B"])).await;

    let summary = scheduler.run_cycle().await;
    assert_eq!(summary.targets, 2);
    assert!(summary.removed.is_empty());

    let events = sink.events();
    assert!(events.contains(&Event::Removed("B".into())));
    assert!(!events.contains(&Event::Removed("A".into())));
    let snap = store.snapshot().await;
    assert_eq!(snap.results.keys().cloned().collect::<Vec<_>>(), vec!["A"]);
}

async fn wait_for_cycles(handle: &portwatch_rs::scheduler::SchedulerHandle, n: u64) {
    while handle.stats().await.cycles_completed < n {
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

#[tokio::test(start_paused = true)]
async fn inventory_arriving_after_first_retry_starts_a_cycle_promptly() {
    let scheduler = ScanScheduler::new(
        Arc::new(ResultStore::new()),
        FakeSweeper::default(),
        Arc::new(RecordingSink::default()),
        SchedulerConfig::default(),
    );
    let handle = scheduler.handle();
    let cancel = CancellationToken::new();
    let task = tokio::spawn(scheduler.run(cancel.clone()));

    // past the 10 s first-run delay, into the long empty-inventory wait
    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(handle.stats().await.cycles_completed, 0);

    handle.set_inventory(targets(&["10.0.0.1"])).await;
    tokio::time::timeout(Duration::from_secs(5), wait_for_cycles(&handle, 1))
        .await
        .expect("cycle started after inventory update");

    tokio::time::sleep(Duration::from_secs(3600)).await;
    assert_eq!(handle.stats().await.cycles_completed, 1);

    cancel.cancel();
    task.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn inventory_during_first_delay_cuts_it_short() {
    let scheduler = ScanScheduler::new(
        Arc::new(ResultStore::new()),
        FakeSweeper::default(),
        Arc::new(RecordingSink::default()),
        SchedulerConfig::default(),
    );
    let handle = scheduler.handle();
    let cancel = CancellationToken::new();
    let task = tokio::spawn(scheduler.run(cancel.clone()));

    tokio::time::sleep(Duration::from_secs(2)).await;
    let started = tokio::time::Instant::now();
    handle.set_inventory(targets(&["10.0.0.1"])).await;
    wait_for_cycles(&handle, 1).await;
    assert!(started.elapsed() < Duration::from_secs(8));

    cancel.cancel();
    task.await.unwrap();
}
