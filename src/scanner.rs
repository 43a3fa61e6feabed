use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpStream;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::{self, Instant};
use tracing::{debug, warn};

use crate::ports::PortRangeSet;
use crate::store::ResultStore;
use crate::types::ScanResult;

/// Upper bound for simultaneous connects against one address.
pub const MAX_CONCURRENCY: usize = 5_000;

/// Outcome of sweeping one address.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SweepReport {
    /// Open ports, ordered by range and then by port.
    pub results: Vec<ScanResult>,
    pub elapsed_secs: f64,
    /// The per-address budget ran out before every port was probed.
    pub partial: bool,
    /// The address left the inventory before the sweep started; nothing was probed.
    pub skipped: bool,
}

impl SweepReport {
    pub fn skipped() -> Self {
        Self {
            skipped: true,
            ..Self::default()
        }
    }
}

/// Something that can sweep a single address. The scheduler only talks to
/// this trait so alternative probing strategies can be plugged in.
#[async_trait]
pub trait Sweeper: Send + Sync + 'static {
    /// Sweep `address`, or return a skipped report if `store` no longer tracks it.
    async fn sweep(&self, address: &str, store: &ResultStore) -> SweepReport;
}

/// TCP connect sweeper with a per-address time budget and bounded parallelism.
#[derive(Debug, Clone)]
pub struct PortSweepEngine {
    ranges: Arc<PortRangeSet>,
    timeout: Duration,
    connect_timeout: Option<Duration>,
    concurrency: usize,
}

impl PortSweepEngine {
    pub fn new(ranges: PortRangeSet, timeout: Duration, concurrency: usize) -> Self {
        Self {
            ranges: Arc::new(ranges),
            timeout,
            connect_timeout: None,
            concurrency: concurrency.clamp(1, MAX_CONCURRENCY),
        }
    }

    /// Cap each individual connect in addition to the per-address budget.
    pub fn with_connect_timeout(mut self, connect_timeout: Option<Duration>) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }

    pub fn ranges(&self) -> &PortRangeSet {
        &self.ranges
    }

    /// Probe every configured port on `address` without any inventory check.
    ///
    /// Refused, filtered, unreachable and timed-out connects all count as
    /// closed. Ports not started before the budget expires are closed too and
    /// flag the report as partial.
    pub async fn sweep_address(&self, address: &str) -> SweepReport {
        let start = Instant::now();
        let ip: IpAddr = match address.parse() {
            Ok(ip) => ip,
            Err(e) => {
                warn!(address, "cannot sweep unparseable address: {e}");
                return SweepReport::default();
            }
        };

        // An unrepresentable deadline means the budget never runs out.
        let deadline = start.checked_add(self.timeout);
        let sem = Arc::new(Semaphore::new(self.concurrency));
        let mut set = JoinSet::new();
        let mut open = Vec::new();
        let mut partial = false;
        let mut seq = 0usize;

        'ranges: for range in self.ranges.iter() {
            for port in range.ports() {
                let acquire = sem.clone().acquire_owned();
                let permit = match deadline {
                    Some(deadline) => match time::timeout_at(deadline, acquire).await {
                        Ok(Ok(permit)) => permit,
                        _ => {
                            partial = true;
                            break 'ranges;
                        }
                    },
                    None => match acquire.await {
                        Ok(permit) => permit,
                        Err(_) => break 'ranges,
                    },
                };
                let now = Instant::now();
                if deadline.is_some_and(|d| now >= d) {
                    partial = true;
                    break 'ranges;
                }

                // finished probes have released their permits; reap them here
                while let Some(res) = set.try_join_next() {
                    if let Ok(Some(hit)) = res {
                        open.push(hit);
                    }
                }

                let idx = seq;
                seq += 1;
                let connect_deadline = self.connect_timeout.and_then(|t| now.checked_add(t));
                let probe_deadline = match (deadline, connect_deadline) {
                    (Some(d), Some(c)) => Some(d.min(c)),
                    (d, c) => d.or(c),
                };
                set.spawn(async move {
                    let _permit = permit; // keep permit until the probe completes
                    let addr = SocketAddr::new(ip, port);
                    let connected = match probe_deadline {
                        Some(d) => matches!(
                            time::timeout_at(d, TcpStream::connect(addr)).await,
                            Ok(Ok(_))
                        ),
                        None => TcpStream::connect(addr).await.is_ok(),
                    };
                    connected.then_some((idx, port))
                });
            }
        }

        while let Some(res) = set.join_next().await {
            if let Ok(Some(hit)) = res {
                open.push(hit);
            }
        }
        open.sort_unstable_by_key(|(idx, _)| *idx);

        let results = open
            .into_iter()
            .map(|(_, port)| {
                debug!(address, port, "detected open port {port}");
                ScanResult::open_tcp(address, port)
            })
            .collect();

        SweepReport {
            results,
            elapsed_secs: start.elapsed().as_secs_f64(),
            partial,
            skipped: false,
        }
    }
}

#[async_trait]
impl Sweeper for PortSweepEngine {
    async fn sweep(&self, address: &str, store: &ResultStore) -> SweepReport {
        if !store.is_tracked(address).await {
            debug!(address, "address left the inventory, skipping sweep");
            return SweepReport::skipped();
        }
        self.sweep_address(address).await
    }
}
