use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use portwatch_rs::config::Config;
use portwatch_rs::inventory;
use portwatch_rs::metrics::PrometheusSink;
use portwatch_rs::scanner::PortSweepEngine;
use portwatch_rs::scheduler::ScanScheduler;
use portwatch_rs::server::{self, AppState};
use portwatch_rs::sink::{LogSink, SinkSet};
use portwatch_rs::store::ResultStore;

/// Periodic TCP port sweeps of an address inventory, exported as Prometheus gauges.
#[derive(Debug, Clone, Parser)]
#[command(name = "portwatch-rs", version, about, long_about = None)]
struct Cli {
    /// TOML configuration file. Flags below override its values.
    #[arg(long, short)]
    config: Option<PathBuf>,

    /// Addresses swept concurrently per cycle.
    #[arg(long)]
    parallel: Option<usize>,

    /// Concurrent connect attempts within one address sweep.
    #[arg(long = "threads-per-scan")]
    threads_per_scan: Option<usize>,

    /// Time budget for sweeping one address, in seconds.
    #[arg(long = "timeout-seconds")]
    timeout_seconds: Option<u64>,

    /// Port range to probe (`22` or `8000-8080`); repeat for several ranges.
    #[arg(long = "port-range")]
    port_ranges: Vec<String>,

    /// Delay between cycles, in seconds.
    #[arg(long = "cycle-interval-seconds")]
    cycle_interval_seconds: Option<u64>,

    /// Where to persist scan state across restarts.
    #[arg(long = "cache-path")]
    cache_path: Option<PathBuf>,

    /// Bind address for the HTTP API.
    #[arg(long)]
    listen: Option<String>,

    /// Address or CIDR to scan; repeat for several targets.
    #[arg(long = "target")]
    targets: Vec<String>,
}

impl Cli {
    fn into_config(self) -> Result<Config> {
        let mut cfg = match &self.config {
            Some(path) => Config::load(path)?,
            None => Config::default(),
        };
        if let Some(v) = self.parallel {
            cfg.parallel = v;
        }
        if let Some(v) = self.threads_per_scan {
            cfg.threads_per_scan = v;
        }
        if let Some(v) = self.timeout_seconds {
            cfg.timeout_seconds = v;
        }
        if !self.port_ranges.is_empty() {
            cfg.port_ranges = self.port_ranges;
        }
        if let Some(v) = self.cycle_interval_seconds {
            cfg.cycle_interval_seconds = v;
        }
        if self.cache_path.is_some() {
            cfg.cache_path = self.cache_path;
        }
        if let Some(v) = self.listen {
            cfg.listen = v;
        }
        if !self.targets.is_empty() {
            cfg.inventory = self.targets;
        }
        Ok(cfg)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("portwatch_rs=info")),
        )
        .init();

    let cfg = Cli::parse().into_config()?;
    let ranges = cfg.validate().context("invalid configuration")?;
    let targets = inventory::parse_entries(&cfg.inventory).context("invalid inventory")?;

    info!("starting portwatch-rs v{}", env!("CARGO_PKG_VERSION"));
    info!("  sweep        : {}", cfg.summary());
    info!("  cycle        : every {}s", cfg.cycle_interval_seconds);
    info!(
        "  cache        : {}",
        cfg.cache_path
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "<disabled>".to_string())
    );
    info!("  listen       : {}", cfg.listen);

    let engine = PortSweepEngine::new(ranges, cfg.timeout(), cfg.threads_per_scan)
        .with_connect_timeout(cfg.connect_timeout());
    let metrics = Arc::new(PrometheusSink::new()?);
    let sinks = SinkSet::new()
        .with(Arc::new(LogSink::new(cfg.summary())))
        .with(metrics.clone());

    let store = Arc::new(ResultStore::new());
    let scheduler = ScanScheduler::new(store, engine, Arc::new(sinks), cfg.scheduler_config());
    scheduler.restore_cache().await;
    if !targets.is_empty() {
        scheduler.set_inventory(targets).await;
    }

    let cancel = CancellationToken::new();
    let ctrlc = cancel.clone();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        info!("received Ctrl-C, shutting down");
        ctrlc.cancel();
    });

    let state = AppState {
        scheduler: scheduler.handle(),
        metrics,
    };
    let server_cancel = cancel.clone();
    let listen = cfg.listen.clone();
    let server_handle = tokio::spawn(async move {
        if let Err(e) = server::serve(&listen, state, server_cancel.clone()).await {
            error!("HTTP server error: {e:#}");
            server_cancel.cancel();
        }
    });

    scheduler.run(cancel.clone()).await;
    cancel.cancel();
    let _ = server_handle.await;

    Ok(())
}
