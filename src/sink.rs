//! Notification contract between the scheduler and whatever republishes scan
//! results (metrics, logs, tests).

use std::sync::Arc;

use anyhow::Result;
use tracing::{debug, info};

use crate::types::ScanResult;

/// Receives scan lifecycle events and the reconciled result set.
///
/// Every call is best effort: the scheduler logs a returned error and carries
/// on with the cycle.
pub trait EventSink: Send + Sync {
    /// A cycle begins; `targets` addresses will be swept.
    fn on_cycle_start(&self, targets: usize) -> Result<()>;

    fn on_address_start(&self, address: &str) -> Result<()>;

    /// `partial` is true when the per-address budget cut the sweep short.
    fn on_address_finish(&self, address: &str, elapsed_secs: f64, partial: bool) -> Result<()>;

    fn on_cycle_finish(&self, targets: usize) -> Result<()>;

    /// `address` left the inventory; anything kept per address can go.
    fn on_address_removed(&self, _address: &str) -> Result<()> {
        Ok(())
    }

    /// A publish begins; previously published results must be forgotten.
    fn on_results_reset(&self) -> Result<()>;

    /// One open port of the reconciled set.
    fn on_result(&self, result: &ScanResult) -> Result<()>;
}

/// Writes lifecycle events to the log.
#[derive(Debug, Clone, Default)]
pub struct LogSink {
    /// Human readable engine settings printed at cycle start.
    settings: String,
}

impl LogSink {
    pub fn new(settings: impl Into<String>) -> Self {
        Self {
            settings: settings.into(),
        }
    }
}

impl EventSink for LogSink {
    fn on_cycle_start(&self, targets: usize) -> Result<()> {
        info!("Starting portscan for {targets} IPs ({})", self.settings);
        Ok(())
    }

    fn on_address_start(&self, address: &str) -> Result<()> {
        info!("Start port scanning for {address}");
        Ok(())
    }

    fn on_address_finish(&self, address: &str, elapsed_secs: f64, partial: bool) -> Result<()> {
        if partial {
            info!("Finished port scanning for {address} in {elapsed_secs:.1}s (partial: timeout reached)");
        } else {
            info!("Finished port scanning for {address} in {elapsed_secs:.1}s");
        }
        Ok(())
    }

    fn on_cycle_finish(&self, targets: usize) -> Result<()> {
        info!("Finished portscan for {targets} IPs");
        Ok(())
    }

    fn on_address_removed(&self, address: &str) -> Result<()> {
        info!("Removed portscan results for {address}");
        Ok(())
    }

    fn on_results_reset(&self) -> Result<()> {
        Ok(())
    }

    fn on_result(&self, result: &ScanResult) -> Result<()> {
        debug!(address = %result.address, port = result.port, "open port");
        Ok(())
    }
}

/// Fans every event out to several sinks. All sinks see every event; the
/// first error is returned once everyone has been notified.
#[derive(Clone, Default)]
pub struct SinkSet {
    sinks: Vec<Arc<dyn EventSink>>,
}

impl SinkSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    fn each(&self, f: impl Fn(&dyn EventSink) -> Result<()>) -> Result<()> {
        let mut first_err = None;
        for sink in &self.sinks {
            if let Err(e) = f(sink.as_ref()) {
                first_err.get_or_insert(e);
            }
        }
        first_err.map_or(Ok(()), Err)
    }
}

impl std::fmt::Debug for SinkSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SinkSet").field("sinks", &self.sinks.len()).finish()
    }
}

impl EventSink for SinkSet {
    fn on_cycle_start(&self, targets: usize) -> Result<()> {
        self.each(|s| s.on_cycle_start(targets))
    }

    fn on_address_start(&self, address: &str) -> Result<()> {
        self.each(|s| s.on_address_start(address))
    }

    fn on_address_finish(&self, address: &str, elapsed_secs: f64, partial: bool) -> Result<()> {
        self.each(|s| s.on_address_finish(address, elapsed_secs, partial))
    }

    fn on_cycle_finish(&self, targets: usize) -> Result<()> {
        self.each(|s| s.on_cycle_finish(targets))
    }

    fn on_address_removed(&self, address: &str) -> Result<()> {
        self.each(|s| s.on_address_removed(address))
    }

    fn on_results_reset(&self) -> Result<()> {
        self.each(|s| s.on_results_reset())
    }

    fn on_result(&self, result: &ScanResult) -> Result<()> {
        self.each(|s| s.on_result(result))
    }
}
