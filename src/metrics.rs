//! Prometheus gauges fed by scheduler events.

use anyhow::{Context, Result};
use prometheus::{Encoder, GaugeVec, Opts, Registry, TextEncoder};
use time::OffsetDateTime;

use crate::sink::EventSink;
use crate::types::ScanResult;

pub const PORT_LABELS: [&str; 4] = ["ipAddress", "protocol", "port", "description"];

/// [`EventSink`] that maintains the portscan gauge families in its own registry.
#[derive(Clone)]
pub struct PrometheusSink {
    registry: Registry,
    status: GaugeVec,
    updated: GaugeVec,
    port: GaugeVec,
}

impl PrometheusSink {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let status = GaugeVec::new(
            Opts::new(
                "portscan_status",
                "Portscan status per address (0 = scanning, 1 = finished)",
            ),
            &["ipAddress"],
        )?;
        let updated = GaugeVec::new(
            Opts::new(
                "portscan_updated",
                "Unix timestamp of the last finished portscan per address",
            ),
            &["ipAddress"],
        )?;
        let port = GaugeVec::new(
            Opts::new("portscan_port", "Open port detected on an address"),
            &PORT_LABELS,
        )?;

        registry.register(Box::new(status.clone()))?;
        registry.register(Box::new(updated.clone()))?;
        registry.register(Box::new(port.clone()))?;

        Ok(Self {
            registry,
            status,
            updated,
            port,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Encode every registered family in the Prometheus text format.
    pub fn render(&self) -> Result<String> {
        let mut buf = Vec::new();
        TextEncoder::new()
            .encode(&self.registry.gather(), &mut buf)
            .context("failed to encode metrics")?;
        String::from_utf8(buf).context("metrics output is not valid UTF-8")
    }
}

impl std::fmt::Debug for PrometheusSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PrometheusSink").finish_non_exhaustive()
    }
}

impl EventSink for PrometheusSink {
    fn on_cycle_start(&self, _targets: usize) -> Result<()> {
        Ok(())
    }

    fn on_address_start(&self, address: &str) -> Result<()> {
        self.status.with_label_values(&[address]).set(0.0);
        Ok(())
    }

    fn on_address_finish(&self, address: &str, _elapsed_secs: f64, _partial: bool) -> Result<()> {
        self.status.with_label_values(&[address]).set(1.0);
        self.updated
            .with_label_values(&[address])
            .set(OffsetDateTime::now_utc().unix_timestamp() as f64);
        Ok(())
    }

    fn on_cycle_finish(&self, _targets: usize) -> Result<()> {
        Ok(())
    }

    fn on_address_removed(&self, address: &str) -> Result<()> {
        // a series that was never set is not an error
        let _ = self.status.remove_label_values(&[address]);
        let _ = self.updated.remove_label_values(&[address]);
        Ok(())
    }

    fn on_results_reset(&self) -> Result<()> {
        self.port.reset();
        Ok(())
    }

    fn on_result(&self, result: &ScanResult) -> Result<()> {
        let values = result.label_values();
        let refs: Vec<&str> = values.iter().map(String::as_str).collect();
        self.port.get_metric_with_label_values(&refs)?.set(result.value);
        Ok(())
    }
}
