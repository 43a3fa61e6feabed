use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use serde::Deserialize;

use crate::error::{Error, Result};
use crate::ports::PortRangeSet;
use crate::scheduler::SchedulerConfig;

/// Upper bound for `timeoutSeconds` and `firstRunDelaySeconds`: one day.
pub const MAX_TIMEOUT_SECONDS: u64 = 24 * 60 * 60;
/// Upper bound for `cycleIntervalSeconds`: 30 days.
pub const MAX_CYCLE_INTERVAL_SECONDS: u64 = 30 * 24 * 60 * 60;
/// Upper bound for `connectTimeoutMillis`, matching `MAX_TIMEOUT_SECONDS`.
pub const MAX_CONNECT_TIMEOUT_MILLIS: u64 = MAX_TIMEOUT_SECONDS * 1000;

/// Agent configuration. Keys are camelCase in the TOML file; every key is
/// optional.
///
/// ```toml
/// parallel = 2
/// threadsPerScan = 1000
/// timeoutSeconds = 5
/// portRanges = ["22", "80-90", "443"]
/// cycleIntervalSeconds = 10800
/// cachePath = "/var/lib/portwatch/state.json"
/// inventory = ["203.0.113.10", "198.51.100.0/30"]
/// ```
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default, deny_unknown_fields)]
pub struct Config {
    pub parallel: usize,
    pub threads_per_scan: usize,
    pub timeout_seconds: u64,
    pub connect_timeout_millis: Option<u64>,
    pub port_ranges: Vec<String>,
    pub cycle_interval_seconds: u64,
    pub first_run_delay_seconds: u64,
    pub cache_path: Option<PathBuf>,
    pub listen: String,
    pub inventory: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            parallel: 2,
            threads_per_scan: 1000,
            timeout_seconds: 5,
            connect_timeout_millis: None,
            port_ranges: vec!["1-65535".to_string()],
            cycle_interval_seconds: 3 * 60 * 60,
            first_run_delay_seconds: 10,
            cache_path: None,
            listen: "0.0.0.0:8080".to_string(),
            inventory: Vec::new(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::from_toml_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    pub fn from_toml_str(s: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(s)?)
    }

    /// Check numeric settings and parse the port ranges.
    ///
    /// Durations are capped so that deadlines and idle waits derived from
    /// them always fit into an `Instant`.
    pub fn validate(&self) -> Result<PortRangeSet> {
        let non_zero = [
            ("parallel", self.parallel as u64),
            ("threadsPerScan", self.threads_per_scan as u64),
            ("timeoutSeconds", self.timeout_seconds),
            ("cycleIntervalSeconds", self.cycle_interval_seconds),
        ];
        if let Some((name, _)) = non_zero.iter().find(|(_, v)| *v == 0) {
            return Err(Error::Config(format!("{name} must be greater than zero")));
        }
        if self.connect_timeout_millis == Some(0) {
            return Err(Error::Config(
                "connectTimeoutMillis must be greater than zero".to_string(),
            ));
        }
        let upper = [
            ("timeoutSeconds", self.timeout_seconds, MAX_TIMEOUT_SECONDS),
            ("firstRunDelaySeconds", self.first_run_delay_seconds, MAX_TIMEOUT_SECONDS),
            ("cycleIntervalSeconds", self.cycle_interval_seconds, MAX_CYCLE_INTERVAL_SECONDS),
            (
                "connectTimeoutMillis",
                self.connect_timeout_millis.unwrap_or(0),
                MAX_CONNECT_TIMEOUT_MILLIS,
            ),
        ];
        if let Some((name, _, max)) = upper.iter().find(|(_, v, max)| v > max) {
            return Err(Error::Config(format!("{name} must not exceed {max}")));
        }
        PortRangeSet::parse(&self.port_ranges)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }

    pub fn connect_timeout(&self) -> Option<Duration> {
        self.connect_timeout_millis.map(Duration::from_millis)
    }

    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            parallel: self.parallel,
            cycle_interval: Duration::from_secs(self.cycle_interval_seconds),
            first_run_delay: Duration::from_secs(self.first_run_delay_seconds),
            cache_path: self.cache_path.clone(),
        }
    }

    /// One-line summary of the sweep settings for log output.
    pub fn summary(&self) -> String {
        format!(
            "parallel:{}, threads per run:{}, timeout:{}s, portranges:{}",
            self.parallel,
            self.threads_per_scan,
            self.timeout_seconds,
            self.port_ranges.join(",")
        )
    }
}
