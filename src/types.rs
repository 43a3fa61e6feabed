use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

/// Scan target identifier; an IP literal in practice, compared as a plain string.
pub type Address = String;

pub const PROTOCOL_TCP: &str = "TCP";

/// One inventory entry. `labels` is caller metadata and is never interpreted.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub address: Address,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
}

impl Target {
    pub fn new(address: impl Into<Address>) -> Self {
        Self {
            address: address.into(),
            labels: BTreeMap::new(),
        }
    }
}

/// One open port discovered on an address.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ScanResult {
    pub address: Address,
    pub protocol: String,
    pub port: u16,
    pub description: String,
    pub value: f64,
}

impl ScanResult {
    pub fn open_tcp(address: &str, port: u16) -> Self {
        Self {
            address: address.to_string(),
            protocol: PROTOCOL_TCP.to_string(),
            port,
            description: String::new(),
            value: 1.0,
        }
    }

    /// Label values in the order `ipAddress, protocol, port, description`.
    pub fn label_values(&self) -> [String; 4] {
        [
            self.address.clone(),
            self.protocol.clone(),
            self.port.to_string(),
            self.description.clone(),
        ]
    }
}

/// Durable snapshot of the engine: results per address plus the inventory
/// they were reconciled against.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct ScannerState {
    pub results: BTreeMap<Address, Vec<ScanResult>>,
    pub inventory: BTreeSet<Address>,
}

impl ScannerState {
    pub fn is_empty(&self) -> bool {
        self.results.is_empty() && self.inventory.is_empty()
    }

    pub fn open_port_count(&self) -> usize {
        self.results.values().map(Vec::len).sum()
    }
}
