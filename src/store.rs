//! Shared result map and inventory.
//!
//! Both structures live behind one mutex so that a cleanup can never observe
//! a half-applied `put` or a torn inventory replacement.

use std::collections::BTreeMap;

use tokio::sync::futures::Notified;
use tokio::sync::{Mutex, Notify};
use tracing::debug;

use crate::types::{Address, ScanResult, ScannerState, Target};

#[derive(Debug, Default)]
struct Inner {
    results: BTreeMap<Address, Vec<ScanResult>>,
    inventory: BTreeMap<Address, Target>,
}

/// Concurrency-safe store of the latest sweep results per address.
#[derive(Debug, Default)]
pub struct ResultStore {
    inner: Mutex<Inner>,
    inventory_changed: Notify,
}

impl ResultStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the full result list for `address`.
    pub async fn put(&self, address: &str, results: Vec<ScanResult>) {
        let mut guard = self.inner.lock().await;
        guard.results.insert(address.to_string(), results);
    }

    /// Replace the inventory wholesale. Later entries win on duplicate addresses.
    pub async fn set_inventory(&self, targets: Vec<Target>) {
        let inventory: BTreeMap<_, _> = targets
            .into_iter()
            .map(|t| (t.address.clone(), t))
            .collect();
        let mut guard = self.inner.lock().await;
        guard.inventory = inventory;
        drop(guard);
        self.inventory_changed.notify_waiters();
    }

    /// Resolves on the next [`ResultStore::set_inventory`]. Only updates made
    /// after this call are observed, so create it before checking the
    /// inventory.
    pub fn inventory_changed(&self) -> Notified<'_> {
        self.inventory_changed.notified()
    }

    /// Drop results for every address missing from the current inventory.
    /// Returns the removed addresses.
    pub async fn cleanup(&self) -> Vec<Address> {
        let mut guard = self.inner.lock().await;
        let Inner { results, inventory } = &mut *guard;
        remove_orphans(results, |a| inventory.contains_key(a))
    }

    pub async fn is_tracked(&self, address: &str) -> bool {
        self.inner.lock().await.inventory.contains_key(address)
    }

    /// Current inventory, ordered by address.
    pub async fn targets(&self) -> Vec<Target> {
        self.inner.lock().await.inventory.values().cloned().collect()
    }

    pub async fn inventory_len(&self) -> usize {
        self.inner.lock().await.inventory.len()
    }

    /// Number of addresses with stored results.
    pub async fn result_count(&self) -> usize {
        self.inner.lock().await.results.len()
    }

    /// Deep copy of results and inventory.
    pub async fn snapshot(&self) -> ScannerState {
        let guard = self.inner.lock().await;
        ScannerState {
            results: guard.results.clone(),
            inventory: guard.inventory.keys().cloned().collect(),
        }
    }

    /// Overwrite results and inventory from a persisted snapshot.
    ///
    /// Restored inventory entries carry no labels; the next inventory update
    /// replaces them.
    pub async fn restore(&self, state: ScannerState) {
        let mut guard = self.inner.lock().await;
        guard.results = state.results;
        guard.inventory = state
            .inventory
            .into_iter()
            .map(|a| (a.clone(), Target::new(a)))
            .collect();
    }
}

fn remove_orphans(
    results: &mut BTreeMap<Address, Vec<ScanResult>>,
    keep: impl Fn(&str) -> bool,
) -> Vec<Address> {
    let orphans: Vec<Address> = results.keys().filter(|a| !keep(a.as_str())).cloned().collect();
    for address in &orphans {
        debug!(address = %address, "removing orphaned results");
        results.remove(address);
    }
    orphans
}
