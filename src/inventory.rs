use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr};

use ipnet::{IpNet, Ipv4Net};
use serde::Deserialize;

use crate::error::{Error, Result};
use crate::types::Target;

/// Parse raw inventory entries (IP literals or CIDR blocks) into targets.
///
/// CIDR blocks are expanded to their host addresses. Duplicates are dropped,
/// first occurrence wins, so the output keeps the input order.
pub fn parse_entries<S: AsRef<str>>(entries: &[S]) -> Result<Vec<Target>> {
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for raw in entries {
        let entry = raw.as_ref().trim();
        if entry.is_empty() {
            continue;
        }
        for ip in parse_entry(entry)? {
            let address = ip.to_string();
            if seen.insert(address.clone()) {
                out.push(Target::new(address));
            }
        }
    }
    Ok(out)
}

/// Inventory entry as accepted over the API: a bare IP/CIDR string or a
/// single address with labels.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum InventoryEntry {
    Plain(String),
    Labeled(Target),
}

/// Resolve API entries into targets. Labeled entries must name one IP address.
pub fn resolve(entries: Vec<InventoryEntry>) -> Result<Vec<Target>> {
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for entry in entries {
        let targets = match entry {
            InventoryEntry::Plain(raw) => parse_entries(&[raw])?,
            InventoryEntry::Labeled(mut target) => {
                let ip: IpAddr = target.address.trim().parse().map_err(|e| {
                    Error::invalid_target(&target.address, format!("invalid IP: {e}"))
                })?;
                target.address = ip.to_string();
                vec![target]
            }
        };
        for target in targets {
            if seen.insert(target.address.clone()) {
                out.push(target);
            }
        }
    }
    Ok(out)
}

fn parse_entry(entry: &str) -> Result<Vec<IpAddr>> {
    if entry.contains('/') {
        let net: IpNet = entry
            .parse()
            .map_err(|e| Error::invalid_target(entry, format!("invalid CIDR: {e}")))?;
        return match net {
            IpNet::V4(n4) => Ok(expand_ipv4net_hosts(n4).into_iter().map(IpAddr::V4).collect()),
            IpNet::V6(n6) if n6.prefix_len() == 128 => Ok(vec![IpAddr::V6(n6.addr())]),
            IpNet::V6(_) => Err(Error::invalid_target(
                entry,
                "IPv6 blocks are too large to sweep, list addresses instead",
            )),
        };
    }
    let ip: IpAddr = entry
        .parse()
        .map_err(|e| Error::invalid_target(entry, format!("invalid IP: {e}")))?;
    Ok(vec![ip])
}

/// Host addresses of an IPv4 network.
///
/// Network and broadcast addresses are skipped for prefixes up to /30; /31
/// and /32 have no such addresses and yield every address they contain.
pub fn expand_ipv4net_hosts(net: Ipv4Net) -> Vec<Ipv4Addr> {
    let start = u32::from(net.network());
    let end = u32::from(net.broadcast());
    if net.prefix_len() >= 31 {
        return (start..=end).map(Ipv4Addr::from).collect();
    }
    (start + 1..end).map(Ipv4Addr::from).collect()
}
