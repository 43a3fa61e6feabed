use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Inclusive TCP port range. A single port has `first == last`.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortRange {
    pub first: u16,
    pub last: u16,
}

impl PortRange {
    /// Ports of this range in increasing order.
    pub fn ports(&self) -> impl Iterator<Item = u16> {
        self.first..=self.last
    }

    pub fn port_count(&self) -> usize {
        usize::from(self.last - self.first) + 1
    }
}

impl fmt::Display for PortRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.first == self.last {
            write!(f, "{}", self.first)
        } else {
            write!(f, "{}-{}", self.first, self.last)
        }
    }
}

/// Validated, ordered list of port ranges consumed by every sweep.
///
/// Ranges keep the order they were configured in; overlapping ranges are
/// allowed and probed as written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortRangeSet {
    ranges: Vec<PortRange>,
}

impl PortRangeSet {
    /// Parse range specs of the form `first[-last]`.
    ///
    /// - a bare number is a single-port range: `22`
    /// - `20-25` covers 20 through 25 inclusive
    /// - surrounding whitespace is ignored, anything else is an error
    pub fn parse<S: AsRef<str>>(specs: &[S]) -> Result<Self> {
        if specs.is_empty() {
            return Err(Error::invalid_range("", "no port ranges configured"));
        }
        let ranges = specs
            .iter()
            .map(|s| parse_range(s.as_ref()))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { ranges })
    }

    pub fn iter(&self) -> impl Iterator<Item = &PortRange> {
        self.ranges.iter()
    }

    pub fn ranges(&self) -> &[PortRange] {
        &self.ranges
    }

    /// Total number of probes one sweep performs.
    pub fn port_count(&self) -> usize {
        self.ranges.iter().map(PortRange::port_count).sum()
    }
}

impl fmt::Display for PortRangeSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (idx, range) in self.ranges.iter().enumerate() {
            if idx > 0 {
                f.write_str(",")?;
            }
            write!(f, "{range}")?;
        }
        Ok(())
    }
}

fn parse_range(raw: &str) -> Result<PortRange> {
    let spec = raw.trim();
    let (first, last) = match spec.split_once('-') {
        Some((a, b)) => (parse_port(raw, a)?, parse_port(raw, b)?),
        None => {
            let p = parse_port(raw, spec)?;
            (p, p)
        }
    };
    if first > last {
        return Err(Error::invalid_range(
            raw,
            format!("first port {first} is greater than last port {last}"),
        ));
    }
    Ok(PortRange { first, last })
}

fn parse_port(spec: &str, s: &str) -> Result<u16> {
    if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
        return Err(Error::invalid_range(spec, format!("not a port number: {s:?}")));
    }
    let val: u32 = s
        .parse()
        .map_err(|_| Error::invalid_range(spec, format!("port out of range: {s}")))?;
    u16::try_from(val).map_err(|_| Error::invalid_range(spec, format!("port out of range: {val}")))
}
