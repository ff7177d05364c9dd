//! Address ranges that are never admitted into the connection pool.
use std::net::IpAddr;

use serde::{Deserialize, Serialize};

/// An inclusive range of addresses, `start..=end`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct BlockRange {
    pub start: IpAddr,
    pub end: IpAddr,
    pub reason: Option<String>,
}

impl BlockRange {
    pub fn new(start: IpAddr, end: IpAddr, reason: impl Into<String>) -> Self {
        Self { start, end, reason: Some(reason.into()) }
    }

    pub fn contains(&self, ip: IpAddr) -> bool {
        // ranges never span families
        match (self.start, self.end, ip) {
            (IpAddr::V4(s), IpAddr::V4(e), IpAddr::V4(ip)) => {
                (u32::from(s)..=u32::from(e)).contains(&u32::from(ip))
            }
            (IpAddr::V6(s), IpAddr::V6(e), IpAddr::V6(ip)) => {
                (u128::from(s)..=u128::from(e)).contains(&u128::from(ip))
            }
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Blocklist {
    ranges: Vec<BlockRange>,
}

impl Blocklist {
    pub fn new(ranges: Vec<BlockRange>) -> Self {
        Self { ranges }
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    /// Return the reason `ip` is blocked, if it is.
    pub fn check(&self, ip: IpAddr) -> Option<String> {
        // an address mapped into v6 is checked against the v4 ranges
        let ip = match ip {
            IpAddr::V6(v6) => v6.to_ipv4_mapped().map(IpAddr::V4).unwrap_or(ip),
            v4 => v4,
        };
        self.ranges.iter().find(|r| r.contains(ip)).map(|r| {
            r.reason.clone().unwrap_or_else(|| "blocklisted".to_owned())
        })
    }
}
