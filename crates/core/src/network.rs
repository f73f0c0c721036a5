//! Network cost environment input
//!
//! The `batchByCost` policy function gates emission on how expensive the
//! current uplink is. The cost is environment-provided via the
//! `network_cost` variable and may change at runtime (e.g. a gateway
//! failing over from ethernet to a satellite modem), so the current value
//! lives behind a shared `NetworkMonitor` handle.

use crate::error::Error;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, RwLock};
use tracing::warn;

/// Environment variable consulted for the initial network cost
pub const NETWORK_COST_ENV: &str = "network_cost";

/// Relative cost of the current uplink, cheapest first
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NetworkCost {
    Ethernet,
    Cellular,
    Satellite,
}

impl Default for NetworkCost {
    fn default() -> Self {
        Self::Ethernet
    }
}

impl NetworkCost {
    /// Lenient parse used for both the environment variable and policy
    /// parameters: case-insensitive, parenthetical suffixes stripped
    /// (`"ethernet(wired)"` parses as ETHERNET). Unknown input falls back
    /// to the cheapest cost with a warning.
    pub fn parse_lenient(s: &str) -> Self {
        let trimmed = match s.find('(') {
            Some(idx) => &s[..idx],
            None => s,
        };
        match trimmed.trim().parse() {
            Ok(cost) => cost,
            Err(_) => {
                warn!("Unrecognized network cost '{}', defaulting to ETHERNET", s);
                Self::Ethernet
            }
        }
    }

    /// Read the initial cost from the environment; absent means ETHERNET
    pub fn from_env() -> Self {
        match std::env::var(NETWORK_COST_ENV) {
            Ok(value) => Self::parse_lenient(&value),
            Err(_) => Self::Ethernet,
        }
    }
}

impl FromStr for NetworkCost {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "ETHERNET" => Ok(Self::Ethernet),
            "CELLULAR" => Ok(Self::Cellular),
            "SATELLITE" => Ok(Self::Satellite),
            other => Err(Error::Configuration(format!(
                "Unknown network cost '{}'",
                other
            ))),
        }
    }
}

impl fmt::Display for NetworkCost {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Ethernet => "ETHERNET",
            Self::Cellular => "CELLULAR",
            Self::Satellite => "SATELLITE",
        };
        write!(f, "{}", s)
    }
}

/// Shared handle on the current network cost
///
/// Cloning shares the underlying value; cost gating reads it per call.
#[derive(Debug, Clone)]
pub struct NetworkMonitor {
    current: Arc<RwLock<NetworkCost>>,
}

impl NetworkMonitor {
    pub fn new(initial: NetworkCost) -> Self {
        Self {
            current: Arc::new(RwLock::new(initial)),
        }
    }

    /// Initialize from the `network_cost` environment variable
    pub fn from_env() -> Self {
        Self::new(NetworkCost::from_env())
    }

    pub fn current(&self) -> NetworkCost {
        // Lock poisoning only happens if a writer panicked; the cost value
        // itself is always valid, so recover it.
        match self.current.read() {
            Ok(guard) => *guard,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    pub fn set(&self, cost: NetworkCost) {
        match self.current.write() {
            Ok(mut guard) => *guard = cost,
            Err(poisoned) => *poisoned.into_inner() = cost,
        }
    }
}

impl Default for NetworkMonitor {
    fn default() -> Self {
        Self::new(NetworkCost::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cost_ordering() {
        assert!(NetworkCost::Ethernet < NetworkCost::Cellular);
        assert!(NetworkCost::Cellular < NetworkCost::Satellite);
    }

    #[test]
    fn test_parse_lenient_case_insensitive() {
        assert_eq!(NetworkCost::parse_lenient("cellular"), NetworkCost::Cellular);
        assert_eq!(NetworkCost::parse_lenient("SATELLITE"), NetworkCost::Satellite);
        assert_eq!(NetworkCost::parse_lenient("EtherNet"), NetworkCost::Ethernet);
    }

    #[test]
    fn test_parse_lenient_strips_parenthetical() {
        assert_eq!(
            NetworkCost::parse_lenient("ethernet(wired)"),
            NetworkCost::Ethernet
        );
        assert_eq!(
            NetworkCost::parse_lenient("cellular (lte)"),
            NetworkCost::Cellular
        );
    }

    #[test]
    fn test_parse_lenient_unknown_defaults_cheapest() {
        assert_eq!(NetworkCost::parse_lenient("carrier-pigeon"), NetworkCost::Ethernet);
        assert_eq!(NetworkCost::parse_lenient(""), NetworkCost::Ethernet);
    }

    #[test]
    fn test_monitor_shared_across_clones() {
        let monitor = NetworkMonitor::new(NetworkCost::Satellite);
        let clone = monitor.clone();

        clone.set(NetworkCost::Cellular);
        assert_eq!(monitor.current(), NetworkCost::Cellular);
    }
}
