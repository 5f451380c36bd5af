//! Connectivity policy — turns a NAT classification plus the known server
//! lists into the configuration handed to the transport layer.
//!
//! Symmetric and blocked NATs can't hole-punch, so they go straight to
//! relay-only with a short gathering window. Everything else gathers every
//! candidate type with a longer window.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::candidate::CandidateFilter;
use crate::server::ServerDescriptor;

/// Gathering window when relay is forced.
pub const RELAY_GATHERING_TIMEOUT: Duration = Duration::from_secs(5);

/// Gathering window for every other NAT class.
pub const DEFAULT_GATHERING_TIMEOUT: Duration = Duration::from_secs(10);

const FULL_CONE_POOL: u8 = 10;
const DEFAULT_POOL: u8 = 4;

/// NAT classification of the local network.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NatClass {
    /// Public address, no translation.
    Open,
    FullCone,
    RestrictedCone,
    PortRestricted,
    Symmetric,
    /// UDP is blocked outright.
    Blocked,
    #[default]
    Unknown,
}

impl NatClass {
    /// Direct paths are hopeless; only a relay will work.
    pub fn requires_relay(self) -> bool {
        matches!(self, NatClass::Symmetric | NatClass::Blocked)
    }
}

impl fmt::Display for NatClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            NatClass::Open => "open",
            NatClass::FullCone => "full-cone",
            NatClass::RestrictedCone => "restricted-cone",
            NatClass::PortRestricted => "port-restricted",
            NatClass::Symmetric => "symmetric",
            NatClass::Blocked => "blocked",
            NatClass::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

impl FromStr for NatClass {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('_', "-").as_str() {
            "open" | "none" => Ok(NatClass::Open),
            "full-cone" => Ok(NatClass::FullCone),
            "restricted-cone" | "restricted" => Ok(NatClass::RestrictedCone),
            "port-restricted" => Ok(NatClass::PortRestricted),
            "symmetric" => Ok(NatClass::Symmetric),
            "blocked" => Ok(NatClass::Blocked),
            "unknown" => Ok(NatClass::Unknown),
            other => Err(format!("unknown NAT class {other:?}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportPolicy {
    All,
    Relay,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BundlePolicy {
    MaxBundle,
}

/// Candidate-pair nomination mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Nomination {
    /// Nominate the first pair that works.
    Aggressive,
}

/// Connection policy consumed by the transport layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectivityConfig {
    pub servers: Vec<ServerDescriptor>,
    pub transport_policy: TransportPolicy,
    pub candidate_pool_size: u8,
    pub bundle_policy: BundlePolicy,
    pub nomination: Nomination,
    pub gathering_timeout_ms: u64,
    /// Relay was required but none is provisioned; running direct-only.
    #[serde(default)]
    pub relay_degraded: bool,
}

impl ConnectivityConfig {
    pub fn gathering_timeout(&self) -> Duration {
        Duration::from_millis(self.gathering_timeout_ms)
    }

    /// Candidate filter matching the transport policy.
    pub fn candidate_filter(&self) -> CandidateFilter {
        match self.transport_policy {
            TransportPolicy::Relay => CandidateFilter::relay_only(),
            TransportPolicy::All => CandidateFilter::default(),
        }
    }
}

impl Default for ConnectivityConfig {
    fn default() -> Self {
        build(NatClass::Unknown, &[], &[])
    }
}

/// Build the connection policy. Pure.
///
/// When relay is required but `relay_servers` is empty the policy degrades
/// to `All` and sets `relay_degraded`; callers keep going on direct paths.
pub fn build(
    nat: NatClass,
    stun_servers: &[ServerDescriptor],
    relay_servers: &[ServerDescriptor],
) -> ConnectivityConfig {
    let forced = nat.requires_relay();
    let relay_degraded = forced && relay_servers.is_empty();

    let (transport_policy, candidate_pool_size, servers) = if forced && !relay_degraded {
        (TransportPolicy::Relay, 0, relay_servers.to_vec())
    } else {
        let pool = match nat {
            NatClass::FullCone | NatClass::Open => FULL_CONE_POOL,
            _ if relay_degraded => 0,
            _ => DEFAULT_POOL,
        };
        let servers = stun_servers.iter().chain(relay_servers).cloned().collect();
        (TransportPolicy::All, pool, servers)
    };

    let gathering_timeout = if forced {
        RELAY_GATHERING_TIMEOUT
    } else {
        DEFAULT_GATHERING_TIMEOUT
    };

    ConnectivityConfig {
        servers,
        transport_policy,
        candidate_pool_size,
        bundle_policy: BundlePolicy::MaxBundle,
        nomination: Nomination::Aggressive,
        gathering_timeout_ms: gathering_timeout.as_millis() as u64,
        relay_degraded,
    }
}
