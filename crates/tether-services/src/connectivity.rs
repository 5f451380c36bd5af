//! Connectivity configuration builder — joins one reachability cycle and one
//! credential fetch, then hands both to the pure policy builder.

use std::sync::Arc;
use std::time::Duration;

use tether_core::config::TetherConfig;
use tether_core::{policy, ConnectivityConfig, NatClass};

use crate::credentials::RelayCredentialCache;
use crate::error::Error;
use crate::prober::ReachabilityProber;

pub struct ConfigurationBuilder {
    prober: Arc<ReachabilityProber>,
    credentials: Arc<RelayCredentialCache>,
    lease: Duration,
}

impl ConfigurationBuilder {
    pub fn new(
        prober: Arc<ReachabilityProber>,
        credentials: Arc<RelayCredentialCache>,
        lease: Duration,
    ) -> Self {
        Self {
            prober,
            credentials,
            lease,
        }
    }

    pub fn from_config(
        prober: Arc<ReachabilityProber>,
        credentials: Arc<RelayCredentialCache>,
        config: &TetherConfig,
    ) -> Self {
        Self::new(
            prober,
            credentials,
            Duration::from_secs(config.relay.lease_secs),
        )
    }

    /// Build a policy from current discovery and relay state. Never fails:
    /// a missing relay degrades the policy instead.
    pub async fn build_async(&self, nat: NatClass) -> ConnectivityConfig {
        let (stun, relay) = tokio::join!(
            self.prober.get_working_servers(false),
            self.credentials.fetch_credentials(self.lease),
        );
        let config = policy::build(nat, &stun, &relay);
        if config.relay_degraded {
            tracing::warn!(nat = ?nat, error = %Error::RelayUnavailable, "continuing without relay");
        }
        tracing::debug!(
            nat = ?nat,
            policy = ?config.transport_policy,
            servers = config.servers.len(),
            pool = config.candidate_pool_size,
            "connectivity config built"
        );
        config
    }

    pub fn prober(&self) -> &Arc<ReachabilityProber> {
        &self.prober
    }

    pub fn credentials(&self) -> &Arc<RelayCredentialCache> {
        &self.credentials
    }
}
