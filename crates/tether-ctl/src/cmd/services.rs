//! Shared constructors wiring tether-services from the loaded config.

use std::sync::Arc;

use tether_core::ServerDescriptor;
use tether_core::config::TetherConfig;
use tether_services::credentials::{HttpCredentialSource, RelayCredentialCache};
use tether_services::prober::{ProberConfig, ReachabilityProber};
use tether_services::stun_probe::StunProbeTransport;

pub fn prober(config: &TetherConfig) -> ReachabilityProber {
    let candidates = config
        .network
        .stun_servers
        .iter()
        .map(|url| ServerDescriptor::new(url.as_str()))
        .collect();
    ReachabilityProber::new(
        candidates,
        Arc::new(StunProbeTransport::default()),
        ProberConfig::from(&config.network),
    )
}

pub fn credential_cache(config: &TetherConfig) -> RelayCredentialCache {
    match HttpCredentialSource::from_config(&config.relay) {
        Some(source) => RelayCredentialCache::new(Arc::new(source)),
        None => RelayCredentialCache::unprovisioned(),
    }
}

/// Print `value` as pretty JSON.
pub fn print_json<T: serde::Serialize + ?Sized>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
