//! Relay credential commands.

use std::time::{Duration, Instant};

use anyhow::{Result, bail};
use tether_core::config::TetherConfig;

use super::services::{credential_cache, print_json};

pub async fn cmd_credentials(config: &TetherConfig, ttl_secs: Option<u64>, json: bool) -> Result<()> {
    if config.relay.credential_endpoint.is_empty() {
        bail!("no relay provisioned (relay.credential_endpoint is empty)");
    }
    let ttl = Duration::from_secs(ttl_secs.unwrap_or(config.relay.lease_secs));
    let cache = credential_cache(config);
    let servers = cache.fetch_credentials(ttl).await;

    let Some(set) = cache.current() else {
        bail!(
            "credential endpoint {} did not issue a lease (RUST_LOG=tether_services=debug for details)",
            config.relay.credential_endpoint
        );
    };

    if json {
        return print_json(&servers);
    }

    let remaining = set.expires_at.saturating_duration_since(Instant::now());
    println!("═══════════════════════════════════════");
    println!("  Relay Credentials");
    println!("═══════════════════════════════════════");
    println!("  Provider  : {}", set.provider);
    println!("  Lease     : {}s", set.lease().as_secs());
    println!("  Expires in: {}s", remaining.as_secs());
    for s in &servers {
        println!("  ┌─ {}", s.urls.join(", "));
        println!("  └─ username : {}", s.username.as_deref().unwrap_or("-"));
    }
    Ok(())
}
