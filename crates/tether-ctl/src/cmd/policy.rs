//! Connectivity policy command.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Result, anyhow};
use tether_core::NatClass;
use tether_core::config::TetherConfig;
use tether_services::ConfigurationBuilder;

use super::services::{credential_cache, print_json, prober};

pub async fn cmd_policy(config: &TetherConfig, nat: &str, json: bool) -> Result<()> {
    let nat: NatClass = nat.parse().map_err(|e: String| anyhow!(e))?;
    let builder = ConfigurationBuilder::from_config(
        Arc::new(prober(config)),
        Arc::new(credential_cache(config)),
        config,
    );
    let policy = builder.build_async(nat).await;

    if json {
        return print_json(&policy);
    }

    println!("═══════════════════════════════════════");
    println!("  Connectivity Policy ({nat})");
    println!("═══════════════════════════════════════");
    println!("  Transport policy : {:?}", policy.transport_policy);
    println!("  Candidate pool   : {}", policy.candidate_pool_size);
    println!("  Bundle policy    : {:?}", policy.bundle_policy);
    println!("  Nomination       : {:?}", policy.nomination);
    println!(
        "  Gathering limit  : {}s",
        Duration::from_millis(policy.gathering_timeout_ms).as_secs()
    );
    if policy.relay_degraded {
        println!("  ⚠ relay required but unavailable; direct paths only");
    }
    println!("\n  Servers:");
    for s in &policy.servers {
        let kind = if s.is_relay() { "relay" } else { "stun " };
        println!("    {kind}  {}", s.urls.join(", "));
    }
    Ok(())
}
