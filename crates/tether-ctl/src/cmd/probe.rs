//! Discovery server reachability commands.

use anyhow::{Result, bail};
use tether_core::ProbeResult;
use tether_core::config::TetherConfig;

use super::services::{print_json, prober};

fn print_result(r: &ProbeResult) {
    if r.reachable {
        println!("  ✓ {:<40} {:>5} ms", r.url, r.latency_ms);
    } else {
        println!(
            "  ✗ {:<40} {}",
            r.url,
            r.error.as_deref().unwrap_or("unreachable")
        );
    }
}

pub async fn cmd_probe_all(config: &TetherConfig, json: bool) -> Result<()> {
    if config.network.stun_servers.is_empty() {
        bail!("no discovery servers configured (network.stun_servers)");
    }
    let prober = prober(config);
    let servers = prober.get_working_servers(true).await;
    let mut results = prober.last_results();
    results.sort_by_key(|r| (!r.reachable, r.latency_ms));

    if json {
        return print_json(&results);
    }

    println!("═══════════════════════════════════════");
    println!("  Discovery Servers ({})", results.len());
    println!("═══════════════════════════════════════");
    for r in &results {
        print_result(r);
    }

    let reachable = results.iter().filter(|r| r.reachable).count();
    if reachable == 0 {
        println!("\n  Nothing answered; falling back to all {} servers.", servers.len());
    } else {
        println!("\n  {reachable} of {} reachable.", results.len());
    }
    Ok(())
}

pub async fn cmd_probe_one(config: &TetherConfig, url: &str, json: bool) -> Result<()> {
    let result = prober(config).probe(url).await;
    if json {
        return print_json(&result);
    }
    print_result(&result);
    Ok(())
}
