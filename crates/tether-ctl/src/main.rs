//! tether-ctl — diagnostics for the Tether connectivity layer.
//!
//! Runs the same probers, credential cache and policy builder a node uses,
//! against the local configuration, and prints what they decide.

mod cmd;

use anyhow::{Context, Result};
use tether_core::config::TetherConfig;

fn print_usage() {
    println!("Usage: tether-ctl [--json] <command>");
    println!();
    println!("Commands:");
    println!("  probe                 Probe configured discovery servers, fastest first");
    println!("  probe <url>           Probe a single discovery server");
    println!("  credentials [ttl]     Fetch relay credentials from the issuance endpoint");
    println!("  policy [nat-class]    Build the connectivity policy for a NAT class");
    println!("                        (open, full-cone, restricted-cone, port-restricted,");
    println!("                         symmetric, blocked, unknown)");
    println!("  config                Show the effective configuration");
    println!("  config init           Write the default config file if missing");
    println!();
    println!("Options:");
    println!("  --json   Print machine-readable output");
    println!();
    println!("Logging follows RUST_LOG, e.g. RUST_LOG=tether_services=debug.");
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();

    let mut json = false;
    let mut remaining: Vec<&str> = Vec::new();
    for arg in &args {
        if arg == "--json" {
            json = true;
        } else {
            remaining.push(arg);
        }
    }

    if matches!(remaining.as_slice(), ["help"] | ["--help"] | ["-h"]) {
        print_usage();
        return Ok(());
    }
    if remaining.as_slice() == ["config", "init"] {
        return cmd::config::cmd_config_init();
    }

    let config = TetherConfig::load().context("failed to load configuration")?;

    match remaining.as_slice() {
        ["probe"] => cmd::probe::cmd_probe_all(&config, json).await,
        ["probe", url] => cmd::probe::cmd_probe_one(&config, url, json).await,
        ["credentials"] => cmd::credentials::cmd_credentials(&config, None, json).await,
        ["credentials", ttl] => {
            let ttl = ttl.parse().context("ttl must be a number of seconds")?;
            cmd::credentials::cmd_credentials(&config, Some(ttl), json).await
        }
        ["policy"] => cmd::policy::cmd_policy(&config, "unknown", json).await,
        ["policy", nat] => cmd::policy::cmd_policy(&config, nat, json).await,
        ["config"] | [] => cmd::config::cmd_config_show(&config),
        other => {
            eprintln!("Unknown command: {}", other.join(" "));
            eprintln!();
            print_usage();
            std::process::exit(1);
        }
    }
}
