//! Reachability prober — tests discovery servers and ranks the working ones
//! by latency.
//!
//! Each probe opens a disposable session against one server URL and waits
//! for a server-reflexive candidate. The session is an owned value, so it is
//! released when the probe future finishes, times out, or is dropped.
//!
//! Probe cycles are single-flight: concurrent callers wait on one cycle and
//! share its result. The result is cached until `invalidate()`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use futures::future::join_all;
use tokio::time::Instant;

use tether_core::config::NetworkConfig;
use tether_core::{CandidateRecord, CandidateType, ProbeResult, ServerDescriptor};

/// Default per-server probe bound.
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(3);

/// Something observed by a probe session.
#[derive(Debug, Clone)]
pub enum ProbeEvent {
    Candidate(CandidateRecord),
    /// Nothing more will be gathered.
    GatheringComplete,
}

/// A transient connectivity-test session. Released on drop.
#[async_trait]
pub trait ProbeSession: Send {
    async fn next_event(&mut self) -> Result<ProbeEvent>;
}

#[async_trait]
pub trait ProbeTransport: Send + Sync {
    async fn open(&self, url: &str) -> Result<Box<dyn ProbeSession>>;
}

#[derive(Debug, Clone)]
pub struct ProberConfig {
    pub timeout: Duration,
}

impl Default for ProberConfig {
    fn default() -> Self {
        Self {
            timeout: PROBE_TIMEOUT,
        }
    }
}

impl From<&NetworkConfig> for ProberConfig {
    fn from(cfg: &NetworkConfig) -> Self {
        Self {
            timeout: Duration::from_millis(cfg.probe_timeout_ms),
        }
    }
}

#[derive(Debug, Clone)]
struct ProbeCycle {
    servers: Vec<ServerDescriptor>,
    results: Vec<ProbeResult>,
}

pub struct ReachabilityProber {
    candidates: Vec<ServerDescriptor>,
    transport: Arc<dyn ProbeTransport>,
    config: ProberConfig,
    flight: tokio::sync::Mutex<()>,
    cycle: Mutex<Option<ProbeCycle>>,
    generation: AtomicU64,
}

impl ReachabilityProber {
    pub fn new(
        candidates: Vec<ServerDescriptor>,
        transport: Arc<dyn ProbeTransport>,
        config: ProberConfig,
    ) -> Self {
        Self {
            candidates,
            transport,
            config,
            flight: tokio::sync::Mutex::new(()),
            cycle: Mutex::new(None),
            generation: AtomicU64::new(0),
        }
    }

    /// Probe a single URL.
    pub async fn probe(&self, url: &str) -> ProbeResult {
        let started = Instant::now();
        match tokio::time::timeout(self.config.timeout, self.await_reflexive(url)).await {
            Ok(Ok(())) => ProbeResult::reachable(url, started.elapsed()),
            Ok(Err(e)) => ProbeResult::unreachable(url, started.elapsed(), e.to_string()),
            Err(_) => ProbeResult::unreachable(
                url,
                started.elapsed(),
                format!("no response within {:?}", self.config.timeout),
            ),
        }
    }

    async fn await_reflexive(&self, url: &str) -> Result<()> {
        let mut session = self.transport.open(url).await?;
        loop {
            match session.next_event().await? {
                ProbeEvent::Candidate(c) if c.candidate_type == CandidateType::ServerReflexive => {
                    return Ok(());
                }
                ProbeEvent::Candidate(_) => continue,
                ProbeEvent::GatheringComplete => {
                    bail!("gathering completed without a server-reflexive candidate")
                }
            }
        }
    }

    /// Reachable servers, fastest first. Falls back to the full candidate
    /// list when nothing answers, so the result is empty only when no
    /// candidates are configured.
    pub async fn get_working_servers(&self, force_refresh: bool) -> Vec<ServerDescriptor> {
        let observed = self.generation.load(Ordering::Acquire);
        if !force_refresh {
            if let Some(servers) = self.cached_servers() {
                return servers;
            }
        }

        let _flight = self.flight.lock().await;

        // A cycle finished while we waited for the flight lock.
        if self.generation.load(Ordering::Acquire) != observed || !force_refresh {
            if let Some(servers) = self.cached_servers() {
                return servers;
            }
        }

        let cycle = self.run_cycle().await;
        let servers = cycle.servers.clone();
        *self.cycle.lock().unwrap_or_else(PoisonError::into_inner) = Some(cycle);
        self.generation.fetch_add(1, Ordering::AcqRel);
        servers
    }

    /// Drop the cached cycle, e.g. after a network change.
    pub fn invalidate(&self) {
        *self.cycle.lock().unwrap_or_else(PoisonError::into_inner) = None;
        tracing::debug!("probe cache invalidated");
    }

    /// Results of the most recent cycle, empty before the first.
    pub fn last_results(&self) -> Vec<ProbeResult> {
        self.cycle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|c| c.results.clone())
            .unwrap_or_default()
    }

    pub fn candidates(&self) -> &[ServerDescriptor] {
        &self.candidates
    }

    fn cached_servers(&self) -> Option<Vec<ServerDescriptor>> {
        self.cycle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|c| c.servers.clone())
    }

    async fn run_cycle(&self) -> ProbeCycle {
        let urls: Vec<&str> = self
            .candidates
            .iter()
            .flat_map(|d| d.urls.iter().map(String::as_str))
            .collect();
        let results = join_all(urls.iter().map(|url| self.probe(url))).await;

        let mut ranked: Vec<(u64, &ServerDescriptor)> = self
            .candidates
            .iter()
            .filter_map(|desc| {
                results
                    .iter()
                    .filter(|r| r.reachable && desc.urls.contains(&r.url))
                    .map(|r| r.latency_ms)
                    .min()
                    .map(|latency| (latency, desc))
            })
            .collect();
        ranked.sort_by_key(|(latency, _)| *latency);

        let reachable = ranked.len();
        let servers = if ranked.is_empty() {
            tracing::warn!(
                candidates = self.candidates.len(),
                "no discovery server reachable, using full candidate list"
            );
            self.candidates.clone()
        } else {
            ranked.into_iter().map(|(_, d)| d.clone()).collect()
        };
        tracing::info!(
            probed = results.len(),
            reachable,
            "probe cycle complete"
        );

        ProbeCycle { servers, results }
    }
}
