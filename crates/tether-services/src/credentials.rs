//! Relay credential cache.
//!
//! Relay credentials are short-lived leases from an issuance endpoint. The
//! cache reuses a lease until 80% of it has elapsed, collapses concurrent
//! refreshes into one request, and keeps serving the last known-good set
//! (even if expired) when a refresh fails.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;

use tether_core::config::RelayConfig;
use tether_core::{CachedCredentialSet, ServerDescriptor};

use crate::error::Error;

// ── Source ───────────────────────────────────────────────────────────────────

/// Body returned by the credential-issuance endpoint.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CredentialResponse {
    pub servers: Vec<ServerDescriptor>,
    /// Milliseconds since the Unix epoch.
    pub expires_at: u64,
    /// Lease length in seconds. Zero means "derive from `expires_at`".
    pub ttl: u64,
    pub provider: String,
}

impl CredentialResponse {
    pub fn lease(&self, now: SystemTime) -> Duration {
        if self.ttl > 0 {
            return Duration::from_secs(self.ttl);
        }
        let now_ms = now
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        Duration::from_millis(self.expires_at.saturating_sub(now_ms))
    }
}

#[async_trait]
pub trait CredentialSource: Send + Sync {
    /// Request one lease of roughly `ttl`.
    async fn fetch(&self, ttl: Duration) -> Result<CredentialResponse>;
}

/// `GET <endpoint>?ttl=<secs>` with an optional bearer token.
pub struct HttpCredentialSource {
    client: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
}

impl HttpCredentialSource {
    pub fn new(endpoint: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: endpoint.into(),
            api_key: api_key.filter(|k| !k.is_empty()),
        }
    }

    /// `None` when no endpoint is configured.
    pub fn from_config(cfg: &RelayConfig) -> Option<Self> {
        if cfg.credential_endpoint.is_empty() {
            return None;
        }
        Some(Self::new(
            cfg.credential_endpoint.clone(),
            Some(cfg.api_key.clone()),
        ))
    }

    fn request_url(&self, ttl: Duration) -> String {
        let sep = if self.endpoint.contains('?') { '&' } else { '?' };
        format!("{}{}ttl={}", self.endpoint, sep, ttl.as_secs())
    }
}

#[async_trait]
impl CredentialSource for HttpCredentialSource {
    async fn fetch(&self, ttl: Duration) -> Result<CredentialResponse> {
        let url = self.request_url(ttl);
        let mut request = self.client.get(&url);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }
        request
            .send()
            .await
            .with_context(|| format!("failed to reach credential endpoint {}", self.endpoint))?
            .error_for_status()
            .context("credential endpoint rejected the request")?
            .json::<CredentialResponse>()
            .await
            .context("failed to parse credential response")
    }
}

// ── Cache ────────────────────────────────────────────────────────────────────

pub struct RelayCredentialCache {
    source: Option<Arc<dyn CredentialSource>>,
    flight: tokio::sync::Mutex<()>,
    current: Mutex<Option<CachedCredentialSet>>,
    generation: AtomicU64,
    bypass: AtomicBool,
}

impl RelayCredentialCache {
    pub fn new(source: Arc<dyn CredentialSource>) -> Self {
        Self::with_source(Some(source))
    }

    /// A cache with no relay provisioned. Always returns an empty set.
    pub fn unprovisioned() -> Self {
        Self::with_source(None)
    }

    fn with_source(source: Option<Arc<dyn CredentialSource>>) -> Self {
        Self {
            source,
            flight: tokio::sync::Mutex::new(()),
            current: Mutex::new(None),
            generation: AtomicU64::new(0),
            bypass: AtomicBool::new(false),
        }
    }

    /// Relay servers with credentials. Empty only if no lease was ever
    /// obtained.
    pub async fn fetch_credentials(&self, ttl: Duration) -> Vec<ServerDescriptor> {
        let observed = self.generation.load(Ordering::Acquire);
        if let Some(servers) = self.fresh_servers() {
            return servers;
        }

        let _flight = self.flight.lock().await;

        // Another caller refreshed (or tried to) while we waited.
        if self.generation.load(Ordering::Acquire) != observed {
            return self.last_known_servers();
        }
        if let Some(servers) = self.fresh_servers() {
            return servers;
        }

        let Some(source) = &self.source else {
            return Vec::new();
        };

        match source.fetch(ttl).await {
            Ok(response) => {
                let lease = response.lease(SystemTime::now());
                let set = CachedCredentialSet::new(
                    response.servers,
                    now(),
                    lease,
                    response.provider,
                );
                tracing::info!(
                    provider = %set.provider,
                    servers = set.servers.len(),
                    lease_secs = lease.as_secs(),
                    "relay credentials refreshed"
                );
                *self.lock_current() = Some(set);
                self.bypass.store(false, Ordering::Release);
            }
            Err(e) => {
                let err = Error::Credentials(e);
                tracing::warn!(error = %err, class = ?err.class(), "serving last known-good relay credentials");
            }
        }
        self.generation.fetch_add(1, Ordering::AcqRel);
        self.last_known_servers()
    }

    /// Force the next fetch to go to the endpoint. The current set is kept
    /// as a fallback.
    pub fn invalidate(&self) {
        self.bypass.store(true, Ordering::Release);
    }

    pub fn current(&self) -> Option<CachedCredentialSet> {
        self.lock_current().clone()
    }

    fn fresh_servers(&self) -> Option<Vec<ServerDescriptor>> {
        if self.bypass.load(Ordering::Acquire) {
            return None;
        }
        self.lock_current()
            .as_ref()
            .filter(|set| !set.is_stale(now()))
            .map(|set| set.servers.clone())
    }

    fn last_known_servers(&self) -> Vec<ServerDescriptor> {
        self.lock_current()
            .as_ref()
            .map(|set| set.servers.clone())
            .unwrap_or_default()
    }

    fn lock_current(&self) -> std::sync::MutexGuard<'_, Option<CachedCredentialSet>> {
        self.current.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Runtime clock, so paused-time tests drive lease expiry.
fn now() -> std::time::Instant {
    tokio::time::Instant::now().into_std()
}
