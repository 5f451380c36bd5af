//! Relay-discovery servers — descriptors, probe results, and cached relay
//! credential leases.

use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;
use std::time::{Duration, Instant};

use serde::{Deserialize, Deserializer, Serialize};

/// Default port for `stun:` and `turn:` URLs.
pub const DEFAULT_PORT: u16 = 3478;

/// Default port for `stuns:` and `turns:` URLs.
pub const DEFAULT_TLS_PORT: u16 = 5349;

/// Fraction of a credential lease after which the lease is refreshed.
pub const CREDENTIAL_FRESHNESS_RATIO: f64 = 0.8;

// ── ServerDescriptor ─────────────────────────────────────────────────────────

/// One discovery or relay server, as handed to the transport layer.
///
/// Immutable once constructed. Relay servers carry a username/credential
/// pair; discovery servers usually don't.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerDescriptor {
    #[serde(deserialize_with = "one_or_many")]
    pub urls: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

impl ServerDescriptor {
    /// A discovery server without credentials.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            urls: vec![url.into()],
            username: None,
            credential: None,
        }
    }

    /// A relay server with a username/credential pair.
    pub fn with_credentials(
        urls: Vec<String>,
        username: impl Into<String>,
        credential: impl Into<String>,
    ) -> Self {
        Self {
            urls,
            username: Some(username.into()),
            credential: Some(credential.into()),
        }
    }

    /// True if any URL is a `turn:`/`turns:` relay.
    pub fn is_relay(&self) -> bool {
        self.urls.iter().any(|u| {
            u.parse::<ServerUrl>()
                .map(|p| p.scheme.is_relay())
                .unwrap_or(false)
        })
    }
}

/// Credential endpoints return `urls` either as a single string or a list.
fn one_or_many<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(String),
        Many(Vec<String>),
    }

    Ok(match OneOrMany::deserialize(deserializer)? {
        OneOrMany::One(url) => vec![url],
        OneOrMany::Many(urls) => urls,
    })
}

// ── ProbeResult ──────────────────────────────────────────────────────────────

/// Outcome of probing one server URL. Produced fresh per probe cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProbeResult {
    pub url: String,
    pub reachable: bool,
    pub latency_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ProbeResult {
    pub fn reachable(url: impl Into<String>, latency: Duration) -> Self {
        Self {
            url: url.into(),
            reachable: true,
            latency_ms: latency.as_millis() as u64,
            error: None,
        }
    }

    pub fn unreachable(url: impl Into<String>, elapsed: Duration, error: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            reachable: false,
            latency_ms: elapsed.as_millis() as u64,
            error: Some(error.into()),
        }
    }
}

// ── CachedCredentialSet ──────────────────────────────────────────────────────

/// A relay credential lease held by the credential cache.
///
/// Replaced wholesale on refresh, never mutated. Stale once 80% of the lease
/// has elapsed; an expired set may still be served when a refresh fails.
#[derive(Debug, Clone)]
pub struct CachedCredentialSet {
    pub servers: Vec<ServerDescriptor>,
    pub fetched_at: Instant,
    pub expires_at: Instant,
    pub provider: String,
}

impl CachedCredentialSet {
    pub fn new(
        servers: Vec<ServerDescriptor>,
        fetched_at: Instant,
        lease: Duration,
        provider: impl Into<String>,
    ) -> Self {
        Self {
            servers,
            fetched_at,
            expires_at: fetched_at + lease,
            provider: provider.into(),
        }
    }

    /// Full lease length, `expires_at - fetched_at`.
    pub fn lease(&self) -> Duration {
        self.expires_at.saturating_duration_since(self.fetched_at)
    }

    /// Reusable while `now - fetched_at < 0.8 * lease`.
    pub fn is_stale(&self, now: Instant) -> bool {
        let elapsed = now.saturating_duration_since(self.fetched_at);
        elapsed.as_secs_f64() >= self.lease().as_secs_f64() * CREDENTIAL_FRESHNESS_RATIO
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

// ── ServerUrl ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scheme {
    Stun,
    Stuns,
    Turn,
    Turns,
}

impl Scheme {
    pub fn is_relay(self) -> bool {
        matches!(self, Scheme::Turn | Scheme::Turns)
    }

    pub fn is_tls(self) -> bool {
        matches!(self, Scheme::Stuns | Scheme::Turns)
    }

    fn as_str(self) -> &'static str {
        match self {
            Scheme::Stun => "stun",
            Scheme::Stuns => "stuns",
            Scheme::Turn => "turn",
            Scheme::Turns => "turns",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerTransport {
    Udp,
    Tcp,
}

/// A parsed `stun:` / `stuns:` / `turn:` / `turns:` URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerUrl {
    pub scheme: Scheme,
    pub host: String,
    pub port: u16,
    pub transport: ServerTransport,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ServerUrlError {
    #[error("missing scheme in {0:?}")]
    MissingScheme(String),
    #[error("unsupported scheme {0:?}")]
    UnsupportedScheme(String),
    #[error("empty host")]
    EmptyHost,
    #[error("malformed host {0:?}")]
    MalformedHost(String),
    #[error("invalid port {0:?}")]
    InvalidPort(String),
    #[error("unsupported transport {0:?}")]
    UnsupportedTransport(String),
}

impl ServerUrl {
    /// `host:port`, bracketing IPv6 literals, suitable for DNS lookup.
    pub fn authority(&self) -> String {
        match self.host.parse::<IpAddr>() {
            Ok(IpAddr::V6(_)) => format!("[{}]:{}", self.host, self.port),
            _ => format!("{}:{}", self.host, self.port),
        }
    }
}

impl FromStr for ServerUrl {
    type Err = ServerUrlError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (scheme, rest) = s
            .split_once(':')
            .ok_or_else(|| ServerUrlError::MissingScheme(s.to_string()))?;
        let scheme = match scheme.to_ascii_lowercase().as_str() {
            "stun" => Scheme::Stun,
            "stuns" => Scheme::Stuns,
            "turn" => Scheme::Turn,
            "turns" => Scheme::Turns,
            other => return Err(ServerUrlError::UnsupportedScheme(other.to_string())),
        };

        let (authority, query) = match rest.split_once('?') {
            Some((a, q)) => (a, Some(q)),
            None => (rest, None),
        };
        let authority = authority.trim_start_matches("//");

        let (host, port) = if let Some(bracketed) = authority.strip_prefix('[') {
            let (host, tail) = bracketed
                .split_once(']')
                .ok_or_else(|| ServerUrlError::MalformedHost(authority.to_string()))?;
            match tail.strip_prefix(':') {
                Some(p) => (host, Some(p)),
                None if tail.is_empty() => (host, None),
                None => return Err(ServerUrlError::MalformedHost(authority.to_string())),
            }
        } else {
            match authority.rsplit_once(':') {
                Some((h, p)) => (h, Some(p)),
                None => (authority, None),
            }
        };

        if host.is_empty() {
            return Err(ServerUrlError::EmptyHost);
        }

        let port = match port {
            Some(p) => p
                .parse::<u16>()
                .ok()
                .filter(|p| *p != 0)
                .ok_or_else(|| ServerUrlError::InvalidPort(p.to_string()))?,
            None if scheme.is_tls() => DEFAULT_TLS_PORT,
            None => DEFAULT_PORT,
        };

        let mut transport = if scheme.is_tls() {
            ServerTransport::Tcp
        } else {
            ServerTransport::Udp
        };
        for pair in query.into_iter().flat_map(|q| q.split('&')) {
            if let Some(value) = pair.strip_prefix("transport=") {
                transport = match value.to_ascii_lowercase().as_str() {
                    "udp" => ServerTransport::Udp,
                    "tcp" => ServerTransport::Tcp,
                    other => return Err(ServerUrlError::UnsupportedTransport(other.to_string())),
                };
            }
        }

        Ok(Self {
            scheme,
            host: host.to_string(),
            port,
            transport,
        })
    }
}

impl fmt::Display for ServerUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.scheme.as_str(), self.authority())?;
        if self.scheme.is_relay() && self.transport == ServerTransport::Tcp && !self.scheme.is_tls() {
            write!(f, "?transport=tcp")?;
        }
        Ok(())
    }
}
