//! Candidate processor — parse, filter, and order raw connectivity
//! candidates.
//!
//! Raw candidates use the ICE attribute grammar:
//!
//!   candidate:<foundation> <component> <udp|tcp> <priority> <address> <port> typ <type> [...]
//!
//! Parsing is total. Anything without the `candidate:` prefix and at least a
//! foundation and component is rejected; anything past that is accepted with
//! deterministic defaults for the fields that don't parse.

use std::cmp::{Ordering, Reverse};
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::time::Instant;

use serde::{Deserialize, Serialize};

// ── Candidate types ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CandidateType {
    /// Local interface address.
    #[default]
    Host,
    /// Public address observed by a discovery server.
    #[serde(rename = "srflx")]
    ServerReflexive,
    /// Address observed during connectivity checks.
    #[serde(rename = "prflx")]
    PeerReflexive,
    /// Address allocated on a relay server.
    Relay,
}

impl CandidateType {
    /// Ordering rank: host < srflx < prflx < relay.
    pub fn rank(self) -> u8 {
        match self {
            CandidateType::Host => 0,
            CandidateType::ServerReflexive => 1,
            CandidateType::PeerReflexive => 2,
            CandidateType::Relay => 3,
        }
    }

    fn from_token(token: &str) -> Option<Self> {
        match token.to_ascii_lowercase().as_str() {
            "host" => Some(CandidateType::Host),
            "srflx" => Some(CandidateType::ServerReflexive),
            "prflx" => Some(CandidateType::PeerReflexive),
            "relay" => Some(CandidateType::Relay),
            _ => None,
        }
    }
}

impl fmt::Display for CandidateType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CandidateType::Host => write!(f, "host"),
            CandidateType::ServerReflexive => write!(f, "srflx"),
            CandidateType::PeerReflexive => write!(f, "prflx"),
            CandidateType::Relay => write!(f, "relay"),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CandidateProtocol {
    #[default]
    Udp,
    Tcp,
}

impl CandidateProtocol {
    fn from_token(token: &str) -> Option<Self> {
        match token.to_ascii_lowercase().as_str() {
            "udp" => Some(CandidateProtocol::Udp),
            "tcp" => Some(CandidateProtocol::Tcp),
            _ => None,
        }
    }
}

impl fmt::Display for CandidateProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CandidateProtocol::Udp => write!(f, "udp"),
            CandidateProtocol::Tcp => write!(f, "tcp"),
        }
    }
}

// ── CandidateRecord ──────────────────────────────────────────────────────────

/// A parsed connectivity candidate.
///
/// `address` is empty and `port` is `None` when the raw line failed strict
/// parsing. Type, protocol and priority always carry a value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CandidateRecord {
    pub candidate_type: CandidateType,
    pub protocol: CandidateProtocol,
    pub address: String,
    pub port: Option<u16>,
    pub priority: u32,
    pub timestamp: Instant,
}

const PREFIX: &str = "candidate:";

impl CandidateRecord {
    /// Build a record directly (used for locally observed candidates).
    pub fn new(candidate_type: CandidateType, protocol: CandidateProtocol, addr: SocketAddr, priority: u32) -> Self {
        Self {
            candidate_type,
            protocol,
            address: addr.ip().to_string(),
            port: Some(addr.port()),
            priority,
            timestamp: Instant::now(),
        }
    }

    /// Parse a raw candidate line. Never panics; returns `None` for anything
    /// outside the grammar.
    pub fn parse(raw: &str) -> Option<Self> {
        let line = raw.trim();
        let line = line.strip_prefix("a=").unwrap_or(line);
        let head = line.get(..PREFIX.len())?;
        if !head.eq_ignore_ascii_case(PREFIX) {
            return None;
        }
        let tokens: Vec<&str> = line.get(PREFIX.len()..)?.split_whitespace().collect();
        if tokens.len() < 2 {
            return None;
        }

        let protocol = tokens.get(2).and_then(|t| CandidateProtocol::from_token(t));
        let priority = tokens.get(3).and_then(|t| t.parse::<u32>().ok());
        let candidate_type = tokens
            .iter()
            .position(|t| t.eq_ignore_ascii_case("typ"))
            .and_then(|i| tokens.get(i + 1))
            .and_then(|t| CandidateType::from_token(t));

        let strict = tokens.len() >= 8
            && protocol.is_some()
            && priority.is_some()
            && candidate_type.is_some()
            && tokens[6].eq_ignore_ascii_case("typ");
        let (address, port) = match (strict, tokens.get(4), tokens.get(5)) {
            (true, Some(addr), Some(port)) => match port.parse::<u16>() {
                Ok(port) => (addr.to_string(), Some(port)),
                Err(_) => (String::new(), None),
            },
            _ => (String::new(), None),
        };

        Some(Self {
            candidate_type: candidate_type.unwrap_or_default(),
            protocol: protocol.unwrap_or_default(),
            address,
            port,
            priority: priority.unwrap_or(0),
            timestamp: Instant::now(),
        })
    }

    /// The address as an IP literal, if it is one (mDNS names are not).
    pub fn ip(&self) -> Option<IpAddr> {
        self.address.parse().ok()
    }

    pub fn socket_addr(&self) -> Option<SocketAddr> {
        Some(SocketAddr::new(self.ip()?, self.port?))
    }

    /// True for RFC1918, loopback and link-local addresses.
    pub fn is_private(&self) -> bool {
        self.ip().map(is_private_ip).unwrap_or(false)
    }
}

/// Shorthand for [`CandidateRecord::parse`].
pub fn parse(raw: &str) -> Option<CandidateRecord> {
    CandidateRecord::parse(raw)
}

/// RFC1918 ranges, loopback, and link-local (v4 and v6).
pub fn is_private_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            let o = v4.octets();
            o[0] == 10
                || (o[0] == 172 && (16..=31).contains(&o[1]))
                || (o[0] == 192 && o[1] == 168)
                || o[0] == 127
                || (o[0] == 169 && o[1] == 254)
        }
        IpAddr::V6(v6) => {
            if let Some(mapped) = v6.to_ipv4_mapped() {
                return is_private_ip(IpAddr::V4(mapped));
            }
            v6.is_loopback() || (v6.segments()[0] & 0xffc0) == 0xfe80
        }
    }
}

// ── Filtering ────────────────────────────────────────────────────────────────

/// Which candidates may be used. Each flag gates independently.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CandidateFilter {
    pub allow_host: bool,
    pub allow_server_reflexive: bool,
    pub allow_relay: bool,
    pub allow_tcp: bool,
    /// Privacy mode: drop private addresses and anything that isn't an IP
    /// literal, so no local address can leak.
    pub exclude_private_addresses: bool,
}

impl Default for CandidateFilter {
    fn default() -> Self {
        Self {
            allow_host: true,
            allow_server_reflexive: true,
            allow_relay: true,
            allow_tcp: true,
            exclude_private_addresses: false,
        }
    }
}

impl CandidateFilter {
    /// Relay candidates only, never exposing a local address.
    pub fn relay_only() -> Self {
        Self {
            allow_host: false,
            allow_server_reflexive: false,
            allow_relay: true,
            allow_tcp: true,
            exclude_private_addresses: true,
        }
    }

    pub fn permits(&self, record: &CandidateRecord) -> bool {
        let type_ok = match record.candidate_type {
            CandidateType::Host => self.allow_host,
            CandidateType::ServerReflexive => self.allow_server_reflexive,
            CandidateType::Relay => self.allow_relay,
            CandidateType::PeerReflexive => true,
        };
        if !type_ok {
            return false;
        }
        if record.protocol == CandidateProtocol::Tcp && !self.allow_tcp {
            return false;
        }
        if self.exclude_private_addresses {
            return match record.ip() {
                Some(ip) => !is_private_ip(ip),
                None => false,
            };
        }
        true
    }
}

pub fn filter<I>(records: I, policy: &CandidateFilter) -> Vec<CandidateRecord>
where
    I: IntoIterator<Item = CandidateRecord>,
{
    records.into_iter().filter(|r| policy.permits(r)).collect()
}

// ── Ordering ─────────────────────────────────────────────────────────────────

fn preference(a: &CandidateRecord, b: &CandidateRecord) -> Ordering {
    let key = |r: &CandidateRecord| {
        (
            r.protocol == CandidateProtocol::Tcp,
            r.candidate_type.rank(),
            Reverse(r.priority),
        )
    };
    key(a).cmp(&key(b))
}

/// Stable sort: UDP before TCP, then host < srflx < prflx < relay, then
/// priority descending.
pub fn prioritize(records: &mut [CandidateRecord]) {
    records.sort_by(preference);
}
