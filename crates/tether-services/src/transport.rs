//! Collaborator seams — the transport, signaling and session-encryption
//! objects the orchestration layer drives but does not implement.
//!
//! All of these return `anyhow::Result`: their failures are opaque to us and
//! get wrapped into typed [`crate::Error`] variants at the call site.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::watch;

use tether_core::{CandidateRecord, ConnectivityConfig};

// ── Transport state ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl TransportState {
    /// States that trigger the restart controller.
    pub fn needs_restart(self) -> bool {
        matches!(self, TransportState::Disconnected | TransportState::Failed)
    }

    pub fn is_down(self) -> bool {
        matches!(
            self,
            TransportState::Disconnected | TransportState::Failed | TransportState::Closed
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatheringState {
    New,
    Gathering,
    Complete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SdpKind {
    Offer,
    Answer,
}

/// An offer or answer. The body is opaque to this crate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionDescription {
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransportStats {
    pub bytes_sent: u64,
    pub bytes_received: u64,
    /// Current round-trip time of the nominated pair, if one is known.
    pub round_trip_time: Option<Duration>,
}

// ── Traits ───────────────────────────────────────────────────────────────────

/// One peer transport session: offer/answer, candidate exchange, and an
/// ordered reliable data channel.
#[async_trait]
pub trait PeerTransport: Send + Sync {
    fn peer_id(&self) -> &str;

    fn state(&self) -> TransportState;

    fn subscribe_state(&self) -> watch::Receiver<TransportState>;

    async fn create_offer(&self, ice_restart: bool) -> Result<SessionDescription>;

    async fn create_answer(&self) -> Result<SessionDescription>;

    async fn set_local_description(&self, desc: SessionDescription) -> Result<()>;

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<()>;

    /// The local description including every candidate gathered so far.
    fn local_description(&self) -> Option<SessionDescription>;

    async fn add_remote_candidate(&self, candidate: &CandidateRecord, raw: &str) -> Result<()>;

    fn gathering(&self) -> watch::Receiver<GatheringState>;

    async fn stats(&self) -> Result<TransportStats>;

    /// Bytes queued in the data channel but not yet on the wire.
    fn buffered_amount(&self) -> u64;

    async fn send(&self, data: Bytes) -> Result<()>;

    async fn close(&self);
}

#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn create(&self, peer_id: &str, config: &ConnectivityConfig) -> Result<Arc<dyn PeerTransport>>;
}

/// Signaling channel. Wire encoding belongs to the implementation.
#[async_trait]
pub trait Signaling: Send + Sync {
    /// Send an initial offer and wait for the peer's answer.
    async fn send_offer(&self, peer_id: &str, offer: SessionDescription) -> Result<SessionDescription>;

    /// Send a restart offer and wait for the peer's answer.
    async fn send_restart_offer(&self, peer_id: &str, offer: SessionDescription) -> Result<SessionDescription>;

    async fn send_candidate(&self, peer_id: &str, candidate: &str) -> Result<()>;

    async fn create_group(&self, group_id: &str, members: &[String]) -> Result<()>;

    async fn leave_group(&self, group_id: &str) -> Result<()>;
}

/// An established per-peer encryption context.
pub trait EncryptedSession: Send + Sync {
    fn seal(&self, plaintext: &[u8]) -> Result<Bytes>;
}

/// Runs the per-peer encryption handshake over an open transport.
#[async_trait]
pub trait SessionNegotiator: Send + Sync {
    async fn negotiate(
        &self,
        peer_id: &str,
        transport: Arc<dyn PeerTransport>,
    ) -> Result<Arc<dyn EncryptedSession>>;
}

// ── Gathering wait ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatheringOutcome {
    Complete,
    /// Proceed with whatever candidates were gathered.
    TimedOut,
}

/// Wait for gathering to complete, bounded by `timeout`.
///
/// A dropped sender counts as complete: nothing more will be gathered.
pub async fn wait_for_gathering(
    mut rx: watch::Receiver<GatheringState>,
    timeout: Duration,
) -> GatheringOutcome {
    let done = async {
        loop {
            if *rx.borrow_and_update() == GatheringState::Complete {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    };
    match tokio::time::timeout(timeout, done).await {
        Ok(()) => GatheringOutcome::Complete,
        Err(_) => GatheringOutcome::TimedOut,
    }
}
