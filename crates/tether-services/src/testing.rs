//! Scripted collaborators shared by the unit tests in this crate.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::watch;

use tether_core::{CandidateRecord, ConnectivityConfig};

use crate::transport::{
    EncryptedSession, GatheringState, PeerTransport, SessionDescription, SessionNegotiator,
    Signaling, TransportFactory, TransportState, TransportStats,
};

pub struct MockTransport {
    peer_id: String,
    state: watch::Sender<TransportState>,
    gathering: watch::Sender<GatheringState>,
    local: Mutex<Option<SessionDescription>>,
    pub remote: Mutex<Option<SessionDescription>>,
    pub offers: AtomicUsize,
    pub restart_offers: AtomicUsize,
    pub fail_offers: AtomicUsize,
    pub lose_local_description: AtomicBool,
    pub stall_gathering: AtomicBool,
    pub candidates: Mutex<Vec<CandidateRecord>>,
    pub sent: Mutex<Vec<Bytes>>,
    pub rtt: Mutex<Option<Duration>>,
    pub buffered: AtomicU64,
    pub closed: AtomicBool,
}

impl MockTransport {
    pub fn new(peer_id: &str) -> Arc<Self> {
        Arc::new(Self {
            peer_id: peer_id.to_string(),
            state: watch::channel(TransportState::New).0,
            gathering: watch::channel(GatheringState::New).0,
            local: Mutex::new(None),
            remote: Mutex::new(None),
            offers: AtomicUsize::new(0),
            restart_offers: AtomicUsize::new(0),
            fail_offers: AtomicUsize::new(0),
            lose_local_description: AtomicBool::new(false),
            stall_gathering: AtomicBool::new(false),
            candidates: Mutex::new(Vec::new()),
            sent: Mutex::new(Vec::new()),
            rtt: Mutex::new(Some(Duration::from_millis(50))),
            buffered: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        })
    }

    pub fn set_state(&self, state: TransportState) {
        self.state.send_replace(state);
    }
}

#[async_trait]
impl PeerTransport for MockTransport {
    fn peer_id(&self) -> &str {
        &self.peer_id
    }

    fn state(&self) -> TransportState {
        *self.state.borrow()
    }

    fn subscribe_state(&self) -> watch::Receiver<TransportState> {
        self.state.subscribe()
    }

    async fn create_offer(&self, ice_restart: bool) -> Result<SessionDescription> {
        self.offers.fetch_add(1, Ordering::SeqCst);
        if ice_restart {
            self.restart_offers.fetch_add(1, Ordering::SeqCst);
        }
        let pending = self.fail_offers.load(Ordering::SeqCst);
        if pending > 0 {
            self.fail_offers.store(pending - 1, Ordering::SeqCst);
            bail!("offer creation failed");
        }
        Ok(SessionDescription::offer(format!("offer-{}", self.peer_id)))
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        Ok(SessionDescription::answer(format!("answer-{}", self.peer_id)))
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<()> {
        *self.local.lock().unwrap() = Some(desc);
        if self.stall_gathering.load(Ordering::SeqCst) {
            self.gathering.send_replace(GatheringState::Gathering);
        } else {
            self.gathering.send_replace(GatheringState::Complete);
        }
        Ok(())
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<()> {
        *self.remote.lock().unwrap() = Some(desc);
        self.state.send_replace(TransportState::Connected);
        Ok(())
    }

    fn local_description(&self) -> Option<SessionDescription> {
        if self.lose_local_description.load(Ordering::SeqCst) {
            return None;
        }
        self.local.lock().unwrap().clone()
    }

    async fn add_remote_candidate(&self, candidate: &CandidateRecord, _raw: &str) -> Result<()> {
        self.candidates.lock().unwrap().push(candidate.clone());
        Ok(())
    }

    fn gathering(&self) -> watch::Receiver<GatheringState> {
        self.gathering.subscribe()
    }

    async fn stats(&self) -> Result<TransportStats> {
        let bytes_sent = self.sent.lock().unwrap().iter().map(|b| b.len() as u64).sum();
        Ok(TransportStats {
            bytes_sent,
            bytes_received: 0,
            round_trip_time: *self.rtt.lock().unwrap(),
        })
    }

    fn buffered_amount(&self) -> u64 {
        self.buffered.load(Ordering::SeqCst)
    }

    async fn send(&self, data: Bytes) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            bail!("data channel closed");
        }
        self.sent.lock().unwrap().push(data);
        Ok(())
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.state.send_replace(TransportState::Closed);
    }
}

/// Answers every offer, optionally failing the next few restart offers.
#[derive(Default)]
pub struct MockSignaling {
    pub offers: AtomicUsize,
    pub restart_offers: AtomicUsize,
    pub fail_restarts: AtomicUsize,
    pub delay: Mutex<Duration>,
    pub candidates: Mutex<Vec<(String, String)>>,
    pub groups: Mutex<Vec<(String, Vec<String>)>>,
    pub left: Mutex<Vec<String>>,
    pub unreachable: Mutex<Vec<String>>,
}

#[async_trait]
impl Signaling for MockSignaling {
    async fn send_offer(&self, peer_id: &str, _offer: SessionDescription) -> Result<SessionDescription> {
        self.offers.fetch_add(1, Ordering::SeqCst);
        let delay = *self.delay.lock().unwrap();
        tokio::time::sleep(delay).await;
        if self.unreachable.lock().unwrap().iter().any(|p| p == peer_id) {
            bail!("peer {peer_id} did not answer");
        }
        Ok(SessionDescription::answer(format!("answer-{peer_id}")))
    }

    async fn send_restart_offer(&self, peer_id: &str, _offer: SessionDescription) -> Result<SessionDescription> {
        self.restart_offers.fetch_add(1, Ordering::SeqCst);
        let delay = *self.delay.lock().unwrap();
        tokio::time::sleep(delay).await;
        let pending = self.fail_restarts.load(Ordering::SeqCst);
        if pending > 0 {
            self.fail_restarts.store(pending - 1, Ordering::SeqCst);
            bail!("signaling timed out");
        }
        Ok(SessionDescription::answer(format!("restart-answer-{peer_id}")))
    }

    async fn send_candidate(&self, peer_id: &str, candidate: &str) -> Result<()> {
        self.candidates
            .lock()
            .unwrap()
            .push((peer_id.to_string(), candidate.to_string()));
        Ok(())
    }

    async fn create_group(&self, group_id: &str, members: &[String]) -> Result<()> {
        self.groups
            .lock()
            .unwrap()
            .push((group_id.to_string(), members.to_vec()));
        Ok(())
    }

    async fn leave_group(&self, group_id: &str) -> Result<()> {
        self.left.lock().unwrap().push(group_id.to_string());
        Ok(())
    }
}

/// Hands out pre-built transports in order, or fresh ones when empty.
#[derive(Default)]
pub struct MockFactory {
    pub queued: Mutex<VecDeque<Arc<MockTransport>>>,
    pub created: Mutex<Vec<Arc<MockTransport>>>,
    pub configs: Mutex<Vec<ConnectivityConfig>>,
}

impl MockFactory {
    pub fn transport(&self, peer_id: &str) -> Option<Arc<MockTransport>> {
        self.created
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|t| t.peer_id() == peer_id)
            .cloned()
    }
}

#[async_trait]
impl TransportFactory for MockFactory {
    async fn create(&self, peer_id: &str, config: &ConnectivityConfig) -> Result<Arc<dyn PeerTransport>> {
        self.configs.lock().unwrap().push(config.clone());
        let transport = self
            .queued
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| MockTransport::new(peer_id));
        self.created.lock().unwrap().push(transport.clone());
        Ok(transport as Arc<dyn PeerTransport>)
    }
}

/// XORs every byte with a fixed key so tests can tell sealed data apart.
pub struct XorSession(pub u8);

impl EncryptedSession for XorSession {
    fn seal(&self, plaintext: &[u8]) -> Result<Bytes> {
        Ok(plaintext.iter().map(|b| b ^ self.0).collect::<Vec<u8>>().into())
    }
}

#[derive(Default)]
pub struct MockNegotiator {
    pub refused: Mutex<Vec<String>>,
    pub negotiated: AtomicUsize,
}

#[async_trait]
impl SessionNegotiator for MockNegotiator {
    async fn negotiate(
        &self,
        peer_id: &str,
        _transport: Arc<dyn PeerTransport>,
    ) -> Result<Arc<dyn EncryptedSession>> {
        if self.refused.lock().unwrap().iter().any(|p| p == peer_id) {
            bail!("handshake rejected by {peer_id}");
        }
        self.negotiated.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(XorSession(0x5a)))
    }
}
