//! In-process network simulation: transports, signaling, handshakes and a
//! loopback discovery server.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use bytes::Bytes;
use tokio::net::UdpSocket;
use tokio::sync::watch;

use tether_core::{policy, stun, CandidateRecord, ConnectivityConfig, NatClass, ServerDescriptor};
use tether_services::group::{GroupTransferConfig, GroupTransferCoordinator};
use tether_services::peer::{PeerConnectionManager, PeerManagerConfig};
use tether_services::progress::{GroupTransferResult, TransferObserver};
use tether_services::transport::{
    EncryptedSession, GatheringState, PeerTransport, SessionDescription, SessionNegotiator,
    Signaling, TransportFactory, TransportState, TransportStats,
};
use tether_services::Error;

pub const MB: usize = 1024 * 1024;

// ── Harness ───────────────────────────────────────────────────────────────────

/// One local node wired to a simulated network.
pub struct Net {
    pub factory: Arc<SimFactory>,
    pub signaling: Arc<SimSignaling>,
    pub negotiator: Arc<SimNegotiator>,
    pub observer: Arc<CountingObserver>,
    pub manager: Arc<PeerConnectionManager>,
}

impl Net {
    pub fn new(config: PeerManagerConfig) -> Self {
        let factory = Arc::new(SimFactory::default());
        let signaling = Arc::new(SimSignaling::default());
        let manager = Arc::new(PeerConnectionManager::new(
            config,
            factory.clone(),
            signaling.clone(),
        ));
        Self {
            factory,
            signaling,
            negotiator: Arc::new(SimNegotiator::default()),
            observer: Arc::new(CountingObserver::default()),
            manager,
        }
    }

    pub fn coordinator(&self, config: GroupTransferConfig) -> GroupTransferCoordinator {
        GroupTransferCoordinator::new(self.manager.clone(), self.negotiator.clone(), config)
            .with_observer(self.observer.clone())
    }
}

/// Policy for a peer reachable on direct paths.
pub fn direct_policy() -> ConnectivityConfig {
    policy::build(NatClass::FullCone, &[], &[])
}

// ── Transport ─────────────────────────────────────────────────────────────────

/// A reliable, ordered link that counts what it carries instead of storing it.
pub struct SimTransport {
    peer_id: String,
    state: watch::Sender<TransportState>,
    gathering: watch::Sender<GatheringState>,
    local: Mutex<Option<SessionDescription>>,
    /// Close the link once this many bytes have gone out.
    close_after: Option<u64>,
    pub bytes_sent: AtomicU64,
    pub frames: AtomicUsize,
    pub restart_offers: AtomicUsize,
    pub first_frame: Mutex<Option<Bytes>>,
}

impl SimTransport {
    pub fn new(peer_id: &str, close_after: Option<u64>) -> Arc<Self> {
        Arc::new(Self {
            peer_id: peer_id.to_string(),
            state: watch::channel(TransportState::New).0,
            gathering: watch::channel(GatheringState::New).0,
            local: Mutex::new(None),
            close_after,
            bytes_sent: AtomicU64::new(0),
            frames: AtomicUsize::new(0),
            restart_offers: AtomicUsize::new(0),
            first_frame: Mutex::new(None),
        })
    }

    pub fn set_state(&self, state: TransportState) {
        self.state.send_replace(state);
    }

    pub fn sent(&self) -> u64 {
        self.bytes_sent.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PeerTransport for SimTransport {
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
        if ice_restart {
            self.restart_offers.fetch_add(1, Ordering::SeqCst);
        }
        Ok(SessionDescription::offer(format!("v=0 o={}", self.peer_id)))
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        Ok(SessionDescription::answer(format!("v=0 a={}", self.peer_id)))
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<()> {
        *self.local.lock().unwrap() = Some(desc);
        self.gathering.send_replace(GatheringState::Complete);
        Ok(())
    }

    async fn set_remote_description(&self, _desc: SessionDescription) -> Result<()> {
        self.state.send_replace(TransportState::Connected);
        Ok(())
    }

    fn local_description(&self) -> Option<SessionDescription> {
        self.local.lock().unwrap().clone()
    }

    async fn add_remote_candidate(&self, _candidate: &CandidateRecord, _raw: &str) -> Result<()> {
        Ok(())
    }

    fn gathering(&self) -> watch::Receiver<GatheringState> {
        self.gathering.subscribe()
    }

    async fn stats(&self) -> Result<TransportStats> {
        Ok(TransportStats {
            bytes_sent: self.sent(),
            bytes_received: 0,
            round_trip_time: Some(Duration::from_millis(40)),
        })
    }

    fn buffered_amount(&self) -> u64 {
        0
    }

    async fn send(&self, data: Bytes) -> Result<()> {
        if self.state() == TransportState::Closed {
            bail!("data channel to {} closed", self.peer_id);
        }
        if let Some(limit) = self.close_after {
            if self.sent() + data.len() as u64 > limit {
                self.state.send_replace(TransportState::Closed);
                bail!("data channel to {} closed", self.peer_id);
            }
        }
        let mut first = self.first_frame.lock().unwrap();
        if first.is_none() {
            *first = Some(data.clone());
        }
        self.bytes_sent.fetch_add(data.len() as u64, Ordering::SeqCst);
        self.frames.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&self) {
        self.state.send_replace(TransportState::Closed);
    }
}

#[derive(Default)]
pub struct SimFactory {
    /// Per-peer byte budget before the link drops.
    pub close_after: Mutex<HashMap<String, u64>>,
    pub transports: Mutex<HashMap<String, Arc<SimTransport>>>,
}

impl SimFactory {
    pub fn transport(&self, peer_id: &str) -> Arc<SimTransport> {
        self.transports.lock().unwrap()[peer_id].clone()
    }
}

#[async_trait]
impl TransportFactory for SimFactory {
    async fn create(&self, peer_id: &str, _config: &ConnectivityConfig) -> Result<Arc<dyn PeerTransport>> {
        let close_after = self.close_after.lock().unwrap().get(peer_id).copied();
        let transport = SimTransport::new(peer_id, close_after);
        self.transports
            .lock()
            .unwrap()
            .insert(peer_id.to_string(), transport.clone());
        Ok(transport as Arc<dyn PeerTransport>)
    }
}

// ── Signaling ─────────────────────────────────────────────────────────────────

#[derive(Default)]
pub struct SimSignaling {
    pub round_trip: Mutex<Duration>,
    pub offers: AtomicUsize,
    pub restart_offers: AtomicUsize,
    /// Restart offers left to drop before answering again.
    pub drop_restarts: AtomicUsize,
    pub groups: Mutex<Vec<String>>,
    pub left: Mutex<Vec<String>>,
}

impl SimSignaling {
    async fn round_trip(&self) {
        let rtt = *self.round_trip.lock().unwrap();
        tokio::time::sleep(rtt).await;
    }
}

#[async_trait]
impl Signaling for SimSignaling {
    async fn send_offer(&self, peer_id: &str, _offer: SessionDescription) -> Result<SessionDescription> {
        self.offers.fetch_add(1, Ordering::SeqCst);
        self.round_trip().await;
        Ok(SessionDescription::answer(format!("v=0 a={peer_id}")))
    }

    async fn send_restart_offer(&self, peer_id: &str, _offer: SessionDescription) -> Result<SessionDescription> {
        self.restart_offers.fetch_add(1, Ordering::SeqCst);
        self.round_trip().await;
        let pending = self.drop_restarts.load(Ordering::SeqCst);
        if pending > 0 {
            self.drop_restarts.store(pending - 1, Ordering::SeqCst);
            bail!("no answer from {peer_id}");
        }
        Ok(SessionDescription::answer(format!("v=0 a={peer_id} restart")))
    }

    async fn send_candidate(&self, _peer_id: &str, _candidate: &str) -> Result<()> {
        Ok(())
    }

    async fn create_group(&self, group_id: &str, _members: &[String]) -> Result<()> {
        self.groups.lock().unwrap().push(group_id.to_string());
        Ok(())
    }

    async fn leave_group(&self, group_id: &str) -> Result<()> {
        self.left.lock().unwrap().push(group_id.to_string());
        Ok(())
    }
}

// ── Handshake ─────────────────────────────────────────────────────────────────

/// Frames are passed through with a one-byte tag so sealed output is
/// distinguishable from plaintext.
pub struct TaggedSession;

impl EncryptedSession for TaggedSession {
    fn seal(&self, plaintext: &[u8]) -> Result<Bytes> {
        let mut out = Vec::with_capacity(plaintext.len() + 1);
        out.push(0xE1);
        out.extend_from_slice(plaintext);
        Ok(out.into())
    }
}

#[derive(Default)]
pub struct SimNegotiator {
    pub handshakes: AtomicUsize,
}

#[async_trait]
impl SessionNegotiator for SimNegotiator {
    async fn negotiate(
        &self,
        _peer_id: &str,
        _transport: Arc<dyn PeerTransport>,
    ) -> Result<Arc<dyn EncryptedSession>> {
        self.handshakes.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(TaggedSession))
    }
}

// ── Observer ──────────────────────────────────────────────────────────────────

#[derive(Default)]
pub struct CountingObserver {
    pub completions: AtomicUsize,
    pub recipient_done: Mutex<Vec<String>>,
    pub recipient_errors: Mutex<Vec<String>>,
    pub last_overall: AtomicUsize,
}

impl TransferObserver for CountingObserver {
    fn on_recipient_complete(&self, recipient: &str) {
        self.recipient_done.lock().unwrap().push(recipient.to_string());
    }

    fn on_recipient_error(&self, recipient: &str, _error: &Error) {
        self.recipient_errors.lock().unwrap().push(recipient.to_string());
    }

    fn on_overall_progress(&self, progress: u8) {
        self.last_overall.store(progress as usize, Ordering::SeqCst);
    }

    fn on_complete(&self, _result: &GroupTransferResult) {
        self.completions.fetch_add(1, Ordering::SeqCst);
    }
}

// ── Discovery server ──────────────────────────────────────────────────────────

/// A loopback discovery server answering binding requests with the
/// requester's address. `delay` is applied before every answer.
pub async fn spawn_discovery_server(delay: Duration) -> Result<(ServerDescriptor, Arc<AtomicUsize>)> {
    let socket = UdpSocket::bind("127.0.0.1:0").await?;
    let addr = socket.local_addr()?;
    let requests = Arc::new(AtomicUsize::new(0));
    let counter = requests.clone();

    tokio::spawn(async move {
        let mut buf = [0u8; 1500];
        loop {
            let Ok((n, from)) = socket.recv_from(&mut buf).await else {
                return;
            };
            if n < stun::HEADER_LEN {
                continue;
            }
            counter.fetch_add(1, Ordering::SeqCst);
            let mut txid: stun::TransactionId = [0u8; 12];
            txid.copy_from_slice(&buf[8..20]);
            tokio::time::sleep(delay).await;
            let _ = socket.send_to(&stun::binding_success(&txid, from), from).await;
        }
    });

    Ok((ServerDescriptor::new(format!("stun:{addr}")), requests))
}

/// A port with nothing listening.
pub async fn dead_server() -> Result<ServerDescriptor> {
    let socket = UdpSocket::bind("127.0.0.1:0").await?;
    let addr: SocketAddr = socket.local_addr()?;
    drop(socket);
    Ok(ServerDescriptor::new(format!("stun:{addr}")))
}
