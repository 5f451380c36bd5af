//! Peer connection manager — owns the lifecycle of concurrent peer sessions.
//!
//! Each connected peer gets a transport, a restart controller, and a monitor
//! task. The monitor watches transport state and drives the restart
//! controller when a connection drops. Peers whose restart budget runs out
//! are torn down, their slot freed, and reported dead; reconnect them with
//! `connect`.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::{DashMap, DashSet};
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use tether_core::candidate::{self, CandidateFilter};
use tether_core::config::ConnectionConfig;
use tether_core::ConnectivityConfig;

use crate::error::{Error, ErrorClass, Result};
use crate::restart::{RestartConfig, RestartController, RestartOutcome};
use crate::transport::{
    wait_for_gathering, GatheringOutcome, PeerTransport, SessionDescription, Signaling,
    TransportFactory, TransportState,
};

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_MAX_CONNECTIONS: usize = 10;

const EVENT_CAPACITY: usize = 256;

// ── Quality ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum QualityClass {
    Excellent,
    Good,
    Fair,
    Poor,
    Disconnected,
}

impl QualityClass {
    /// Classify from transport state and round-trip time. A live transport
    /// with no RTT sample yet counts as good.
    pub fn classify(state: TransportState, rtt: Option<Duration>) -> Self {
        if state.is_down() {
            return QualityClass::Disconnected;
        }
        match rtt.map(|d| d.as_millis()) {
            None => QualityClass::Good,
            Some(ms) if ms < 100 => QualityClass::Excellent,
            Some(ms) if ms < 200 => QualityClass::Good,
            Some(ms) if ms < 500 => QualityClass::Fair,
            Some(_) => QualityClass::Poor,
        }
    }
}

// ── Records & events ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PeerStats {
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub round_trip_time: Option<Duration>,
    pub buffered_amount: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerConnectionRecord {
    pub peer_id: String,
    pub state: TransportState,
    pub quality: QualityClass,
    pub stats: PeerStats,
    pub connected_at: Instant,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerEvent {
    Connected { peer_id: String },
    QualityChanged { peer_id: String, quality: QualityClass },
    Reconnecting { peer_id: String },
    Recovered { peer_id: String, attempt: u32 },
    /// Restart budget spent. The session is gone; reconnect with `connect`.
    Dead { peer_id: String },
    Disconnected { peer_id: String },
}

// ── Config ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct PeerManagerConfig {
    pub max_connections: usize,
    pub connect_timeout: Duration,
    pub restart: RestartConfig,
}

impl Default for PeerManagerConfig {
    fn default() -> Self {
        Self {
            max_connections: DEFAULT_MAX_CONNECTIONS,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            restart: RestartConfig::default(),
        }
    }
}

impl From<&ConnectionConfig> for PeerManagerConfig {
    fn from(cfg: &ConnectionConfig) -> Self {
        Self {
            max_connections: cfg.max_peers,
            connect_timeout: Duration::from_secs(cfg.connect_timeout_secs),
            restart: RestartConfig {
                max_attempts: cfg.max_reconnect_attempts,
                ..RestartConfig::default()
            },
        }
    }
}

// ── Manager ──────────────────────────────────────────────────────────────────

struct PeerEntry {
    transport: Arc<dyn PeerTransport>,
    record: PeerConnectionRecord,
    restart: Arc<RestartController>,
    filter: CandidateFilter,
    monitor: Option<JoinHandle<()>>,
}

type PeerTable = Arc<DashMap<String, PeerEntry>>;

pub struct PeerConnectionManager {
    config: PeerManagerConfig,
    factory: Arc<dyn TransportFactory>,
    signaling: Arc<dyn Signaling>,
    peers: PeerTable,
    /// Peer ids with a `connect`/`accept` in flight.
    pending: DashSet<String>,
    reserved: Arc<AtomicUsize>,
    events: broadcast::Sender<PeerEvent>,
}

impl PeerConnectionManager {
    pub fn new(
        config: PeerManagerConfig,
        factory: Arc<dyn TransportFactory>,
        signaling: Arc<dyn Signaling>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            config,
            factory,
            signaling,
            peers: Arc::new(DashMap::new()),
            pending: DashSet::new(),
            reserved: Arc::new(AtomicUsize::new(0)),
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PeerEvent> {
        self.events.subscribe()
    }

    pub fn signaling(&self) -> Arc<dyn Signaling> {
        self.signaling.clone()
    }

    pub fn max_connections(&self) -> usize {
        self.config.max_connections
    }

    /// Slots not taken by connected or connecting peers.
    pub fn available_slots(&self) -> usize {
        self.config
            .max_connections
            .saturating_sub(self.reserved.load(Ordering::Acquire))
    }

    pub fn is_connected(&self, peer_id: &str) -> bool {
        self.peers.contains_key(peer_id)
    }

    /// Open a session to `peer_id` as the offering side.
    pub async fn connect(&self, peer_id: &str, config: &ConnectivityConfig) -> Result<Arc<dyn PeerTransport>> {
        let claim = self.claim(peer_id)?;
        tracing::info!(peer = peer_id, policy = ?config.transport_policy, "connecting");

        let transport = self
            .factory
            .create(peer_id, config)
            .await
            .map_err(|e| Error::transport(peer_id, e))?;

        let negotiated = tokio::time::timeout(
            self.config.connect_timeout,
            self.offer_answer(peer_id, transport.as_ref(), config),
        )
        .await
        .unwrap_or_else(|_| Err(Error::Timeout(self.config.connect_timeout, "offer/answer")));

        if let Err(e) = negotiated {
            tracing::warn!(peer = peer_id, error = %e, "connect failed");
            transport.close().await;
            return Err(e);
        }

        self.register(peer_id, transport.clone(), config);
        claim.commit();
        Ok(transport)
    }

    async fn offer_answer(
        &self,
        peer_id: &str,
        transport: &dyn PeerTransport,
        config: &ConnectivityConfig,
    ) -> Result<()> {
        let offer = transport
            .create_offer(false)
            .await
            .map_err(|e| Error::transport(peer_id, e))?;
        transport
            .set_local_description(offer)
            .await
            .map_err(|e| Error::transport(peer_id, e))?;
        if wait_for_gathering(transport.gathering(), config.gathering_timeout()).await
            == GatheringOutcome::TimedOut
        {
            tracing::debug!(peer = peer_id, "gathering timed out, offering partial candidates");
        }
        let local = transport
            .local_description()
            .ok_or_else(|| Error::MissingLocalDescription {
                peer_id: peer_id.to_string(),
                stage: "offer",
            })?;
        let answer = self
            .signaling
            .send_offer(peer_id, local)
            .await
            .map_err(|e| Error::signaling(peer_id, e))?;
        transport
            .set_remote_description(answer)
            .await
            .map_err(|e| Error::transport(peer_id, e))
    }

    /// Answer an incoming offer. Returns the local answer to relay back.
    pub async fn accept(
        &self,
        peer_id: &str,
        offer: SessionDescription,
        config: &ConnectivityConfig,
    ) -> Result<SessionDescription> {
        let claim = self.claim(peer_id)?;

        let transport = self
            .factory
            .create(peer_id, config)
            .await
            .map_err(|e| Error::transport(peer_id, e))?;

        let answered = tokio::time::timeout(
            self.config.connect_timeout,
            answer_offer(peer_id, transport.as_ref(), offer, config.gathering_timeout()),
        )
        .await
        .unwrap_or_else(|_| Err(Error::Timeout(self.config.connect_timeout, "answer")));

        match answered {
            Ok(answer) => {
                self.register(peer_id, transport, config);
                claim.commit();
                Ok(answer)
            }
            Err(e) => {
                tracing::warn!(peer = peer_id, error = %e, "accept failed");
                transport.close().await;
                Err(e)
            }
        }
    }

    fn register(&self, peer_id: &str, transport: Arc<dyn PeerTransport>, config: &ConnectivityConfig) {
        let restart = Arc::new(RestartController::new(
            peer_id,
            self.signaling.clone(),
            RestartConfig {
                gathering_timeout: config.gathering_timeout(),
                ..self.config.restart.clone()
            },
        ));
        let state = transport.state();
        let record = PeerConnectionRecord {
            peer_id: peer_id.to_string(),
            state,
            quality: QualityClass::classify(state, None),
            stats: PeerStats::default(),
            connected_at: Instant::now(),
        };

        self.peers.insert(
            peer_id.to_string(),
            PeerEntry {
                transport: transport.clone(),
                record,
                restart: restart.clone(),
                filter: config.candidate_filter(),
                monitor: None,
            },
        );

        let monitor = tokio::spawn(monitor_peer(
            peer_id.to_string(),
            transport,
            restart,
            self.peers.clone(),
            self.reserved.clone(),
            self.events.clone(),
        ));
        if let Some(mut entry) = self.peers.get_mut(peer_id) {
            entry.monitor = Some(monitor);
        }

        tracing::info!(peer = peer_id, "peer connected");
        let _ = self.events.send(PeerEvent::Connected {
            peer_id: peer_id.to_string(),
        });
    }

    /// Forward a trickled remote candidate. Returns `false` when the line
    /// doesn't parse or the peer's policy rejects it.
    pub async fn add_remote_candidate(&self, peer_id: &str, raw: &str) -> Result<bool> {
        let (transport, filter) = self.lookup(peer_id, |e| (e.transport.clone(), e.filter))?;
        let Some(record) = candidate::parse(raw) else {
            tracing::debug!(peer = peer_id, raw, "dropping unparseable candidate");
            return Ok(false);
        };
        if !filter.permits(&record) {
            tracing::trace!(peer = peer_id, kind = %record.candidate_type, "candidate filtered");
            return Ok(false);
        }
        transport
            .add_remote_candidate(&record, raw)
            .await
            .map_err(|e| Error::transport(peer_id, e))?;
        Ok(true)
    }

    /// Trickle a locally gathered candidate to the peer, subject to the same
    /// policy. Relay-only peers never see host addresses.
    pub async fn send_local_candidate(&self, peer_id: &str, raw: &str) -> Result<bool> {
        let filter = self.lookup(peer_id, |e| e.filter)?;
        match candidate::parse(raw) {
            Some(record) if filter.permits(&record) => {
                self.signaling
                    .send_candidate(peer_id, raw)
                    .await
                    .map_err(|e| Error::signaling(peer_id, e))?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    pub async fn handle_remote_restart_offer(
        &self,
        peer_id: &str,
        offer: SessionDescription,
    ) -> Result<SessionDescription> {
        let (transport, restart) = self.lookup(peer_id, |e| (e.transport.clone(), e.restart.clone()))?;
        restart.handle_remote_restart_offer(transport.as_ref(), offer).await
    }

    /// Pull fresh stats from the transport and reclassify quality.
    pub async fn refresh_stats(&self, peer_id: &str) -> Result<PeerConnectionRecord> {
        let transport = self.lookup(peer_id, |e| e.transport.clone())?;
        let stats = transport
            .stats()
            .await
            .map_err(|e| Error::transport(peer_id, e))?;
        let state = transport.state();
        let stats = PeerStats {
            bytes_sent: stats.bytes_sent,
            bytes_received: stats.bytes_received,
            round_trip_time: stats.round_trip_time,
            buffered_amount: transport.buffered_amount(),
        };

        let mut entry = self
            .peers
            .get_mut(peer_id)
            .ok_or_else(|| Error::UnknownPeer(peer_id.to_string()))?;
        entry.record.stats = stats;
        entry.record.state = state;
        let quality = QualityClass::classify(state, stats.round_trip_time);
        if quality != entry.record.quality {
            entry.record.quality = quality;
            let _ = self.events.send(PeerEvent::QualityChanged {
                peer_id: peer_id.to_string(),
                quality,
            });
        }
        Ok(entry.record.clone())
    }

    pub fn record(&self, peer_id: &str) -> Option<PeerConnectionRecord> {
        self.peers.get(peer_id).map(|e| e.record.clone())
    }

    pub fn records(&self) -> Vec<PeerConnectionRecord> {
        self.peers.iter().map(|e| e.record.clone()).collect()
    }

    pub fn transport(&self, peer_id: &str) -> Option<Arc<dyn PeerTransport>> {
        self.peers.get(peer_id).map(|e| e.transport.clone())
    }

    pub fn restart_controller(&self, peer_id: &str) -> Option<Arc<RestartController>> {
        self.peers.get(peer_id).map(|e| e.restart.clone())
    }

    /// Tear down one peer: cancel recovery, close the transport, free the slot.
    pub async fn disconnect(&self, peer_id: &str) -> Result<()> {
        let (_, entry) = self
            .peers
            .remove(peer_id)
            .ok_or_else(|| Error::UnknownPeer(peer_id.to_string()))?;
        entry.restart.destroy();
        if let Some(monitor) = entry.monitor {
            monitor.abort();
        }
        entry.transport.close().await;
        release_slot(&self.reserved);

        tracing::info!(peer = peer_id, "peer disconnected");
        let _ = self.events.send(PeerEvent::Disconnected {
            peer_id: peer_id.to_string(),
        });
        Ok(())
    }

    pub async fn shutdown(&self) {
        let ids: Vec<String> = self.peers.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            let _ = self.disconnect(&id).await;
        }
    }

    fn lookup<T>(&self, peer_id: &str, f: impl FnOnce(&PeerEntry) -> T) -> Result<T> {
        self.peers
            .get(peer_id)
            .map(|e| f(&e))
            .ok_or_else(|| Error::UnknownPeer(peer_id.to_string()))
    }

    /// Mark `peer_id` as connecting and take a slot for it. A peer id is
    /// claimed by at most one `connect`/`accept` at a time, and never while
    /// it is in the table.
    fn claim(&self, peer_id: &str) -> Result<Claim<'_>> {
        if !self.pending.insert(peer_id.to_string()) {
            return Err(Error::AlreadyConnected(peer_id.to_string()));
        }
        if self.peers.contains_key(peer_id) {
            self.pending.remove(peer_id);
            return Err(Error::AlreadyConnected(peer_id.to_string()));
        }
        let max = self.config.max_connections;
        if self
            .reserved
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| (n < max).then_some(n + 1))
            .is_err()
        {
            self.pending.remove(peer_id);
            return Err(Error::CapacityReached(max));
        }
        Ok(Claim {
            manager: self,
            peer_id: peer_id.to_string(),
            committed: false,
        })
    }
}

fn release_slot(reserved: &AtomicUsize) {
    let _ = reserved.fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
}

/// A connecting peer. Dropped without `commit` (error, timeout, or the
/// caller's future going away) it gives the slot back.
struct Claim<'a> {
    manager: &'a PeerConnectionManager,
    peer_id: String,
    committed: bool,
}

impl Claim<'_> {
    /// The peer is in the table; keep the slot.
    fn commit(mut self) {
        self.committed = true;
    }
}

impl Drop for Claim<'_> {
    fn drop(&mut self) {
        if !self.committed {
            release_slot(&self.manager.reserved);
        }
        self.manager.pending.remove(&self.peer_id);
    }
}

async fn answer_offer(
    peer_id: &str,
    transport: &dyn PeerTransport,
    offer: SessionDescription,
    gathering_timeout: Duration,
) -> Result<SessionDescription> {
    transport
        .set_remote_description(offer)
        .await
        .map_err(|e| Error::transport(peer_id, e))?;
    let answer = transport
        .create_answer()
        .await
        .map_err(|e| Error::transport(peer_id, e))?;
    transport
        .set_local_description(answer)
        .await
        .map_err(|e| Error::transport(peer_id, e))?;
    wait_for_gathering(transport.gathering(), gathering_timeout).await;
    transport
        .local_description()
        .ok_or_else(|| Error::MissingLocalDescription {
            peer_id: peer_id.to_string(),
            stage: "answer",
        })
}

// ── Monitor ──────────────────────────────────────────────────────────────────

/// Follows one transport's state until it closes or its restart budget runs
/// out. A dead peer is removed from the table and its slot released.
async fn monitor_peer(
    peer_id: String,
    transport: Arc<dyn PeerTransport>,
    restart: Arc<RestartController>,
    peers: PeerTable,
    reserved: Arc<AtomicUsize>,
    events: broadcast::Sender<PeerEvent>,
) {
    let mut states = transport.subscribe_state();
    loop {
        let state = *states.borrow_and_update();
        update_state(&peers, &events, &peer_id, state);

        if state == TransportState::Closed {
            break;
        }

        if state.needs_restart() {
            tracing::warn!(peer = %peer_id, ?state, "connection lost, restarting");
            let _ = events.send(PeerEvent::Reconnecting {
                peer_id: peer_id.clone(),
            });
            match restart.initiate_restart(transport.as_ref()).await {
                Ok(RestartOutcome::Restarted { attempt }) => {
                    let _ = events.send(PeerEvent::Recovered {
                        peer_id: peer_id.clone(),
                        attempt,
                    });
                }
                Ok(RestartOutcome::AlreadyInProgress) => {}
                Err(e) if e.class() == ErrorClass::Exhausted => {
                    tracing::error!(peer = %peer_id, error = %e, "peer is dead");
                    update_state(&peers, &events, &peer_id, TransportState::Failed);
                    // `disconnect` may have raced us to the entry.
                    if peers
                        .remove_if(&peer_id, |_, entry| Arc::ptr_eq(&entry.restart, &restart))
                        .is_some()
                    {
                        transport.close().await;
                        release_slot(&reserved);
                    }
                    let _ = events.send(PeerEvent::Dead {
                        peer_id: peer_id.clone(),
                    });
                    break;
                }
                Err(Error::RestartCancelled(_)) => break,
                Err(e) => {
                    // The cycle spent an attempt. Retry while still down.
                    tracing::warn!(peer = %peer_id, error = %e, "restart cycle failed");
                    continue;
                }
            }
        }

        if states.changed().await.is_err() {
            break;
        }
    }
    tracing::debug!(peer = %peer_id, "monitor stopped");
}

fn update_state(peers: &PeerTable, events: &broadcast::Sender<PeerEvent>, peer_id: &str, state: TransportState) {
    let Some(mut entry) = peers.get_mut(peer_id) else {
        return;
    };
    entry.record.state = state;
    let quality = QualityClass::classify(state, entry.record.stats.round_trip_time);
    if quality != entry.record.quality {
        entry.record.quality = quality;
        let _ = events.send(PeerEvent::QualityChanged {
            peer_id: peer_id.to_string(),
            quality,
        });
    }
}
