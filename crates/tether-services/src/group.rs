//! Group transfer coordinator — fans one file out to N independently
//! encrypted peer sessions.
//!
//! Lifecycle:
//!   1. `initialize_group_transfer` freezes the recipient set.
//!   2. `connect_recipients` opens a session per recipient (optional when the
//!      peers are already connected through the manager).
//!   3. `start_key_exchange` runs the per-recipient handshakes in parallel.
//!   4. `send_to_all` streams manifest + chunks to every ready recipient in
//!      parallel and settles the transfer.
//!
//! One recipient failing never stops the others. The completion callback
//! fires exactly once per transfer. The transfer stays current until it
//! settles, so a new one can't be initialized while it is sending.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use bytes::Bytes;
use futures::future::join_all;
use tokio::time::Instant;

use tether_core::config::TransferConfig;
use tether_core::{ConnectivityConfig, FileManifest};

use crate::bandwidth::{BandwidthLimiter, BandwidthPolicy, EvenSplit};
use crate::error::{Error, Result};
use crate::peer::{PeerConnectionManager, QualityClass};
use crate::progress::{
    FailedRecipient, GroupStatus, GroupTransferResult, GroupTransferState, NoopObserver, Recipient,
    RecipientStatus, RecipientTransferState, TransferObserver,
};
use crate::transport::{EncryptedSession, PeerTransport, SessionNegotiator, TransportState};

const BACKPRESSURE_POLL: Duration = Duration::from_millis(10);
const QUALITY_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct GroupTransferConfig {
    pub chunk_size: usize,
    /// Total outbound ceiling across all recipients, bytes/sec.
    pub bandwidth_limit: Option<u64>,
    pub high_water_mark: u64,
    pub low_water_mark: u64,
    pub backpressure_poll: Duration,
    /// How often each recipient's rate is re-evaluated against link quality.
    pub quality_interval: Duration,
}

impl Default for GroupTransferConfig {
    fn default() -> Self {
        Self::from(&TransferConfig::default())
    }
}

impl From<&TransferConfig> for GroupTransferConfig {
    fn from(cfg: &TransferConfig) -> Self {
        Self {
            chunk_size: cfg.chunk_size.max(1),
            bandwidth_limit: (cfg.bandwidth_limit > 0).then_some(cfg.bandwidth_limit),
            high_water_mark: cfg.high_water_mark,
            low_water_mark: cfg.low_water_mark.min(cfg.high_water_mark),
            backpressure_poll: BACKPRESSURE_POLL,
            quality_interval: QUALITY_INTERVAL,
        }
    }
}

/// Per-recipient connection and encryption slots.
#[derive(Clone, Default)]
struct RecipientSlot {
    transport: Option<Arc<dyn PeerTransport>>,
    session: Option<Arc<dyn EncryptedSession>>,
}

#[derive(Clone)]
struct ActiveTransfer {
    transfer_id: String,
    file_name: String,
    started: Instant,
    recipients: Vec<Recipient>,
    slots: HashMap<String, RecipientSlot>,
    sending: bool,
}

/// Retires the current transfer when `send_to_all` returns or is dropped.
struct Settled<'a>(&'a Mutex<Option<ActiveTransfer>>);

impl Drop for Settled<'_> {
    fn drop(&mut self) {
        *self.0.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }
}

pub struct GroupTransferCoordinator {
    manager: Arc<PeerConnectionManager>,
    negotiator: Arc<dyn SessionNegotiator>,
    observer: Arc<dyn TransferObserver>,
    policy: Arc<dyn BandwidthPolicy>,
    config: GroupTransferConfig,
    active: Mutex<Option<ActiveTransfer>>,
    state: Arc<Mutex<Option<GroupTransferState>>>,
    cancelled: Arc<AtomicBool>,
}

impl GroupTransferCoordinator {
    pub fn new(
        manager: Arc<PeerConnectionManager>,
        negotiator: Arc<dyn SessionNegotiator>,
        config: GroupTransferConfig,
    ) -> Self {
        Self {
            manager,
            negotiator,
            observer: Arc::new(NoopObserver),
            policy: Arc::new(EvenSplit),
            config,
            active: Mutex::new(None),
            state: Arc::new(Mutex::new(None)),
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn TransferObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn with_policy(mut self, policy: Arc<dyn BandwidthPolicy>) -> Self {
        self.policy = policy;
        self
    }

    /// Freeze the recipient set and reserve a slot per recipient.
    pub fn initialize_group_transfer(
        &self,
        transfer_id: &str,
        file_name: &str,
        file_size: u64,
        recipients: Vec<Recipient>,
    ) -> Result<()> {
        let mut active = self.lock_active();
        if let Some(existing) = active.as_ref() {
            return Err(Error::AlreadyInitialized(existing.transfer_id.clone()));
        }

        let mut unique: Vec<Recipient> = Vec::with_capacity(recipients.len());
        for r in recipients {
            if !unique.iter().any(|u| u.id == r.id) {
                unique.push(r);
            }
        }
        if unique.is_empty() {
            return Err(Error::NoRecipients);
        }

        let needed = unique
            .iter()
            .filter(|r| !self.manager.is_connected(&r.id))
            .count();
        if needed > self.manager.available_slots() {
            return Err(Error::CapacityReached(self.manager.max_connections()));
        }

        let slots = unique
            .iter()
            .map(|r| (r.id.clone(), RecipientSlot::default()))
            .collect();
        *self.lock_state() = Some(GroupTransferState {
            transfer_id: transfer_id.to_string(),
            file_name: file_name.to_string(),
            file_size,
            recipients: unique.iter().map(RecipientTransferState::pending).collect(),
        });
        *active = Some(ActiveTransfer {
            transfer_id: transfer_id.to_string(),
            file_name: file_name.to_string(),
            started: Instant::now(),
            recipients: unique,
            slots,
            sending: false,
        });
        self.cancelled.store(false, Ordering::Release);

        tracing::info!(transfer = transfer_id, file = file_name, file_size, "group transfer initialized");
        Ok(())
    }

    /// Create the signaling group and connect every recipient in parallel.
    /// Returns how many recipients are connected.
    pub async fn connect_recipients(&self, config: &ConnectivityConfig) -> Result<usize> {
        let (transfer_id, recipients) = {
            let active = self.lock_active();
            let active = preparing(active.as_ref())?;
            (active.transfer_id.clone(), active.recipients.clone())
        };

        let ids: Vec<String> = recipients.iter().map(|r| r.id.clone()).collect();
        self.manager
            .signaling()
            .create_group(&transfer_id, &ids)
            .await
            .map_err(|e| Error::signaling(&transfer_id, e))?;

        let attempts = recipients.iter().map(|r| async move {
            let result = match self.manager.transport(&r.id) {
                Some(existing) => Ok(existing),
                None => self.manager.connect(&r.id, config).await,
            };
            (r.id.clone(), result)
        });

        let mut connected = 0;
        for (id, result) in join_all(attempts).await {
            match result {
                Ok(transport) => {
                    connected += 1;
                    if let Some(slot) = self.lock_active().as_mut().and_then(|a| a.slots.get_mut(&id)) {
                        slot.transport = Some(transport);
                    }
                }
                Err(e) => self.fail_recipient(&id, &e),
            }
        }
        tracing::info!(transfer = %transfer_id, connected, total = ids.len(), "recipients connected");
        Ok(connected)
    }

    /// Run every recipient's handshake in parallel. Returns how many
    /// recipients are ready to receive.
    pub async fn start_key_exchange(&self) -> Result<usize> {
        let pending: Vec<(String, Option<Arc<dyn PeerTransport>>)> = {
            let active = self.lock_active();
            let active = preparing(active.as_ref())?;
            active
                .recipients
                .iter()
                .filter(|r| !self.is_failed(&r.id))
                .map(|r| {
                    let slot = active.slots.get(&r.id);
                    let transport = slot
                        .and_then(|s| s.transport.clone())
                        .or_else(|| self.manager.transport(&r.id));
                    (r.id.clone(), transport)
                })
                .collect()
        };

        let handshakes = pending.into_iter().map(|(id, transport)| async move {
            let result = match transport.clone() {
                None => Err(Error::Recipient {
                    recipient: id.clone(),
                    reason: "not connected".into(),
                }),
                Some(t) => self.negotiator.negotiate(&id, t).await.map_err(|e| Error::Recipient {
                    recipient: id.clone(),
                    reason: format!("handshake failed: {e:#}"),
                }),
            };
            (id, transport, result)
        });

        let mut ready = 0;
        for (id, transport, result) in join_all(handshakes).await {
            match result {
                Ok(session) => {
                    ready += 1;
                    tracing::debug!(recipient = %id, "handshake complete");
                    if let Some(slot) = self.lock_active().as_mut().and_then(|a| a.slots.get_mut(&id)) {
                        slot.transport = transport;
                        slot.session = Some(session);
                    }
                }
                Err(e) => self.fail_recipient(&id, &e),
            }
        }
        Ok(ready)
    }

    /// Stream `payload` to every ready recipient and settle the transfer.
    pub async fn send_to_all(&self, payload: Bytes) -> Result<GroupTransferResult> {
        let active = {
            let mut current = self.lock_active();
            let current = current.as_mut().ok_or(Error::NotInitialized)?;
            if current.sending {
                return Err(Error::TransferInProgress(current.transfer_id.clone()));
            }
            current.sending = true;
            current.clone()
        };
        let _settled = Settled(&self.active);

        let manifest = FileManifest::for_payload(
            &active.transfer_id,
            &active.file_name,
            &payload,
            self.config.chunk_size,
        );
        if let Some(state) = self.lock_state().as_ref() {
            if state.file_size != manifest.file_size {
                tracing::warn!(
                    declared = state.file_size,
                    actual = manifest.file_size,
                    "payload size differs from the initialized file size"
                );
            }
        }
        let manifest_frame = match manifest.to_bytes() {
            Ok(bytes) => Bytes::from(bytes),
            Err(e) => {
                let err = Error::Recipient {
                    recipient: "*".into(),
                    reason: format!("manifest encoding failed: {e}"),
                };
                for r in &active.recipients {
                    self.fail_recipient(&r.id, &err);
                }
                return Ok(self.settle(&active));
            }
        };

        let mut ready = Vec::new();
        for r in &active.recipients {
            if self.is_failed(&r.id) {
                continue;
            }
            match active.slots.get(&r.id) {
                Some(RecipientSlot {
                    transport: Some(t),
                    session: Some(s),
                }) => ready.push((r.id.clone(), t.clone(), s.clone())),
                _ => self.fail_recipient(&r.id, &Error::HandshakeIncomplete(r.id.clone())),
            }
        }

        let recipients = ready.len();
        tracing::info!(
            transfer = %active.transfer_id,
            recipients,
            bytes = payload.len(),
            chunks = manifest.chunk_count,
            "group send started"
        );

        let mut tasks = Vec::with_capacity(recipients);
        for (id, transport, session) in ready {
            let stream = RecipientStream {
                id: id.clone(),
                transport,
                session,
                manager: self.manager.clone(),
                policy: self.policy.clone(),
                observer: self.observer.clone(),
                state: self.state.clone(),
                cancelled: self.cancelled.clone(),
                config: self.config.clone(),
                recipients,
            };
            let payload = payload.clone();
            let manifest_frame = manifest_frame.clone();
            tasks.push((id, tokio::spawn(stream.run(manifest_frame, payload))));
        }

        for (id, task) in tasks {
            let outcome = match task.await {
                Ok(outcome) => outcome,
                Err(e) => Err(Error::Recipient {
                    recipient: id.clone(),
                    reason: format!("send task aborted: {e}"),
                }),
            };
            match outcome {
                Ok(()) => {
                    self.update_recipient(&id, |r| {
                        r.status = RecipientStatus::Succeeded;
                        r.progress = 100;
                    });
                    tracing::info!(recipient = %id, "recipient complete");
                    self.observer.on_recipient_complete(&id);
                }
                Err(e) => self.fail_recipient(&id, &e),
            }
        }

        if let Err(e) = self.manager.signaling().leave_group(&active.transfer_id).await {
            tracing::warn!(transfer = %active.transfer_id, error = %e, "failed to leave signaling group");
        }
        Ok(self.settle(&active))
    }

    /// Ask every recipient stream to stop after its current chunk.
    pub fn cancel(&self) {
        if !self.cancelled.swap(true, Ordering::AcqRel) {
            tracing::info!("group transfer cancel requested");
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Snapshot of the current (or last settled) transfer.
    pub fn state(&self) -> Option<GroupTransferState> {
        self.lock_state().clone()
    }

    fn settle(&self, active: &ActiveTransfer) -> GroupTransferResult {
        let snapshot = self.state().unwrap_or_else(|| GroupTransferState {
            transfer_id: active.transfer_id.clone(),
            file_name: active.file_name.clone(),
            file_size: 0,
            recipients: Vec::new(),
        });
        let result = GroupTransferResult {
            transfer_id: active.transfer_id.clone(),
            successful_recipients: snapshot
                .recipients
                .iter()
                .filter(|r| r.status == RecipientStatus::Succeeded)
                .map(|r| r.id.clone())
                .collect(),
            failed_recipients: snapshot
                .recipients
                .iter()
                .filter(|r| r.status == RecipientStatus::Failed)
                .map(|r| FailedRecipient {
                    id: r.id.clone(),
                    error: r.error.clone().unwrap_or_default(),
                })
                .collect(),
            status: snapshot.status(),
            duration: active.started.elapsed(),
        };
        tracing::info!(
            transfer = %result.transfer_id,
            status = ?result.status,
            ok = result.successful_recipients.len(),
            failed = result.failed_recipients.len(),
            duration_ms = result.duration.as_millis() as u64,
            "group transfer settled"
        );
        self.observer.on_complete(&result);
        result
    }

    fn fail_recipient(&self, id: &str, err: &Error) {
        let message = err.to_string();
        self.update_recipient(id, |r| {
            r.status = RecipientStatus::Failed;
            r.error = Some(message.clone());
        });
        tracing::warn!(recipient = id, error = %err, "recipient failed");
        self.observer.on_recipient_error(id, err);
    }

    fn is_failed(&self, id: &str) -> bool {
        self.lock_state()
            .as_ref()
            .and_then(|s| s.recipients.iter().find(|r| r.id == id))
            .is_some_and(|r| r.status == RecipientStatus::Failed)
    }

    fn update_recipient(&self, id: &str, f: impl FnOnce(&mut RecipientTransferState)) {
        update_recipient(&self.state, id, f);
    }

    fn lock_active(&self) -> MutexGuard<'_, Option<ActiveTransfer>> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_state(&self) -> MutexGuard<'_, Option<GroupTransferState>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// The current transfer, if it is still taking setup calls.
fn preparing(active: Option<&ActiveTransfer>) -> Result<&ActiveTransfer> {
    match active {
        None => Err(Error::NotInitialized),
        Some(a) if a.sending => Err(Error::TransferInProgress(a.transfer_id.clone())),
        Some(a) => Ok(a),
    }
}

fn update_recipient(
    state: &Mutex<Option<GroupTransferState>>,
    id: &str,
    f: impl FnOnce(&mut RecipientTransferState),
) {
    let mut guard = state.lock().unwrap_or_else(PoisonError::into_inner);
    if let Some(r) = guard
        .as_mut()
        .and_then(|s| s.recipients.iter_mut().find(|r| r.id == id))
    {
        f(r);
    }
}

// ── Per-recipient stream ─────────────────────────────────────────────────────

struct RecipientStream {
    id: String,
    transport: Arc<dyn PeerTransport>,
    session: Arc<dyn EncryptedSession>,
    manager: Arc<PeerConnectionManager>,
    policy: Arc<dyn BandwidthPolicy>,
    observer: Arc<dyn TransferObserver>,
    state: Arc<Mutex<Option<GroupTransferState>>>,
    cancelled: Arc<AtomicBool>,
    config: GroupTransferConfig,
    recipients: usize,
}

impl RecipientStream {
    async fn run(self, manifest: Bytes, payload: Bytes) -> Result<()> {
        let total = self.config.bandwidth_limit;
        let mut quality = self.quality().await;
        let limiter = BandwidthLimiter::new(self.policy.allocate(total, self.recipients, quality));
        tracing::debug!(recipient = %self.id, rate = ?limiter.rate(), "recipient stream started");

        update_recipient(&self.state, &self.id, |r| r.status = RecipientStatus::Transferring);
        self.send_frame(&manifest).await?;

        let started = Instant::now();
        let mut last_quality_check = started;
        let mut sent: u64 = 0;
        let mut last_progress = 0u8;
        let size = payload.len() as u64;

        let chunk_size = self.config.chunk_size.max(1);
        for offset in (0..payload.len()).step_by(chunk_size) {
            if self.cancelled.load(Ordering::Acquire) {
                return Err(Error::Cancelled);
            }
            self.relieve_backpressure().await?;

            if last_quality_check.elapsed() >= self.config.quality_interval {
                last_quality_check = Instant::now();
                let current = self.quality().await;
                if current != quality {
                    quality = current;
                    let rate = self.policy.allocate(total, self.recipients, quality);
                    tracing::debug!(recipient = %self.id, ?quality, ?rate, "rate reallocated");
                    limiter.set_rate(rate);
                }
            }

            let end = (offset + chunk_size).min(payload.len());
            let chunk = payload.slice(offset..end);
            limiter.acquire(chunk.len() as u64).await;
            self.send_frame(&chunk).await?;

            sent += chunk.len() as u64;
            let progress = ((sent * 100) / size.max(1)) as u8;
            if progress != last_progress {
                last_progress = progress;
                let secs = started.elapsed().as_secs_f64();
                let speed = if secs > 0.0 { (sent as f64 / secs) as u64 } else { 0 };
                let overall = {
                    let mut guard = self.state.lock().unwrap_or_else(PoisonError::into_inner);
                    guard.as_mut().map(|s| {
                        if let Some(r) = s.recipients.iter_mut().find(|r| r.id == self.id) {
                            r.progress = progress;
                            r.speed = speed;
                            r.bytes_sent = sent;
                        }
                        s.progress()
                    })
                };
                self.observer.on_recipient_progress(&self.id, progress, speed);
                if let Some(overall) = overall {
                    self.observer.on_overall_progress(overall);
                }
            }
        }
        Ok(())
    }

    async fn send_frame(&self, plaintext: &[u8]) -> Result<()> {
        let sealed = self
            .session
            .seal(plaintext)
            .map_err(|e| Error::Recipient {
                recipient: self.id.clone(),
                reason: format!("encryption failed: {e:#}"),
            })?;
        self.transport
            .send(sealed)
            .await
            .map_err(|e| Error::transport(&self.id, e))
    }

    /// Above the high-water mark, wait until the queue drains to the low
    /// one.
    async fn relieve_backpressure(&self) -> Result<()> {
        if self.transport.buffered_amount() <= self.config.high_water_mark {
            return Ok(());
        }
        tracing::trace!(recipient = %self.id, "backpressure");
        while self.transport.buffered_amount() > self.config.low_water_mark {
            if self.cancelled.load(Ordering::Acquire) {
                return Err(Error::Cancelled);
            }
            if self.transport.state() == TransportState::Closed {
                return Err(Error::transport(
                    &self.id,
                    anyhow::anyhow!("transport closed while draining"),
                ));
            }
            tokio::time::sleep(self.config.backpressure_poll).await;
        }
        Ok(())
    }

    /// Fresh link quality from the manager's stats, or from the transport
    /// state alone when the peer isn't managed.
    async fn quality(&self) -> QualityClass {
        match self.manager.refresh_stats(&self.id).await {
            Ok(record) => record.quality,
            Err(e) => {
                tracing::trace!(recipient = %self.id, error = %e, "stats unavailable");
                QualityClass::classify(self.transport.state(), None)
            }
        }
    }
}
