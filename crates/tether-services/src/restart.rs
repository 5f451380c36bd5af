//! Restart controller — per-peer recovery for connections that degrade or
//! fail.
//!
//! States:
//!
//!   Idle ──initiate──▶ Restarting ──success──▶ Idle
//!                        │    ▲
//!                        │    └── attempt failed, backoff
//!                        └── budget spent ──▶ Exhausted (terminal)
//!
//! One controller per peer. At most one cycle runs at a time; a second
//! `initiate_restart` while one is running is a no-op. The attempt counter
//! only resets on success.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tokio::sync::watch;

use tether_core::policy::RELAY_GATHERING_TIMEOUT;

use crate::error::{Error, ErrorClass, Result};
use crate::transport::{wait_for_gathering, GatheringOutcome, PeerTransport, SessionDescription, Signaling};

/// Delay before attempt N (1-based). Attempts past the end reuse the last.
pub const BACKOFF_SCHEDULE: [Duration; 3] = [
    Duration::from_secs(1),
    Duration::from_secs(2),
    Duration::from_secs(4),
];

pub const MAX_RESTART_ATTEMPTS: u32 = 3;

#[derive(Debug, Clone)]
pub struct RestartConfig {
    pub max_attempts: u32,
    pub backoff: Vec<Duration>,
    /// Bound on candidate gathering for the restart offer.
    pub gathering_timeout: Duration,
}

impl Default for RestartConfig {
    fn default() -> Self {
        Self {
            max_attempts: MAX_RESTART_ATTEMPTS,
            backoff: BACKOFF_SCHEDULE.to_vec(),
            gathering_timeout: RELAY_GATHERING_TIMEOUT,
        }
    }
}

impl RestartConfig {
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let idx = (attempt.max(1) as usize - 1).min(self.backoff.len().saturating_sub(1));
        self.backoff.get(idx).copied().unwrap_or(Duration::ZERO)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartPhase {
    Idle,
    Restarting,
    Exhausted,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestartState {
    pub peer_id: String,
    pub attempt: u32,
    pub max_attempts: u32,
    pub in_progress: bool,
    pub last_attempt_time: Option<Instant>,
}

impl RestartState {
    pub fn phase(&self) -> RestartPhase {
        if self.in_progress {
            RestartPhase::Restarting
        } else if self.attempt >= self.max_attempts {
            RestartPhase::Exhausted
        } else {
            RestartPhase::Idle
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartOutcome {
    /// The connection was renegotiated on this attempt.
    Restarted { attempt: u32 },
    /// Another cycle was already running; nothing was done.
    AlreadyInProgress,
}

pub struct RestartController {
    peer_id: String,
    signaling: Arc<dyn Signaling>,
    config: RestartConfig,
    state: Mutex<RestartState>,
    /// Bumped by `reset`/`destroy` to abort a running cycle.
    cancel: watch::Sender<u64>,
    destroyed: AtomicBool,
}

/// Clears `in_progress` however the cycle ends, including when the
/// caller's future is dropped.
struct CycleGuard<'a>(&'a Mutex<RestartState>);

impl Drop for CycleGuard<'_> {
    fn drop(&mut self) {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).in_progress = false;
    }
}

impl RestartController {
    pub fn new(peer_id: impl Into<String>, signaling: Arc<dyn Signaling>, config: RestartConfig) -> Self {
        let peer_id = peer_id.into();
        Self {
            state: Mutex::new(RestartState {
                peer_id: peer_id.clone(),
                attempt: 0,
                max_attempts: config.max_attempts,
                in_progress: false,
                last_attempt_time: None,
            }),
            peer_id,
            signaling,
            config,
            cancel: watch::channel(0).0,
            destroyed: AtomicBool::new(false),
        }
    }

    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    pub fn state(&self) -> RestartState {
        self.lock_state().clone()
    }

    pub fn phase(&self) -> RestartPhase {
        self.lock_state().phase()
    }

    /// Run a restart cycle against `transport`.
    pub async fn initiate_restart(&self, transport: &dyn PeerTransport) -> Result<RestartOutcome> {
        if self.destroyed.load(Ordering::Acquire) {
            return Err(Error::RestartCancelled(self.peer_id.clone()));
        }
        {
            let mut state = self.lock_state();
            if state.in_progress {
                tracing::debug!(peer = %self.peer_id, "restart already in progress");
                return Ok(RestartOutcome::AlreadyInProgress);
            }
            if state.attempt >= state.max_attempts {
                return Err(Error::RestartExhausted {
                    peer_id: self.peer_id.clone(),
                    attempts: state.attempt,
                });
            }
            state.in_progress = true;
        }
        let _guard = CycleGuard(&self.state);
        let mut cancel_rx = self.cancel.subscribe();

        loop {
            let attempt = {
                let mut state = self.lock_state();
                state.attempt += 1;
                state.last_attempt_time = Some(tokio::time::Instant::now().into_std());
                state.attempt
            };
            let delay = self.config.backoff_for(attempt);
            tracing::info!(
                peer = %self.peer_id,
                attempt,
                max = self.config.max_attempts,
                delay_ms = delay.as_millis() as u64,
                "restart scheduled"
            );

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = cancel_rx.changed() => {
                    tracing::debug!(peer = %self.peer_id, "restart backoff cancelled");
                    return Err(Error::RestartCancelled(self.peer_id.clone()));
                }
            }

            match self.attempt_once(transport, &cancel_rx).await {
                Ok(()) => {
                    self.lock_state().attempt = 0;
                    tracing::info!(peer = %self.peer_id, attempt, "restart succeeded");
                    return Ok(RestartOutcome::Restarted { attempt });
                }
                Err(e) if matches!(e, Error::RestartCancelled(_)) => return Err(e),
                Err(e) if e.class() == ErrorClass::Fatal => {
                    tracing::error!(peer = %self.peer_id, attempt, error = %e, "restart cycle aborted");
                    return Err(e);
                }
                Err(e) => {
                    tracing::warn!(peer = %self.peer_id, attempt, error = %e, "restart attempt failed");
                    if attempt >= self.config.max_attempts {
                        tracing::error!(peer = %self.peer_id, attempts = attempt, "restart attempts exhausted");
                        return Err(Error::RestartExhausted {
                            peer_id: self.peer_id.clone(),
                            attempts: attempt,
                        });
                    }
                }
            }
        }
    }

    async fn attempt_once(&self, transport: &dyn PeerTransport, cancel_rx: &watch::Receiver<u64>) -> Result<()> {
        let peer = self.peer_id.as_str();

        let offer = transport
            .create_offer(true)
            .await
            .map_err(|e| Error::transport(peer, e))?;
        transport
            .set_local_description(offer)
            .await
            .map_err(|e| Error::transport(peer, e))?;

        if wait_for_gathering(transport.gathering(), self.config.gathering_timeout).await
            == GatheringOutcome::TimedOut
        {
            tracing::debug!(peer, "gathering timed out, offering partial candidates");
        }

        let local = transport
            .local_description()
            .ok_or_else(|| Error::MissingLocalDescription {
                peer_id: peer.to_string(),
                stage: "restart offer",
            })?;
        let answer = self
            .signaling
            .send_restart_offer(peer, local)
            .await
            .map_err(|e| Error::signaling(peer, e))?;

        if cancel_rx.has_changed().unwrap_or(true) {
            return Err(Error::RestartCancelled(peer.to_string()));
        }
        transport
            .set_remote_description(answer)
            .await
            .map_err(|e| Error::transport(peer, e))
    }

    /// Answer a restart initiated by the remote side. Returns the local
    /// answer to relay back through signaling.
    pub async fn handle_remote_restart_offer(
        &self,
        transport: &dyn PeerTransport,
        offer: SessionDescription,
    ) -> Result<SessionDescription> {
        let peer = self.peer_id.as_str();
        tracing::info!(peer, "remote restart offer");

        transport
            .set_remote_description(offer)
            .await
            .map_err(|e| Error::transport(peer, e))?;
        let answer = transport
            .create_answer()
            .await
            .map_err(|e| Error::transport(peer, e))?;
        transport
            .set_local_description(answer)
            .await
            .map_err(|e| Error::transport(peer, e))?;
        wait_for_gathering(transport.gathering(), self.config.gathering_timeout).await;

        transport
            .local_description()
            .ok_or_else(|| Error::MissingLocalDescription {
                peer_id: peer.to_string(),
                stage: "restart answer",
            })
    }

    /// Cancel any pending backoff and clear the attempt counter.
    pub fn reset(&self) {
        self.cancel.send_modify(|epoch| *epoch += 1);
        self.lock_state().attempt = 0;
    }

    /// Cancel any pending backoff; later restarts return `RestartCancelled`.
    pub fn destroy(&self) {
        if !self.destroyed.swap(true, Ordering::AcqRel) {
            tracing::debug!(peer = %self.peer_id, "restart controller destroyed");
        }
        self.cancel.send_modify(|epoch| *epoch += 1);
    }

    fn lock_state(&self) -> MutexGuard<'_, RestartState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
