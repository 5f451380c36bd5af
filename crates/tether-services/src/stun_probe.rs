//! UDP STUN probe transport — the default `ProbeTransport`.
//!
//! Sends a Binding Request from an ephemeral socket, retransmitting until a
//! response arrives. The outer probe timeout bounds the whole exchange.

use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use tokio::net::{lookup_host, UdpSocket};

use tether_core::server::ServerTransport;
use tether_core::stun::{self, BindingResponse, TransactionId};
use tether_core::{CandidateProtocol, CandidateRecord, CandidateType, ServerUrl};

use crate::prober::{ProbeEvent, ProbeSession, ProbeTransport};

const RETRANSMIT_INTERVAL: Duration = Duration::from_millis(500);
const MAX_DATAGRAM: usize = 1500;

#[derive(Debug, Clone)]
pub struct StunProbeTransport {
    retransmit: Duration,
}

impl StunProbeTransport {
    pub fn new() -> Self {
        Self {
            retransmit: RETRANSMIT_INTERVAL,
        }
    }
}

impl Default for StunProbeTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ProbeTransport for StunProbeTransport {
    async fn open(&self, url: &str) -> Result<Box<dyn ProbeSession>> {
        let parsed: ServerUrl = url.parse().with_context(|| format!("bad server url {url:?}"))?;
        if parsed.transport != ServerTransport::Udp || parsed.scheme.is_tls() {
            bail!("unsupported transport for {url}");
        }

        let target = lookup_host(parsed.authority())
            .await
            .with_context(|| format!("failed to resolve {}", parsed.host))?
            .next()
            .ok_or_else(|| anyhow!("no address for {}", parsed.host))?;

        let bind = if target.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
        let socket = UdpSocket::bind(bind).await.context("failed to bind probe socket")?;
        socket
            .connect(target)
            .await
            .with_context(|| format!("failed to connect probe socket to {target}"))?;

        let txid = stun::new_transaction_id();
        tracing::trace!(%url, %target, txid = %hex::encode(txid), "stun probe opened");
        Ok(Box::new(StunProbeSession {
            socket,
            txid,
            retransmit: self.retransmit,
            finished: false,
        }))
    }
}

struct StunProbeSession {
    socket: UdpSocket,
    txid: TransactionId,
    retransmit: Duration,
    finished: bool,
}

#[async_trait]
impl ProbeSession for StunProbeSession {
    async fn next_event(&mut self) -> Result<ProbeEvent> {
        if self.finished {
            return Ok(ProbeEvent::GatheringComplete);
        }

        let request = stun::binding_request(&self.txid);
        let mut buf = [0u8; MAX_DATAGRAM];
        loop {
            self.socket.send(&request).await.context("failed to send binding request")?;
            let deadline = tokio::time::Instant::now() + self.retransmit;

            loop {
                let n = match tokio::time::timeout_at(deadline, self.socket.recv(&mut buf)).await {
                    Err(_) => break,
                    Ok(received) => received.context("probe socket receive failed")?,
                };
                match stun::parse_binding_response(&buf[..n], &self.txid) {
                    Ok(BindingResponse::Mapped(addr)) => {
                        self.finished = true;
                        return Ok(ProbeEvent::Candidate(CandidateRecord::new(
                            CandidateType::ServerReflexive,
                            CandidateProtocol::Udp,
                            addr,
                            0,
                        )));
                    }
                    Ok(BindingResponse::Error { code }) => {
                        tracing::debug!(code, "binding error response");
                        self.finished = true;
                        return Ok(ProbeEvent::GatheringComplete);
                    }
                    Err(e) => {
                        tracing::trace!(error = %e, "ignoring stray datagram");
                    }
                }
            }
        }
    }
}
