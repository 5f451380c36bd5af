//! Orchestration errors and their recovery class.

use std::time::Duration;

/// How the caller is expected to react to an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// One probe or restart attempt failed; retried internally.
    Transient,
    /// Restart budget spent. The connection is dead; recreate it.
    Exhausted,
    /// Setup problem (missing relay, capacity, call order). Degrade or fix
    /// the call; never retried.
    Configuration,
    /// One recipient of a group transfer failed; the others continue.
    IsolatedRecipient,
    /// Local state is broken; abort the current cycle for that peer.
    Fatal,
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("transport error for {peer_id}: {source}")]
    Transport {
        peer_id: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("signaling error for {peer_id}: {source}")]
    Signaling {
        peer_id: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("timed out after {0:?} waiting for {1}")]
    Timeout(Duration, &'static str),

    #[error("credential endpoint failed: {0}")]
    Credentials(#[source] anyhow::Error),

    #[error("restart attempts exhausted for {peer_id} after {attempts} attempts")]
    RestartExhausted { peer_id: String, attempts: u32 },

    #[error("restart for {0} was cancelled")]
    RestartCancelled(String),

    #[error("{peer_id} has no local description after {stage}")]
    MissingLocalDescription { peer_id: String, stage: &'static str },

    #[error("relay required but none is provisioned")]
    RelayUnavailable,

    #[error("connection limit of {0} peers reached")]
    CapacityReached(usize),

    #[error("peer {0} is already connected")]
    AlreadyConnected(String),

    #[error("unknown peer {0}")]
    UnknownPeer(String),

    #[error("recipient {recipient} failed: {reason}")]
    Recipient { recipient: String, reason: String },

    #[error("handshake with {0} has not completed")]
    HandshakeIncomplete(String),

    #[error("no group transfer has been initialized")]
    NotInitialized,

    #[error("group transfer {0} is already initialized")]
    AlreadyInitialized(String),

    #[error("group transfer {0} is already sending")]
    TransferInProgress(String),

    #[error("a group transfer needs at least one recipient")]
    NoRecipients,

    #[error("transfer cancelled")]
    Cancelled,
}

impl Error {
    pub fn transport(peer_id: &str, source: anyhow::Error) -> Self {
        Error::Transport {
            peer_id: peer_id.to_string(),
            source,
        }
    }

    pub fn signaling(peer_id: &str, source: anyhow::Error) -> Self {
        Error::Signaling {
            peer_id: peer_id.to_string(),
            source,
        }
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            Error::Transport { .. }
            | Error::Signaling { .. }
            | Error::Timeout(..)
            | Error::Credentials(_)
            | Error::RestartCancelled(_) => ErrorClass::Transient,
            Error::RestartExhausted { .. } => ErrorClass::Exhausted,
            Error::RelayUnavailable
            | Error::CapacityReached(_)
            | Error::AlreadyConnected(_)
            | Error::UnknownPeer(_)
            | Error::NotInitialized
            | Error::AlreadyInitialized(_)
            | Error::TransferInProgress(_)
            | Error::NoRecipients => ErrorClass::Configuration,
            Error::Recipient { .. } | Error::HandshakeIncomplete(_) | Error::Cancelled => {
                ErrorClass::IsolatedRecipient
            }
            Error::MissingLocalDescription { .. } => ErrorClass::Fatal,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
