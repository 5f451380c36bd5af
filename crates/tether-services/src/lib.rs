//! tether-services — async orchestration on top of tether-core: server
//! probing, relay credentials, restarts, the peer connection table and
//! group transfers.

pub mod bandwidth;
pub mod connectivity;
pub mod credentials;
pub mod error;
pub mod group;
pub mod peer;
pub mod prober;
pub mod progress;
pub mod restart;
pub mod stun_probe;
pub mod transport;

#[cfg(test)]
mod testing;

pub use bandwidth::{BandwidthLimiter, BandwidthPolicy, EvenSplit, QualityWeighted};
pub use connectivity::ConfigurationBuilder;
pub use credentials::{CredentialSource, HttpCredentialSource, RelayCredentialCache};
pub use error::{Error, ErrorClass, Result};
pub use group::{GroupTransferConfig, GroupTransferCoordinator};
pub use peer::{PeerConnectionManager, PeerEvent, PeerManagerConfig, QualityClass};
pub use prober::{ProbeTransport, ReachabilityProber};
pub use progress::{GroupStatus, GroupTransferResult, Recipient, TransferObserver};
pub use restart::{RestartConfig, RestartController, RestartOutcome};
pub use stun_probe::StunProbeTransport;
pub use transport::{
    EncryptedSession, PeerTransport, SessionDescription, SessionNegotiator, Signaling,
    TransportFactory, TransportState,
};
