//! tether-core — shared types, candidate processing, connectivity policy,
//! and the STUN binding codec. All other Tether crates depend on this one.

pub mod candidate;
pub mod config;
pub mod manifest;
pub mod policy;
pub mod server;
pub mod stun;

pub use candidate::{CandidateFilter, CandidateProtocol, CandidateRecord, CandidateType};
pub use manifest::FileManifest;
pub use policy::{BundlePolicy, ConnectivityConfig, NatClass, Nomination, TransportPolicy};
pub use server::{CachedCredentialSet, ProbeResult, ServerDescriptor, ServerUrl};
