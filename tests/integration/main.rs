//! Tether integration tests.
//!
//! Everything runs in-process: peers sit behind simulated transports and
//! signaling (see `infra`), and discovery servers are loopback UDP sockets.
//! Time-dependent scenarios run on tokio's paused clock.
//!
//!   cargo test --test integration

mod infra;

mod group;
mod restart;
mod sessions;
