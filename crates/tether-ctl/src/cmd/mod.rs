//! CLI command modules.

pub mod config;
pub mod credentials;
pub mod policy;
pub mod probe;
pub mod services;
