//! The control-plane client: a periodic heartbeat that doubles as the
//! agent's config pull, plus crash/resource dump reporting.

#![forbid(unsafe_code)]

pub mod dump;
pub mod heartbeat;
pub mod parse;

pub use heartbeat::ControlClient;

/// Version string reported in heartbeats and dump envelopes.
pub const AGENT_VERSION: &str = env!("CARGO_PKG_VERSION");
