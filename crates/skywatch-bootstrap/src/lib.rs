//! One-shot network identity bring-up: read the access key, derive the
//! serial number, wait for DNS, and pick a reachable control-plane tunnel.

#![forbid(unsafe_code)]

pub mod access_key;
pub mod dns;
pub mod proxy;
pub mod serial;

pub use proxy::{ProxyInfo, ProxyManager};
