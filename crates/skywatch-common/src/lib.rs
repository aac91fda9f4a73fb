//! This crate provides shared functionality used by the other crates in the
//! project: signing primitives, encoding/decoding helpers, properties-file
//! configuration, a mockable clock, and the narrow host-facts surface.

#![forbid(unsafe_code)]

pub mod clock;
pub mod config;
pub mod crypto;
pub mod encoding;
pub mod host;
pub mod properties;
