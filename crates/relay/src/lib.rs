//! Relay HTTP client.
//!
//! Resolves a relay socket URL to its HTTP API base(s) and performs the
//! JSON requests used for pairing and device-credential management.

pub mod base;
pub mod client;

pub use base::api_bases;
pub use client::{RelayApi, RelayClient, RelayError};
