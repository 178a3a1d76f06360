//! Multi-host connection manager.
//!
//! Owns one relay WebSocket per paired host, keeps session credentials
//! fresh, reconnects with backoff, tracks remote tool state and runs the
//! pairing and host-removal flows.

pub mod bridge;
pub mod error;
pub mod hooks;
mod ingest;
mod manager;
mod outbound;
pub mod pairing;
pub(crate) mod pumps;
mod reconnection;
pub(crate) mod registry;
pub mod saga;
pub mod session;
pub(crate) mod signing;
pub mod socket;
pub(crate) mod timers;
pub mod types;

#[cfg(test)]
pub(crate) mod testing;

pub use bridge::{CredentialBridge, FileCredentialStore};
pub use error::{BridgeError, ConnectionError};
pub use hooks::{ChannelHooks, HostHooks, NoopHooks};
pub use manager::ConnectionManager;
pub use saga::{SagaFailure, SagaFailureKind, SagaReport};
pub use socket::{Connector, SocketEvent, SocketEvents, SocketHandle, WsConnector};
pub use types::*;
