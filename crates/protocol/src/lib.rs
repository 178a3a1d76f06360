//! Wire protocol shared by the hostlink client and the relay.
//!
//! Covers the event envelope exchanged over the duplex socket, the typed
//! payloads carried inside it, the relay HTTP request/response bodies, and
//! the canonical strings that get signed with the device key.

pub mod api;
pub mod auth;
pub mod constants;
pub mod envelope;
pub mod events;

// Re-export primary types for convenience.
pub use constants::EventType;
pub use envelope::Envelope;
pub use events::{InboundEvent, ToolAction, ToolInfo};
