//! Socket pumps: one task per direction plus keepalive.

pub(crate) mod ping;
pub(crate) mod read;
pub(crate) mod write;
