//! Persisted client configuration.
//!
//! Holds the device identity, paired host profiles, the delete-compensation
//! queue, tool alias/visibility maps and a bounded operation log, stored as
//! a single JSON document (schema version 2).

pub mod config;
pub mod oplog;
pub mod types;

pub use config::{
    ConfigStore, PersistedConfig, SCHEMA_VERSION, SettingsError, default_config_path,
    default_credentials_dir,
};
pub use oplog::{LogEntry, LogLevel, OperationLog};
pub use types::{DeviceIdentity, HostProfile, PendingHostDelete};
