//! Configuration document and its on-disk store.
//!
//! Reads `~/.config/hostlink/config.json`. A legacy single-host document
//! (no `version`, or `version: 1`) is migrated into the list form on load.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::oplog::{LogEntry, OperationLog};
use crate::types::{DeviceIdentity, HostProfile, PendingHostDelete, same_relay};

/// Current configuration schema version.
pub const SCHEMA_VERSION: u32 = 2;

/// Errors from configuration operations.
#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("unsupported config schema version {0}")]
    UnsupportedVersion(u64),
}

/// The persisted configuration document (schema version 2).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedConfig {
    pub version: u32,
    pub device: DeviceIdentity,
    #[serde(default)]
    pub hosts: Vec<HostProfile>,
    #[serde(default)]
    pub pending_deletes: Vec<PendingHostDelete>,
    /// Display aliases keyed by logical tool id.
    #[serde(default)]
    pub tool_aliases: HashMap<String, String>,
    /// Visibility flags keyed by logical tool id.
    #[serde(default)]
    pub tool_visibility: HashMap<String, bool>,
    #[serde(default)]
    pub operation_log: OperationLog,
    #[serde(default)]
    pub last_debug_message: String,
}

impl PersistedConfig {
    /// Creates an empty configuration with a fresh device identity.
    pub fn new(device: DeviceIdentity) -> Self {
        Self {
            version: SCHEMA_VERSION,
            device,
            hosts: Vec::new(),
            pending_deletes: Vec::new(),
            tool_aliases: HashMap::new(),
            tool_visibility: HashMap::new(),
            operation_log: OperationLog::default(),
            last_debug_message: String::new(),
        }
    }

    pub fn host(&self, host_id: &str) -> Option<&HostProfile> {
        self.hosts.iter().find(|h| h.host_id == host_id)
    }

    pub fn host_mut(&mut self, host_id: &str) -> Option<&mut HostProfile> {
        self.hosts.iter_mut().find(|h| h.host_id == host_id)
    }

    /// Finds the host paired at `(system_id, relay_url)`.
    pub fn find_host(&self, system_id: &str, relay_url: &str) -> Option<&HostProfile> {
        self.hosts.iter().find(|h| h.matches(system_id, relay_url))
    }

    /// Inserts or replaces a host profile by `host_id`.
    pub fn upsert_host(&mut self, host: HostProfile) {
        match self.host_mut(&host.host_id) {
            Some(existing) => *existing = host,
            None => self.hosts.push(host),
        }
    }

    pub fn remove_host(&mut self, host_id: &str) -> Option<HostProfile> {
        let idx = self.hosts.iter().position(|h| h.host_id == host_id)?;
        Some(self.hosts.remove(idx))
    }

    /// Queues a delete-compensation item, replacing one for the same host.
    pub fn queue_delete(&mut self, item: PendingHostDelete) {
        self.pending_deletes.retain(|p| p.host_id != item.host_id);
        self.pending_deletes.push(item);
    }

    /// Drops queued deletes for `(system_id, relay_url)`. Returns how many.
    pub fn remove_pending_deletes_for(&mut self, system_id: &str, relay_url: &str) -> usize {
        let before = self.pending_deletes.len();
        self.pending_deletes
            .retain(|p| !(p.system_id == system_id && same_relay(&p.relay_url, relay_url)));
        before - self.pending_deletes.len()
    }

    pub fn remove_pending_delete(&mut self, host_id: &str) -> Option<PendingHostDelete> {
        let idx = self
            .pending_deletes
            .iter()
            .position(|p| p.host_id == host_id)?;
        Some(self.pending_deletes.remove(idx))
    }

    pub fn push_log(&mut self, entry: LogEntry) {
        self.operation_log.push(entry);
    }
}

/// Single-host document written by earlier releases.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LegacyConfig {
    #[serde(default)]
    device_id: String,
    #[serde(default)]
    device_name: String,
    #[serde(default)]
    relay_url: String,
    #[serde(default)]
    system_id: String,
    #[serde(default)]
    host_name: String,
    #[serde(default)]
    auto_connect: Option<bool>,
    #[serde(default)]
    paired_at: Option<DateTime<Utc>>,
    #[serde(default)]
    tool_aliases: HashMap<String, String>,
    #[serde(default)]
    tool_visibility: HashMap<String, bool>,
    #[serde(default)]
    last_debug_message: String,
}

impl LegacyConfig {
    fn migrate(self) -> PersistedConfig {
        let mut device = DeviceIdentity::generate();
        if !self.device_id.is_empty() {
            device.device_id = self.device_id;
        }
        if !self.device_name.is_empty() {
            device.device_name = self.device_name;
        }

        let mut config = PersistedConfig::new(device);
        if !self.system_id.is_empty() && !self.relay_url.is_empty() {
            let mut host = HostProfile::new(&self.system_id, &self.relay_url, &self.host_name);
            if let Some(paired_at) = self.paired_at {
                host.paired_at = paired_at;
            }
            host.auto_connect = self.auto_connect.unwrap_or(true);
            config.hosts.push(host);
        }
        config.tool_aliases = self.tool_aliases;
        config.tool_visibility = self.tool_visibility;
        config.last_debug_message = self.last_debug_message;
        config
    }
}

/// Parses a configuration document. Returns `true` when it was migrated.
pub fn parse_config(content: &str) -> Result<(PersistedConfig, bool), SettingsError> {
    let value: serde_json::Value = serde_json::from_str(content)?;
    match value.get("version").and_then(serde_json::Value::as_u64) {
        Some(v) if v == u64::from(SCHEMA_VERSION) => Ok((serde_json::from_value(value)?, false)),
        None | Some(1) => {
            let legacy: LegacyConfig = serde_json::from_value(value)?;
            Ok((legacy.migrate(), true))
        }
        Some(v) => Err(SettingsError::UnsupportedVersion(v)),
    }
}

/// Configuration document bound to its file.
#[derive(Debug)]
pub struct ConfigStore {
    path: Option<PathBuf>,
    config: PersistedConfig,
}

impl ConfigStore {
    /// Loads the configuration at `path`, creating it when missing and
    /// rewriting it when a legacy document was migrated.
    pub fn open(path: PathBuf) -> Result<Self, SettingsError> {
        let (config, needs_save) = if path.exists() {
            let content = std::fs::read_to_string(&path)?;
            let (config, migrated) = parse_config(&content)?;
            if migrated {
                info!(path = %path.display(), hosts = config.hosts.len(), "migrated legacy config");
            }
            (config, migrated)
        } else {
            (PersistedConfig::new(DeviceIdentity::generate()), true)
        };

        let store = Self {
            path: Some(path),
            config,
        };
        if needs_save {
            store.save()?;
        }
        Ok(store)
    }

    /// A store that never touches disk.
    pub fn in_memory(config: PersistedConfig) -> Self {
        Self { path: None, config }
    }

    pub fn config(&self) -> &PersistedConfig {
        &self.config
    }

    pub fn config_mut(&mut self) -> &mut PersistedConfig {
        &mut self.config
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Writes the current configuration to disk.
    pub fn save(&self) -> Result<(), SettingsError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(&self.config)?;
        // Replace atomically so a crash never leaves a truncated file.
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, json)?;
        set_permissions_0600(&tmp);
        if let Err(e) = std::fs::rename(&tmp, path) {
            let _ = std::fs::remove_file(&tmp);
            return Err(e.into());
        }
        debug!(
            path = %path.display(),
            hosts = self.config.hosts.len(),
            pending_deletes = self.config.pending_deletes.len(),
            "configuration saved"
        );
        Ok(())
    }
}

fn set_permissions_0600(path: &Path) {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let _ = std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600));
    }
    #[cfg(not(unix))]
    {
        let _ = path;
    }
}

/// Returns the default configuration path.
pub fn default_config_path() -> Option<PathBuf> {
    config_dir().map(|d| d.join("hostlink").join("config.json"))
}

/// Returns the default credential store directory.
pub fn default_credentials_dir() -> Option<PathBuf> {
    config_dir().map(|d| d.join("hostlink").join("credentials"))
}

/// Returns the platform-specific config directory.
fn config_dir() -> Option<PathBuf> {
    #[cfg(target_os = "linux")]
    {
        std::env::var("XDG_CONFIG_HOME")
            .ok()
            .map(PathBuf::from)
            .or_else(|| {
                std::env::var("HOME")
                    .ok()
                    .map(|h| PathBuf::from(h).join(".config"))
            })
    }

    #[cfg(target_os = "windows")]
    {
        std::env::var("APPDATA").ok().map(PathBuf::from)
    }

    #[cfg(not(any(target_os = "linux", target_os = "windows")))]
    {
        std::env::var("HOME")
            .ok()
            .map(|h| PathBuf::from(h).join(".config"))
    }
}
