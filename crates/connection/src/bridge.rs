//! Credential store bridge.
//!
//! The core reads and writes device sessions and signs canonical payloads
//! only through [`CredentialBridge`]. [`FileCredentialStore`] keeps sessions
//! in a JSON file and an Ed25519 device key next to it.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError, RwLock};

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use ed25519_dalek::{Signer, SigningKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::error::BridgeError;
use crate::types::{DeviceKey, SessionCredential};

const SESSIONS_FILE: &str = "sessions.json";
const DEVICE_KEY_FILE: &str = "device_key.json";

/// Hex characters of the public-key digest used as key id.
const KEY_ID_LEN: usize = 16;

/// Storage for device sessions and the device signing key.
pub trait CredentialBridge: Send + Sync {
    fn load_session(
        &self,
        system_id: &str,
        device_id: &str,
    ) -> Result<Option<SessionCredential>, BridgeError>;

    fn store_session(
        &self,
        system_id: &str,
        device_id: &str,
        credential: &SessionCredential,
    ) -> Result<(), BridgeError>;

    fn clear_session(&self, system_id: &str, device_id: &str) -> Result<(), BridgeError>;

    /// Returns the device public key, creating the key pair on first use.
    fn device_key(&self) -> Result<DeviceKey, BridgeError>;

    /// Signs `payload` with the device key. Returns a base64url signature.
    fn sign(&self, payload: &str) -> Result<String, BridgeError>;
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StoredKey {
    secret_key: String,
}

/// File-backed credential store.
pub struct FileCredentialStore {
    dir: PathBuf,
    sessions: RwLock<HashMap<String, SessionCredential>>,
    key: Mutex<Option<SigningKey>>,
}

impl FileCredentialStore {
    /// Opens the store in `dir`, loading existing sessions.
    pub fn open(dir: PathBuf) -> Result<Self, BridgeError> {
        let sessions = load_sessions(&dir.join(SESSIONS_FILE))?;
        Ok(Self {
            dir,
            sessions: RwLock::new(sessions),
            key: Mutex::new(None),
        })
    }

    /// Number of stored sessions.
    pub fn len(&self) -> usize {
        self.read_sessions().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn read_sessions(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, SessionCredential>> {
        self.sessions.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_sessions(
        &self,
    ) -> std::sync::RwLockWriteGuard<'_, HashMap<String, SessionCredential>> {
        self.sessions.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn persist(&self) -> Result<(), BridgeError> {
        let map = self.read_sessions();
        let json = serde_json::to_string_pretty(&*map)?;
        write_private(&self.dir.join(SESSIONS_FILE), &json)?;
        debug!("persisted {} session(s) to {:?}", map.len(), self.dir);
        Ok(())
    }

    /// Runs `f` with the device key, loading or generating it first.
    fn with_key<R>(&self, f: impl FnOnce(&SigningKey) -> R) -> Result<R, BridgeError> {
        let mut guard = self.key.lock().unwrap_or_else(PoisonError::into_inner);
        if guard.is_none() {
            *guard = Some(self.load_or_generate_key()?);
        }
        match guard.as_ref() {
            Some(key) => Ok(f(key)),
            None => Err(BridgeError::Key("device key unavailable".into())),
        }
    }

    fn load_or_generate_key(&self) -> Result<SigningKey, BridgeError> {
        let path = self.dir.join(DEVICE_KEY_FILE);
        if path.exists() {
            let stored: StoredKey = serde_json::from_str(&std::fs::read_to_string(&path)?)?;
            let bytes = URL_SAFE_NO_PAD
                .decode(stored.secret_key.as_bytes())
                .map_err(|e| BridgeError::Key(e.to_string()))?;
            let secret: [u8; 32] = bytes
                .as_slice()
                .try_into()
                .map_err(|_| BridgeError::Key(format!("bad key length {}", bytes.len())))?;
            return Ok(SigningKey::from_bytes(&secret));
        }

        let key = SigningKey::generate(&mut OsRng);
        let stored = StoredKey {
            secret_key: URL_SAFE_NO_PAD.encode(key.to_bytes()),
        };
        write_private(&path, &serde_json::to_string_pretty(&stored)?)?;
        info!(path = %path.display(), "generated device key");
        Ok(key)
    }
}

impl CredentialBridge for FileCredentialStore {
    fn load_session(
        &self,
        system_id: &str,
        device_id: &str,
    ) -> Result<Option<SessionCredential>, BridgeError> {
        Ok(self
            .read_sessions()
            .get(&session_key(system_id, device_id))
            .cloned())
    }

    fn store_session(
        &self,
        system_id: &str,
        device_id: &str,
        credential: &SessionCredential,
    ) -> Result<(), BridgeError> {
        self.write_sessions()
            .insert(session_key(system_id, device_id), credential.clone());
        self.persist()
    }

    fn clear_session(&self, system_id: &str, device_id: &str) -> Result<(), BridgeError> {
        let removed = self
            .write_sessions()
            .remove(&session_key(system_id, device_id));
        if removed.is_some() {
            self.persist()?;
        }
        Ok(())
    }

    fn device_key(&self) -> Result<DeviceKey, BridgeError> {
        self.with_key(|key| {
            let public = key.verifying_key().to_bytes();
            DeviceKey {
                key_id: key_id_for(&public),
                public_key: URL_SAFE_NO_PAD.encode(public),
            }
        })
    }

    fn sign(&self, payload: &str) -> Result<String, BridgeError> {
        self.with_key(|key| URL_SAFE_NO_PAD.encode(key.sign(payload.as_bytes()).to_bytes()))
    }
}

fn session_key(system_id: &str, device_id: &str) -> String {
    format!("{system_id}:{device_id}")
}

/// Key id derived from the public key: truncated hex SHA-256.
fn key_id_for(public_key: &[u8]) -> String {
    let digest = hex::encode(Sha256::digest(public_key));
    digest[..KEY_ID_LEN].to_string()
}

fn load_sessions(path: &Path) -> Result<HashMap<String, SessionCredential>, BridgeError> {
    if !path.exists() {
        return Ok(HashMap::new());
    }
    let data = std::fs::read_to_string(path)?;
    let sessions: HashMap<String, SessionCredential> = serde_json::from_str(&data)?;
    debug!("loaded {} session(s) from {:?}", sessions.len(), path);
    Ok(sessions)
}

fn write_private(path: &Path, contents: &str) -> Result<(), BridgeError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, contents)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ed25519_dalek::{Signature, Verifier, VerifyingKey};

    fn credential() -> SessionCredential {
        SessionCredential {
            access_token: "at-1".into(),
            refresh_token: "rt-1".into(),
            key_id: "k-1".into(),
            credential_id: "c-1".into(),
        }
    }

    #[test]
    fn store_and_load_session() {
        let tmp = tempfile::tempdir().unwrap();
        let store = FileCredentialStore::open(tmp.path().to_path_buf()).unwrap();
        store.store_session("sys-1", "dev-1", &credential()).unwrap();

        assert_eq!(
            store.load_session("sys-1", "dev-1").unwrap(),
            Some(credential())
        );
        assert_eq!(store.load_session("sys-2", "dev-1").unwrap(), None);
    }

    #[test]
    fn sessions_persist_across_instances() {
        let tmp = tempfile::tempdir().unwrap();
        {
            let store = FileCredentialStore::open(tmp.path().to_path_buf()).unwrap();
            store.store_session("sys-1", "dev-1", &credential()).unwrap();
        }
        let store = FileCredentialStore::open(tmp.path().to_path_buf()).unwrap();
        assert_eq!(store.len(), 1);
        assert_eq!(
            store.load_session("sys-1", "dev-1").unwrap(),
            Some(credential())
        );
    }

    #[test]
    fn clear_session_removes_entry() {
        let tmp = tempfile::tempdir().unwrap();
        let store = FileCredentialStore::open(tmp.path().to_path_buf()).unwrap();
        store.store_session("sys-1", "dev-1", &credential()).unwrap();
        store.clear_session("sys-1", "dev-1").unwrap();
        assert!(store.is_empty());
        // Clearing a missing session is fine.
        store.clear_session("sys-1", "dev-1").unwrap();
    }

    #[test]
    fn device_key_is_stable_and_signs() {
        let tmp = tempfile::tempdir().unwrap();
        let first = {
            let store = FileCredentialStore::open(tmp.path().to_path_buf()).unwrap();
            store.device_key().unwrap()
        };
        let store = FileCredentialStore::open(tmp.path().to_path_buf()).unwrap();
        let key = store.device_key().unwrap();
        assert_eq!(key, first);
        assert_eq!(key.key_id.len(), KEY_ID_LEN);

        let sig = store.sign("ws\nsys\ndev\nk\n1\nn").unwrap();
        let public: [u8; 32] = URL_SAFE_NO_PAD
            .decode(key.public_key)
            .unwrap()
            .try_into()
            .unwrap();
        let sig: [u8; 64] = URL_SAFE_NO_PAD.decode(sig).unwrap().try_into().unwrap();
        VerifyingKey::from_bytes(&public)
            .unwrap()
            .verify(b"ws\nsys\ndev\nk\n1\nn", &Signature::from_bytes(&sig))
            .unwrap();
    }

    #[cfg(unix)]
    #[test]
    fn files_are_private() {
        use std::os::unix::fs::PermissionsExt;

        let tmp = tempfile::tempdir().unwrap();
        let store = FileCredentialStore::open(tmp.path().to_path_buf()).unwrap();
        store.store_session("sys-1", "dev-1", &credential()).unwrap();
        store.device_key().unwrap();

        for name in [SESSIONS_FILE, DEVICE_KEY_FILE] {
            let mode = std::fs::metadata(tmp.path().join(name))
                .unwrap()
                .permissions()
                .mode();
            assert_eq!(mode & 0o777, 0o600, "{name}");
        }
    }
}
