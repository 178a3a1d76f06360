//! Identifiers, nonces, timestamps and the signed connection URL.

use chrono::{SecondsFormat, Utc};
use rand::Rng;
use url::Url;

use hostlink_protocol::auth::socket_connect_payload;
use hostlink_protocol::constants::CLIENT_TYPE;

use crate::bridge::CredentialBridge;
use crate::error::ConnectionError;
use crate::types::SessionCredential;

const NONCE_BYTES: usize = 16;

/// Fresh random nonce as lowercase hex.
pub(crate) fn new_nonce() -> String {
    let mut bytes = [0u8; NONCE_BYTES];
    rand::thread_rng().fill(&mut bytes);
    hex::encode(bytes)
}

/// Fresh event, trace or request id.
pub(crate) fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// POSIX seconds.
pub(crate) fn now_secs() -> i64 {
    Utc::now().timestamp()
}

/// ISO-8601 UTC timestamp with milliseconds.
pub(crate) fn now_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Builds the socket URL carrying the signed device credential.
pub(crate) fn connection_url(
    relay_url: &str,
    system_id: &str,
    device_id: &str,
    credential: &SessionCredential,
    bridge: &dyn CredentialBridge,
) -> Result<String, ConnectionError> {
    let mut url = Url::parse(relay_url.trim())
        .map_err(|e| ConnectionError::InvalidUrl(format!("{relay_url}: {e}")))?;

    let ts = now_secs();
    let nonce = new_nonce();
    let sig = bridge.sign(&socket_connect_payload(
        system_id,
        device_id,
        &credential.key_id,
        ts,
        &nonce,
    ))?;

    url.query_pairs_mut()
        .append_pair("clientType", CLIENT_TYPE)
        .append_pair("systemId", system_id)
        .append_pair("deviceId", device_id)
        .append_pair("accessToken", &credential.access_token)
        .append_pair("keyId", &credential.key_id)
        .append_pair("ts", &ts.to_string())
        .append_pair("nonce", &nonce)
        .append_pair("sig", &sig);
    Ok(url.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::FileCredentialStore;
    use std::collections::HashMap;

    #[test]
    fn nonces_are_unique_hex() {
        let a = new_nonce();
        assert_eq!(a.len(), NONCE_BYTES * 2);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a, new_nonce());
    }

    #[test]
    fn iso_timestamp_has_millis() {
        let ts = now_iso();
        assert!(ts.ends_with('Z'));
        assert_eq!(ts.len(), "2024-01-01T00:00:00.000Z".len());
    }

    #[test]
    fn url_carries_signed_query() {
        let tmp = tempfile::tempdir().unwrap();
        let bridge = FileCredentialStore::open(tmp.path().to_path_buf()).unwrap();
        let cred = SessionCredential {
            access_token: "at".into(),
            key_id: "k-1".into(),
            ..Default::default()
        };

        let url = connection_url("wss://relay.example.com/ws", "sys-1", "dev-1", &cred, &bridge)
            .unwrap();
        let parsed = Url::parse(&url).unwrap();
        assert_eq!(parsed.path(), "/ws");
        let q: HashMap<String, String> = parsed.query_pairs().into_owned().collect();
        assert_eq!(q["clientType"], "app");
        assert_eq!(q["systemId"], "sys-1");
        assert_eq!(q["deviceId"], "dev-1");
        assert_eq!(q["accessToken"], "at");
        assert_eq!(q["keyId"], "k-1");
        assert!(q["ts"].parse::<i64>().is_ok());
        assert_eq!(q["nonce"].len(), NONCE_BYTES * 2);
        assert!(!q["sig"].is_empty());
    }

    #[test]
    fn bad_relay_url() {
        let tmp = tempfile::tempdir().unwrap();
        let bridge = FileCredentialStore::open(tmp.path().to_path_buf()).unwrap();
        assert!(matches!(
            connection_url("::nope", "s", "d", &SessionCredential::default(), &bridge),
            Err(ConnectionError::InvalidUrl(_))
        ));
    }
}
