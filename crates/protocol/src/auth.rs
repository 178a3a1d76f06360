//! Canonical strings signed with the device key.
//!
//! Each string is newline-joined; the relay rebuilds the same string to
//! verify the signature, so field order is part of the protocol.

/// Payload signed into the socket connection URL.
pub fn socket_connect_payload(
    system_id: &str,
    device_id: &str,
    key_id: &str,
    ts: i64,
    nonce: &str,
) -> String {
    format!("ws\n{system_id}\n{device_id}\n{key_id}\n{ts}\n{nonce}")
}

/// Payload signed for an access-token refresh.
pub fn refresh_payload(
    system_id: &str,
    device_id: &str,
    key_id: &str,
    ts: i64,
    nonce: &str,
) -> String {
    format!("auth-refresh\n{system_id}\n{device_id}\n{key_id}\n{ts}\n{nonce}")
}

/// Payload signed for a device revocation.
pub fn revoke_payload(
    system_id: &str,
    device_id: &str,
    target_device_id: &str,
    key_id: &str,
    ts: i64,
    nonce: &str,
) -> String {
    format!("auth-revoke\n{system_id}\n{device_id}\n{target_device_id}\n{key_id}\n{ts}\n{nonce}")
}

/// Proof of key possession sent with a pairing exchange.
pub fn pair_proof_payload(system_id: &str, device_id: &str, key_id: &str) -> String {
    format!("pair-exchange\n{system_id}\n{device_id}\n{key_id}")
}
