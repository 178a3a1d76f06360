//! Socket URL to HTTP API base derivation.

use url::Url;

use crate::client::RelayError;

/// Derives the HTTP API base URLs for a relay socket URL.
///
/// `ws` maps to `http` and `wss` to `https`; a trailing `/ws` path segment
/// is stripped. When the host is a loopback name, the alias of the same
/// port (`localhost` <-> `127.0.0.1`) is appended as a fallback.
pub fn api_bases(socket_url: &str) -> Result<Vec<String>, RelayError> {
    let parsed = Url::parse(socket_url.trim())
        .map_err(|e| RelayError::InvalidUrl(format!("{socket_url}: {e}")))?;

    let scheme = match parsed.scheme() {
        "ws" | "http" => "http",
        "wss" | "https" => "https",
        other => {
            return Err(RelayError::InvalidUrl(format!(
                "{socket_url}: unsupported scheme {other}"
            )));
        }
    };

    let host = parsed
        .host_str()
        .ok_or_else(|| RelayError::InvalidUrl(format!("{socket_url}: missing host")))?;
    let port = parsed.port();

    let trimmed = parsed.path().trim_end_matches('/');
    let path = trimmed.strip_suffix("/ws").unwrap_or(trimmed);

    let base_for = |h: &str| match port {
        Some(p) => format!("{scheme}://{h}:{p}{path}"),
        None => format!("{scheme}://{h}{path}"),
    };

    let mut bases = vec![base_for(host)];
    let alias = match host {
        "localhost" => Some("127.0.0.1"),
        "127.0.0.1" => Some("localhost"),
        _ => None,
    };
    if let Some(alias) = alias {
        bases.push(base_for(alias));
    }
    Ok(bases)
}
