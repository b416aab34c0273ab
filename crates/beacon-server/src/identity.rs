//! Client identity for rate limiting.

use axum::http::HeaderMap;
use std::net::SocketAddr;

/// Identity used when neither a trusted header nor the peer address is known.
pub const UNKNOWN_CLIENT: &str = "unknown";

/// Resolve the address a request should be counted against.
///
/// Checks `trusted_headers` in order and takes the first non-empty value;
/// for `x-forwarded-for` only the first hop counts. Falls back to the TCP
/// peer address.
#[must_use]
pub fn client_identity(
    headers: &HeaderMap,
    peer: Option<SocketAddr>,
    trusted_headers: &[String],
) -> String {
    for name in trusted_headers {
        let Some(value) = headers
            .get(name.as_str())
            .and_then(|value| value.to_str().ok())
        else {
            continue;
        };

        let candidate = if name.eq_ignore_ascii_case("x-forwarded-for") {
            value.split(',').next().unwrap_or_default()
        } else {
            value
        }
        .trim();

        if !candidate.is_empty() {
            return candidate.to_string();
        }
    }

    peer.map_or_else(|| UNKNOWN_CLIENT.to_string(), |addr| addr.ip().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn trusted() -> Vec<String> {
        vec!["x-real-ip".to_string(), "x-forwarded-for".to_string()]
    }

    fn peer() -> Option<SocketAddr> {
        Some("192.0.2.7:51000".parse().unwrap())
    }

    #[test]
    fn test_prefers_real_ip() {
        let mut headers = HeaderMap::new();
        headers.insert("x-real-ip", HeaderValue::from_static("203.0.113.1"));
        headers.insert("x-forwarded-for", HeaderValue::from_static("198.51.100.1"));

        assert_eq!(client_identity(&headers, peer(), &trusted()), "203.0.113.1");
    }

    #[test]
    fn test_forwarded_for_first_hop() {
        let mut headers = HeaderMap::new();
        headers.insert("x-real-ip", HeaderValue::from_static("  "));
        headers.insert(
            "x-forwarded-for",
            HeaderValue::from_static("198.51.100.1, 10.0.0.2, 10.0.0.3"),
        );

        assert_eq!(client_identity(&headers, peer(), &trusted()), "198.51.100.1");
    }

    #[test]
    fn test_falls_back_to_peer() {
        assert_eq!(client_identity(&HeaderMap::new(), peer(), &trusted()), "192.0.2.7");
        assert_eq!(client_identity(&HeaderMap::new(), None, &trusted()), UNKNOWN_CLIENT);
    }

    #[test]
    fn test_untrusted_headers_ignored() {
        let mut headers = HeaderMap::new();
        headers.insert("x-real-ip", HeaderValue::from_static("203.0.113.1"));

        assert_eq!(client_identity(&headers, peer(), &[]), "192.0.2.7");
    }
}
