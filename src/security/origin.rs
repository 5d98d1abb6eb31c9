use axum::http::HeaderMap;
use sha2::{Digest, Sha256};
use std::net::{IpAddr, SocketAddr};

/// Hashes client addresses into opaque origin identifiers so raw IPs never reach the session
/// registry or the logs.
#[derive(Clone)]
pub struct OriginKeyGenerator {
    server_secret: String,
}

impl OriginKeyGenerator {
    pub fn new(server_secret: String) -> Self {
        Self { server_secret }
    }

    /// Hex SHA-256 of `ip:server_secret`.
    pub fn generate(&self, ip: &IpAddr) -> String {
        let combined = format!("{}:{}", ip, self.server_secret);
        let mut hasher = Sha256::new();
        hasher.update(combined.as_bytes());
        hex::encode(hasher.finalize())
    }
}

/// Caller address: the socket peer, or the first `X-Forwarded-For` hop when running behind a
/// proxy we trust. An unparseable header falls back to the peer.
pub fn client_ip(headers: &HeaderMap, peer: SocketAddr, trust_forwarded_for: bool) -> IpAddr {
    if trust_forwarded_for {
        let forwarded = headers
            .get("x-forwarded-for")
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.split(',').next())
            .and_then(|first| first.trim().parse().ok());
        if let Some(ip) = forwarded {
            return ip;
        }
    }
    peer.ip()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn peer() -> SocketAddr {
        "10.0.0.7:5000".parse().unwrap()
    }

    #[test]
    fn test_origin_key_is_stable_and_opaque() {
        let generator = OriginKeyGenerator::new("test_secret".to_string());
        let ip: IpAddr = "192.168.1.1".parse().unwrap();
        let key = generator.generate(&ip);

        assert_eq!(key.len(), 64);
        assert!(key.chars().all(|c| c.is_ascii_hexdigit()));
        assert!(!key.contains("192.168"));
        assert_eq!(key, generator.generate(&ip));
        assert_ne!(key, generator.generate(&"192.168.1.2".parse().unwrap()));
        assert_ne!(key, OriginKeyGenerator::new("other".to_string()).generate(&ip));
    }

    #[test]
    fn test_forwarded_header_only_when_trusted() {
        let mut headers = HeaderMap::new();
        headers.insert(
            "x-forwarded-for",
            HeaderValue::from_static("203.0.113.9, 10.0.0.1"),
        );

        assert_eq!(client_ip(&headers, peer(), false), peer().ip());
        assert_eq!(
            client_ip(&headers, peer(), true),
            "203.0.113.9".parse::<IpAddr>().unwrap()
        );

        headers.insert("x-forwarded-for", HeaderValue::from_static("garbage"));
        assert_eq!(client_ip(&headers, peer(), true), peer().ip());
    }
}
