//! Shared helpers: port derivation, URL normalization, upstream client.

use pagescope_types::{ProxyError, Result};
use reqwest::Client;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use url::Url;

/// Stable default port for a target URL: `10000 + fnv1a32(url) % 50000`.
///
/// Always lands in `[10000, 60000)` and is deterministic across runs, so
/// restarting the proxy for the same target reuses the same port.
pub fn default_port(target_url: &str) -> u16 {
    10000 + (fnv1a32(target_url.as_bytes()) % 50000) as u16
}

/// FNV-1a, 32 bit.
pub(crate) fn fnv1a32(bytes: &[u8]) -> u32 {
    let mut hash: u32 = 2_166_136_261;
    for &b in bytes {
        hash ^= u32::from(b);
        hash = hash.wrapping_mul(16_777_619);
    }
    hash
}

/// Parse and validate a target origin URL.
pub fn parse_target_url(raw: &str) -> Result<Url> {
    let url = Url::parse(raw).map_err(|e| ProxyError::InvalidTarget {
        url: raw.to_string(),
        message: e.to_string(),
    })?;
    if url.scheme() != "http" && url.scheme() != "https" {
        return Err(ProxyError::InvalidTarget {
            url: raw.to_string(),
            message: format!("unsupported scheme '{}'", url.scheme()),
        });
    }
    if url.host_str().is_none() {
        return Err(ProxyError::InvalidTarget {
            url: raw.to_string(),
            message: "missing host".to_string(),
        });
    }
    Ok(url)
}

/// `host[:port]` authority of a URL, port omitted when it is the scheme default.
pub fn url_authority(url: &Url) -> String {
    match (url.host_str(), url.port()) {
        (Some(host), Some(port)) => format!("{host}:{port}"),
        (Some(host), None) => host.to_string(),
        _ => String::new(),
    }
}

/// Normalize a URL for session-index lookups: strip the fragment and the
/// trailing slash (except for the bare root path). Invalid URLs come back
/// trimmed but otherwise untouched so lookups still have a stable key.
pub fn normalize_url(raw: &str) -> String {
    match Url::parse(raw) {
        Ok(mut url) => {
            url.set_fragment(None);
            let path = url.path().to_string();
            if path.len() > 1 && path.ends_with('/') {
                url.set_path(path.trim_end_matches('/'));
            }
            url.to_string()
        }
        Err(_) => raw.trim().to_string(),
    }
}

/// `scheme://host[:port]` of a URL, for same-origin comparisons.
pub fn url_origin(raw: &str) -> Option<String> {
    let url = Url::parse(raw).ok()?;
    let host = url.host_str()?;
    Some(match url.port() {
        Some(port) => format!("{}://{}:{}", url.scheme(), host, port),
        None => format!("{}://{}", url.scheme(), host),
    })
}

/// Build the upstream HTTP client for a target.
///
/// The dev target's certificate is accepted unconditionally, and
/// `localhost` is pinned to `127.0.0.1` so that targets listening only on
/// IPv4 still work on hosts that resolve `localhost` to `::1` first.
pub fn build_upstream_client(target: &Url) -> Result<Client> {
    let mut builder = Client::builder()
        .connect_timeout(std::time::Duration::from_secs(10))
        .tcp_nodelay(true)
        .pool_idle_timeout(std::time::Duration::from_secs(90))
        .http2_keep_alive_interval(std::time::Duration::from_secs(25))
        .http2_keep_alive_timeout(std::time::Duration::from_secs(10))
        .danger_accept_invalid_certs(true)
        .redirect(reqwest::redirect::Policy::none());

    if let Some(host) = target.host_str() {
        if host.eq_ignore_ascii_case("localhost") || host == "127.0.0.1" || host == "::1" {
            let port = target.port_or_known_default().unwrap_or(80);
            builder = builder
                .resolve(host, SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port));
        }
    }

    builder
        .build()
        .map_err(|e| ProxyError::Internal { message: format!("failed to build client: {e}") })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_port_range_and_determinism() {
        for target in [
            "http://localhost:3000",
            "http://localhost:8080",
            "https://app.test:4443",
            "http://127.0.0.1:9999/base",
        ] {
            let port = default_port(target);
            assert!((10000..60000).contains(&port), "{target} -> {port}");
            assert_eq!(port, default_port(target), "must be stable across calls");
        }
    }

    #[test]
    fn test_default_port_varies_by_target() {
        // Not guaranteed in general, but these two must not collide for the
        // derivation to be useful at all.
        assert_ne!(
            default_port("http://localhost:3000"),
            default_port("http://localhost:3001")
        );
    }

    #[test]
    fn test_parse_target_rejects_garbage() {
        assert!(parse_target_url("http://localhost:3000").is_ok());
        assert!(parse_target_url("not a url").is_err());
        assert!(parse_target_url("ftp://host/").is_err());
    }

    #[test]
    fn test_normalize_url() {
        assert_eq!(
            normalize_url("http://host/page/#frag"),
            "http://host/page"
        );
        assert_eq!(normalize_url("http://host/"), "http://host/");
        assert_eq!(
            normalize_url("http://host/a/b/?q=1"),
            "http://host/a/b?q=1"
        );
    }

    #[test]
    fn test_url_origin() {
        assert_eq!(
            url_origin("http://host:3000/a/b").as_deref(),
            Some("http://host:3000")
        );
        assert_eq!(url_origin("http://host/a").as_deref(), Some("http://host"));
        assert_eq!(url_origin("nope"), None);
    }
}
