//! Request inspection helpers shared by the dispatch pipeline and the auth routes

use std::net::SocketAddr;

use axum::http::{header, HeaderMap, HeaderName, Uri};

/// Headers meaningful only for a single transport hop; never forwarded as-is
pub const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Paths with these extensions are not access-logged unless verbose mode is on
const STATIC_ASSET_EXTENSIONS: &[&str] = &[
    ".js", ".css", ".jpeg", ".bmp", ".jpg", ".png", ".gif", ".svg", ".font", ".ico", ".woff2",
    ".ttf",
];

/// A request is an upgrade iff `Connection` mentions "upgrade" (any case)
/// and a non-empty `Upgrade` header is present.
pub fn is_upgrade_request(headers: &HeaderMap) -> bool {
    let connection_upgrade = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .any(|v| v.to_ascii_lowercase().contains("upgrade"));

    let has_upgrade = headers
        .get(header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| !v.trim().is_empty());

    connection_upgrade && has_upgrade
}

/// Resolve the client IP address.
///
/// When a real-IP header is configured, its first comma-separated entry wins
/// (e.g. the client entry of `X-Forwarded-For`). Otherwise the socket address
/// is used, and "-" when neither is known.
pub fn client_ip(
    headers: &HeaderMap,
    real_ip_header: Option<&HeaderName>,
    remote: Option<SocketAddr>,
) -> String {
    if let Some(name) = real_ip_header {
        let forwarded = headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(',').next())
            .map(str::trim)
            .unwrap_or_default();
        if !forwarded.is_empty() {
            return forwarded.to_string();
        }
    }

    remote
        .map(|addr| addr.ip().to_string())
        .unwrap_or_else(|| "-".to_string())
}

pub fn is_static_asset(path: &str) -> bool {
    let path = path.to_ascii_lowercase();
    STATIC_ASSET_EXTENSIONS
        .iter()
        .any(|ext| path.ends_with(ext))
}

/// Host the client addressed, from the `Host` header or the absolute URI (HTTP/2)
pub fn request_host(headers: &HeaderMap, uri: &Uri) -> Option<String> {
    headers
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .or_else(|| uri.authority().map(|a| a.as_str().to_string()))
        .filter(|h| !h.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn headers(pairs: &[(&str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (k, v) in pairs {
            map.append(
                HeaderName::from_bytes(k.as_bytes()).unwrap(),
                HeaderValue::from_str(v).unwrap(),
            );
        }
        map
    }

    #[test]
    fn test_upgrade_detection() {
        assert!(is_upgrade_request(&headers(&[
            ("connection", "keep-alive, Upgrade"),
            ("upgrade", "websocket"),
        ])));
        assert!(is_upgrade_request(&headers(&[
            ("connection", "UPGRADE"),
            ("upgrade", "h2c"),
        ])));
        assert!(!is_upgrade_request(&headers(&[("connection", "upgrade")])));
        assert!(!is_upgrade_request(&headers(&[
            ("connection", "upgrade"),
            ("upgrade", "  "),
        ])));
        assert!(!is_upgrade_request(&headers(&[("upgrade", "websocket")])));
    }

    #[test]
    fn test_client_ip_prefers_configured_header() {
        let name = HeaderName::from_static("x-forwarded-for");
        let remote: SocketAddr = "10.0.0.9:5555".parse().unwrap();

        let map = headers(&[("x-forwarded-for", "203.0.113.7, 10.0.0.1")]);
        assert_eq!(client_ip(&map, Some(&name), Some(remote)), "203.0.113.7");

        let empty = HeaderMap::new();
        assert_eq!(client_ip(&empty, Some(&name), Some(remote)), "10.0.0.9");
        assert_eq!(client_ip(&map, None, Some(remote)), "10.0.0.9");
        assert_eq!(client_ip(&empty, None, None), "-");
    }

    #[test]
    fn test_static_asset_detection() {
        assert!(is_static_asset("/app/main.JS"));
        assert!(is_static_asset("/fonts/a.woff2"));
        assert!(!is_static_asset("/api/users"));
        assert!(!is_static_asset("/"));
    }

    #[test]
    fn test_request_host() {
        let map = headers(&[("host", "kibana.example.com")]);
        let uri: Uri = "/app".parse().unwrap();
        assert_eq!(
            request_host(&map, &uri).as_deref(),
            Some("kibana.example.com")
        );

        let absolute: Uri = "https://grafana.example.com/d".parse().unwrap();
        assert_eq!(
            request_host(&HeaderMap::new(), &absolute).as_deref(),
            Some("grafana.example.com")
        );
        assert_eq!(request_host(&HeaderMap::new(), &uri), None);
    }
}
