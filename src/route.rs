//! Proxy routes: which requests a proxy instance claims and where they go

use crate::error::RouteError;
use std::time::Duration;

/// Host every build-server route points at.
///
/// The build server always runs next to this process, so the downstream host
/// is fixed rather than taken from the caller's Host header, which may name a
/// load balancer we cannot reach.
pub const DOWNSTREAM_HOST: &str = "localhost";

/// Scheme every build-server route uses. The build server never sees the
/// caller directly, so it has no use for TLS.
pub const DOWNSTREAM_SCHEME: &str = "http";

/// Where a proxy instance sends matching requests
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyTarget {
    pub scheme: String,
    pub host: String,
    pub port: u16,
    /// Upper bound on connect + response head + full body
    pub request_timeout: Duration,
}

impl ProxyTarget {
    /// Target a port on this machine over plain HTTP
    pub fn localhost(port: u16, request_timeout: Duration) -> Self {
        Self {
            scheme: DOWNSTREAM_SCHEME.to_string(),
            host: DOWNSTREAM_HOST.to_string(),
            port,
            request_timeout,
        }
    }

    /// Build the downstream URI, keeping the caller's path and query unchanged
    pub fn downstream_uri(&self, path_and_query: &str) -> String {
        let path_and_query = if path_and_query.is_empty() { "/" } else { path_and_query };
        format!("{}://{}:{}{}", self.scheme, self.host, self.port, path_and_query)
    }

    /// Value for the Host header sent downstream
    pub fn authority(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// One forwarding rule: a path prefix bound to a downstream target
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyRoute {
    prefix: String,
    target: ProxyTarget,
}

impl ProxyRoute {
    /// Create a route. The prefix must be absolute; a trailing slash is
    /// dropped so `/dist/` and `/dist` register the same route.
    pub fn new(prefix: &str, target: ProxyTarget) -> Result<Self, RouteError> {
        Ok(Self {
            prefix: normalize_prefix(prefix)?,
            target,
        })
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn target(&self) -> &ProxyTarget {
        &self.target
    }

    /// Check whether a request path belongs to this route.
    ///
    /// Matching is case-sensitive and stops at segment boundaries: `/dist`
    /// claims `/dist` and `/dist/app.js` but not `/distant`.
    pub fn matches(&self, path: &str) -> bool {
        if self.prefix == "/" {
            return path.starts_with('/');
        }
        match path.strip_prefix(self.prefix.as_str()) {
            Some(rest) => rest.is_empty() || rest.starts_with('/'),
            None => false,
        }
    }
}

/// Normalize a route prefix, rejecting relative ones
pub fn normalize_prefix(prefix: &str) -> Result<String, RouteError> {
    if !prefix.starts_with('/') {
        return Err(RouteError::InvalidPrefix(prefix.to_string()));
    }
    let trimmed = prefix.trim_end_matches('/');
    if trimmed.is_empty() {
        Ok("/".to_string())
    } else {
        Ok(trimmed.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn route(prefix: &str) -> ProxyRoute {
        ProxyRoute::new(prefix, ProxyTarget::localhost(1234, Duration::from_secs(5))).unwrap()
    }

    #[test]
    fn test_prefix_matches_on_segment_boundary() {
        let r = route("/dist");
        assert!(r.matches("/dist"));
        assert!(r.matches("/dist/"));
        assert!(r.matches("/dist/app.js"));
        assert!(r.matches("/dist/nested/deep/app.js.map"));
        assert!(!r.matches("/distant"));
        assert!(!r.matches("/dis"));
        assert!(!r.matches("/"));
        assert!(!r.matches("/other/dist/app.js"));
    }

    #[test]
    fn test_matching_is_case_sensitive() {
        let r = route("/dist");
        assert!(!r.matches("/DIST/app.js"));
        assert!(!r.matches("/Dist"));
    }

    #[test]
    fn test_root_prefix_matches_everything() {
        let r = route("/");
        assert!(r.matches("/"));
        assert!(r.matches("/index.html"));
        assert!(r.matches("/dist/app.js"));
    }

    #[test]
    fn test_trailing_slash_is_normalized() {
        assert_eq!(route("/dist/").prefix(), "/dist");
        assert_eq!(route("///").prefix(), "/");
        assert!(route("/dist/").matches("/dist/app.js"));
        assert!(!route("/dist/").matches("/distant"));
    }

    #[test]
    fn test_relative_prefix_rejected() {
        let err = ProxyRoute::new("dist", ProxyTarget::localhost(1, Duration::from_secs(1)))
            .unwrap_err();
        assert_eq!(err, RouteError::InvalidPrefix("dist".to_string()));
        assert!(normalize_prefix("").is_err());
    }

    #[test]
    fn test_downstream_uri_preserves_path_and_query() {
        let target = ProxyTarget::localhost(41234, Duration::from_secs(100));
        assert_eq!(
            target.downstream_uri("/dist/app.js?v=3&x=%20y"),
            "http://localhost:41234/dist/app.js?v=3&x=%20y"
        );
        assert_eq!(target.downstream_uri(""), "http://localhost:41234/");
        assert_eq!(target.authority(), "localhost:41234");
    }

    #[test]
    fn test_localhost_target_defaults() {
        let target = ProxyTarget::localhost(8080, Duration::from_secs(100));
        assert_eq!(target.scheme, "http");
        assert_eq!(target.host, "localhost");
        assert_eq!(target.port, 8080);
        assert_eq!(target.request_timeout, Duration::from_secs(100));
    }
}
