//! Connection pool for downstream HTTP connections
//!
//! All proxy instances in a pipeline share one pooled client, so repeated
//! requests for bundle assets reuse warm connections to the build server.

use crate::route::ProxyTarget;
use crate::ProxyBody;
use hyper::body::Incoming;
use hyper::header::{HeaderMap, HeaderName, HeaderValue, HOST};
use hyper::{Request, Response};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Headers scoped to a single connection; never forwarded downstream
const HOP_BY_HOP_HEADERS: [&str; 7] = [
    "connection",
    "keep-alive",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Error type for connection pool operations
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    /// Error from the HTTP client
    #[error("client error: {0}")]
    Client(#[from] hyper_util::client::legacy::Error),
    /// Error building a request
    #[error("request build error: {0}")]
    RequestBuild(String),
}

/// Statistics for the connection pool
#[derive(Debug, Default)]
pub struct PoolStats {
    /// Total number of requests sent downstream
    pub total_requests: AtomicU64,
    /// Requests that failed before a response head arrived
    pub failed_requests: AtomicU64,
}

impl PoolStats {
    pub fn record_request(&self) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failure(&self) {
        self.failed_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get_total_requests(&self) -> u64 {
        self.total_requests.load(Ordering::Relaxed)
    }

    pub fn get_failed_requests(&self) -> u64 {
        self.failed_requests.load(Ordering::Relaxed)
    }
}

/// Configuration for the connection pool
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum idle connections per host
    pub max_idle_per_host: usize,
    /// Idle connection timeout
    pub idle_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_idle_per_host: 10,
            idle_timeout: Duration::from_secs(90),
        }
    }
}

/// A connection pool for HTTP connections to downstream servers
pub struct ConnectionPool {
    client: Client<HttpConnector, ProxyBody>,
    stats: Arc<PoolStats>,
}

impl ConnectionPool {
    pub fn new(config: PoolConfig) -> Self {
        let mut connector = HttpConnector::new();
        connector.set_nodelay(true);
        connector.enforce_http(true);

        let client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(config.max_idle_per_host)
            .pool_idle_timeout(config.idle_timeout)
            .build(connector);

        debug!(
            max_idle = config.max_idle_per_host,
            idle_timeout_secs = config.idle_timeout.as_secs(),
            "Connection pool initialized"
        );

        Self {
            client,
            stats: Arc::new(PoolStats::default()),
        }
    }

    pub fn stats(&self) -> Arc<PoolStats> {
        Arc::clone(&self.stats)
    }

    /// Send a request to the target and resolve once the response head arrives.
    ///
    /// The response body is left unread so the caller can stream it.
    pub async fn send_request(
        &self,
        req: Request<ProxyBody>,
        target: &ProxyTarget,
    ) -> Result<Response<Incoming>, PoolError> {
        let downstream_req = build_downstream_request(req, target)?;

        self.stats.record_request();

        match self.client.request(downstream_req).await {
            Ok(response) => Ok(response),
            Err(e) => {
                self.stats.record_failure();
                Err(e.into())
            }
        }
    }
}

/// Rewrite a caller's request so it addresses the downstream target
pub fn build_downstream_request(
    req: Request<ProxyBody>,
    target: &ProxyTarget,
) -> Result<Request<ProxyBody>, PoolError> {
    let path_and_query = req.uri().path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
    let uri = target.downstream_uri(path_and_query);

    let (parts, body) = req.into_parts();
    let mut builder = Request::builder().method(parts.method).uri(&uri);

    if let Some(headers) = builder.headers_mut() {
        copy_forwardable_headers(&parts.headers, headers);
        let authority = HeaderValue::from_str(&target.authority())
            .map_err(|e| PoolError::RequestBuild(e.to_string()))?;
        headers.insert(HOST, authority);
    }

    builder
        .body(body)
        .map_err(|e| PoolError::RequestBuild(e.to_string()))
}

/// Copy every header except Host and the connection-scoped ones
pub fn copy_forwardable_headers(from: &HeaderMap, to: &mut HeaderMap) {
    let named_by_connection = connection_tokens(from);
    for (name, value) in from.iter() {
        if name == HOST || is_hop_by_hop(name) || named_by_connection.contains(name) {
            continue;
        }
        to.append(name.clone(), value.clone());
    }
}

/// Drop connection-scoped headers from a relayed response head
pub fn remove_hop_by_hop_headers(headers: &mut HeaderMap) {
    for name in connection_tokens(headers) {
        headers.remove(&name);
    }
    for name in HOP_BY_HOP_HEADERS {
        headers.remove(name);
    }
}

fn is_hop_by_hop(name: &HeaderName) -> bool {
    HOP_BY_HOP_HEADERS.contains(&name.as_str())
}

/// Headers listed in `Connection` are connection-scoped too
fn connection_tokens(headers: &HeaderMap) -> Vec<HeaderName> {
    headers
        .get_all(hyper::header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|token| HeaderName::from_bytes(token.trim().as_bytes()).ok())
        .collect()
}
