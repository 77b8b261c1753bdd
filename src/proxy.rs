//! Conditional proxy middleware
//!
//! A [`ConditionalProxy`] owns one [`ProxyRoute`]. Requests under the route's
//! prefix are forwarded to the build server and the response is streamed back
//! as it arrives; every other request goes to the next pipeline stage exactly
//! as it came in.

use crate::error::{json_error_response, DeadlineElapsed, ProxyErrorCode, RouteError};
use crate::pipeline::{Endpoint, HandlerFuture, Middleware, Next, Pipeline};
use crate::pool::{remove_hop_by_hop_headers, ConnectionPool, PoolError};
use crate::route::{ProxyRoute, ProxyTarget};
use crate::{BoxError, ProxyBody};
use http_body_util::BodyExt;
use hyper::body::{Body, Frame, SizeHint};
use hyper::header::{HeaderValue, HOST};
use hyper::{Request, Response};
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::time::{Instant, Sleep};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Header name for request ID
const X_REQUEST_ID: &str = "x-request-id";
/// Header name for forwarded-for
const X_FORWARDED_FOR: &str = "x-forwarded-for";
/// Header name for forwarded host
const X_FORWARDED_HOST: &str = "x-forwarded-host";
/// Header name for forwarded proto
const X_FORWARDED_PROTO: &str = "x-forwarded-proto";

/// Address of the caller, stored in request extensions by the server
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientAddr(pub SocketAddr);

/// Middleware forwarding one path prefix to a downstream build server
pub struct ConditionalProxy {
    route: ProxyRoute,
    pool: Arc<ConnectionPool>,
}

impl ConditionalProxy {
    pub fn new(route: ProxyRoute, pool: Arc<ConnectionPool>) -> Self {
        Self { route, pool }
    }
}

impl Middleware for ConditionalProxy {
    fn handle<'a>(&'a self, req: Request<ProxyBody>, next: Next<'a>) -> HandlerFuture<'a> {
        if !self.route.matches(req.uri().path()) {
            return next.run(req);
        }
        Box::pin(forward(&self.pool, self.route.target(), req))
    }

    fn route_prefix(&self) -> Option<&str> {
        Some(self.route.prefix())
    }
}

/// Endpoint forwarding every request to the application server
pub struct AppUpstream {
    target: ProxyTarget,
    pool: Arc<ConnectionPool>,
}

impl AppUpstream {
    pub fn new(target: ProxyTarget, pool: Arc<ConnectionPool>) -> Self {
        Self { target, pool }
    }
}

impl Endpoint for AppUpstream {
    fn call(&self, req: Request<ProxyBody>) -> HandlerFuture<'_> {
        Box::pin(forward(&self.pool, &self.target, req))
    }
}

/// Insert a conditional proxy for `path_prefix` targeting `localhost:target_port`
pub fn attach(
    pipeline: &mut Pipeline,
    path_prefix: &str,
    target_port: u16,
    request_timeout: Duration,
) -> Result<(), RouteError> {
    let route = ProxyRoute::new(path_prefix, ProxyTarget::localhost(target_port, request_timeout))?;
    if pipeline.has_route(route.prefix()) {
        return Err(RouteError::Duplicate(route.prefix().to_string()));
    }

    info!(
        prefix = route.prefix(),
        port = target_port,
        timeout_secs = request_timeout.as_secs(),
        "Proxy route attached"
    );

    let proxy = ConditionalProxy::new(route, Arc::clone(pipeline.pool()));
    pipeline.push(proxy);
    Ok(())
}

/// Forward a request to the target and relay the response.
///
/// One deadline covers connecting, sending, the response head and the whole
/// response body. A single attempt is made; failures become 502/504 JSON
/// responses and never propagate past this request.
pub async fn forward(
    pool: &ConnectionPool,
    target: &ProxyTarget,
    mut req: Request<ProxyBody>,
) -> Response<ProxyBody> {
    let deadline = Instant::now() + target.request_timeout;
    let request_id = set_forwarding_headers(&mut req);
    let uri = req.uri().clone();

    debug!(method = %req.method(), %uri, port = target.port, request_id, "Forwarding request");

    match tokio::time::timeout_at(deadline, pool.send_request(req, target)).await {
        Ok(Ok(response)) => {
            let (mut parts, body) = response.into_parts();
            remove_hop_by_hop_headers(&mut parts.headers);
            debug!(%uri, status = %parts.status, request_id, "Relaying downstream response");
            Response::from_parts(parts, DeadlineBody::new(body, deadline).boxed())
        }
        Ok(Err(PoolError::RequestBuild(e))) => {
            error!(%uri, request_id, error = %e, "Failed to build downstream request");
            json_error_response(ProxyErrorCode::InternalError, "Failed to build downstream request")
        }
        Ok(Err(e)) => {
            error!(%uri, port = target.port, request_id, error = %e, "Failed to reach downstream server");
            json_error_response(
                ProxyErrorCode::DownstreamUnavailable,
                format!("Downstream server on port {} is unavailable", target.port),
            )
        }
        Err(_) => {
            warn!(
                %uri,
                port = target.port,
                request_id,
                timeout_secs = target.request_timeout.as_secs(),
                "Downstream request timed out"
            );
            json_error_response(
                ProxyErrorCode::DownstreamTimeout,
                format!(
                    "Downstream server did not respond within {} seconds",
                    target.request_timeout.as_secs()
                ),
            )
        }
    }
}

/// Set request ID and X-Forwarded-* headers, returning the request ID.
///
/// X-Forwarded-* values are overwritten rather than appended; this proxy is
/// the first trusted hop.
fn set_forwarding_headers(req: &mut Request<ProxyBody>) -> String {
    let request_id = req
        .headers()
        .get(X_REQUEST_ID)
        .and_then(|v| v.to_str().ok())
        .map(String::from)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let client_addr = req.extensions().get::<ClientAddr>().copied();
    // HTTP/2 callers carry the host in :authority instead of a Host header
    let uri_authority = req
        .uri()
        .authority()
        .and_then(|authority| HeaderValue::from_str(authority.as_str()).ok());
    let headers = req.headers_mut();

    if let Ok(value) = HeaderValue::from_str(&request_id) {
        headers.insert(X_REQUEST_ID, value);
    }

    if let Some(ClientAddr(addr)) = client_addr {
        if let Ok(value) = HeaderValue::from_str(&addr.ip().to_string()) {
            headers.insert(X_FORWARDED_FOR, value);
        }
    }

    if let Some(host) = headers.get(HOST).cloned().or(uri_authority) {
        headers.insert(X_FORWARDED_HOST, host);
    }

    headers.insert(X_FORWARDED_PROTO, HeaderValue::from_static("http"));

    request_id
}

/// Response body that fails once the request deadline passes.
///
/// Frames are passed through as they arrive. When the deadline fires first
/// the body yields [`DeadlineElapsed`], which makes the server abort the
/// caller's response; dropping the body closes the downstream connection.
pub struct DeadlineBody<B> {
    inner: B,
    deadline: Pin<Box<Sleep>>,
}

impl<B> DeadlineBody<B> {
    pub fn new(inner: B, deadline: Instant) -> Self {
        Self {
            inner,
            deadline: Box::pin(tokio::time::sleep_until(deadline)),
        }
    }
}

impl<B> Body for DeadlineBody<B>
where
    B: Body + Unpin,
    B::Error: Into<BoxError>,
{
    type Data = B::Data;
    type Error = BoxError;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.get_mut();

        if let Poll::Ready(frame) = Pin::new(&mut this.inner).poll_frame(cx) {
            return Poll::Ready(frame.map(|result| result.map_err(Into::into)));
        }

        match this.deadline.as_mut().poll(cx) {
            Poll::Ready(()) => Poll::Ready(Some(Err(Box::new(DeadlineElapsed)))),
            Poll::Pending => Poll::Pending,
        }
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::NotFound;
    use http_body_util::{Empty, Full};
    use hyper::body::Bytes;
    use hyper::StatusCode;
    use std::convert::Infallible;
    use std::sync::Mutex;

    fn empty_body() -> ProxyBody {
        Empty::<Bytes>::new().map_err(|never| match never {}).boxed()
    }

    fn closed_port() -> u16 {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    }

    /// Endpoint that records the request it received
    #[derive(Clone, Default)]
    struct Recorder {
        seen: Arc<Mutex<Vec<(String, hyper::HeaderMap)>>>,
    }

    impl Endpoint for Recorder {
        fn call(&self, req: Request<ProxyBody>) -> HandlerFuture<'_> {
            self.seen
                .lock()
                .unwrap()
                .push((req.uri().to_string(), req.headers().clone()));
            Box::pin(async move {
                Response::builder()
                    .status(StatusCode::IM_A_TEAPOT)
                    .body(empty_body())
                    .unwrap()
            })
        }
    }

    /// Body that never yields a frame
    struct Stalled;

    impl Body for Stalled {
        type Data = Bytes;
        type Error = Infallible;

        fn poll_frame(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
        ) -> Poll<Option<Result<Frame<Bytes>, Infallible>>> {
            Poll::Pending
        }
    }

    #[tokio::test]
    async fn test_non_matching_request_passes_through_untouched() {
        let recorder = Recorder::default();
        let mut pipeline = Pipeline::new(recorder.clone());
        attach(&mut pipeline, "/dist", closed_port(), Duration::from_secs(1)).unwrap();

        let req = Request::builder()
            .uri("/distant/page?x=1")
            .header("host", "app.example.com")
            .header("x-custom", "kept")
            .body(empty_body())
            .unwrap();
        let response = pipeline.dispatch(req).await;

        assert_eq!(response.status(), StatusCode::IM_A_TEAPOT);
        let seen = recorder.seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        let (uri, headers) = &seen[0];
        assert_eq!(uri, "/distant/page?x=1");
        assert_eq!(headers.len(), 2);
        assert_eq!(headers.get("host").unwrap(), "app.example.com");
        assert!(headers.get(X_REQUEST_ID).is_none());
        assert!(headers.get(X_FORWARDED_HOST).is_none());
    }

    #[tokio::test]
    async fn test_matching_request_to_closed_port_is_bad_gateway() {
        let recorder = Recorder::default();
        let mut pipeline = Pipeline::new(recorder.clone());
        attach(&mut pipeline, "/dist", closed_port(), Duration::from_secs(5)).unwrap();

        let req = Request::builder().uri("/dist/app.js").body(empty_body()).unwrap();
        let response = pipeline.dispatch(req).await;

        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(
            response.headers().get("X-Proxy-Error").unwrap(),
            "DOWNSTREAM_UNAVAILABLE"
        );
        assert!(recorder.seen.lock().unwrap().is_empty());
    }

    #[test]
    fn test_attach_rejects_duplicate_and_relative_prefixes() {
        let mut pipeline = Pipeline::new(NotFound);
        attach(&mut pipeline, "/dist", 3000, Duration::from_secs(1)).unwrap();

        assert_eq!(
            attach(&mut pipeline, "/dist/", 3001, Duration::from_secs(1)),
            Err(RouteError::Duplicate("/dist".to_string()))
        );
        assert_eq!(
            attach(&mut pipeline, "assets", 3001, Duration::from_secs(1)),
            Err(RouteError::InvalidPrefix("assets".to_string()))
        );

        attach(&mut pipeline, "/assets", 3001, Duration::from_secs(1)).unwrap();
        assert_eq!(pipeline.route_prefixes(), vec!["/dist", "/assets"]);
    }

    #[test]
    fn test_forwarding_headers_set() {
        let mut req = Request::builder()
            .uri("/dist/app.js")
            .header("host", "app.example.com:8443")
            .header(X_FORWARDED_FOR, "10.0.0.1")
            .body(empty_body())
            .unwrap();
        req.extensions_mut()
            .insert(ClientAddr("192.168.1.20:51000".parse().unwrap()));

        let request_id = set_forwarding_headers(&mut req);

        assert!(Uuid::parse_str(&request_id).is_ok());
        assert_eq!(req.headers().get(X_REQUEST_ID).unwrap(), request_id.as_str());
        assert_eq!(req.headers().get(X_FORWARDED_FOR).unwrap(), "192.168.1.20");
        assert_eq!(
            req.headers().get(X_FORWARDED_HOST).unwrap(),
            "app.example.com:8443"
        );
        assert_eq!(req.headers().get(X_FORWARDED_PROTO).unwrap(), "http");
    }

    #[test]
    fn test_forwarded_host_falls_back_to_uri_authority() {
        let mut req = Request::builder()
            .version(hyper::Version::HTTP_2)
            .uri("http://app.example.com:8443/dist/app.js")
            .body(empty_body())
            .unwrap();

        set_forwarding_headers(&mut req);

        assert_eq!(
            req.headers().get(X_FORWARDED_HOST).unwrap(),
            "app.example.com:8443"
        );
    }

    #[test]
    fn test_request_id_propagated() {
        let mut req = Request::builder()
            .uri("/dist/app.js")
            .header(X_REQUEST_ID, "abc-123")
            .body(empty_body())
            .unwrap();

        assert_eq!(set_forwarding_headers(&mut req), "abc-123");
        assert!(req.headers().get(X_FORWARDED_FOR).is_none());
    }

    #[tokio::test]
    async fn test_deadline_body_passes_frames_before_deadline() {
        let body = Full::new(Bytes::from_static(b"console.log(1)"));
        let deadline = Instant::now() + Duration::from_secs(5);

        let collected = DeadlineBody::new(body, deadline).collect().await.unwrap();
        assert_eq!(collected.to_bytes(), Bytes::from_static(b"console.log(1)"));
    }

    #[tokio::test]
    async fn test_deadline_body_errors_when_deadline_passes() {
        let deadline = Instant::now() + Duration::from_millis(50);
        let started = std::time::Instant::now();

        let err = DeadlineBody::new(Stalled, deadline).collect().await.unwrap_err();

        assert!(err.is::<DeadlineElapsed>());
        assert!(started.elapsed() < Duration::from_secs(2));
    }
}
