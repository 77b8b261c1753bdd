//! Request pipeline: an ordered middleware chain ending in an endpoint
//!
//! A middleware either answers a request itself or hands it to the rest of
//! the chain through [`Next`]. The pipeline is built once at startup and is
//! read-only while serving, so concurrent requests share it without locks.

use crate::error::{json_error_response, ProxyErrorCode};
use crate::pool::{ConnectionPool, PoolConfig};
use crate::ProxyBody;
use futures::future::BoxFuture;
use hyper::{Request, Response};
use std::sync::Arc;
use tracing::debug;

/// Future returned by middleware and endpoints
pub type HandlerFuture<'a> = BoxFuture<'a, Response<ProxyBody>>;

/// A stage in the pipeline that may answer a request or pass it on
pub trait Middleware: Send + Sync {
    fn handle<'a>(&'a self, req: Request<ProxyBody>, next: Next<'a>) -> HandlerFuture<'a>;

    /// Path prefix this middleware claims, if it is a proxy route
    fn route_prefix(&self) -> Option<&str> {
        None
    }
}

/// The terminal stage that answers requests no middleware claimed
pub trait Endpoint: Send + Sync {
    fn call(&self, req: Request<ProxyBody>) -> HandlerFuture<'_>;
}

/// The remainder of the chain after the current middleware
pub struct Next<'a> {
    middleware: &'a [Arc<dyn Middleware>],
    endpoint: &'a dyn Endpoint,
}

impl<'a> Next<'a> {
    /// Hand the request, untouched, to the rest of the chain
    pub fn run(self, req: Request<ProxyBody>) -> HandlerFuture<'a> {
        match self.middleware.split_first() {
            Some((head, tail)) => head.handle(
                req,
                Next {
                    middleware: tail,
                    endpoint: self.endpoint,
                },
            ),
            None => self.endpoint.call(req),
        }
    }
}

/// Endpoint answering every request with a JSON 404
#[derive(Debug, Default, Clone, Copy)]
pub struct NotFound;

impl Endpoint for NotFound {
    fn call(&self, req: Request<ProxyBody>) -> HandlerFuture<'_> {
        debug!(method = %req.method(), uri = %req.uri(), "No route claimed request");
        Box::pin(async move {
            json_error_response(ProxyErrorCode::NoRoute, "No route for this path")
        })
    }
}

/// An ordered middleware chain with a shared downstream client
pub struct Pipeline {
    middleware: Vec<Arc<dyn Middleware>>,
    endpoint: Arc<dyn Endpoint>,
    pool: Arc<ConnectionPool>,
}

impl Pipeline {
    pub fn new(endpoint: impl Endpoint + 'static) -> Self {
        Self::with_pool_config(endpoint, PoolConfig::default())
    }

    pub fn with_pool_config(endpoint: impl Endpoint + 'static, pool_config: PoolConfig) -> Self {
        Self::with_pool(endpoint, Arc::new(ConnectionPool::new(pool_config)))
    }

    /// Build a pipeline around an existing pool, e.g. one shared with the endpoint
    pub fn with_pool(endpoint: impl Endpoint + 'static, pool: Arc<ConnectionPool>) -> Self {
        Self {
            middleware: Vec::new(),
            endpoint: Arc::new(endpoint),
            pool,
        }
    }

    /// Append a middleware; it runs after everything already in the chain
    pub fn push(&mut self, middleware: impl Middleware + 'static) {
        self.middleware.push(Arc::new(middleware));
    }

    /// Get the shared downstream pool
    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    pub fn len(&self) -> usize {
        self.middleware.len()
    }

    pub fn is_empty(&self) -> bool {
        self.middleware.is_empty()
    }

    /// Prefixes of every proxy route in the chain, in order
    pub fn route_prefixes(&self) -> Vec<&str> {
        self.middleware.iter().filter_map(|m| m.route_prefix()).collect()
    }

    pub fn has_route(&self, prefix: &str) -> bool {
        self.middleware.iter().any(|m| m.route_prefix() == Some(prefix))
    }

    /// Run a request through the chain
    pub async fn dispatch(&self, req: Request<ProxyBody>) -> Response<ProxyBody> {
        Next {
            middleware: &self.middleware,
            endpoint: self.endpoint.as_ref(),
        }
        .run(req)
        .await
    }
}
