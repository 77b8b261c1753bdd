//! HTTP listener feeding every request through the pipeline

use crate::pipeline::Pipeline;
use crate::proxy::ClientAddr;
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper::Request;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info};

/// The dev proxy's front door
pub struct DevProxyServer {
    listener: TcpListener,
    pipeline: Arc<Pipeline>,
    shutdown_rx: watch::Receiver<bool>,
}

impl DevProxyServer {
    /// Bind the listener. Port 0 picks a free port; see [`Self::local_addr`].
    pub async fn bind(
        addr: SocketAddr,
        pipeline: Pipeline,
        shutdown_rx: watch::Receiver<bool>,
    ) -> std::io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            listener,
            pipeline: Arc::new(pipeline),
            shutdown_rx,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept connections until shutdown is signalled
    pub async fn run(self) -> anyhow::Result<()> {
        let addr = self.local_addr()?;
        info!(
            %addr,
            routes = ?self.pipeline.route_prefixes(),
            "Dev proxy listening (HTTP/1.1 and HTTP/2)"
        );

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = self.listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let pipeline = Arc::clone(&self.pipeline);
                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(stream, addr, pipeline).await {
                                    debug!(addr = %addr, error = %e, "Connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                changed = shutdown_rx.changed() => {
                    // A dropped sender also means shutdown
                    if changed.is_err() || *shutdown_rx.borrow() {
                        info!("Dev proxy shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    pipeline: Arc<Pipeline>,
) -> anyhow::Result<()> {
    let io = TokioIo::new(stream);

    let service = service_fn(move |req: Request<Incoming>| {
        let pipeline = Arc::clone(&pipeline);
        async move {
            let (mut parts, body) = req.into_parts();
            parts.extensions.insert(ClientAddr(addr));
            let req = Request::from_parts(parts, body.map_err(Into::into).boxed());
            Ok::<_, Infallible>(pipeline.dispatch(req).await)
        }
    });

    AutoBuilder::new(TokioExecutor::new())
        .http1()
        .preserve_header_case(true)
        .http2()
        .max_concurrent_streams(250)
        .serve_connection(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Connection error: {}", e))?;

    Ok(())
}
