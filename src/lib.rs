//! Bundlegate - A development proxy in front of a bundler's dev server
//!
//! This library provides a dev-time proxy that:
//! - Launches the bundler's dev server as a child process and learns its port
//!   and public paths from a one-line JSON handshake
//! - Forwards requests under those public paths to the dev server, streaming
//!   responses back as they are produced
//! - Passes every other request, untouched, to the application or a 404
//! - Bounds each proxied request with one deadline covering connect through
//!   the last body byte
//! - Reuses downstream connections through a shared pool

pub mod config;
pub mod error;
pub mod launcher;
pub mod pipeline;
pub mod pool;
pub mod proxy;
pub mod registrar;
pub mod route;
pub mod server;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");

/// Error type carried by relayed bodies
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Body type flowing through the pipeline in both directions
pub type ProxyBody = http_body_util::combinators::BoxBody<hyper::body::Bytes, BoxError>;
