//! Error types and JSON error responses for the proxy

use crate::ProxyBody;
use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use serde::Serialize;
use std::path::PathBuf;

/// Error codes reported to callers when a proxied request fails
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProxyErrorCode {
    /// No route or upstream claimed the request
    NoRoute,
    /// Connection to the downstream server was refused or reset
    DownstreamUnavailable,
    /// Downstream did not answer within the request timeout
    DownstreamTimeout,
    /// Internal proxy error
    InternalError,
}

impl ProxyErrorCode {
    /// Get the default HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            ProxyErrorCode::NoRoute => StatusCode::NOT_FOUND,
            ProxyErrorCode::DownstreamUnavailable => StatusCode::BAD_GATEWAY,
            ProxyErrorCode::DownstreamTimeout => StatusCode::GATEWAY_TIMEOUT,
            ProxyErrorCode::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Get the error code as a string for the X-Proxy-Error header
    pub fn as_header_value(&self) -> &'static str {
        match self {
            ProxyErrorCode::NoRoute => "NO_ROUTE",
            ProxyErrorCode::DownstreamUnavailable => "DOWNSTREAM_UNAVAILABLE",
            ProxyErrorCode::DownstreamTimeout => "DOWNSTREAM_TIMEOUT",
            ProxyErrorCode::InternalError => "INTERNAL_ERROR",
        }
    }
}

/// JSON error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    /// The error code
    pub code: ProxyErrorCode,
    /// Human-readable error message
    pub message: String,
    /// HTTP status code (for reference)
    pub status: u16,
}

impl ErrorResponse {
    pub fn new(code: ProxyErrorCode, message: impl Into<String>) -> Self {
        Self {
            status: code.status_code().as_u16(),
            code,
            message: message.into(),
        }
    }

    /// Convert to JSON string
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!(
                r#"{{"code":"{}","message":"{}","status":{}}}"#,
                self.code.as_header_value(),
                self.message.replace('\"', "\\\""),
                self.status
            )
        })
    }
}

/// Create a JSON error response with X-Proxy-Error header
pub fn json_error_response(code: ProxyErrorCode, message: impl Into<String>) -> Response<ProxyBody> {
    let error = ErrorResponse::new(code, message);
    let body = error.to_json();

    Response::builder()
        .status(code.status_code())
        .header("Content-Type", "application/json")
        .header("X-Proxy-Error", code.as_header_value())
        .body(Full::new(Bytes::from(body)).map_err(|never| match never {}).boxed())
        .expect("valid response with StatusCode enum and static headers")
}

/// Raised when the relayed body outlives the request deadline
#[derive(Debug, thiserror::Error)]
#[error("downstream response exceeded the request timeout")]
pub struct DeadlineElapsed;

/// Errors raised while attaching a proxy route to a pipeline
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RouteError {
    #[error("route prefix '{0}' must start with '/'")]
    InvalidPrefix(String),

    #[error("a proxy route is already registered for '{0}'")]
    Duplicate(String),
}

/// Errors raised while starting the build server
///
/// Every variant carries the working directory of the launch attempt, since
/// most startup failures come from running in the wrong project or from a
/// missing `npm install`.
#[derive(Debug, thiserror::Error)]
pub enum LaunchError {
    #[error("failed to spawn build server command '{command}': {source}\nCurrent directory is: {}", .working_dir.display())]
    Spawn {
        command: String,
        working_dir: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("build server failed to start. Error was: {message}\nCurrent directory is: {}", .working_dir.display())]
    Reported { message: String, working_dir: PathBuf },

    #[error("build server exited before reporting its port ({status}).{}\nCurrent directory is: {}", stderr_suffix(.stderr), .working_dir.display())]
    Exited {
        status: String,
        stderr: String,
        working_dir: PathBuf,
    },

    #[error("build server sent an invalid startup message '{line}': {reason}\nCurrent directory is: {}", .working_dir.display())]
    Handshake {
        line: String,
        reason: String,
        working_dir: PathBuf,
    },

    #[error("build server did not report its port within {timeout_secs} seconds.{}\nCurrent directory is: {}", stderr_suffix(.stderr), .working_dir.display())]
    Timeout {
        timeout_secs: u64,
        stderr: String,
        working_dir: PathBuf,
    },

    #[error("failed to prepare build server bootstrap script: {0}")]
    Script(#[source] std::io::Error),

    #[error("invalid build server command: {0}")]
    Command(String),
}

fn stderr_suffix(stderr: &str) -> String {
    if stderr.trim().is_empty() {
        String::new()
    } else {
        format!(" Output was:\n{}", stderr.trim_end())
    }
}
