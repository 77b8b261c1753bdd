//! Wires one conditional proxy per public path advertised by the build server

use crate::error::RouteError;
use crate::launcher::BuildServerInfo;
use crate::pipeline::Pipeline;
use crate::proxy::attach;
use crate::route::normalize_prefix;
use std::time::Duration;
use tracing::{info, warn};

/// Default upper bound for a proxied request, matching a typical HTTP
/// client's default timeout
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(100);

/// Register a proxy route for every public path of a build server.
///
/// Paths are registered in the order the build server reported them.
/// Repeated paths are skipped so each path has exactly one route. Returns the
/// number of routes added.
pub fn register_build_server(
    pipeline: &mut Pipeline,
    info: &BuildServerInfo,
    request_timeout: Duration,
) -> Result<usize, RouteError> {
    if info.public_paths.is_empty() {
        warn!(
            port = info.port,
            "Build server advertised no public paths, all requests pass through"
        );
        return Ok(0);
    }

    let mut registered = 0;
    for public_path in &info.public_paths {
        let prefix = normalize_prefix(public_path)?;
        if pipeline.has_route(&prefix) {
            warn!(prefix, "Public path advertised more than once, skipping");
            continue;
        }
        attach(pipeline, &prefix, info.port, request_timeout)?;
        registered += 1;
    }

    info!(
        port = info.port,
        routes = registered,
        prefixes = ?pipeline.route_prefixes(),
        "Build server routes registered"
    );

    Ok(registered)
}
