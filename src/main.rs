use bundlegate::config::Config;
use bundlegate::launcher::BuildServer;
use bundlegate::pipeline::{NotFound, Pipeline};
use bundlegate::pool::{ConnectionPool, PoolConfig};
use bundlegate::proxy::AppUpstream;
use bundlegate::registrar::register_build_server;
use bundlegate::route::{ProxyTarget, DOWNSTREAM_SCHEME};
use bundlegate::server::DevProxyServer;
use bundlegate::{PKG_NAME, VERSION};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info};

const DEFAULT_CONFIG_PATH: &str = "bundlegate.toml";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("bundlegate=debug".parse()?),
        )
        .init();

    let explicit_path = std::env::args().nth(1).map(PathBuf::from);
    let config = load_config(explicit_path.as_deref())?;

    print_startup_banner(&config);

    // The proxy is useless without its build server, so startup failures are fatal
    let mut build_server = BuildServer::start(&config.bundler).await.map_err(|e| {
        error!(error = %e, "Failed to start build server");
        e
    })?;

    let pool = Arc::new(ConnectionPool::new(PoolConfig {
        max_idle_per_host: config.server.pool_max_idle_per_host,
        idle_timeout: Duration::from_secs(config.server.pool_idle_timeout_secs),
    }));
    let pool_stats = pool.stats();

    let request_timeout = config.server.request_timeout();
    let mut pipeline = match config.server.upstream {
        Some(ref upstream) => {
            info!(host = %upstream.host, port = upstream.port, "Forwarding unmatched requests to application");
            let target = ProxyTarget {
                scheme: DOWNSTREAM_SCHEME.to_string(),
                host: upstream.host.clone(),
                port: upstream.port,
                request_timeout,
            };
            Pipeline::with_pool(AppUpstream::new(target, Arc::clone(&pool)), pool)
        }
        None => Pipeline::with_pool(NotFound, pool),
    };

    if let Err(e) = register_build_server(&mut pipeline, build_server.info(), request_timeout) {
        error!(error = %e, "Failed to register build server routes");
        build_server.shutdown().await;
        return Err(e.into());
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let bind_addr: SocketAddr = format!("{}:{}", config.server.bind, config.server.port).parse()?;
    let server = match DevProxyServer::bind(bind_addr, pipeline, shutdown_rx).await {
        Ok(server) => server,
        Err(e) => {
            error!(addr = %bind_addr, error = %e, "Failed to bind listener");
            build_server.shutdown().await;
            return Err(e.into());
        }
    };

    let server_handle = tokio::spawn(async move {
        if let Err(e) = server.run().await {
            error!(error = %e, "Dev proxy error");
        }
    });

    wait_for_shutdown_signal().await?;

    let _ = shutdown_tx.send(true);

    info!(pid = ?build_server.pid(), "Stopping build server...");
    build_server.shutdown().await;

    let _ = tokio::time::timeout(Duration::from_secs(5), server_handle).await;

    info!(
        total_requests = pool_stats.get_total_requests(),
        failed_requests = pool_stats.get_failed_requests(),
        "Downstream request totals"
    );

    info!("Shutdown complete");
    Ok(())
}

/// Load the config file named on the command line, or `bundlegate.toml` if present
fn load_config(explicit_path: Option<&Path>) -> anyhow::Result<Config> {
    let path = match explicit_path {
        Some(path) => path,
        None if Path::new(DEFAULT_CONFIG_PATH).exists() => Path::new(DEFAULT_CONFIG_PATH),
        None => {
            info!("No configuration file found, using defaults");
            return Ok(Config::default());
        }
    };

    let config = Config::load(path).map_err(|e| {
        error!(path = %path.display(), error = %e, "Failed to load configuration");
        e
    })?;
    info!(path = %path.display(), "Configuration loaded");
    Ok(config)
}

async fn wait_for_shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received SIGINT (Ctrl+C), shutting down...");
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        info!("Received Ctrl+C, shutting down...");
    }

    Ok(())
}

fn print_startup_banner(config: &Config) {
    info!(name = PKG_NAME, version = VERSION, "Starting dev proxy");
    info!(
        bind = %config.server.bind,
        port = config.server.port,
        request_timeout_secs = config.server.request_timeout_secs,
        upstream = config.server.upstream.is_some(),
        "Server configuration"
    );
    info!(
        pool_max_idle = config.server.pool_max_idle_per_host,
        pool_idle_timeout_secs = config.server.pool_idle_timeout_secs,
        "Connection pool settings"
    );
    info!(
        entry_point = %config.bundler.entry_point,
        public_url = %config.bundler.public_url,
        hmr_port = config.bundler.port,
        external = config.bundler.external.is_some(),
        startup_timeout_secs = config.bundler.startup_timeout_secs,
        "Build server settings"
    );
}
