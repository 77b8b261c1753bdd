use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

/// Global configuration for the dev proxy
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    /// Listener and downstream settings
    #[serde(default)]
    pub server: ServerConfig,

    /// Build server launch options
    #[serde(default)]
    pub bundler: BundlerOptions,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Bind address (default: 127.0.0.1)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// Listen port (default: 8080)
    #[serde(default = "default_listen_port")]
    pub port: u16,

    /// Application server receiving every request no build-server route claims.
    /// Without it, unclaimed requests get a 404.
    pub upstream: Option<UpstreamConfig>,

    /// Max seconds for a proxied request, connect through last body byte (default: 100)
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Maximum idle connections per downstream host (default: 10)
    #[serde(default = "default_pool_max_idle_per_host")]
    pub pool_max_idle_per_host: usize,

    /// Idle connection timeout in seconds (default: 90)
    #[serde(default = "default_pool_idle_timeout")]
    pub pool_idle_timeout_secs: u64,
}

impl ServerConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind_address(),
            port: default_listen_port(),
            upstream: None,
            request_timeout_secs: default_request_timeout(),
            pool_max_idle_per_host: default_pool_max_idle_per_host(),
            pool_idle_timeout_secs: default_pool_idle_timeout(),
        }
    }
}

/// Application server that sits behind the proxy
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct UpstreamConfig {
    #[serde(default = "default_upstream_host")]
    pub host: String,
    pub port: u16,
}

/// Build target passed to the bundler
#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BundlerTarget {
    #[default]
    Browser,
    Node,
    Electron,
}

impl BundlerTarget {
    pub fn as_str(&self) -> &'static str {
        match self {
            BundlerTarget::Browser => "browser",
            BundlerTarget::Node => "node",
            BundlerTarget::Electron => "electron",
        }
    }
}

/// Bundler log verbosity, sent to the bundler as a number from 0 to 4
#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BundlerLogLevel {
    Nothing,
    Errors,
    Warnings,
    #[default]
    Everything,
    Verbose,
}

impl BundlerLogLevel {
    pub fn as_u8(&self) -> u8 {
        match self {
            BundlerLogLevel::Nothing => 0,
            BundlerLogLevel::Errors => 1,
            BundlerLogLevel::Warnings => 2,
            BundlerLogLevel::Everything => 3,
            BundlerLogLevel::Verbose => 4,
        }
    }
}

/// An already-running build server to adopt instead of launching one
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct ExternalBuildServer {
    pub port: u16,
    #[serde(default = "default_public_paths")]
    pub public_paths: Vec<String>,
}

/// Options for starting the build server.
///
/// Everything except the launcher fields (`project_path`, `env`, `command`,
/// `args`, timeouts, `external`) is handed to the bundler untouched.
///
/// # Security Warning
///
/// `command` and `args` are executed directly. Keep configuration files
/// writable only by the developer running the proxy.
#[derive(Debug, Deserialize, Clone)]
pub struct BundlerOptions {
    /// Entry point file for the bundler (default: index.html)
    #[serde(default = "default_entry_point")]
    pub entry_point: String,

    /// Port for the bundler's dev server (default: 0, picks a free port)
    #[serde(default)]
    pub port: u16,

    /// Directory for build output (default: wwwroot/debug)
    #[serde(default = "default_out_dir")]
    pub out_dir: String,

    /// Name of the output file
    pub out_file: Option<String>,

    /// URL prefix the bundled assets are served under (default: /)
    #[serde(default = "default_public_url")]
    pub public_url: String,

    /// Enable the bundler's cache (default: true)
    #[serde(default = "default_true")]
    pub cache: bool,

    /// Cache directory
    pub cache_dir: Option<String>,

    /// Minify output (default: false)
    #[serde(default)]
    pub minify: bool,

    /// browser, node or electron (default: browser)
    #[serde(default)]
    pub target: BundlerTarget,

    /// Bundler log verbosity (default: everything)
    #[serde(default)]
    pub log_level: BundlerLogLevel,

    /// Emit source maps (default: true)
    #[serde(default = "default_true")]
    pub source_maps: bool,

    /// Print a detailed bundle report (default: false)
    #[serde(default)]
    pub detailed_report: bool,

    /// Rebuild on file changes (default: true)
    #[serde(default = "default_true")]
    pub watch: bool,

    // === Launcher fields ===
    /// Working directory for the build server (default: current directory)
    pub project_path: Option<String>,

    /// Extra environment variables for the build server process
    #[serde(default)]
    pub env: HashMap<String, String>,

    /// Command to run instead of the embedded bootstrap script. Split with
    /// shell quoting rules, so `"npx my-dev-server --quiet"` works.
    pub command: Option<String>,

    /// Extra arguments appended to `command`
    #[serde(default)]
    pub args: Vec<String>,

    /// Seconds to wait for the build server to report its port (default: 60)
    #[serde(default = "default_startup_timeout")]
    pub startup_timeout_secs: u64,

    /// Grace period in seconds between SIGTERM and SIGKILL (default: 5)
    #[serde(default = "default_shutdown_grace_period")]
    pub shutdown_grace_period_secs: u64,

    /// Adopt a running build server instead of launching one
    pub external: Option<ExternalBuildServer>,
}

impl Default for BundlerOptions {
    fn default() -> Self {
        Self {
            entry_point: default_entry_point(),
            port: 0,
            out_dir: default_out_dir(),
            out_file: None,
            public_url: default_public_url(),
            cache: true,
            cache_dir: None,
            minify: false,
            target: BundlerTarget::default(),
            log_level: BundlerLogLevel::default(),
            source_maps: true,
            detailed_report: false,
            watch: true,
            project_path: None,
            env: HashMap::new(),
            command: None,
            args: Vec::new(),
            startup_timeout_secs: default_startup_timeout(),
            shutdown_grace_period_secs: default_shutdown_grace_period(),
            external: None,
        }
    }
}

impl BundlerOptions {
    pub fn startup_timeout(&self) -> Duration {
        Duration::from_secs(self.startup_timeout_secs)
    }

    pub fn shutdown_grace_period(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_period_secs)
    }

    /// Set the command to run (builder pattern)
    pub fn with_command(mut self, command: &str) -> Self {
        self.command = Some(command.to_string());
        self
    }

    /// Set the working directory (builder pattern)
    pub fn with_project_path(mut self, path: &str) -> Self {
        self.project_path = Some(path.to_string());
        self
    }

    /// Validate the bundler options
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if !self.public_url.starts_with('/') {
            errors.push(format!(
                "bundler: 'public_url' must start with '/', got '{}'",
                self.public_url
            ));
        }

        if self.startup_timeout_secs == 0 {
            errors.push("bundler: 'startup_timeout_secs' must be greater than 0".to_string());
        }

        if let Some(ref command) = self.command {
            match shell_words::split(command) {
                Ok(words) if words.is_empty() => {
                    errors.push("bundler: 'command' must not be empty".to_string());
                }
                Ok(_) => {}
                Err(e) => errors.push(format!("bundler: 'command' is not parseable: {}", e)),
            }
        }

        if let Some(ref external) = self.external {
            if external.port == 0 {
                errors.push("bundler.external: 'port' must be greater than 0".to_string());
            }
            for path in &external.public_paths {
                if !path.starts_with('/') {
                    errors.push(format!(
                        "bundler.external: public path '{}' must start with '/'",
                        path
                    ));
                }
            }
        }

        errors
    }
}

// Default value functions
fn default_bind_address() -> String {
    "127.0.0.1".to_string()
}

fn default_listen_port() -> u16 {
    8080
}

fn default_upstream_host() -> String {
    "localhost".to_string()
}

fn default_request_timeout() -> u64 {
    100 // matches the usual HTTP client default
}

fn default_pool_max_idle_per_host() -> usize {
    10
}

fn default_pool_idle_timeout() -> u64 {
    90
}

fn default_entry_point() -> String {
    "index.html".to_string()
}

fn default_out_dir() -> String {
    "wwwroot/debug".to_string()
}

fn default_public_url() -> String {
    "/".to_string()
}

fn default_public_paths() -> Vec<String> {
    vec![default_public_url()]
}

fn default_true() -> bool {
    true
}

fn default_startup_timeout() -> u64 {
    60 // first builds of large projects are slow
}

fn default_shutdown_grace_period() -> u64 {
    5
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate all configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        if self.server.request_timeout_secs == 0 {
            errors.push("server: 'request_timeout_secs' must be greater than 0".to_string());
        }

        if let Some(ref upstream) = self.server.upstream {
            if upstream.port == 0 {
                errors.push("server.upstream: 'port' must be greater than 0".to_string());
            }
        }

        errors.extend(self.bundler.validate());

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }
}
