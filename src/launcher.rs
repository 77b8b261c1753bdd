//! Build server launcher
//!
//! Starts the bundler's dev server as a child process and waits for it to
//! report where it is listening. The child writes one JSON handshake line to
//! stdout, either `{"port":N,"publicPaths":[...]}` or `{"error":"..."}`.
//! Stdout lines that are not JSON objects, and everything after the
//! handshake, are relayed to the log.

use crate::config::BundlerOptions;
use crate::error::LaunchError;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::io::Write;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::NamedTempFile;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Environment variable carrying the JSON bundler options
pub const OPTIONS_ENV_VAR: &str = "BUNDLEGATE_OPTIONS";

/// Runtime used for the embedded bootstrap script
const DEFAULT_RUNTIME: &str = "node";

const BOOTSTRAP_SCRIPT: &str = include_str!("../scripts/parcel-dev-server.js");

/// Stderr lines kept for startup diagnostics
const STDERR_TAIL_LINES: usize = 40;

/// How long to wait for a dead child's pipes to drain
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

const LOG_TARGET: &str = "bundlegate::build_server";

/// What a started build server reports about itself
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildServerInfo {
    pub port: u16,
    pub public_paths: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Handshake {
    Failed { error: String },
    Ready(BuildServerInfo),
}

/// Options as the bundler expects them. The dev server port travels as `hmrPort`.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct WireOptions<'a> {
    watch: bool,
    hmr_port: u16,
    out_dir: &'a str,
    out_file: Option<&'a str>,
    public_url: &'a str,
    cache: bool,
    cache_dir: Option<&'a str>,
    minify: bool,
    target: &'static str,
    log_level: u8,
    source_maps: bool,
    detailed_report: bool,
    entry_point: &'a str,
}

/// Serialize the bundler-facing part of the options
pub fn options_json(options: &BundlerOptions) -> serde_json::Result<String> {
    serde_json::to_string(&WireOptions {
        watch: options.watch,
        hmr_port: options.port,
        out_dir: &options.out_dir,
        out_file: options.out_file.as_deref(),
        public_url: &options.public_url,
        cache: options.cache,
        cache_dir: options.cache_dir.as_deref(),
        minify: options.minify,
        target: options.target.as_str(),
        log_level: options.log_level.as_u8(),
        source_maps: options.source_maps,
        detailed_report: options.detailed_report,
        entry_point: &options.entry_point,
    })
}

/// Last lines a child wrote to stderr
#[derive(Debug, Clone, Default)]
struct OutputTail {
    lines: Arc<Mutex<VecDeque<String>>>,
}

impl OutputTail {
    fn push(&self, line: String) {
        let mut lines = self.lines.lock().unwrap_or_else(|e| e.into_inner());
        if lines.len() == STDERR_TAIL_LINES {
            lines.pop_front();
        }
        lines.push_back(line);
    }

    fn snapshot(&self) -> String {
        let lines = self.lines.lock().unwrap_or_else(|e| e.into_inner());
        lines.iter().map(String::as_str).collect::<Vec<_>>().join("\n")
    }
}

/// Line reader for child output that tolerates invalid UTF-8.
///
/// Bad bytes become U+FFFD so a stray byte never stops the reader and
/// leaves the child writing into a closed pipe.
struct OutputLines<R> {
    reader: BufReader<R>,
    buf: Vec<u8>,
}

impl<R: AsyncRead + Unpin> OutputLines<R> {
    fn new(inner: R) -> Self {
        Self {
            reader: BufReader::new(inner),
            buf: Vec::new(),
        }
    }

    async fn next_line(&mut self) -> std::io::Result<Option<String>> {
        self.buf.clear();
        if self.reader.read_until(b'\n', &mut self.buf).await? == 0 {
            return Ok(None);
        }
        let line = String::from_utf8_lossy(&self.buf);
        Ok(Some(line.trim_end_matches(['\n', '\r']).to_string()))
    }
}

struct ManagedProcess {
    child: Child,
    grace_period: Duration,
    relays: Vec<JoinHandle<()>>,
    // Removed when the process handle is dropped
    _script: Option<NamedTempFile>,
}

/// Handle to a running build server
pub struct BuildServer {
    info: BuildServerInfo,
    process: Option<ManagedProcess>,
}

impl BuildServer {
    /// Launch the build server described by `options` and wait for its handshake.
    ///
    /// With `options.external` set, nothing is spawned and the configured
    /// server is adopted as-is.
    pub async fn start(options: &BundlerOptions) -> Result<Self, LaunchError> {
        if let Some(ref external) = options.external {
            return Ok(Self::external(BuildServerInfo {
                port: external.port,
                public_paths: external.public_paths.clone(),
            }));
        }

        let working_dir = match options.project_path {
            Some(ref path) => PathBuf::from(path),
            None => std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
        };

        let wire_options =
            options_json(options).map_err(|e| LaunchError::Script(e.into()))?;
        let (program, args, script) = resolve_command(options)?;
        let display_command = shell_words::join(std::iter::once(&program).chain(args.iter()));

        info!(
            command = %display_command,
            working_dir = %working_dir.display(),
            "Starting build server"
        );

        let mut cmd = Command::new(&program);
        cmd.args(&args);
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.current_dir(&working_dir);
        cmd.envs(&options.env);
        cmd.env(OPTIONS_ENV_VAR, &wire_options);
        cmd.kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|source| LaunchError::Spawn {
            command: display_command,
            working_dir: working_dir.clone(),
            source,
        })?;
        debug!(pid = child.id(), "Build server process spawned");

        let tail = OutputTail::default();
        let mut stderr_relay = match child.stderr.take() {
            Some(stderr) => spawn_stderr_relay(stderr, tail.clone()),
            None => tokio::spawn(async {}),
        };
        let Some(stdout) = child.stdout.take() else {
            return Err(LaunchError::Handshake {
                line: String::new(),
                reason: "stdout of the build server is not available".to_string(),
                working_dir,
            });
        };
        let mut stdout_lines = OutputLines::new(stdout);

        let startup_timeout = options.startup_timeout();
        let event = tokio::time::timeout(startup_timeout, await_handshake(&mut stdout_lines)).await;

        let info = match event {
            Ok(StartupEvent::Ready(info)) => info,
            Ok(StartupEvent::Reported(message)) => {
                abort_startup(&mut child, &mut stderr_relay).await;
                return Err(LaunchError::Reported {
                    message,
                    working_dir,
                });
            }
            Ok(StartupEvent::Malformed { line, reason }) => {
                abort_startup(&mut child, &mut stderr_relay).await;
                return Err(LaunchError::Handshake {
                    line,
                    reason,
                    working_dir,
                });
            }
            Ok(StartupEvent::Closed) => {
                let status = match tokio::time::timeout(DRAIN_TIMEOUT, child.wait()).await {
                    Ok(Ok(status)) => status.to_string(),
                    _ => {
                        let _ = child.kill().await;
                        "stdout closed".to_string()
                    }
                };
                let _ = tokio::time::timeout(DRAIN_TIMEOUT, &mut stderr_relay).await;
                return Err(LaunchError::Exited {
                    status,
                    stderr: tail.snapshot(),
                    working_dir,
                });
            }
            Err(_) => {
                abort_startup(&mut child, &mut stderr_relay).await;
                return Err(LaunchError::Timeout {
                    timeout_secs: startup_timeout.as_secs(),
                    stderr: tail.snapshot(),
                    working_dir,
                });
            }
        };

        if info.port == 0 {
            abort_startup(&mut child, &mut stderr_relay).await;
            return Err(LaunchError::Handshake {
                line: format!("{:?}", info),
                reason: "port must be greater than 0".to_string(),
                working_dir,
            });
        }

        info!(
            pid = child.id(),
            port = info.port,
            public_paths = ?info.public_paths,
            "Build server ready"
        );

        let stdout_relay = spawn_stdout_relay(stdout_lines);

        Ok(Self {
            info,
            process: Some(ManagedProcess {
                child,
                grace_period: options.shutdown_grace_period(),
                relays: vec![stdout_relay, stderr_relay],
                _script: script,
            }),
        })
    }

    /// Adopt a build server that is already running
    pub fn external(info: BuildServerInfo) -> Self {
        info!(
            port = info.port,
            public_paths = ?info.public_paths,
            "Using external build server"
        );
        Self {
            info,
            process: None,
        }
    }

    pub fn info(&self) -> &BuildServerInfo {
        &self.info
    }

    pub fn port(&self) -> u16 {
        self.info.port
    }

    /// Process ID, if this handle owns a running child
    pub fn pid(&self) -> Option<u32> {
        self.process.as_ref().and_then(|p| p.child.id())
    }

    /// Stop the build server: SIGTERM, then SIGKILL after the grace period.
    ///
    /// Safe to call more than once; adopted servers are left running.
    pub async fn shutdown(&mut self) {
        let Some(mut process) = self.process.take() else {
            return;
        };

        stop_process(&mut process.child, process.grace_period).await;

        for relay in process.relays {
            relay.abort();
        }
    }
}

enum StartupEvent {
    Ready(BuildServerInfo),
    Reported(String),
    Malformed { line: String, reason: String },
    Closed,
}

/// Read stdout until the handshake line arrives or the stream ends
async fn await_handshake(lines: &mut OutputLines<ChildStdout>) -> StartupEvent {
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => return StartupEvent::Closed,
            Err(e) => {
                return StartupEvent::Malformed {
                    line: String::new(),
                    reason: e.to_string(),
                }
            }
        };

        let trimmed = line.trim();
        if !trimmed.starts_with('{') {
            relay_line("stdout", trimmed);
            continue;
        }

        return match serde_json::from_str::<Handshake>(trimmed) {
            Ok(Handshake::Ready(info)) => StartupEvent::Ready(info),
            Ok(Handshake::Failed { error }) => StartupEvent::Reported(error),
            Err(e) => StartupEvent::Malformed {
                line: trimmed.to_string(),
                reason: e.to_string(),
            },
        };
    }
}

/// Kill a child that failed its startup and let its stderr drain
async fn abort_startup(child: &mut Child, stderr_relay: &mut JoinHandle<()>) {
    if let Err(e) = child.kill().await {
        debug!(error = %e, "Build server already gone");
    }
    let _ = tokio::time::timeout(DRAIN_TIMEOUT, stderr_relay).await;
}

/// Pick the program and arguments: the configured command, or node with the
/// embedded bootstrap script
fn resolve_command(
    options: &BundlerOptions,
) -> Result<(String, Vec<String>, Option<NamedTempFile>), LaunchError> {
    match options.command {
        Some(ref command) => {
            let mut words =
                shell_words::split(command).map_err(|e| LaunchError::Command(e.to_string()))?;
            if words.is_empty() {
                return Err(LaunchError::Command("command is empty".to_string()));
            }
            let program = words.remove(0);
            words.extend(options.args.iter().cloned());
            Ok((program, words, None))
        }
        None => {
            let script = write_bootstrap_script()?;
            let mut args = vec![script.path().to_string_lossy().into_owned()];
            args.extend(options.args.iter().cloned());
            Ok((DEFAULT_RUNTIME.to_string(), args, Some(script)))
        }
    }
}

fn write_bootstrap_script() -> Result<NamedTempFile, LaunchError> {
    let mut file = tempfile::Builder::new()
        .prefix("bundlegate-")
        .suffix(".js")
        .tempfile()
        .map_err(LaunchError::Script)?;
    file.write_all(BOOTSTRAP_SCRIPT.as_bytes())
        .map_err(LaunchError::Script)?;
    file.flush().map_err(LaunchError::Script)?;
    Ok(file)
}

fn relay_line(stream: &'static str, line: &str) {
    let line = line.trim_end();
    if !line.is_empty() {
        info!(target: LOG_TARGET, stream, "{}", line);
    }
}

fn spawn_stdout_relay(mut lines: OutputLines<ChildStdout>) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Ok(Some(line)) = lines.next_line().await {
            relay_line("stdout", &line);
        }
    })
}

fn spawn_stderr_relay(stderr: ChildStderr, tail: OutputTail) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut lines = OutputLines::new(stderr);
        while let Ok(Some(line)) = lines.next_line().await {
            relay_line("stderr", &line);
            tail.push(line);
        }
    })
}

/// Stop a child process
async fn stop_process(child: &mut Child, grace_period: Duration) {
    if let Ok(Some(status)) = child.try_wait() {
        info!(?status, "Build server had already exited");
        return;
    }

    if let Some(pid) = child.id() {
        info!(pid, "Sending SIGTERM to build server");

        // Send SIGTERM on Unix, or kill on other platforms
        #[cfg(unix)]
        unsafe {
            libc::kill(pid as libc::pid_t, libc::SIGTERM);
        }

        #[cfg(not(unix))]
        {
            let _ = child.start_kill();
        }
    }

    match tokio::time::timeout(grace_period, child.wait()).await {
        Ok(Ok(status)) => {
            info!(?status, "Build server exited gracefully");
        }
        Ok(Err(e)) => {
            warn!(error = %e, "Error waiting for build server to exit");
        }
        Err(_) => {
            warn!(
                grace_period_secs = grace_period.as_secs(),
                "Grace period exceeded, sending SIGKILL"
            );
            if let Err(e) = child.kill().await {
                error!(error = %e, "Failed to kill build server");
            }
        }
    }
}
