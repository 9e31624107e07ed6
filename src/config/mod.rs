//! Configuration layer: typed settings with layered precedence (file → env → CLI).

mod cli;

use std::{
    net::{Ipv4Addr, SocketAddr},
    num::{NonZeroU64, NonZeroUsize},
    path::PathBuf,
    str::FromStr,
    thread,
    time::Duration,
};

use clap::Parser;
use config::{Config, Environment, File};
use serde::Deserialize;
use thiserror::Error;
use tracing::level_filters::LevelFilter;

use crate::application::render::{
    DEFAULT_COMPLETION_CAP, DEFAULT_DEFAULT_MODE_WAIT, DEFAULT_EXPLICIT_MODE_WAIT,
};

pub use cli::{
    CliArgs, Command, RenderOverrides, SendArgs, ServeOverrides, SupervisorOverrides,
    TransportOverrides, WorkerMode,
};

const DEFAULT_CONFIG_BASENAME: &str = "config/default";
const LOCAL_CONFIG_BASENAME: &str = "markdownd";
const ENV_PREFIX: &str = "MARKDOWND";
pub const DEFAULT_SOCKET_PATH: &str = "/tmp/markdownd.sock";
const DEFAULT_SOCKET_MODE: u32 = 0o777;
const DEFAULT_MAX_REQUEST_BYTES: u64 = 16 * 1024 * 1024;
const DEFAULT_IDLE_TIMEOUT_MS: u64 = 30_000;
const DEFAULT_RESPAWN_INITIAL_BACKOFF_MS: u64 = 100;
const DEFAULT_RESPAWN_MAX_BACKOFF_MS: u64 = 10_000;
const DEFAULT_STABLE_AFTER_SECS: u64 = 10;
pub(crate) const DEFAULT_MERMAID_CLI_PATH: &str = "mmdc";
pub(crate) const DEFAULT_MERMAID_CACHE_DIR: &str = "/tmp/markdownd-mermaid";

/// Fully-resolved daemon settings after precedence resolution and validation.
#[derive(Debug, Clone)]
pub struct Settings {
    pub server: ServerSettings,
    pub render: RenderSettings,
    pub supervisor: SupervisorSettings,
    pub logging: LoggingSettings,
}

/// Where the daemon listens. Exactly one transport is active.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListenAddress {
    Unix(PathBuf),
    /// Always on the loopback interface.
    Tcp(SocketAddr),
}

impl std::fmt::Display for ListenAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ListenAddress::Unix(path) => write!(f, "unix:{}", path.display()),
            ListenAddress::Tcp(addr) => write!(f, "tcp:{addr}"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub listen: ListenAddress,
    pub socket_mode: u32,
    pub max_request_bytes: NonZeroUsize,
    pub idle_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct RenderSettings {
    pub assets_dir: Option<PathBuf>,
    pub mermaid_cli_path: PathBuf,
    pub mermaid_cache_dir: PathBuf,
    pub explicit_mode_wait: Duration,
    pub default_mode_wait: Duration,
    pub completion_cap: Duration,
}

#[derive(Debug, Clone)]
pub struct SupervisorSettings {
    pub workers: NonZeroUsize,
    pub mode: WorkerMode,
    pub respawn_initial_backoff: Duration,
    pub respawn_max_backoff: Duration,
    pub stable_after: Duration,
}

#[derive(Debug, Clone)]
pub struct LoggingSettings {
    pub level: LevelFilter,
    pub format: LogFormat,
}

#[derive(Debug, Clone, Copy)]
pub enum LogFormat {
    Json,
    Compact,
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to build configuration: {0}")]
    Build(#[from] config::ConfigError),
    #[error("invalid configuration for `{key}`: {reason}")]
    Invalid { key: &'static str, reason: String },
}

impl LoadError {
    fn invalid(key: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key,
            reason: reason.into(),
        }
    }
}

/// Load settings using the configured precedence (file → environment → CLI).
pub fn load(cli: &CliArgs) -> Result<Settings, LoadError> {
    let mut builder = Config::builder()
        .add_source(File::with_name(DEFAULT_CONFIG_BASENAME).required(false))
        .add_source(File::with_name(LOCAL_CONFIG_BASENAME).required(false));

    if let Some(path) = cli.config_file.as_ref() {
        builder = builder.add_source(File::from(path.as_path()).required(true));
    }

    builder = builder.add_source(Environment::with_prefix(ENV_PREFIX).separator("__"));

    let mut raw: RawSettings = builder.build()?.try_deserialize()?;
    raw.apply_serve_overrides(&cli.overrides);

    Settings::from_raw(raw)
}

/// Resolve configuration using the supplied CLI arguments, returning both for downstream use.
pub fn load_with_cli() -> Result<(CliArgs, Settings), LoadError> {
    let args = CliArgs::parse();
    let settings = load(&args)?;
    Ok((args, settings))
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSettings {
    server: RawServerSettings,
    render: RawRenderSettings,
    supervisor: RawSupervisorSettings,
    logging: RawLoggingSettings,
}

impl RawSettings {
    fn apply_serve_overrides(&mut self, overrides: &ServeOverrides) {
        self.apply_transport_overrides(&overrides.transport);
        if let Some(limit) = overrides.max_request_bytes {
            self.server.max_request_bytes = Some(limit);
        }
        if let Some(timeout) = overrides.idle_timeout_ms {
            self.server.idle_timeout_ms = Some(timeout);
        }
        if let Some(level) = overrides.log_level.as_ref() {
            self.logging.level = Some(level.clone());
        }
        if let Some(json) = overrides.log_json {
            self.logging.json = Some(json);
        }

        self.apply_render_overrides(&overrides.render);
        self.apply_supervisor_overrides(&overrides.supervisor);
    }

    /// A transport chosen on the command line replaces the other one from
    /// lower layers; choosing both is left for validation to reject.
    fn apply_transport_overrides(&mut self, overrides: &TransportOverrides) {
        match (overrides.socket_path.as_ref(), overrides.port) {
            (Some(path), Some(port)) => {
                self.server.socket_path = Some(path.clone());
                self.server.port = Some(port);
            }
            (Some(path), None) => {
                self.server.socket_path = Some(path.clone());
                self.server.port = None;
            }
            (None, Some(port)) => {
                self.server.socket_path = None;
                self.server.port = Some(port);
            }
            (None, None) => {}
        }
        if let Some(mode) = overrides.socket_mode.as_ref() {
            self.server.socket_mode = Some(mode.clone());
        }
    }

    fn apply_render_overrides(&mut self, overrides: &RenderOverrides) {
        if let Some(dir) = overrides.assets_dir.as_ref() {
            self.render.assets_dir = Some(dir.clone());
        }
        if let Some(path) = overrides.mermaid_cli_path.as_ref() {
            self.render.mermaid_cli_path = Some(path.clone());
        }
        if let Some(dir) = overrides.mermaid_cache_dir.as_ref() {
            self.render.mermaid_cache_dir = Some(dir.clone());
        }
        if let Some(wait) = overrides.explicit_mode_wait_ms {
            self.render.explicit_mode_wait_ms = Some(wait);
        }
        if let Some(wait) = overrides.default_mode_wait_ms {
            self.render.default_mode_wait_ms = Some(wait);
        }
        if let Some(cap) = overrides.completion_cap_ms {
            self.render.completion_cap_ms = Some(cap);
        }
    }

    fn apply_supervisor_overrides(&mut self, overrides: &SupervisorOverrides) {
        if let Some(workers) = overrides.workers {
            self.supervisor.workers = Some(workers);
        }
        if let Some(mode) = overrides.worker_mode {
            self.supervisor.mode = Some(mode);
        }
        if let Some(backoff) = overrides.respawn_initial_backoff_ms {
            self.supervisor.respawn_initial_backoff_ms = Some(backoff);
        }
        if let Some(backoff) = overrides.respawn_max_backoff_ms {
            self.supervisor.respawn_max_backoff_ms = Some(backoff);
        }
        if let Some(secs) = overrides.stable_after_secs {
            self.supervisor.stable_after_secs = Some(secs);
        }
    }
}

impl Settings {
    fn from_raw(raw: RawSettings) -> Result<Self, LoadError> {
        let RawSettings {
            server,
            render,
            supervisor,
            logging,
        } = raw;

        Ok(Self {
            server: build_server_settings(server)?,
            render: build_render_settings(render)?,
            supervisor: build_supervisor_settings(supervisor)?,
            logging: build_logging_settings(logging)?,
        })
    }
}

fn build_server_settings(server: RawServerSettings) -> Result<ServerSettings, LoadError> {
    let listen = match (server.socket_path, server.port) {
        (Some(_), Some(_)) => {
            return Err(LoadError::invalid(
                "server.port",
                "a socket path and a port cannot both be set",
            ));
        }
        (None, Some(0)) => {
            return Err(LoadError::invalid(
                "server.port",
                "port must be greater than zero",
            ));
        }
        (None, Some(port)) => {
            ListenAddress::Tcp(SocketAddr::from((Ipv4Addr::LOCALHOST, port)))
        }
        (Some(path), None) if path.as_os_str().is_empty() => {
            return Err(LoadError::invalid(
                "server.socket_path",
                "path must not be empty",
            ));
        }
        (Some(path), None) => ListenAddress::Unix(path),
        (None, None) => ListenAddress::Unix(PathBuf::from(DEFAULT_SOCKET_PATH)),
    };

    let socket_mode = match server.socket_mode {
        Some(raw) => parse_octal_mode(&raw)
            .map_err(|reason| LoadError::invalid("server.socket_mode", reason))?,
        None => DEFAULT_SOCKET_MODE,
    };

    let max_request_bytes_value = server
        .max_request_bytes
        .unwrap_or(DEFAULT_MAX_REQUEST_BYTES);
    let max_request_bytes = NonZeroU64::new(max_request_bytes_value)
        .and_then(|value| usize::try_from(value.get()).ok())
        .and_then(NonZeroUsize::new)
        .ok_or_else(|| {
            LoadError::invalid(
                "server.max_request_bytes",
                "must be greater than zero and fit in usize",
            )
        })?;

    let idle_timeout = positive_millis(
        server.idle_timeout_ms.unwrap_or(DEFAULT_IDLE_TIMEOUT_MS),
        "server.idle_timeout_ms",
    )?;

    Ok(ServerSettings {
        listen,
        socket_mode,
        max_request_bytes,
        idle_timeout,
    })
}

fn build_render_settings(render: RawRenderSettings) -> Result<RenderSettings, LoadError> {
    let cli_path = render
        .mermaid_cli_path
        .unwrap_or_else(|| PathBuf::from(DEFAULT_MERMAID_CLI_PATH));
    if cli_path.as_os_str().is_empty() {
        return Err(LoadError::invalid(
            "render.mermaid_cli_path",
            "path must not be empty",
        ));
    }

    let cache_dir = render
        .mermaid_cache_dir
        .unwrap_or_else(|| PathBuf::from(DEFAULT_MERMAID_CACHE_DIR));
    if cache_dir.as_os_str().is_empty() {
        return Err(LoadError::invalid(
            "render.mermaid_cache_dir",
            "path must not be empty",
        ));
    }

    let assets_dir = render
        .assets_dir
        .filter(|dir| !dir.as_os_str().is_empty());

    let explicit_mode_wait = match render.explicit_mode_wait_ms {
        Some(ms) => positive_millis(ms, "render.explicit_mode_wait_ms")?,
        None => DEFAULT_EXPLICIT_MODE_WAIT,
    };
    let default_mode_wait = match render.default_mode_wait_ms {
        Some(ms) => positive_millis(ms, "render.default_mode_wait_ms")?,
        None => DEFAULT_DEFAULT_MODE_WAIT,
    };
    let completion_cap = match render.completion_cap_ms {
        Some(ms) => positive_millis(ms, "render.completion_cap_ms")?,
        None => DEFAULT_COMPLETION_CAP,
    };

    Ok(RenderSettings {
        assets_dir,
        mermaid_cli_path: cli_path,
        mermaid_cache_dir: cache_dir,
        explicit_mode_wait,
        default_mode_wait,
        completion_cap,
    })
}

fn build_supervisor_settings(
    supervisor: RawSupervisorSettings,
) -> Result<SupervisorSettings, LoadError> {
    let workers = match supervisor.workers {
        Some(count) => NonZeroUsize::new(count).ok_or_else(|| {
            LoadError::invalid("supervisor.workers", "must be greater than zero")
        })?,
        None => thread::available_parallelism().unwrap_or(NonZeroUsize::MIN),
    };

    let respawn_initial_backoff = positive_millis(
        supervisor
            .respawn_initial_backoff_ms
            .unwrap_or(DEFAULT_RESPAWN_INITIAL_BACKOFF_MS),
        "supervisor.respawn_initial_backoff_ms",
    )?;
    let respawn_max_backoff = positive_millis(
        supervisor
            .respawn_max_backoff_ms
            .unwrap_or(DEFAULT_RESPAWN_MAX_BACKOFF_MS),
        "supervisor.respawn_max_backoff_ms",
    )?;
    if respawn_max_backoff < respawn_initial_backoff {
        return Err(LoadError::invalid(
            "supervisor.respawn_max_backoff_ms",
            "must not be smaller than the initial backoff",
        ));
    }

    let stable_after_secs = supervisor
        .stable_after_secs
        .unwrap_or(DEFAULT_STABLE_AFTER_SECS);
    if stable_after_secs == 0 {
        return Err(LoadError::invalid(
            "supervisor.stable_after_secs",
            "must be greater than zero",
        ));
    }

    Ok(SupervisorSettings {
        workers,
        mode: supervisor.mode.unwrap_or_default(),
        respawn_initial_backoff,
        respawn_max_backoff,
        stable_after: Duration::from_secs(stable_after_secs),
    })
}

fn build_logging_settings(logging: RawLoggingSettings) -> Result<LoggingSettings, LoadError> {
    let level = match logging.level {
        Some(level) => LevelFilter::from_str(level.as_str()).map_err(|err| {
            LoadError::invalid("logging.level", format!("failed to parse: {err}"))
        })?,
        None => LevelFilter::INFO,
    };

    let format = if logging.json.unwrap_or(false) {
        LogFormat::Json
    } else {
        LogFormat::Compact
    };

    Ok(LoggingSettings { level, format })
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawServerSettings {
    socket_path: Option<PathBuf>,
    port: Option<u16>,
    socket_mode: Option<String>,
    max_request_bytes: Option<u64>,
    idle_timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawRenderSettings {
    assets_dir: Option<PathBuf>,
    mermaid_cli_path: Option<PathBuf>,
    mermaid_cache_dir: Option<PathBuf>,
    explicit_mode_wait_ms: Option<u64>,
    default_mode_wait_ms: Option<u64>,
    completion_cap_ms: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSupervisorSettings {
    workers: Option<usize>,
    mode: Option<WorkerMode>,
    respawn_initial_backoff_ms: Option<u64>,
    respawn_max_backoff_ms: Option<u64>,
    stable_after_secs: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawLoggingSettings {
    level: Option<String>,
    json: Option<bool>,
}

/// Accepts `777`, `0777` and `0o777`.
fn parse_octal_mode(value: &str) -> Result<u32, String> {
    let trimmed = value.trim();
    let digits = trimmed
        .strip_prefix("0o")
        .or_else(|| trimmed.strip_prefix("0O"))
        .unwrap_or(trimmed);
    let mode = u32::from_str_radix(digits, 8)
        .map_err(|err| format!("`{value}` is not an octal mode: {err}"))?;
    if mode > 0o7777 {
        return Err(format!("`{value}` exceeds 0o7777"));
    }
    Ok(mode)
}

fn positive_millis(value: u64, key: &'static str) -> Result<Duration, LoadError> {
    if value == 0 {
        return Err(LoadError::invalid(key, "must be greater than zero"));
    }
    Ok(Duration::from_millis(value))
}
