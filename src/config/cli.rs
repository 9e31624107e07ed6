use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum, ValueHint, builder::BoolishValueParser};
use serde::Deserialize;

/// Command-line arguments for the markdownd binary.
#[derive(Debug, Parser)]
#[command(
    name = "markdownd",
    version,
    about = "Render markdown sent over a local socket into HTML"
)]
pub struct CliArgs {
    /// Optional path to a configuration file.
    #[arg(
        long = "config-file",
        env = "MARKDOWND_CONFIG_FILE",
        value_name = "PATH",
        global = true
    )]
    pub config_file: Option<PathBuf>,

    #[command(flatten)]
    pub overrides: ServeOverrides,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Run the worker pool (the default when no command is given).
    Serve,
    /// Send one document to a running daemon and print the rendered HTML.
    Send(SendArgs),
}

#[derive(Debug, Args, Clone)]
pub struct SendArgs {
    /// Mode tag sent ahead of the document (2 to 10 bytes, e.g. `python`).
    #[arg(long, short = 'm', value_name = "TAG")]
    pub mode: Option<String>,

    /// File to send; standard input when omitted.
    #[arg(value_name = "FILE", value_hint = ValueHint::FilePath)]
    pub file: Option<PathBuf>,

    /// Give up on the response after this many milliseconds.
    #[arg(long = "timeout-ms", value_name = "MILLIS", default_value_t = 30_000)]
    pub timeout_ms: u64,
}

/// How worker slots are realised.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum WorkerMode {
    /// One child process per slot, all accepting on the inherited listener.
    #[default]
    Process,
    /// One task per slot inside the supervisor process.
    Task,
}

#[derive(Debug, Args, Default, Clone)]
pub struct TransportOverrides {
    /// Serve on a Unix socket at this path.
    #[arg(
        long = "socket-path",
        env = "MARKDOWN_SOCKET",
        value_name = "PATH",
        value_hint = ValueHint::FilePath,
        global = true
    )]
    pub socket_path: Option<PathBuf>,

    /// Serve on 127.0.0.1 at this TCP port instead of a Unix socket.
    #[arg(long = "port", env = "MARKDOWN_PORT", value_name = "PORT", global = true)]
    pub port: Option<u16>,

    /// Permissions applied to the Unix socket after binding, in octal.
    #[arg(long = "socket-mode", value_name = "OCTAL", global = true)]
    pub socket_mode: Option<String>,
}

#[derive(Debug, Args, Default, Clone)]
pub struct RenderOverrides {
    /// Directory with rendering assets; extra syntaxes are read from its `syntaxes/`.
    #[arg(
        long = "assets-dir",
        env = "EDITOR_MD",
        value_name = "PATH",
        value_hint = ValueHint::DirPath,
        global = true
    )]
    pub assets_dir: Option<PathBuf>,

    /// Override the Mermaid CLI executable path used for diagram rendering.
    #[arg(long = "render-mermaid-cli-path", value_name = "PATH", global = true)]
    pub mermaid_cli_path: Option<PathBuf>,

    /// Override the directory used to cache rendered Mermaid diagrams.
    #[arg(long = "render-mermaid-cache-dir", value_name = "PATH", global = true)]
    pub mermaid_cache_dir: Option<PathBuf>,

    /// Upper bound on the completion wait for requests with a mode tag.
    #[arg(long = "render-explicit-mode-wait-ms", value_name = "MILLIS", global = true)]
    pub explicit_mode_wait_ms: Option<u64>,

    /// Upper bound on the completion wait for untagged markdown.
    #[arg(long = "render-default-mode-wait-ms", value_name = "MILLIS", global = true)]
    pub default_mode_wait_ms: Option<u64>,

    /// Longest wait on a render that reports its own completion.
    #[arg(long = "render-completion-cap-ms", value_name = "MILLIS", global = true)]
    pub completion_cap_ms: Option<u64>,
}

#[derive(Debug, Args, Default, Clone)]
pub struct SupervisorOverrides {
    /// Number of workers; defaults to the available parallelism.
    #[arg(long = "workers", value_name = "COUNT", global = true)]
    pub workers: Option<usize>,

    /// Run workers as child processes or in-process tasks.
    #[arg(long = "worker-mode", value_name = "MODE", value_enum, global = true)]
    pub worker_mode: Option<WorkerMode>,

    /// First respawn delay for a crashed worker.
    #[arg(long = "respawn-initial-backoff-ms", value_name = "MILLIS", global = true)]
    pub respawn_initial_backoff_ms: Option<u64>,

    /// Ceiling for the doubling respawn delay.
    #[arg(long = "respawn-max-backoff-ms", value_name = "MILLIS", global = true)]
    pub respawn_max_backoff_ms: Option<u64>,

    /// A worker alive this long resets its respawn delay.
    #[arg(long = "stable-after-seconds", value_name = "SECONDS", global = true)]
    pub stable_after_secs: Option<u64>,
}

#[derive(Debug, Args, Default, Clone)]
pub struct ServeOverrides {
    #[command(flatten)]
    pub transport: TransportOverrides,

    #[command(flatten)]
    pub render: RenderOverrides,

    #[command(flatten)]
    pub supervisor: SupervisorOverrides,

    /// Largest accepted request in bytes.
    #[arg(long = "max-request-bytes", value_name = "BYTES", global = true)]
    pub max_request_bytes: Option<u64>,

    /// Close connections that send nothing for this long.
    #[arg(long = "idle-timeout-ms", value_name = "MILLIS", global = true)]
    pub idle_timeout_ms: Option<u64>,

    /// Override the base log level (trace|debug|info|warn|error).
    #[arg(long = "log-level", value_name = "LEVEL", global = true)]
    pub log_level: Option<String>,

    /// Toggle JSON logging.
    #[arg(
        long = "log-json",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new(),
        global = true
    )]
    pub log_json: Option<bool>,
}
