use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

use crate::config::SyncConfig;
use crate::telemetry::logging::{LogConfig, LogLevel};

#[derive(Parser, Debug)]
#[command(
    name = "taskchat-sync",
    about = "Keep a taskchat session in sync: live events, offline queue, replay",
    author,
    version
)]
pub struct Cli {
    #[arg(
        long,
        global = true,
        value_name = "URL",
        help = "Base URL of the taskchat API (overrides TASKCHAT__SERVER_URL)"
    )]
    pub server_url: Option<String>,

    #[arg(
        long,
        global = true,
        value_name = "URL",
        help = "Websocket endpoint; derived from the server URL when omitted"
    )]
    pub socket_url: Option<String>,

    #[arg(
        long,
        global = true,
        env = "TASKCHAT_TOKEN",
        hide_env_values = true,
        help = "Bearer token sent with auth and REST fallback requests"
    )]
    pub token: Option<String>,

    #[arg(
        long = "store",
        global = true,
        value_name = "PATH",
        help = "Local store file (defaults to the per-user data directory)"
    )]
    pub store_path: Option<PathBuf>,

    #[command(flatten)]
    pub logging: LoggingArgs,

    #[command(subcommand)]
    pub command: Command,
}

impl Cli {
    /// Environment configuration with command-line overrides applied.
    pub fn sync_config(&self) -> SyncConfig {
        let mut config = SyncConfig::from_env();
        if let Some(url) = &self.server_url {
            config.server_url = url.clone();
        }
        if let Some(url) = &self.socket_url {
            config.socket_url = Some(url.clone());
        }
        if self.token.is_some() {
            config.auth_token = self.token.clone();
        }
        if self.store_path.is_some() {
            config.store_path = self.store_path.clone();
        }
        config
    }
}

#[derive(Args, Debug, Clone)]
pub struct LoggingArgs {
    #[arg(
        long = "log-level",
        global = true,
        value_enum,
        env = "TASKCHAT_LOG_LEVEL",
        default_value_t = LogLevel::Warn,
        help = "Minimum log level (error, warn, info, debug, trace)"
    )]
    pub level: LogLevel,

    #[arg(
        long = "log-file",
        global = true,
        value_name = "PATH",
        env = "TASKCHAT_LOG_FILE",
        help = "Write structured logs to the specified file"
    )]
    pub file: Option<PathBuf>,
}

impl LoggingArgs {
    pub fn to_config(&self) -> LogConfig {
        LogConfig {
            level: self.level,
            file: self.file.clone(),
        }
    }
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Stay connected and print live events until Ctrl-C
    Run(RunArgs),
    /// Post a message to a channel (queued while offline)
    Send(SendArgs),
    /// Edit a channel message
    Edit(EditArgs),
    /// Send a direct message to a user
    Dm(DmArgs),
    /// Print actions waiting in the local queue
    Queue,
    /// Probe the server health endpoint once
    Health,
    /// Rank mention candidates for the token under the cursor
    Mentions(MentionArgs),
}

#[derive(Args, Debug)]
pub struct RunArgs {
    #[arg(long, help = "Print Prometheus metrics on exit")]
    pub metrics: bool,
}

#[derive(Args, Debug, Clone)]
pub struct DeliveryArgs {
    #[arg(
        long,
        value_name = "FILE",
        help = "JSON directory used to resolve @handles into mention ids"
    )]
    pub directory: Option<PathBuf>,

    #[arg(
        long = "wait-secs",
        default_value_t = 5,
        help = "How long to wait for queued actions to flush before exiting"
    )]
    pub wait_secs: u64,
}

#[derive(Args, Debug)]
pub struct SendArgs {
    #[arg(long, value_name = "ID")]
    pub channel: i64,
    pub content: String,
    #[command(flatten)]
    pub delivery: DeliveryArgs,
}

#[derive(Args, Debug)]
pub struct EditArgs {
    #[arg(long, value_name = "ID")]
    pub channel: i64,
    #[arg(long, value_name = "ID")]
    pub message: i64,
    pub content: String,
    #[command(flatten)]
    pub delivery: DeliveryArgs,
}

#[derive(Args, Debug)]
pub struct DmArgs {
    #[arg(long, value_name = "ID")]
    pub user: i64,
    pub content: String,
    #[command(flatten)]
    pub delivery: DeliveryArgs,
}

#[derive(Args, Debug)]
pub struct MentionArgs {
    #[arg(long, value_name = "FILE", help = "JSON array of directory entries")]
    pub directory: PathBuf,

    #[arg(long, help = "Byte offset of the cursor (defaults to end of text)")]
    pub cursor: Option<usize>,

    #[arg(long, value_name = "N", help = "Complete with the N-th ranked candidate")]
    pub pick: Option<usize>,

    pub text: String,
}
