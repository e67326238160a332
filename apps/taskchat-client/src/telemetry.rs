//! Process-wide log setup for the `taskchat-sync` binary.

pub mod logging {
    use clap::ValueEnum;
    use std::fs::OpenOptions;
    use std::path::{Path, PathBuf};
    use std::sync::OnceLock;
    use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
    use tracing_subscriber::prelude::*;
    use tracing_subscriber::{fmt, EnvFilter};

    /// Complete `EnvFilter` directives; replaces the level-derived default.
    pub const FILTER_ENV: &str = "TASKCHAT_LOG_FILTER";
    /// Lifts HTTP and websocket library targets to the chosen level.
    const DEPS_ENV: &str = "TASKCHAT_TRACE_DEPS";

    const CLIENT_TARGETS: &[&str] = &["taskchat", "taskchat_sync", "taskchat_proto"];
    const NETWORK_TARGETS: &[&str] = &[
        "tokio_tungstenite",
        "tungstenite",
        "reqwest",
        "hyper",
        "h2",
        "rustls",
    ];

    #[derive(Clone, Copy, Debug, Default, ValueEnum, PartialEq, Eq, PartialOrd, Ord)]
    pub enum LogLevel {
        Error,
        #[default]
        Warn,
        Info,
        Debug,
        Trace,
    }

    impl LogLevel {
        fn directive(self) -> &'static str {
            match self {
                LogLevel::Error => "error",
                LogLevel::Warn => "warn",
                LogLevel::Info => "info",
                LogLevel::Debug => "debug",
                LogLevel::Trace => "trace",
            }
        }
    }

    #[derive(Clone, Debug, Default)]
    pub struct LogConfig {
        pub level: LogLevel,
        pub file: Option<PathBuf>,
    }

    #[derive(thiserror::Error, Debug)]
    pub enum InitError {
        #[error("cannot open log file {path:?}: {source}")]
        OpenFile {
            path: PathBuf,
            #[source]
            source: std::io::Error,
        },
        #[error("invalid log filter {directives:?}: {reason}")]
        Filter { directives: String, reason: String },
        #[error("failed to install subscriber: {0}")]
        Install(String),
    }

    static WRITER_GUARD: OnceLock<WorkerGuard> = OnceLock::new();

    /// Installs the global subscriber. Calls after the first succeed without
    /// changing anything.
    pub fn init(config: &LogConfig) -> Result<(), InitError> {
        if WRITER_GUARD.get().is_some() {
            return Ok(());
        }
        let directives = std::env::var(FILTER_ENV)
            .unwrap_or_else(|_| directives_for(config.level, deps_enabled()));
        let filter = EnvFilter::try_new(&directives).map_err(|err| InitError::Filter {
            reason: err.to_string(),
            directives: directives.clone(),
        })?;

        let (writer, guard) = open_writer(config.file.as_deref())?;
        let layer = fmt::layer()
            .with_writer(writer)
            .with_ansi(config.file.is_none())
            .with_target(config.level >= LogLevel::Debug)
            .with_thread_names(config.level == LogLevel::Trace);

        tracing_subscriber::registry()
            .with(filter)
            .with(layer)
            .try_init()
            .map_err(|err| InitError::Install(err.to_string()))?;
        let _ = WRITER_GUARD.set(guard);
        Ok(())
    }

    fn open_writer(path: Option<&Path>) -> Result<(NonBlocking, WorkerGuard), InitError> {
        let Some(path) = path else {
            return Ok(tracing_appender::non_blocking(std::io::stderr()));
        };
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|source| InitError::OpenFile {
                path: path.to_path_buf(),
                source,
            })?;
        Ok(tracing_appender::non_blocking(file))
    }

    fn deps_enabled() -> bool {
        std::env::var(DEPS_ENV).is_ok_and(|v| !v.is_empty() && v != "0")
    }

    /// Quiet levels apply globally. Debug and trace apply to the client's
    /// own targets while everything else stays at info; `deps` extends them
    /// to the network libraries.
    pub(crate) fn directives_for(level: LogLevel, deps: bool) -> String {
        if level <= LogLevel::Info {
            return level.directive().to_string();
        }
        let lifted = CLIENT_TARGETS
            .iter()
            .chain(if deps { NETWORK_TARGETS } else { &[] })
            .map(|target| format!("{target}={}", level.directive()));
        std::iter::once("info".to_string())
            .chain(lifted)
            .collect::<Vec<_>>()
            .join(",")
    }

}
