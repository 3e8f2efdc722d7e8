pub mod logging {
    use std::fs::OpenOptions;
    use std::path::PathBuf;
    use std::sync::OnceLock;

    use clap::ValueEnum;
    use tracing_appender::non_blocking::WorkerGuard;
    use tracing_subscriber::EnvFilter;

    /// Replaces the computed filter entirely, e.g. `meshcall::mesh=trace,warn`.
    pub const FILTER_ENV: &str = "MESHCALL_LOG_FILTER";
    /// At trace level, also trace webrtc, tungstenite and the HTTP stack.
    pub const TRACE_DEPS_ENV: &str = "MESHCALL_TRACE_DEPS";

    #[derive(Clone, Copy, Debug, Default, ValueEnum, PartialEq, Eq, PartialOrd, Ord)]
    pub enum LogLevel {
        Error,
        #[default]
        Warn,
        Info,
        Debug,
        Trace,
    }

    #[derive(Clone, Debug, Default)]
    pub struct LogConfig {
        pub level: LogLevel,
        /// Append to this file instead of writing to stderr.
        pub file: Option<PathBuf>,
    }

    #[derive(thiserror::Error, Debug)]
    pub enum InitError {
        #[error("failed to open log file {path:?}: {source}")]
        Io {
            path: PathBuf,
            source: std::io::Error,
        },
        #[error("failed to configure logger: {0}")]
        Configure(String),
    }

    static GUARD: OnceLock<WorkerGuard> = OnceLock::new();

    /// Installs the process-wide subscriber. Only the first call has an effect.
    pub fn init(config: &LogConfig) -> Result<(), InitError> {
        if GUARD.get().is_some() {
            return Ok(());
        }

        let filter = match std::env::var(FILTER_ENV) {
            Ok(custom) => EnvFilter::new(custom),
            Err(_) => EnvFilter::new(directives(config.level, trace_deps_requested())),
        };

        let (writer, guard) = match &config.file {
            Some(path) => {
                let file = OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)
                    .map_err(|source| InitError::Io {
                        path: path.clone(),
                        source,
                    })?;
                tracing_appender::non_blocking(file)
            }
            None => tracing_appender::non_blocking(std::io::stderr()),
        };

        let subscriber = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(config.level >= LogLevel::Debug)
            .with_thread_ids(config.level == LogLevel::Trace)
            .with_ansi(config.file.is_none())
            .with_writer(writer)
            .finish();
        tracing::subscriber::set_global_default(subscriber)
            .map_err(|err| InitError::Configure(err.to_string()))?;

        let _ = GUARD.set(guard);
        Ok(())
    }

    /// Below debug the level applies everywhere. At debug and trace only our
    /// own crates get the extra detail and dependencies stay at info, unless
    /// dependency tracing was asked for.
    fn directives(level: LogLevel, trace_deps: bool) -> String {
        match level {
            LogLevel::Error => "error".to_owned(),
            LogLevel::Warn => "warn".to_owned(),
            LogLevel::Info => "info".to_owned(),
            LogLevel::Debug => "info,meshcall=debug,meshcall_core=debug".to_owned(),
            LogLevel::Trace if trace_deps => "trace".to_owned(),
            LogLevel::Trace => "info,meshcall=trace,meshcall_core=trace".to_owned(),
        }
    }

    fn trace_deps_requested() -> bool {
        std::env::var(TRACE_DEPS_ENV).is_ok_and(|value| !value.is_empty() && value != "0")
    }

}
