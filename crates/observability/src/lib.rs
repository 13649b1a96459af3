// crates/observability/src/lib.rs
//! Process-wide tracing setup for gateway binaries.
//!
//! Console output is compact text or JSON lines. When a log directory is
//! configured, a JSON copy of every event also goes to a daily-rolling file
//! through a non-blocking writer; keep the returned [`TracingGuard`] alive for
//! the life of the process or buffered lines are lost.

use std::path::PathBuf;

use thiserror::Error;
use tracing::Subscriber;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::{fmt, EnvFilter};

const ENV_FILTER: &str = "WA_GATEWAY_LOG";
const ENV_FORMAT: &str = "WA_GATEWAY_LOG_FORMAT";
const ENV_DIR: &str = "WA_GATEWAY_LOG_DIR";
const DEFAULT_FILTER: &str = "info";
const FILE_PREFIX: &str = "wa-gateway.log";

#[derive(Debug, Error)]
pub enum ObservabilityError {
    #[error("invalid log filter: {0}")]
    Filter(#[from] tracing_subscriber::filter::ParseError),

    #[error("failed to install global subscriber: {0}")]
    SetGlobal(#[from] tracing::subscriber::SetGlobalDefaultError),

    #[error("failed to create log directory {path}: {source}")]
    LogDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Compact,
    Json,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogConfig {
    /// `EnvFilter` directive string.
    pub filter: String,
    pub format: LogFormat,
    pub log_dir: Option<PathBuf>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            filter: DEFAULT_FILTER.into(),
            format: LogFormat::Compact,
            log_dir: None,
        }
    }
}

impl LogConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// `RUST_LOG` wins over `WA_GATEWAY_LOG`.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let filter = non_empty("RUST_LOG")
            .or_else(|| non_empty(ENV_FILTER))
            .unwrap_or_else(|| DEFAULT_FILTER.into());
        let format = match non_empty(ENV_FORMAT) {
            Some(v) if v.trim().eq_ignore_ascii_case("json") => LogFormat::Json,
            _ => LogFormat::Compact,
        };
        Self {
            filter,
            format,
            log_dir: non_empty(ENV_DIR).map(PathBuf::from),
        }
    }
}

/// Keeps the file writer flushing. Dropping it flushes and stops the worker.
#[must_use = "dropping the guard stops file logging"]
pub struct TracingGuard {
    _file: Option<WorkerGuard>,
}

/// Install the global subscriber described by `config`.
///
/// Called once at the top of the gateway binary's `main`:
///
/// ```
/// use wa_gateway_observability::{init_tracing, LogConfig, LogFormat};
///
/// let config = LogConfig {
///     format: LogFormat::Json,
///     ..LogConfig::from_lookup(|_| None)
/// };
/// let _guard = init_tracing(&config)?;
/// tracing::info!(account_id = "main", "gateway starting");
/// # Ok::<(), wa_gateway_observability::ObservabilityError>(())
/// ```
pub fn init_tracing(config: &LogConfig) -> Result<TracingGuard, ObservabilityError> {
    let (subscriber, guard) = build_subscriber(config)?;
    tracing::subscriber::set_global_default(subscriber)?;
    Ok(guard)
}

/// Build without installing, for scoped use with `tracing::subscriber::with_default`.
pub fn build_subscriber(
    config: &LogConfig,
) -> Result<(Box<dyn Subscriber + Send + Sync>, TracingGuard), ObservabilityError> {
    let filter = EnvFilter::try_new(&config.filter)?;

    let (file_layer, file_guard) = match &config.log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir).map_err(|source| ObservabilityError::LogDir {
                path: dir.clone(),
                source,
            })?;
            let appender = tracing_appender::rolling::daily(dir, FILE_PREFIX);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer().json().with_ansi(false).with_writer(writer);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    let base = tracing_subscriber::registry().with(filter).with(file_layer);
    let subscriber: Box<dyn Subscriber + Send + Sync> = match config.format {
        LogFormat::Json => Box::new(base.with(fmt::layer().json().with_target(true))),
        LogFormat::Compact => Box::new(base.with(fmt::layer().compact())),
    };

    Ok((subscriber, TracingGuard { _file: file_guard }))
}
