//! Unified logging module for the alarm pipeline services
//!
//! Console output always; an optional daily-rolling file sink when a log
//! directory is configured.

use std::path::PathBuf;
use std::sync::{Mutex, OnceLock};

use serde::{Deserialize, Serialize};
use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    fmt::{self, format::Writer, FmtContext, FormatEvent, FormatFields},
    layer::SubscriberExt,
    registry::LookupSpan,
    reload,
    util::SubscriberInitExt,
    EnvFilter, Layer, Registry,
};

/// Custom format for log level with brackets: `[INFO]`, `[WARN]`, etc.
fn format_level(level: &Level) -> &'static str {
    match *level {
        Level::TRACE => "[TRACE]",
        Level::DEBUG => "[DEBUG]",
        Level::INFO => "[INFO]",
        Level::WARN => "[WARN]",
        Level::ERROR => "[ERROR]",
    }
}

/// Custom event formatter that outputs: `timestamp [LEVEL] message`
///
/// Example output: `2025-12-02T00:50:44.809Z [INFO] Site B1 connected`
struct BracketedLevelFormat;

impl<S, N> FormatEvent<S, N> for BracketedLevelFormat
where
    S: tracing::Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &tracing::Event<'_>,
    ) -> std::fmt::Result {
        let now = chrono::Utc::now();
        write!(writer, "{} ", now.format("%Y-%m-%dT%H:%M:%S%.6fZ"))?;

        let level = *event.metadata().level();
        if writer.has_ansi_escapes() {
            let color = match level {
                Level::TRACE => "\x1b[35m", // magenta
                Level::DEBUG => "\x1b[34m", // blue
                Level::INFO => "\x1b[32m",  // green
                Level::WARN => "\x1b[33m",  // yellow
                Level::ERROR => "\x1b[31m", // red
            };
            write!(writer, "{}{}\x1b[0m ", color, format_level(&level))?;
        } else {
            write!(writer, "{} ", format_level(&level))?;
        }

        ctx.field_format().format_fields(writer.by_ref(), event)?;

        writeln!(writer)
    }
}

// Guards keep the non-blocking writers flushing for the process lifetime
static GUARDS: OnceLock<Mutex<Vec<WorkerGuard>>> = OnceLock::new();
static LOG_FILTER_HANDLE: OnceLock<reload::Handle<EnvFilter, Registry>> = OnceLock::new();

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Service name, used as default filter target and file prefix
    pub service_name: String,
    /// Directory for rolling log files; console only when unset
    pub log_dir: Option<PathBuf>,
    /// Console filter directive used when RUST_LOG is not set
    pub console_level: String,
    /// Emit JSON lines to the log file
    pub json: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            service_name: "alarmsrv".to_string(),
            log_dir: None,
            console_level: "info".to_string(),
            json: false,
        }
    }
}

impl LogConfig {
    fn default_filter(&self) -> String {
        format!("{},{}=debug", self.console_level, self.service_name)
    }
}

/// Initialize the global subscriber
///
/// `RUST_LOG` takes precedence over the configured console level.
pub fn init_with_config(config: &LogConfig) -> Result<(), Box<dyn std::error::Error>> {
    let env_filter = match std::env::var("RUST_LOG") {
        Ok(directives) => EnvFilter::new(directives),
        Err(_) => EnvFilter::new(config.default_filter()),
    };

    let (reload_filter, reload_handle) = reload::Layer::new(env_filter);
    let _ = LOG_FILTER_HANDLE.set(reload_handle);

    let console_layer = fmt::layer()
        .with_ansi(true)
        .event_format(BracketedLevelFormat)
        .boxed();

    let file_layer = match &config.log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)?;
            let appender =
                tracing_appender::rolling::daily(dir, format!("{}.log", config.service_name));
            let (non_blocking, guard) = tracing_appender::non_blocking(appender);
            let guards = GUARDS.get_or_init(|| Mutex::new(Vec::new()));
            match guards.lock() {
                Ok(mut guards) => guards.push(guard),
                Err(poisoned) => poisoned.into_inner().push(guard),
            }

            let layer = if config.json {
                fmt::layer()
                    .json()
                    .with_writer(non_blocking)
                    .with_target(true)
                    .boxed()
            } else {
                fmt::layer()
                    .with_writer(non_blocking)
                    .with_ansi(false)
                    .event_format(BracketedLevelFormat)
                    .boxed()
            };
            Some(layer)
        },
        None => None,
    };

    tracing_subscriber::registry()
        .with(reload_filter)
        .with(console_layer)
        .with(file_layer)
        .try_init()?;

    tracing::info!("Logging: {} @ {:?}", config.service_name, config.log_dir);
    Ok(())
}

/// Initialize console logging at a fixed level
pub fn init(level: &str) -> Result<(), Box<dyn std::error::Error>> {
    init_with_config(&LogConfig {
        console_level: level.to_string(),
        ..LogConfig::default()
    })
}

/// Replace the active filter at runtime
pub fn set_log_level(level: &str) -> Result<(), String> {
    let handle = LOG_FILTER_HANDLE
        .get()
        .ok_or_else(|| "Logging not initialized".to_string())?;
    let filter = EnvFilter::try_new(level).map_err(|e| format!("Invalid filter: {e}"))?;
    handle
        .reload(filter)
        .map_err(|e| format!("Failed to reload filter: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_level() {
        assert_eq!(format_level(&Level::WARN), "[WARN]");
        assert_eq!(format_level(&Level::ERROR), "[ERROR]");
    }

    #[test]
    fn test_default_filter() {
        let config = LogConfig::default();
        assert_eq!(config.default_filter(), "info,alarmsrv=debug");
    }

    #[test]
    fn test_set_level_before_init() {
        // No subscriber in this test binary path
        if LOG_FILTER_HANDLE.get().is_none() {
            assert!(set_log_level("debug").is_err());
        }
    }
}
