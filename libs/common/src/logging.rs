//! Unified logging for SCADA services
//!
//! Console output plus a daily rolling file (`{service}.log.{YYYY-MM-DD}`)
//! written through a non-blocking appender.

use std::path::PathBuf;
use std::sync::{Mutex, OnceLock};

use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    fmt::{self, format::Writer, FmtContext, FormatEvent, FormatFields},
    layer::SubscriberExt,
    registry::LookupSpan,
    util::SubscriberInitExt,
    EnvFilter, Layer,
};

use crate::error::{Error, Result};

/// Environment variable overriding the log root
pub const LOG_DIR_ENV: &str = "SCADA_LOG_DIR";

fn format_level(level: &Level) -> &'static str {
    match *level {
        Level::TRACE => "[TRACE]",
        Level::DEBUG => "[DEBUG]",
        Level::INFO => "[INFO]",
        Level::WARN => "[WARN]",
        Level::ERROR => "[ERROR]",
    }
}

/// `timestamp [LEVEL] message`
///
/// Example output: `2025-12-02T00:50:44.809Z [INFO] Service started`
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
        write!(writer, "{} ", chrono::Utc::now().format("%Y-%m-%dT%H:%M:%S%.3fZ"))?;

        let level = *event.metadata().level();
        if writer.has_ansi_escapes() {
            let color = match level {
                Level::TRACE => "\x1b[35m",
                Level::DEBUG => "\x1b[34m",
                Level::INFO => "\x1b[32m",
                Level::WARN => "\x1b[33m",
                Level::ERROR => "\x1b[31m",
            };
            write!(writer, "{}{}\x1b[0m ", color, format_level(&level))?;
        } else {
            write!(writer, "{} ", format_level(&level))?;
        }

        ctx.field_format().format_fields(writer.by_ref(), event)?;
        writeln!(writer)
    }
}

// Appender guards live for the whole process
static GUARDS: OnceLock<Mutex<Vec<WorkerGuard>>> = OnceLock::new();

// ============================================================================
// Log Root Directory
// ============================================================================

static LOG_ROOT: OnceLock<PathBuf> = OnceLock::new();

/// Priority: `SCADA_LOG_DIR` > configured directory > `logs`
fn resolve_log_root(env_dir: Option<String>, config_dir: Option<&str>) -> PathBuf {
    env_dir
        .filter(|d| !d.is_empty())
        .map(PathBuf::from)
        .or_else(|| config_dir.map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from("logs"))
}

/// Fix the log root for this process; later calls are ignored
pub fn init_log_root(config_dir: Option<&str>) -> PathBuf {
    LOG_ROOT
        .get_or_init(|| resolve_log_root(std::env::var(LOG_DIR_ENV).ok(), config_dir))
        .clone()
}

pub fn get_log_root() -> PathBuf {
    LOG_ROOT
        .get()
        .cloned()
        .unwrap_or_else(|| resolve_log_root(std::env::var(LOG_DIR_ENV).ok(), None))
}

// ============================================================================
// Initialization
// ============================================================================

/// Logger configuration
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Service name, also the file name stem
    pub service_name: String,
    pub log_dir: PathBuf,
    /// Filter directive used when `RUST_LOG` is unset (e.g. "debug")
    pub level: Option<String>,
    /// JSON lines in the log file instead of the bracketed format
    pub enable_json: bool,
    pub enable_file: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            service_name: "unknown".to_string(),
            log_dir: get_log_root(),
            level: None,
            enable_json: false,
            enable_file: true,
        }
    }
}

/// Filter directive: `RUST_LOG`, else the explicit level, else `info,{service}=debug`
fn filter_directive(rust_log: Option<String>, level: Option<&str>, service_name: &str) -> String {
    rust_log
        .filter(|s| !s.is_empty())
        .or_else(|| level.map(str::to_string))
        .unwrap_or_else(|| format!("info,{}=debug", service_name.replace('-', "_")))
}

pub fn init_with_config(config: LogConfig) -> Result<()> {
    let directive = filter_directive(
        std::env::var("RUST_LOG").ok(),
        config.level.as_deref(),
        &config.service_name,
    );
    let env_filter = EnvFilter::try_new(&directive)
        .map_err(|e| Error::Logging(format!("invalid filter '{}': {}", directive, e)))?;

    let console_layer = fmt::layer()
        .with_ansi(true)
        .event_format(BracketedLevelFormat)
        .boxed();

    let file_layer = if config.enable_file {
        std::fs::create_dir_all(&config.log_dir)?;
        let appender =
            tracing_appender::rolling::daily(&config.log_dir, format!("{}.log", config.service_name));
        let (non_blocking, guard) = tracing_appender::non_blocking(appender);

        let guards = GUARDS.get_or_init(|| Mutex::new(Vec::new()));
        match guards.lock() {
            Ok(mut guards) => guards.push(guard),
            Err(poisoned) => poisoned.into_inner().push(guard),
        }

        let layer = if config.enable_json {
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
    } else {
        None
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .try_init()
        .map_err(|e| Error::Logging(e.to_string()))?;

    tracing::info!("Logging: {} @ {:?} ({})", config.service_name, config.log_dir, directive);
    Ok(())
}

/// Console + file logging under the resolved log root
pub fn init(service_name: &str, level: Option<&str>) -> Result<()> {
    init_with_config(LogConfig {
        service_name: service_name.to_string(),
        log_dir: get_log_root(),
        level: level.map(str::to_string),
        ..LogConfig::default()
    })
}
