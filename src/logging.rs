// ============================================================================
// SECTION 6: LOGGING & TRACING INFRASTRUCTURE
// ============================================================================
// Structured logging for the exporter:
// - JSON output for log shippers, compact or pretty for terminals
// - RUST_LOG style directives layered over the configured level
// - Slow-operation warnings for refresh cycles
// ============================================================================

use std::fmt::{self, Display, Formatter};
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing::{info, trace, warn, Level};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt as tfmt, EnvFilter};

use crate::config::LoggingConfig;
use crate::error::{ExporterError, ExporterResult};

// ----------------------------------------------------------------------------
// 6.1 Log Level Management
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn to_tracing_level(&self) -> Level {
        match self {
            LogLevel::Trace => Level::TRACE,
            LogLevel::Debug => Level::DEBUG,
            LogLevel::Info => Level::INFO,
            LogLevel::Warn => Level::WARN,
            LogLevel::Error => Level::ERROR,
        }
    }

    /// Parse from string, falling back to `Info`.
    pub fn parse(s: &str) -> Self {
        match s.trim().to_lowercase().as_str() {
            "trace" => LogLevel::Trace,
            "debug" => LogLevel::Debug,
            "warn" | "warning" => LogLevel::Warn,
            "error" => LogLevel::Error,
            _ => LogLevel::Info,
        }
    }
}

impl Display for LogLevel {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let name = match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        };
        f.write_str(name)
    }
}

// ----------------------------------------------------------------------------
// 6.2 Logger Initialization
// ----------------------------------------------------------------------------

/// Initialize the global subscriber from configuration.
pub fn init_logging(config: &LoggingConfig) -> ExporterResult<()> {
    let level = LogLevel::parse(&config.level).to_tracing_level();
    let env_filter = EnvFilter::builder()
        .with_default_directive(tracing::level_filters::LevelFilter::from_level(level).into())
        .from_env_lossy();

    let registry = tracing_subscriber::registry().with(env_filter);
    let result = match config.format.as_str() {
        "json" => registry
            .with(
                tfmt::layer()
                    .json()
                    .with_target(true)
                    .with_file(config.source_location)
                    .with_line_number(config.source_location)
                    .with_thread_names(true),
            )
            .try_init(),
        "pretty" => registry
            .with(
                tfmt::layer()
                    .pretty()
                    .with_ansi(config.colors)
                    .with_target(true)
                    .with_file(config.source_location)
                    .with_line_number(config.source_location),
            )
            .try_init(),
        _ => registry
            .with(
                tfmt::layer()
                    .compact()
                    .with_ansi(config.colors)
                    .with_target(true),
            )
            .try_init(),
    };
    result.map_err(|e| ExporterError::Internal(format!("Failed to set logger: {}", e)))?;

    info!(
        target: "sonic::init",
        level = %config.level,
        format = %config.format,
        "Logging initialized"
    );

    Ok(())
}

// ----------------------------------------------------------------------------
// 6.3 Logging Macros
// ----------------------------------------------------------------------------

/// Log a refresh cycle outcome for one domain.
#[macro_export]
macro_rules! log_refresh {
    ($domain:expr, $outcome:expr) => {
        tracing::debug!(
            target: "sonic::refresh",
            domain = $domain,
            outcome = $outcome,
            "Refresh cycle finished"
        )
    };
    ($domain:expr, $outcome:expr, $($field:tt)*) => {
        tracing::debug!(
            target: "sonic::refresh",
            domain = $domain,
            outcome = $outcome,
            $($field)*,
            "Refresh cycle finished"
        )
    };
}

// ----------------------------------------------------------------------------
// 6.4 Performance Timer
// ----------------------------------------------------------------------------

/// Measures one operation and warns when it runs past a threshold.
#[derive(Debug)]
pub struct PerfTimer {
    name: &'static str,
    start: Instant,
    threshold_ms: Option<u64>,
    stopped: bool,
}

impl PerfTimer {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            start: Instant::now(),
            threshold_ms: None,
            stopped: false,
        }
    }

    pub fn with_threshold(name: &'static str, threshold_ms: u64) -> Self {
        Self {
            threshold_ms: Some(threshold_ms),
            ..Self::new(name)
        }
    }

    pub fn elapsed_ms(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }

    pub fn elapsed_secs_f64(&self) -> f64 {
        self.start.elapsed().as_secs_f64()
    }

    /// Stop the timer, returning elapsed seconds.
    pub fn stop(mut self) -> f64 {
        self.stopped = true;
        let elapsed = self.elapsed_ms();

        if let Some(threshold) = self.threshold_ms {
            if elapsed > threshold {
                warn!(
                    target: "sonic::perf",
                    operation = self.name,
                    elapsed_ms = elapsed,
                    threshold_ms = threshold,
                    "Operation exceeded threshold"
                );
            }
        }

        trace!(
            target: "sonic::perf",
            operation = self.name,
            elapsed_ms = elapsed,
            "Operation completed"
        );

        self.elapsed_secs_f64()
    }
}

impl Drop for PerfTimer {
    fn drop(&mut self) {
        if !self.stopped {
            trace!(
                target: "sonic::perf",
                operation = self.name,
                elapsed_ms = self.elapsed_ms(),
                "Timer dropped"
            );
        }
    }
}
