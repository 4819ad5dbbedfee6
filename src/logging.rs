// ============================================================================
// LOGGING & TRACING INFRASTRUCTURE
// ============================================================================
// Structured logging through `tracing`:
// - pretty / compact / JSON output
// - level filtering with RUST_LOG overrides
// - per-area targets (`opmetrics::ingest`, `opmetrics::aggregate`, ...)
// ============================================================================

use std::borrow::Cow;
use std::time::Instant;

use tracing::{info, trace, warn};
use tracing_subscriber::fmt;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::EnvFilter;

use crate::config::LoggingConfig;
use crate::error::{MetricsError, MetricsResult};

// ----------------------------------------------------------------------------
// Targets
// ----------------------------------------------------------------------------

pub mod targets {
    pub const INIT: &str = "opmetrics::init";
    pub const ENGINE: &str = "opmetrics::engine";
    pub const STORE: &str = "opmetrics::store";
    pub const INGEST: &str = "opmetrics::ingest";
    pub const ANALYTICS: &str = "opmetrics::analytics";
    pub const AGGREGATE: &str = "opmetrics::aggregate";
    pub const RETENTION: &str = "opmetrics::retention";
    pub const SCHEDULER: &str = "opmetrics::scheduler";
    pub const QUERY: &str = "opmetrics::query";
    pub const PERF: &str = "opmetrics::perf";
}

// ----------------------------------------------------------------------------
// Logger Initialization
// ----------------------------------------------------------------------------

fn level_filter(level: &str) -> tracing::level_filters::LevelFilter {
    use tracing::level_filters::LevelFilter;
    match level.to_lowercase().as_str() {
        "trace" => LevelFilter::TRACE,
        "debug" => LevelFilter::DEBUG,
        "info" => LevelFilter::INFO,
        "warn" | "warning" => LevelFilter::WARN,
        "error" => LevelFilter::ERROR,
        _ => LevelFilter::INFO,
    }
}

/// Initialize the global subscriber based on configuration.
///
/// Fails if a global subscriber is already installed.
pub fn init_logging(config: &LoggingConfig) -> MetricsResult<()> {
    let env_filter = EnvFilter::builder()
        .with_default_directive(level_filter(&config.level).into())
        .from_env_lossy();

    let installed = match config.format.as_str() {
        "json" => {
            let subscriber = tracing_subscriber::registry().with(env_filter).with(
                fmt::layer()
                    .json()
                    .with_timer(fmt::time::UtcTime::rfc_3339())
                    .with_target(true)
                    .with_file(config.source_location)
                    .with_line_number(config.source_location)
                    .with_thread_names(true),
            );
            tracing::subscriber::set_global_default(subscriber)
        }
        "compact" => {
            let subscriber = tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt::layer().compact().with_ansi(config.colors).with_target(true));
            tracing::subscriber::set_global_default(subscriber)
        }
        _ => {
            let subscriber = tracing_subscriber::registry().with(env_filter).with(
                fmt::layer()
                    .pretty()
                    .with_ansi(config.colors)
                    .with_target(true)
                    .with_file(config.source_location)
                    .with_line_number(config.source_location)
                    .with_thread_names(true),
            );
            tracing::subscriber::set_global_default(subscriber)
        }
    };
    installed.map_err(|e| MetricsError::Internal(format!("failed to set logger: {e}")))?;

    info!(
        target: targets::INIT,
        level = %config.level,
        format = %config.format,
        "Logging initialized"
    );

    Ok(())
}

// ----------------------------------------------------------------------------
// Performance Timer
// ----------------------------------------------------------------------------

/// Measures an operation and warns when it runs past a threshold.
#[derive(Debug)]
pub struct PerfTimer {
    name: Cow<'static, str>,
    start: Instant,
    threshold_ms: Option<u64>,
    stopped: bool,
}

impl PerfTimer {
    pub fn new(name: impl Into<Cow<'static, str>>) -> Self {
        Self {
            name: name.into(),
            start: Instant::now(),
            threshold_ms: None,
            stopped: false,
        }
    }

    pub fn with_threshold(name: impl Into<Cow<'static, str>>, threshold_ms: u64) -> Self {
        let mut timer = Self::new(name);
        timer.threshold_ms = Some(threshold_ms);
        timer
    }

    pub fn elapsed_ms(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }

    /// Stop the timer and log if above threshold
    pub fn stop(mut self) -> u64 {
        self.stopped = true;
        let elapsed = self.elapsed_ms();

        if let Some(threshold) = self.threshold_ms {
            if elapsed > threshold {
                warn!(
                    target: targets::PERF,
                    operation = %self.name,
                    elapsed_ms = elapsed,
                    threshold_ms = threshold,
                    "Operation exceeded threshold"
                );
            }
        }

        trace!(
            target: targets::PERF,
            operation = %self.name,
            elapsed_ms = elapsed,
            "Operation completed"
        );

        elapsed
    }
}

impl Drop for PerfTimer {
    fn drop(&mut self) {
        if !self.stopped {
            trace!(
                target: targets::PERF,
                operation = %self.name,
                elapsed_ms = self.elapsed_ms(),
                "Timer dropped"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_filter_parsing() {
        use tracing::level_filters::LevelFilter;
        assert_eq!(level_filter("DEBUG"), LevelFilter::DEBUG);
        assert_eq!(level_filter("warning"), LevelFilter::WARN);
        assert_eq!(level_filter("nonsense"), LevelFilter::INFO);
    }

    #[test]
    fn test_perf_timer_reports_elapsed() {
        let timer = PerfTimer::with_threshold("test", 10_000);
        assert_eq!(timer.threshold_ms, Some(10_000));
        assert_eq!(PerfTimer::new("plain").threshold_ms, None);
        std::thread::sleep(std::time::Duration::from_millis(2));
        assert!(timer.stop() >= 1);
    }
}
