// ============================================================================
// SECTION 9: LOGGING & TRACING INFRASTRUCTURE
// ============================================================================
// Structured logging for the engine:
// - JSON, compact or pretty output on stderr (stdout carries documents)
// - RUST_LOG aware level filtering
// - Optional non-blocking log file
// ============================================================================

use std::path::Path;
use std::time::Instant;

use tracing::level_filters::LevelFilter;
use tracing::{info, trace, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::{fmt, EnvFilter, Layer, Registry};

use crate::config::LoggingConfig;
use crate::error::{ForensicsError, ForensicsResult};

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

// ----------------------------------------------------------------------------
// 9.1 Logger Initialization
// ----------------------------------------------------------------------------

/// Parse a configured level, falling back to `warn`.
pub fn level_filter(level: &str) -> LevelFilter {
    match level.to_lowercase().as_str() {
        "trace" => LevelFilter::TRACE,
        "debug" => LevelFilter::DEBUG,
        "info" => LevelFilter::INFO,
        "warn" | "warning" => LevelFilter::WARN,
        "error" => LevelFilter::ERROR,
        "off" => LevelFilter::OFF,
        _ => LevelFilter::WARN,
    }
}

/// Initialize the logging system based on configuration.
///
/// The returned guard flushes the log file writer on drop and must be held
/// by `main` for the lifetime of the process.
pub fn init_logging(config: &LoggingConfig) -> ForensicsResult<Option<WorkerGuard>> {
    let env_filter = EnvFilter::builder()
        .with_default_directive(level_filter(&config.level).into())
        .from_env_lossy();

    let stderr_layer: BoxedLayer = match config.format.as_str() {
        "json" => fmt::layer()
            .json()
            .with_writer(std::io::stderr)
            .with_target(true)
            .with_file(config.source_location)
            .with_line_number(config.source_location)
            .boxed(),
        "compact" => fmt::layer()
            .compact()
            .with_writer(std::io::stderr)
            .with_ansi(config.colors)
            .with_target(true)
            .boxed(),
        _ => fmt::layer()
            .pretty()
            .with_writer(std::io::stderr)
            .with_ansi(config.colors)
            .with_target(true)
            .with_file(config.source_location)
            .with_line_number(config.source_location)
            .boxed(),
    };

    let mut layers = vec![stderr_layer];
    let mut guard = None;
    if let Some(path) = &config.file {
        let (writer, worker_guard) = file_writer(path)?;
        layers.push(fmt::layer().json().with_writer(writer).with_ansi(false).boxed());
        guard = Some(worker_guard);
    }

    let subscriber = tracing_subscriber::registry().with(layers).with(env_filter);
    tracing::subscriber::set_global_default(subscriber)
        .map_err(|e| ForensicsError::Internal(format!("Failed to set logger: {}", e)))?;

    info!(
        target: "forensics::init",
        level = %config.level,
        format = %config.format,
        file = ?config.file,
        "Logging initialized"
    );

    Ok(guard)
}

fn file_writer(path: &Path) -> ForensicsResult<(tracing_appender::non_blocking::NonBlocking, WorkerGuard)> {
    let file_name = path
        .file_name()
        .ok_or_else(|| ForensicsError::Internal(format!("Log file path has no file name: {}", path.display())))?;
    let dir = path.parent().filter(|d| !d.as_os_str().is_empty()).unwrap_or(Path::new("."));
    let appender = tracing_appender::rolling::never(dir, file_name);
    Ok(tracing_appender::non_blocking(appender))
}

// ----------------------------------------------------------------------------
// 9.2 Performance Timer
// ----------------------------------------------------------------------------

/// Measures one analyzer run and logs it on stop.
#[derive(Debug)]
pub struct PerfTimer {
    name: &'static str,
    start: Instant,
    threshold_ms: Option<u64>,
}

impl PerfTimer {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            start: Instant::now(),
            threshold_ms: None,
        }
    }

    /// Start a timer that warns when the operation runs longer than `threshold_ms`
    pub fn with_threshold(name: &'static str, threshold_ms: u64) -> Self {
        Self {
            name,
            start: Instant::now(),
            threshold_ms: Some(threshold_ms),
        }
    }

    pub fn elapsed_ms(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }

    /// Stop the timer and log if above threshold
    pub fn stop(self) -> u64 {
        let elapsed = self.elapsed_ms();

        if let Some(threshold) = self.threshold_ms {
            if elapsed > threshold {
                warn!(
                    target: "forensics::perf",
                    operation = self.name,
                    elapsed_ms = elapsed,
                    threshold_ms = threshold,
                    "Operation exceeded threshold"
                );
            }
        }

        trace!(
            target: "forensics::perf",
            operation = self.name,
            elapsed_ms = elapsed,
            "Operation completed"
        );

        elapsed
    }
}

#[cfg(test)]
mod logging_tests {
    use super::*;
    use test_case::test_case;

    #[test_case("trace", LevelFilter::TRACE)]
    #[test_case("DEBUG", LevelFilter::DEBUG)]
    #[test_case("warning", LevelFilter::WARN)]
    #[test_case("off", LevelFilter::OFF)]
    #[test_case("verbose", LevelFilter::WARN)]
    fn test_level_filter(raw: &str, expected: LevelFilter) {
        assert_eq!(level_filter(raw), expected);
    }

    #[test]
    fn test_perf_timer_measures() {
        let timer = PerfTimer::with_threshold("unit", 10_000);
        std::thread::sleep(std::time::Duration::from_millis(2));
        assert!(timer.stop() >= 2);
    }

    #[test]
    fn test_file_writer_rejects_directory_path() {
        assert!(file_writer(Path::new("/")).is_err());
    }
}
