use crate::config::AppConfig;
use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::filter::Targets;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Target used for per-tick exception repeat traces
pub const TRACE_TARGET: &str = "AFT_TRACE";

/// Env-filter directive for the main log; repeat traces never reach it
pub fn filter_directive(config: &AppConfig) -> String {
    format!("{},{}=off", config.log_level, TRACE_TARGET)
}

/// File that receives `AFT_TRACE` events when tracing is enabled
pub fn trace_log_file(config: &AppConfig) -> String {
    format!("{}.trace", config.log_file)
}

fn main_filter(config: &AppConfig) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter_directive(config)))
}

/// Install the global subscriber. Keep the returned guards alive for the
/// life of the process.
pub fn init_logging(config: &AppConfig) -> Vec<WorkerGuard> {
    let file_appender = match config.rotation.as_str() {
        "hourly" => tracing_appender::rolling::hourly(&config.log_dir, &config.log_file),
        "daily" => tracing_appender::rolling::daily(&config.log_dir, &config.log_file),
        _ => tracing_appender::rolling::never(&config.log_dir, &config.log_file),
    };

    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
    let mut guards = vec![guard];

    let trace_layer = if config.enable_tracing {
        let appender = tracing_appender::rolling::never(&config.log_dir, trace_log_file(config));
        let (writer, trace_guard) = tracing_appender::non_blocking(appender);
        guards.push(trace_guard);
        let layer = fmt::layer()
            .with_writer(writer)
            .with_ansi(false)
            .with_filter(Targets::new().with_target(TRACE_TARGET, Level::TRACE));
        Some(layer)
    } else {
        None
    };

    let registry = tracing_subscriber::registry().with(trace_layer);

    if config.use_json {
        let file_layer = fmt::layer()
            .json()
            .with_target(true) // Keep target in JSON for structured queries
            .with_writer(non_blocking)
            .with_ansi(false)
            .with_filter(main_filter(config));
        registry.with(file_layer).init();
    } else {
        let file_layer = fmt::layer()
            .with_target(false) // Hide redundant target in text output
            .with_writer(non_blocking)
            .with_ansi(false)
            .with_filter(main_filter(config));
        let stdout_layer = fmt::layer()
            .with_target(false)
            .with_ansi(true)
            .with_filter(main_filter(config));
        registry.with(file_layer).with(stdout_layer).init();
    }

    guards
}
