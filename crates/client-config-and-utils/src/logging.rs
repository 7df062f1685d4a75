//! Logging initialization for the delivery layer.
//!
//! Every component goes through the observability package, which writes
//! structured JSONL to `~/.naarscars/logs/dev.jsonl`.

/// Initialize logging for the delivery runtime.
///
/// The level can be overridden with `RUST_LOG`.
///
/// ```ignore
/// init_logging("info");
/// tracing::info!("delivery runtime started");
/// ```
pub fn init_logging(level: &str) {
    init_logging_for_service("delivery", level);
}

/// Initialize logging with a custom service name.
///
/// Use this to tell the send worker and the multiplexer apart in the shared
/// log stream when they run in separate processes.
pub fn init_logging_for_service(service_name: &str, level: &str) {
    observability::init_with_config(observability::LogConfig {
        service_name: service_name.into(),
        default_level: normalized_level(level).into(),
        also_stderr: stderr_requested(),
        ..Default::default()
    });
}

fn stderr_requested() -> bool {
    std::env::var("NAARS_LOG_STDERR")
        .ok()
        .map(|raw| matches!(raw.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
        .unwrap_or(false)
}

fn normalized_level(level: &str) -> &'static str {
    match parse_level(level) {
        tracing::Level::TRACE => "trace",
        tracing::Level::DEBUG => "debug",
        tracing::Level::INFO => "info",
        tracing::Level::WARN => "warn",
        tracing::Level::ERROR => "error",
    }
}

/// Parse a log level string into a tracing Level.
pub fn parse_level(level: &str) -> tracing::Level {
    match level.trim().to_lowercase().as_str() {
        "trace" => tracing::Level::TRACE,
        "debug" => tracing::Level::DEBUG,
        "info" => tracing::Level::INFO,
        "warn" | "warning" => tracing::Level::WARN,
        "error" => tracing::Level::ERROR,
        _ => tracing::Level::INFO,
    }
}
