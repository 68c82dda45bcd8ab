//! Logging initialization and utilities

/// Initialize the logging system
///
/// Uses env_logger with default filter level of `info`.
/// Override with RUST_LOG environment variable. Safe to call more than once;
/// only the first call installs the logger.
///
/// # Example
/// ```
/// landscape_grass::core::logging::init();
/// log::info!("Grass scheduler started");
/// ```
pub fn init() {
    init_with_filter("info");
}

/// Initialize logging with an explicit default filter (e.g. `"landscape_grass=debug"`).
///
/// RUST_LOG still takes precedence when set.
pub fn init_with_filter(default_filter: &str) {
    let _ = env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(default_filter)
    )
    .format_timestamp_millis()
    .try_init();
}
