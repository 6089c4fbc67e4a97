//! Structured logging for the strata workspace.
//!
//! Sets up span-based, filterable logging via the `tracing` ecosystem:
//! console output with timestamps and module paths, plus optional JSON file
//! logging for post-mortem analysis of concurrent write storms.

use std::path::Path;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize the tracing subscriber.
///
/// Console output honors `RUST_LOG`, falling back to `filter` (or the
/// default filter when `None`). When `log_dir` is given, a JSON file layer
/// writes `strata.log` alongside the console output.
pub fn init_logging(log_dir: Option<&Path>, filter: Option<&str>) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| filter.map_or_else(default_env_filter, EnvFilter::new));

    let console_layer = fmt::layer()
        .with_target(true)
        .with_thread_ids(false)
        .with_thread_names(true) // useful when writer threads are named
        .with_level(true)
        .with_timer(fmt::time::uptime());

    let subscriber = tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer);

    if let Some(log_dir) = log_dir
        && std::fs::create_dir_all(log_dir).is_ok()
        && let Ok(log_file) = std::fs::File::create(log_dir.join("strata.log"))
    {
        let file_layer = fmt::layer()
            .with_writer(log_file)
            .with_ansi(false)
            .with_target(true)
            .with_timer(fmt::time::uptime())
            .json();

        subscriber.with(file_layer).init();
        return;
    }

    subscriber.init();
}

/// The default filter: `info` everywhere, with the chatty per-cell store
/// internals capped at `warn`.
pub fn default_env_filter() -> EnvFilter {
    EnvFilter::new("info,strata_store=warn")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_filter_contents() {
        let filter_str = format!("{}", default_env_filter());
        assert!(filter_str.contains("strata_store=warn"));
        assert!(filter_str.contains("info"));
    }

    #[test]
    fn test_filter_strings_parse() {
        let valid_filters = [
            "info",
            "debug,strata_store=trace",
            "warn,strata_demo=debug",
            "error",
        ];
        for filter_str in &valid_filters {
            assert!(
                EnvFilter::try_from(*filter_str).is_ok(),
                "failed to parse filter: {}",
                filter_str
            );
        }
    }

    #[test]
    fn test_log_file_path() {
        let temp_dir = tempfile::tempdir().unwrap();
        let log_file_path = temp_dir.path().join("strata.log");
        assert_eq!(log_file_path.file_name().unwrap(), "strata.log");
    }
}
