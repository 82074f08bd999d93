//! Logging system configuration and initialization
//!
//! tracing-based setup with console and daily-rolling file output, JSON
//! formatting as an option, and module-level filters driven by the
//! configuration file.

use std::path::PathBuf;

use anyhow::{Result, anyhow};
use tracing_appender::{non_blocking, non_blocking::WorkerGuard, rolling};
use tracing_subscriber::{
    EnvFilter, Registry, fmt, layer::SubscriberExt, util::SubscriberInitExt,
};

pub use crate::infrastructure::config::LoggingConfig;

/// Log directory under the application data dir, falling back to ./logs.
pub fn get_log_directory() -> PathBuf {
    crate::infrastructure::config::ConfigManager::get_app_data_dir()
        .map(|dir| dir.join("logs"))
        .unwrap_or_else(|_| PathBuf::from("logs"))
}

/// Initialize the logging system with default configuration.
pub fn init_logging() -> Result<Option<WorkerGuard>> {
    init_logging_with_config(LoggingConfig::default())
}

/// Initialize logging with custom configuration. The returned guard must be
/// held for the process lifetime when file output is enabled.
pub fn init_logging_with_config(config: LoggingConfig) -> Result<Option<WorkerGuard>> {
    let env_filter = build_filter(&config);
    let registry = Registry::default().with(env_filter);

    match (config.file_output, config.console_output) {
        (true, console) => {
            let log_dir = get_log_directory();
            std::fs::create_dir_all(&log_dir)
                .map_err(|e| anyhow!("Failed to create log directory {:?}: {}", log_dir, e))?;
            let file_appender = rolling::daily(&log_dir, "bentham.log");
            let (file_writer, guard) = non_blocking(file_appender);

            if config.json_format {
                let file_layer = fmt::Layer::new()
                    .json()
                    .with_writer(file_writer)
                    .with_target(true)
                    .with_thread_ids(true);
                if console {
                    let console_layer = fmt::Layer::new()
                        .with_writer(std::io::stdout)
                        .with_target(false);
                    registry.with(file_layer).with(console_layer).init();
                } else {
                    registry.with(file_layer).init();
                }
            } else {
                let file_layer = fmt::Layer::new()
                    .with_writer(file_writer)
                    .with_target(true)
                    .with_thread_ids(true);
                if console {
                    let console_layer = fmt::Layer::new()
                        .with_writer(std::io::stdout)
                        .with_target(false);
                    registry.with(file_layer).with(console_layer).init();
                } else {
                    registry.with(file_layer).init();
                }
            }
            Ok(Some(guard))
        }
        (false, true) => {
            let console_layer = fmt::Layer::new()
                .with_writer(std::io::stdout)
                .with_target(false);
            registry.with(console_layer).init();
            Ok(None)
        }
        (false, false) => Ok(None),
    }
}

fn build_filter(config: &LoggingConfig) -> EnvFilter {
    // RUST_LOG wins over the configuration file.
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return filter;
    }
    let mut directives = vec![config.level.clone()];
    for (module, level) in &config.module_filters {
        directives.push(format!("{module}={level}"));
    }
    EnvFilter::new(directives.join(","))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filter_combines_level_and_module_directives() {
        let mut config = LoggingConfig::default();
        config.level = "warn".to_string();
        config.module_filters.clear();
        config
            .module_filters
            .insert("hyper".to_string(), "error".to_string());
        let filter = build_filter(&config);
        let rendered = filter.to_string();
        assert!(rendered.contains("warn"));
        assert!(rendered.contains("hyper=error"));
    }
}
