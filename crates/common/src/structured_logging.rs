use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::Level;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::{fmt, layer::SubscriberExt, EnvFilter, Registry};

/// Logging setup for the watch runtime.
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    /// Level used when `RUST_LOG` is not set
    pub level: Level,
    /// One JSON object per line instead of human-readable output
    pub json_output: bool,
    /// ANSI colours (text output only)
    pub color_output: bool,
    pub include_line_numbers: bool,
    pub include_thread_ids: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            json_output: false,
            color_output: true,
            include_line_numbers: cfg!(debug_assertions),
            include_thread_ids: false,
        }
    }
}

impl LoggingConfig {
    pub fn production() -> Self {
        Self {
            json_output: true,
            color_output: false,
            include_line_numbers: false,
            ..Self::default()
        }
    }

    fn env_filter(&self) -> EnvFilter {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(self.level.to_string()))
    }
}

/// Installs the global tracing subscriber.
///
/// Returns an error if a global subscriber is already installed.
pub fn init_structured_logging(config: LoggingConfig) -> anyhow::Result<()> {
    let env_filter = config.env_filter();

    if config.json_output {
        let json_layer = fmt::layer()
            .json()
            .with_current_span(true)
            .with_target(true)
            .with_line_number(config.include_line_numbers)
            .with_thread_ids(config.include_thread_ids);

        let subscriber = Registry::default().with(env_filter).with(json_layer);
        tracing::subscriber::set_global_default(subscriber)?;
    } else {
        let fmt_layer = fmt::layer()
            .with_target(true)
            .with_thread_ids(config.include_thread_ids)
            .with_line_number(config.include_line_numbers)
            .with_ansi(config.color_output)
            .with_span_events(FmtSpan::CLOSE);

        let subscriber = Registry::default().with(env_filter).with(fmt_layer);
        tracing::subscriber::set_global_default(subscriber)?;
    }

    Ok(())
}

/// Measures one unit of work and logs its outcome with `duration_ms`.
pub struct OperationTimer {
    start: Instant,
    operation_name: String,
    fields: HashMap<String, Value>,
}

impl OperationTimer {
    pub fn new(operation_name: impl Into<String>) -> Self {
        Self {
            start: Instant::now(),
            operation_name: operation_name.into(),
            fields: HashMap::new(),
        }
    }

    pub fn add_field(&mut self, key: impl Into<String>, value: impl Serialize) {
        if let Ok(v) = serde_json::to_value(value) {
            self.fields.insert(key.into(), v);
        }
    }

    pub fn finish_with_result<T, E: std::fmt::Display>(self, result: &Result<T, E>) -> Duration {
        let elapsed = self.start.elapsed();
        match result {
            Ok(_) => {
                tracing::debug!(
                    operation = %self.operation_name,
                    duration_ms = elapsed.as_millis() as u64,
                    success = true,
                    fields = ?self.fields,
                    "Operation completed"
                );
            }
            Err(e) => {
                tracing::warn!(
                    operation = %self.operation_name,
                    duration_ms = elapsed.as_millis() as u64,
                    success = false,
                    error = %e,
                    fields = ?self.fields,
                    "Operation failed"
                );
            }
        }
        elapsed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn production_config_is_json() {
        let config = LoggingConfig::production();
        assert!(config.json_output);
        assert!(!config.color_output);
        assert_eq!(config.level, Level::INFO);
    }

    #[test]
    fn second_init_fails_instead_of_panicking() {
        // Only this test installs a global subscriber in this crate.
        let first = init_structured_logging(LoggingConfig::default());
        let second = init_structured_logging(LoggingConfig::production());
        assert!(first.is_ok());
        assert!(second.is_err());
    }

    #[test]
    fn operation_timer_reports_elapsed() {
        let mut timer = OperationTimer::new("test_operation");
        timer.add_field("items_count", 100);
        std::thread::sleep(Duration::from_millis(5));

        let result: Result<(), String> = Err("boom".to_string());
        let elapsed = timer.finish_with_result(&result);
        assert!(elapsed >= Duration::from_millis(5));
    }
}
