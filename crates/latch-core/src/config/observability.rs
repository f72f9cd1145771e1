use serde::{Deserialize, Serialize};

/// Observability configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// Wrap the object locker and transaction manager in logging decorators.
    #[serde(default)]
    pub instrument: bool,

    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level or filter directive.
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Whether to output JSON format.
    #[serde(default)]
    pub json_format: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json_format: false,
        }
    }
}

impl LoggingConfig {
    /// Subscriber filter for the configured level. Alerts pass at any level.
    pub fn filter_directive(&self) -> String {
        if self.level.contains(ALERT_TARGET) {
            self.level.clone()
        } else {
            format!("{},{}=error", self.level, ALERT_TARGET)
        }
    }
}

const ALERT_TARGET: &str = "latch::alert";

fn default_log_level() -> String {
    "info".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_logging() {
        let config = ObservabilityConfig::default();
        assert!(!config.instrument);
        assert_eq!(config.logging.level, "info");
        assert!(!config.logging.json_format);
    }

    #[test]
    fn test_filter_directive_keeps_alerts() {
        let mut logging = LoggingConfig::default();
        logging.level = "warn".to_string();
        assert_eq!(logging.filter_directive(), "warn,latch::alert=error");

        logging.level = "info,latch::alert=off".to_string();
        assert_eq!(logging.filter_directive(), "info,latch::alert=off");
    }
}
