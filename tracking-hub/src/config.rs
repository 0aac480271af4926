use serde::Deserialize;
use std::fs::File;
use std::path::Path;
use tracker::config::{Config as TrackerConfig, ValidationError};

#[derive(Debug, Deserialize)]
pub struct MetricsConfig {
    pub statsd_host: String,
    pub statsd_port: u16,
}

#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    pub sentry_dsn: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct CommonConfig {
    pub metrics: Option<MetricsConfig>,
    pub logging: Option<LoggingConfig>,
}

#[derive(Debug, Default, Deserialize)]
pub struct Config {
    #[serde(flatten)]
    pub common: CommonConfig,
    #[serde(default)]
    pub tracker: TrackerConfig,
}

impl Config {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let file = File::open(path)?;
        let data = serde_yaml::from_reader(file)?;

        Ok(data)
    }

    /// Reads `path` if given, otherwise starts from defaults, then applies the
    /// `PORT` override.
    pub fn load(path: Option<&Path>, port: Option<&str>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Config::from_file(path)?,
            None => Config::default(),
        };
        if let Some(port) = port {
            config.tracker.override_port(port)?;
        }
        config.tracker.validate()?;

        Ok(config)
    }
}

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("could not load config from file: {0}")]
    LoadError(#[from] std::io::Error),
    #[error("could not parse config: {0}")]
    ParseError(#[from] serde_yaml::Error),
    #[error("invalid config: {0}")]
    ValidationError(#[from] ValidationError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tracker::config::DisconnectPolicy;

    fn write_tmp_file(s: &str) -> tempfile::NamedTempFile {
        let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
        write!(tmp, "{}", s).expect("write yaml");

        tmp
    }

    #[test]
    fn full_config() {
        let yaml = r#"
            metrics:
                statsd_host: 127.0.0.1
                statsd_port: 8125
            logging:
                sentry_dsn: https://key@sentry.example.com/1
            tracker:
                listener:
                    host: 0.0.0.0
                    port: 8080
                disconnect_policy: own_devices
                tracking:
                    max_positions: 20
            "#;
        let tmp = write_tmp_file(yaml);
        let config = Config::from_file(tmp.path()).expect("load config");

        let metrics = config.common.metrics.expect("metrics config");
        assert_eq!((metrics.statsd_host.as_str(), metrics.statsd_port), ("127.0.0.1", 8125));
        assert!(config.common.logging.is_some());
        assert_eq!(config.tracker.listener.port, 8080);
        assert_eq!(config.tracker.disconnect_policy, DisconnectPolicy::OwnDevices);
        assert_eq!(config.tracker.tracking.max_positions, 20);
        assert_eq!(config.tracker.tracking.segment_gap_ms, 30_000);
    }

    #[test]
    fn missing_file_uses_defaults() {
        let config = Config::load(None, None).expect("default config");
        assert!(config.common.metrics.is_none());
        assert_eq!(config.tracker.listener.port, 3000);
        assert_eq!(config.tracker.disconnect_policy, DisconnectPolicy::FlushAll);
    }

    #[test]
    fn port_override() {
        let tmp = write_tmp_file("tracker:\n    listener:\n        host: 0.0.0.0\n        port: 8080\n");
        let config = Config::load(Some(tmp.path()), Some("4000")).expect("load config");
        assert_eq!(config.tracker.listener.port, 4000);

        assert!(matches!(
            Config::load(None, Some("http")),
            Err(ConfigError::ValidationError(ValidationError::InvalidPortOverride(_)))
        ));
        assert!(matches!(
            Config::load(None, Some("0")),
            Err(ConfigError::ValidationError(ValidationError::InvalidPort))
        ));
    }

    #[test]
    fn invalid_values_are_rejected() {
        let tmp = write_tmp_file("tracker:\n    tracking:\n        palette: []\n");
        assert!(matches!(
            Config::load(Some(tmp.path()), None),
            Err(ConfigError::ValidationError(ValidationError::EmptyPalette))
        ));

        let tmp = write_tmp_file("tracker:\n    disconnect_policy: explode\n");
        assert!(matches!(
            Config::from_file(tmp.path()),
            Err(ConfigError::ParseError(_))
        ));
    }
}
