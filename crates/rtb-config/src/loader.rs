//! Configuration loader with environment variable support

use std::env;
use std::path::PathBuf;

use tracing::{debug, info};

use crate::{AppConfig, BrokerKind, ConfigError, StoreKind};

/// Default config file paths to search
const CONFIG_PATHS: &[&str] = &["rtb.toml", "config.toml", "./config/rtb.toml", "/etc/rtb/config.toml"];

/// Configuration loader
pub struct ConfigLoader {
    config_path: Option<PathBuf>,
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self { config_path: None }
    }

    pub fn with_path<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.config_path = Some(path.into());
        self
    }

    /// Load configuration from file and environment
    pub fn load(&self) -> Result<AppConfig, ConfigError> {
        let mut config = match self.find_config_file() {
            Some(path) => {
                info!(path = %path.display(), "Loading configuration from file");
                AppConfig::from_file(&path)?
            }
            None => {
                debug!("No config file found, using defaults");
                AppConfig::default()
            }
        };

        Self::apply_env_overrides(&mut config);
        Ok(config)
    }

    fn find_config_file(&self) -> Option<PathBuf> {
        if let Some(path) = &self.config_path {
            if path.exists() {
                return Some(path.clone());
            }
        }

        if let Ok(path) = env::var("RTB_CONFIG") {
            let path = PathBuf::from(path);
            if path.exists() {
                return Some(path);
            }
        }

        CONFIG_PATHS.iter().map(PathBuf::from).find(|path| path.exists())
    }

    fn apply_env_overrides(config: &mut AppConfig) {
        // HTTP
        if let Ok(val) = env::var("RTB_HTTP_PORT") {
            if let Ok(port) = val.parse() {
                config.http.port = port;
            }
        }
        if let Ok(val) = env::var("RTB_HTTP_HOST") {
            config.http.host = val;
        }

        // Broker
        if let Ok(val) = env::var("RTB_BROKER_KIND") {
            match val.to_lowercase().as_str() {
                "memory" => config.broker.kind = BrokerKind::Memory,
                "amqp" => config.broker.kind = BrokerKind::Amqp,
                _ => {}
            }
        }
        if let Ok(val) = env::var("RTB_AMQP_URI") {
            config.broker.uri = val;
        }

        // Dispatch pool
        if let Ok(val) = env::var("RTB_MAX_WORKERS") {
            if let Ok(n) = val.parse() {
                config.dispatch.max_workers = n;
            }
        }
        if let Ok(val) = env::var("RTB_INIT_WORKERS") {
            if let Ok(n) = val.parse() {
                config.dispatch.init_workers = n;
            }
        }

        // Store
        if let Ok(val) = env::var("RTB_STORE_KIND") {
            match val.to_lowercase().as_str() {
                "memory" => config.store.kind = StoreKind::Memory,
                "sqlite" => config.store.kind = StoreKind::Sqlite,
                _ => {}
            }
        }
        if let Ok(val) = env::var("RTB_SQLITE_URL") {
            config.store.sqlite_url = val;
        }

        if let Ok(val) = env::var("RTB_CREATIVES_PATH") {
            config.creatives.path = Some(val);
        }

        // Metrics
        if let Ok(val) = env::var("RTB_METRICS_ENABLED") {
            config.metrics.enabled = val == "true" || val == "1";
        }
        if let Ok(val) = env::var("RTB_STATS_SAMPLE_RATE") {
            if let Ok(rate) = val.parse() {
                config.metrics.stats_sample_rate = rate;
            }
        }
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_load_explicit_path() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
            [http]
            port = 9191

            [[publishers]]
            name = "audit"
            exchange = "rtb.audit"
            routing_key = "audit.all"
            pool_size = 2
            "#
        )
        .unwrap();

        let config = ConfigLoader::new().with_path(file.path()).load().unwrap();
        assert_eq!(config.publishers.len(), 1);
        assert_eq!(config.publishers[0].exchange, "rtb.audit");
        assert_eq!(config.dispatch.max_workers, 50);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_malformed_file_is_parse_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[dispatch\nmax_workers = ").unwrap();

        let result = ConfigLoader::new().with_path(file.path()).load();
        assert!(matches!(result, Err(ConfigError::ParseError(_))));
    }
}
