use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Upper bound on how long a reader waits for another thread to finish
    /// inflating a bean before proceeding with what it has
    pub inflation_wait_timeout_secs: u64,
    /// Data source used when neither the caller nor the schema names one
    pub default_data_source: String,
    /// Number of most recently used entries a soft store keeps strongly reachable
    pub soft_reference_capacity: usize,
    pub log_level: String,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            inflation_wait_timeout_secs: 120,
            default_data_source: "default".to_string(),
            soft_reference_capacity: 1000,
            log_level: "info".to_string(),
        }
    }
}

impl CacheConfig {
    /// Load configuration from environment variables and config file
    pub fn load() -> anyhow::Result<Self> {
        let mut config = config::Config::builder();

        // Add default configuration
        config = config.add_source(config::Config::try_from(&CacheConfig::default())?);

        // Add config file if it exists
        config = config.add_source(config::File::with_name("bean-cache").required(false));

        // Add environment variables with prefix "BEANCACHE_"
        config = config.add_source(
            config::Environment::with_prefix("BEANCACHE")
                .separator("__")
                .prefix_separator("_"),
        );

        let config = config.build()?;
        let cache_config: CacheConfig = config.try_deserialize()?;

        Ok(cache_config)
    }

    pub fn inflation_wait_timeout(&self) -> Duration {
        Duration::from_secs(self.inflation_wait_timeout_secs)
    }

    /// Log level filter for the binary, falling back to info on junk input
    pub fn level_filter(&self) -> log::LevelFilter {
        self.log_level.parse().unwrap_or(log::LevelFilter::Info)
    }
}
