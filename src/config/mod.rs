//! Configuration loading.
//!
//! Layered file + environment configuration with defaults for every knob,
//! so the service starts with the stock policy when no file is present.
//! Detection and penalty thresholds live here rather than in code: they are
//! calibration, not mechanism.

use std::env;

use config::{Config as ConfigBuilder, ConfigError, Environment, File};

use crate::models::Config;

pub fn load_config() -> Result<Config, ConfigError> {
    let config_file = env::var("CONFIG_FILE").unwrap_or_else(|_| "config/default.toml".to_string());

    let config = ConfigBuilder::builder()
        .add_source(File::with_name(&config_file).required(false))
        .add_source(Environment::default().separator("__"))
        .set_default("server.host", "127.0.0.1")?
        .set_default("server.port", 8080)?
        .set_default("storage.backend", "memory")?
        .set_default("storage.redis_url", "redis://127.0.0.1:6379")?
        .set_default("storage.idle_windows", 3)?
        .set_default("rate_limit.general.limit", 100)?
        .set_default("rate_limit.general.window_ms", 60_000)?
        .set_default("rate_limit.search.limit", 50)?
        .set_default("rate_limit.search.window_ms", 60_000)?
        .set_default("rate_limit.auth.limit", 10)?
        .set_default("rate_limit.auth.window_ms", 60_000)?
        .set_default("rate_limit.master_admin.limit", 20)?
        .set_default("rate_limit.master_admin.window_ms", 60_000)?
        .set_default("rate_limit.bulk.limit", 5)?
        .set_default("rate_limit.bulk.window_ms", 60_000)?
        .set_default("rate_limit.fail_open", false)?
        .set_default("rate_limit.violations_after_rejections", 5)?
        .set_default("rate_limit.rejection_window_ms", 60_000)?
        .set_default("penalties.temp_block_ms", 300_000)?
        .set_default("penalties.extended_block_ms", 3_600_000)?
        .set_default("penalties.retention_ms", 86_400_000)?
        .set_default("detection.per_ip_threshold", 20)?
        .set_default("detection.attack_population_threshold", 50)?
        .set_default("detection.observation_window_ms", 10_000)?
        .set_default("detection.emergency_volume_threshold", 1_000)?
        .set_default("detection.volume_window_ms", 10_000)?
        .set_default("detection.emergency_offender_min", 3)?
        .set_default("detection.botnet_distinct_ip_threshold", 20)?
        .set_default("detection.botnet_window_ms", 10_000)?
        .build()?;

    config.try_deserialize()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_stock_policy() {
        let config = load_config().unwrap();
        assert_eq!(config.storage.backend, "memory");
        assert_eq!(config.rate_limit.general.limit, 100);
        assert_eq!(config.rate_limit.bulk.limit, 5);
        assert_eq!(config.penalties.temp_block_ms, 300_000);
        assert_eq!(config.detection.attack_population_threshold, 50);
        assert!(!config.rate_limit.fail_open);
    }
}
