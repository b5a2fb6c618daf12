pub mod config_cmd;
pub mod gateway;
pub mod providers;

use std::path::Path;

use chatrelay_config::{AppConfig, ConfigError};

/// Load the config from an explicit path, or the default location.
///
/// Environment overrides apply either way.
pub fn load_config(path: Option<&Path>) -> Result<AppConfig, ConfigError> {
    match path {
        Some(path) => {
            let mut config = AppConfig::load_from(path)?;
            config.apply_env_overrides(|key| std::env::var(key).ok());
            config.validate()?;
            Ok(config)
        }
        None => AppConfig::load(),
    }
}
