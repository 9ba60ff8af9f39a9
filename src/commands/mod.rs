//! Command implementations

pub mod history;
pub mod levels;
pub mod report;
pub mod reset;
pub mod run;
pub mod size;
pub mod status;

use anyhow::{Context, Result};
use std::path::Path;
use tracing::{info, warn};

use fx_pilot::Config;

/// Load the config file, or defaults plus environment when it does not exist
pub fn load_config(config_path: &str) -> Result<Config> {
    dotenv::dotenv().ok();

    if Path::new(config_path).exists() {
        let config = Config::from_file(config_path)
            .with_context(|| format!("Failed to load config from {}", config_path))?;
        info!("Loaded configuration from: {}", config_path);
        return Ok(config);
    }

    warn!("Config file {} not found, using defaults", config_path);
    let mut config = Config::default();
    config.apply_env_overrides();
    config.validate()?;
    Ok(config)
}

/// Offline instrument description: 3-digit quotes for JPY crosses, 5-digit otherwise
pub fn offline_instrument(symbol: &str) -> fx_pilot::InstrumentInfo {
    let mut info = fx_pilot::InstrumentInfo::major(symbol);
    if symbol.to_uppercase().ends_with("JPY") {
        info.digits = 3;
        info.point = 0.001;
    }
    info
}
