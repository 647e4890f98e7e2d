//! Configuration loading: YAML document plus environment overrides.

use std::env;
use std::fs;
use std::path::Path;

use tracing::{debug, info};

use super::AdiConfig;
use crate::error::{AdiError, Result};

/// Default location of the settings document, relative to the working
/// directory the service is launched from.
pub const DEFAULT_SETTINGS_PATH: &str = "config/settings.yml";

/// Load the configuration document, apply environment overrides and
/// validate the result.
pub fn load(path: &Path) -> Result<AdiConfig> {
    debug!(path = %path.display(), "loading configuration");

    let raw = fs::read_to_string(path).map_err(|e| {
        AdiError::Configuration(format!("cannot read settings file {}: {e}", path.display()))
    })?;

    let mut config: AdiConfig = serde_yaml::from_str(&raw)
        .map_err(|e| AdiError::Configuration(format!("invalid settings document: {e}")))?;

    apply_env_overrides(&mut config)?;
    config.validate()?;

    info!(
        max_workers = config.max_workers,
        poll_interval_secs = config.poll_interval_secs,
        use_register_zarr = config.use_register_zarr,
        "configuration loaded"
    );

    Ok(config)
}

fn apply_env_overrides(config: &mut AdiConfig) -> Result<()> {
    if let Ok(url) = env::var("INGEST_TRACKING_DB_URL") {
        if !url.is_empty() {
            config.ingest_tracking_db = url;
        }
    }

    if let Ok(value) = env::var("USE_REGISTER_ZARR") {
        config.use_register_zarr = parse_bool("USE_REGISTER_ZARR", &value)?;
    }

    Ok(())
}

fn parse_bool(name: &str, value: &str) -> Result<bool> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" => Ok(true),
        "0" | "false" | "no" => Ok(false),
        other => Err(AdiError::Configuration(format!(
            "{name} must be a boolean, got '{other}'"
        ))),
    }
}
