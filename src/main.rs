//! Service entry point.
//!
//! Loads the settings document (path from the first argument, default
//! `config/settings.yml`), initialises logging and hands over to the
//! lifecycle. Exit code 0 on clean shutdown, non-zero on fatal boot error.

use std::path::Path;

use tracing::info;

use omero_adi::config::{self, DEFAULT_SETTINGS_PATH};
use omero_adi::{logging, orchestration};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let settings_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| DEFAULT_SETTINGS_PATH.to_string());

    let config = config::load(Path::new(&settings_path))?;
    logging::init(&config.log_level, &config.log_file_path);

    info!(
        settings = %settings_path,
        version = env!("CARGO_PKG_VERSION"),
        "starting omero-adi"
    );

    orchestration::bootstrap::run(config).await?;
    Ok(())
}
