//! Runtime configuration loader for Canopy.
//!
//! Reads `canopy.toml` from the data directory (`~/.canopy/` in production)
//! and deserializes it into [`RuntimeConfig`]. Falls back to defaults when the
//! file is missing or malformed.

use std::path::Path;

use canopy_types::config::RuntimeConfig;

/// File name looked up inside the data directory.
pub const CONFIG_FILE_NAME: &str = "canopy.toml";

/// Load runtime configuration from `{data_dir}/canopy.toml`.
///
/// - Missing file: returns [`RuntimeConfig::default()`].
/// - Unreadable or unparsable file: logs a warning and returns the default.
pub async fn load_runtime_config(data_dir: &Path) -> RuntimeConfig {
    let config_path = data_dir.join(CONFIG_FILE_NAME);

    let content = match tokio::fs::read_to_string(&config_path).await {
        Ok(content) => content,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!(
                "No {CONFIG_FILE_NAME} found at {}, using defaults",
                config_path.display()
            );
            return RuntimeConfig::default();
        }
        Err(err) => {
            tracing::warn!("Failed to read {}: {err}, using defaults", config_path.display());
            return RuntimeConfig::default();
        }
    };

    match toml::from_str::<RuntimeConfig>(&content) {
        Ok(config) => config,
        Err(err) => {
            tracing::warn!(
                "Failed to parse {}: {err}, using defaults",
                config_path.display()
            );
            RuntimeConfig::default()
        }
    }
}
