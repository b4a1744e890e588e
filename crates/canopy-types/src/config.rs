//! Runtime configuration types for Canopy.
//!
//! `RuntimeConfig` represents the top-level `canopy.toml` that sizes the
//! per-instance channels, picks the default persistable-idle action and
//! configures logging.

use serde::{Deserialize, Serialize};

use crate::instance::PersistableIdleAction;

/// Top-level configuration shared by every instance a runtime hosts.
///
/// Loaded from `canopy.toml` in the data directory. All fields have sensible
/// defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Capacity of each instance's broadcast event channel.
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,

    /// Capacity of each instance's command channel (resumes, timers, cancel).
    #[serde(default = "default_command_capacity")]
    pub command_capacity: usize,

    /// Applied automatically on every transition into persistable idle.
    #[serde(default)]
    pub persistable_idle_action: PersistableIdleAction,

    #[serde(default)]
    pub logging: LoggingConfig,
}

fn default_event_capacity() -> usize {
    1024
}

fn default_command_capacity() -> usize {
    256
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            event_capacity: default_event_capacity(),
            command_capacity: default_command_capacity(),
            persistable_idle_action: PersistableIdleAction::default(),
            logging: LoggingConfig::default(),
        }
    }
}

/// Subscriber settings consumed by `canopy-observe`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// `EnvFilter` directive used when `RUST_LOG` is unset.
    #[serde(default = "default_filter")]
    pub filter: String,

    /// Emit JSON lines instead of human-readable output.
    #[serde(default)]
    pub json: bool,

    /// Bridge spans to OpenTelemetry (stdout exporter).
    #[serde(default)]
    pub otel: bool,
}

fn default_filter() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: default_filter(),
            json: false,
            otel: false,
        }
    }
}
