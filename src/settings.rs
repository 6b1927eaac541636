use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{debug, warn};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PersistentSettings {
    pub strip_prompt_text: Option<bool>,
    pub default_author: Option<String>,
    pub telemetry: Option<bool>,
    pub update_check: Option<bool>,
}

pub fn load_settings(path: &Path) -> PersistentSettings {
    match std::fs::read_to_string(path) {
        Ok(content) => serde_json::from_str(&content).unwrap_or_else(|e| {
            warn!("Ignoring unreadable settings at {:?}: {}", path, e);
            PersistentSettings::default()
        }),
        Err(_) => PersistentSettings::default(),
    }
}

pub fn save_settings(path: &Path, settings: &PersistentSettings) {
    match serde_json::to_string_pretty(settings) {
        Ok(json) => {
            if let Err(e) = std::fs::write(path, json) {
                warn!("Failed to save settings to {:?}: {}", path, e);
            }
        }
        Err(e) => {
            warn!("Failed to serialize settings: {}", e);
        }
    }
}

// ============================================================================
// Runtime policy
// ============================================================================

/// Where usage events go. Nothing here ever leaves the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Telemetry {
    #[default]
    Disabled,
    /// Events are written to the local `telemetry` tracing target only.
    LocalLog,
}

impl Telemetry {
    pub fn record(&self, event: &str, properties: &serde_json::Value) {
        match self {
            Telemetry::Disabled => {}
            Telemetry::LocalLog => {
                tracing::info!(target: "telemetry", event, %properties, "telemetry event");
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UpdateCheck {
    #[default]
    Disabled,
}

impl UpdateCheck {
    /// Latest known version. With checks disabled this is always the running build.
    pub fn latest_version(&self) -> &'static str {
        match self {
            UpdateCheck::Disabled => env!("CARGO_PKG_VERSION"),
        }
    }

    pub fn update_available(&self) -> bool {
        match self {
            UpdateCheck::Disabled => {
                debug!("Update checks are disabled in this build");
                false
            }
        }
    }
}

/// Capabilities injected into the store and the HTTP layer.
#[derive(Debug, Clone, Default)]
pub struct RuntimePolicy {
    pub telemetry: Telemetry,
    pub update_check: UpdateCheck,
    pub strip_prompt_text: bool,
    pub default_author: Option<String>,
}

impl RuntimePolicy {
    pub fn from_settings(settings: &PersistentSettings) -> Self {
        if settings.update_check == Some(true) {
            warn!("update_check requested but this build has no update channel");
        }
        Self {
            telemetry: if settings.telemetry == Some(true) {
                Telemetry::LocalLog
            } else {
                Telemetry::Disabled
            },
            update_check: UpdateCheck::Disabled,
            strip_prompt_text: settings.strip_prompt_text.unwrap_or(false),
            default_author: settings.default_author.clone(),
        }
    }
}
