use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::stream::{AudioFormatDescriptor, ColorSpace};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PlayerConfig {
    /// Version tag handed to the native source on open (used in its log).
    pub version: String,
    pub color_space: ColorSpace,
    pub audio_format: AudioFormatDescriptor,
    /// Sleep after a pull that returned no data. 0 disables the backoff and
    /// leaves pacing entirely to the native source.
    pub stall_backoff_ms: u64,
    /// How long `close()` waits for the pull loops to report that they stopped.
    pub loop_join_timeout_ms: u64,
}

impl Default for PlayerConfig {
    fn default() -> Self {
        Self {
            version: env!("CARGO_PKG_VERSION").to_string(),
            color_space: ColorSpace::Srgb,
            audio_format: AudioFormatDescriptor::mono_signed(),
            stall_backoff_ms: 0,
            loop_join_timeout_ms: 5_000,
        }
    }
}

impl PlayerConfig {
    pub fn load() -> anyhow::Result<Self> {
        let config_path = Self::config_path();
        if config_path.exists() {
            let content = std::fs::read_to_string(&config_path)
                .map_err(|e| anyhow::anyhow!("Failed to read config file at {}: {}", config_path.display(), e))?;

            match serde_json::from_str::<Self>(&content) {
                Ok(config) => {
                    log::info!("Loaded existing config from {}", config_path.display());
                    Ok(config)
                }
                Err(e) => {
                    log::warn!("Config file exists but has issues ({}), creating new one with defaults", e);
                    let new_config = Self::default();
                    new_config.save()
                        .map_err(|save_err| anyhow::anyhow!("Failed to save new config: {}", save_err))?;
                    Ok(new_config)
                }
            }
        } else {
            log::info!("No config file found, creating default config");
            let config = Self::default();
            config.save()
                .map_err(|e| anyhow::anyhow!("Failed to save default config: {}", e))?;
            log::info!("Created new config file at {}", config_path.display());
            Ok(config)
        }
    }

    pub fn save(&self) -> anyhow::Result<()> {
        let config_path = Self::config_path();
        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(&config_path, content)?;
        Ok(())
    }

    fn config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("stream-player")
            .join("config.json")
    }

    pub fn stall_backoff(&self) -> Option<std::time::Duration> {
        (self.stall_backoff_ms > 0).then(|| std::time::Duration::from_millis(self.stall_backoff_ms))
    }

    pub fn loop_join_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.loop_join_timeout_ms)
    }
}
