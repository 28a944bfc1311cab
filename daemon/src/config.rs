use crate::compositor::DEFAULT_FONT_FAMILY;
use crate::device::DEFAULT_JPEG_QUALITY;
use crate::playback::demuxer::DEFAULT_BUFFER_FRAME_LIMIT;
use crate::validate_enum;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Name of the daemon configuration file inside the config directory
pub const CONFIG_FILE: &str = "config.toml";

/// Main configuration structure
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub general: GeneralSettings,

    #[serde(default)]
    pub playback: PlaybackSettings,
}

/// General daemon settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GeneralSettings {
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Theme directory; relative paths and `~` are resolved against the config directory
    #[serde(default)]
    pub theme_dir: Option<String>,

    #[serde(default = "default_font_family")]
    pub font_family: String,
}

impl Default for GeneralSettings {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            theme_dir: None,
            font_family: default_font_family(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}
fn default_font_family() -> String {
    DEFAULT_FONT_FAMILY.to_string()
}

/// Playback pipeline settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PlaybackSettings {
    /// Capacity of each frame queue
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// Media with more video frames than this is re-decoded on every loop
    #[serde(default = "default_buffer_frame_limit")]
    pub buffer_frame_limit: usize,

    #[serde(default = "default_jpeg_quality")]
    pub jpeg_quality: u8,

    #[serde(default = "default_true")]
    pub audio_enabled: bool,
}

impl Default for PlaybackSettings {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
            buffer_frame_limit: default_buffer_frame_limit(),
            jpeg_quality: default_jpeg_quality(),
            audio_enabled: true,
        }
    }
}

fn default_true() -> bool {
    true
}
fn default_queue_capacity() -> usize {
    512
}
fn default_buffer_frame_limit() -> usize {
    DEFAULT_BUFFER_FRAME_LIMIT
}
fn default_jpeg_quality() -> u8 {
    DEFAULT_JPEG_QUALITY
}

impl Config {
    /// Load configuration from a specific path
    pub fn load_from_path(path: &Path) -> Result<Self> {
        if !path.exists() {
            log::info!(
                "Config file not found at {}, using defaults",
                path.display()
            );
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        log::info!("Loaded configuration from {}", path.display());
        config.validate()?;

        Ok(config)
    }

    /// Get the default config directory
    pub fn default_config_dir() -> Result<PathBuf> {
        Ok(dirs::config_dir()
            .context("Failed to get config directory")?
            .join("lcdc"))
    }

    /// Get the default data directory
    pub fn default_data_dir() -> Result<PathBuf> {
        Ok(dirs::data_local_dir()
            .context("Failed to get data directory")?
            .join("lcdc"))
    }

    /// Resolve the theme directory against the config directory
    pub fn theme_dir(&self, config_dir: &Path) -> Result<PathBuf> {
        match &self.general.theme_dir {
            Some(dir) => {
                let expanded = shellexpand::full(dir)
                    .with_context(|| format!("Failed to expand theme_dir: {}", dir))?;
                let path = PathBuf::from(expanded.as_ref());
                Ok(if path.is_relative() {
                    config_dir.join(path)
                } else {
                    path
                })
            }
            None => Ok(config_dir.join("theme")),
        }
    }

    /// Validate configuration
    fn validate(&self) -> Result<()> {
        validate_enum!(
            self.general.log_level.as_str(),
            "trace",
            "debug",
            "info",
            "warn",
            "error"
        )?;

        if self.playback.queue_capacity == 0 {
            anyhow::bail!("queue_capacity must be at least 1");
        }

        if !(1..=100).contains(&self.playback.jpeg_quality) {
            anyhow::bail!(
                "Invalid jpeg_quality: {} (must be 1-100)",
                self.playback.jpeg_quality
            );
        }

        if self.general.font_family.trim().is_empty() {
            anyhow::bail!("font_family must not be empty");
        }

        Ok(())
    }
}
