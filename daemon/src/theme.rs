//! Theme store
//!
//! Loads a theme directory's `config.json` and its mask. A missing,
//! unreadable or corrupt configuration is replaced by the default theme: an
//! EBU colour-bar background with a vertical fade mask.

use anyhow::{Context, Result};
use common::theme::THEME_CONFIG_FILE;
use common::ThemeConfig;
use image::codecs::jpeg::JpegEncoder;
use image::{ExtendedColorType, ImageBuffer, Rgb, RgbImage, Rgba, RgbaImage};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// Background written when the default theme is generated
pub const DEFAULT_BACKGROUND_FILE: &str = "demo.jpg";

/// Mask written when the default theme is generated
pub const DEFAULT_MASK_FILE: &str = "mask.png";

/// Edge length of the generated background and mask
pub const DEFAULT_THEME_SIZE: u32 = 480;

/// EBU 75% colour bars, left to right
const EBU_BARS: [[u8; 3]; 8] = [
    [255, 255, 255],
    [191, 191, 0],
    [0, 191, 191],
    [0, 191, 0],
    [191, 0, 191],
    [191, 0, 0],
    [0, 0, 191],
    [0, 0, 0],
];

/// A loaded theme.
#[derive(Debug, Clone)]
pub struct Theme {
    pub config: ThemeConfig,

    /// Decoded mask, shared with the compositor's resize cache
    pub mask: Arc<RgbaImage>,

    /// Where `config` is saved
    pub config_path: PathBuf,
}

impl Theme {
    /// Load the theme in `dir`, regenerating the default theme when its
    /// configuration is missing or unusable.
    pub fn load(dir: &Path) -> Result<Self> {
        fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create theme directory: {}", dir.display()))?;

        let config_path = dir.join(THEME_CONFIG_FILE);
        let config = match read_config(&config_path) {
            Ok(config) => {
                log::info!("Loaded theme from {}", config_path.display());
                config
            }
            Err(ConfigIssue::Missing) => {
                log::warn!("Theme config {} not found", config_path.display());
                return Self::regenerate(dir, config_path);
            }
            Err(ConfigIssue::PermissionDenied) => {
                log::warn!("Theme config {} permission denied", config_path.display());
                let temporary = dir.join(temporary_config_name());
                log::warn!("Using temporary config file {}", temporary.display());
                log::warn!(
                    "Please remove the temporary config file and correct the permissions of the theme config"
                );
                return Self::regenerate(dir, temporary);
            }
            Err(ConfigIssue::Corrupt(e)) => {
                log::error!("Theme config load error: {:#}", e);
                if config_path.exists() {
                    let old = backup_path(&config_path);
                    log::warn!(
                        "Theme config {} could be corrupt, renaming it to {}",
                        config_path.display(),
                        old.display()
                    );
                    fs::rename(&config_path, &old).with_context(|| {
                        format!("Failed to rename corrupt theme config to {}", old.display())
                    })?;
                }
                return Self::regenerate(dir, config_path);
            }
        };

        let mask = load_mask(&config.mask)?;
        Ok(Self {
            config,
            mask: Arc::new(mask),
            config_path,
        })
    }

    /// Write the default background and mask into `dir` and save a config
    /// referencing them at `config_path`.
    pub fn regenerate(dir: &Path, config_path: PathBuf) -> Result<Self> {
        let dir = std::path::absolute(dir)
            .with_context(|| format!("Failed to resolve theme directory: {}", dir.display()))?;
        let background = dir.join(DEFAULT_BACKGROUND_FILE);
        let mask_path = dir.join(DEFAULT_MASK_FILE);

        log::info!("Generating default theme in {}", dir.display());
        write_jpeg(&ebu_bars(DEFAULT_THEME_SIZE, DEFAULT_THEME_SIZE), &background)?;

        let mask = fade_mask(DEFAULT_THEME_SIZE, DEFAULT_THEME_SIZE);
        mask.save(&mask_path)
            .with_context(|| format!("Failed to write mask: {}", mask_path.display()))?;

        let theme = Self {
            config: ThemeConfig {
                background,
                mask: mask_path,
                widgets: Vec::new(),
            },
            mask: Arc::new(mask),
            config_path,
        };
        theme.save()?;
        Ok(theme)
    }

    /// Save the configuration as pretty-printed JSON.
    pub fn save(&self) -> Result<()> {
        let json = serde_json::to_string_pretty(&self.config)
            .context("Failed to serialize theme config")?;
        fs::write(&self.config_path, json).with_context(|| {
            format!(
                "Failed to write theme config: {}",
                self.config_path.display()
            )
        })?;
        log::debug!("Saved theme config to {}", self.config_path.display());
        Ok(())
    }

    pub fn background(&self) -> &Path {
        &self.config.background
    }
}

enum ConfigIssue {
    Missing,
    PermissionDenied,
    Corrupt(anyhow::Error),
}

fn read_config(path: &Path) -> std::result::Result<ThemeConfig, ConfigIssue> {
    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(e) if e.kind() == ErrorKind::NotFound => return Err(ConfigIssue::Missing),
        Err(e) if e.kind() == ErrorKind::PermissionDenied => {
            return Err(ConfigIssue::PermissionDenied);
        }
        Err(e) => return Err(ConfigIssue::Corrupt(e.into())),
    };

    serde_json::from_str(&contents)
        .with_context(|| format!("Failed to parse {}", path.display()))
        .map_err(ConfigIssue::Corrupt)
}

fn load_mask(path: &Path) -> Result<RgbaImage> {
    Ok(image::open(path)
        .with_context(|| format!("Failed to load mask: {}", path.display()))?
        .to_rgba8())
}

fn backup_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".old");
    PathBuf::from(name)
}

fn temporary_config_name() -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.subsec_nanos())
        .unwrap_or(0);
    format!("config-{}-{:08x}.json", std::process::id(), nanos)
}

/// Vertical EBU colour bars.
pub fn ebu_bars(width: u32, height: u32) -> RgbImage {
    let bars = EBU_BARS.len() as u32;
    let bar_width = (width / bars).max(1);
    ImageBuffer::from_fn(width, height, |x, _| {
        let bar = (x / bar_width).min(bars - 1) as usize;
        Rgb(EBU_BARS[bar])
    })
}

/// White mask fading from opaque at the top to transparent at the bottom.
pub fn fade_mask(width: u32, height: u32) -> RgbaImage {
    ImageBuffer::from_fn(width, height, |_, y| {
        let alpha = if height > 1 {
            (255.0 * (1.0 - y as f64 / (height - 1) as f64)).round() as u8
        } else {
            255
        };
        Rgba([255, 255, 255, alpha])
    })
}

fn write_jpeg(image: &RgbImage, path: &Path) -> Result<()> {
    let mut jpeg = Vec::new();
    JpegEncoder::new_with_quality(&mut jpeg, 100)
        .encode(image.as_raw(), image.width(), image.height(), ExtendedColorType::Rgb8)
        .context("Failed to encode background")?;
    fs::write(path, jpeg).with_context(|| format!("Failed to write background: {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::WidgetConfig;
    use tempfile::TempDir;

    #[test]
    fn test_missing_config_generates_default_theme() {
        let dir = TempDir::new().unwrap();
        let theme = Theme::load(dir.path()).unwrap();

        assert!(dir.path().join(THEME_CONFIG_FILE).exists());
        assert!(dir.path().join(DEFAULT_BACKGROUND_FILE).exists());
        assert!(dir.path().join(DEFAULT_MASK_FILE).exists());
        assert!(theme.config.background.is_absolute());
        assert!(theme.config.widgets.is_empty());
        assert_eq!(theme.mask.dimensions(), (DEFAULT_THEME_SIZE, DEFAULT_THEME_SIZE));

        let background = image::open(&theme.config.background).unwrap();
        assert_eq!(background.width(), DEFAULT_THEME_SIZE);
    }

    #[test]
    fn test_saved_theme_round_trips() {
        let dir = TempDir::new().unwrap();
        let mut theme = Theme::load(dir.path()).unwrap();
        theme
            .config
            .widgets
            .push(WidgetConfig::sensor("CpuUsage", [10, 20], 18, [255, 255, 255, 255]));
        theme.save().unwrap();

        let reloaded = Theme::load(dir.path()).unwrap();
        assert_eq!(reloaded.config, theme.config);
    }

    #[test]
    fn test_corrupt_config_is_renamed() {
        let dir = TempDir::new().unwrap();
        let config_path = dir.path().join(THEME_CONFIG_FILE);
        fs::write(&config_path, "{ not json").unwrap();

        let theme = Theme::load(dir.path()).unwrap();

        let old = dir.path().join("config.json.old");
        assert_eq!(fs::read_to_string(old).unwrap(), "{ not json");
        assert_eq!(theme.config_path, config_path);
        let saved: ThemeConfig =
            serde_json::from_str(&fs::read_to_string(&config_path).unwrap()).unwrap();
        assert_eq!(saved, theme.config);
    }

    #[test]
    fn test_missing_mask_is_an_error() {
        let dir = TempDir::new().unwrap();
        let config = ThemeConfig {
            background: dir.path().join("bg.mp4"),
            mask: dir.path().join("nope.png"),
            widgets: Vec::new(),
        };
        fs::write(
            dir.path().join(THEME_CONFIG_FILE),
            serde_json::to_string(&config).unwrap(),
        )
        .unwrap();

        assert!(Theme::load(dir.path()).is_err());
    }

    #[test]
    fn test_fade_mask_alpha() {
        let mask = fade_mask(2, 5);
        assert_eq!(mask.get_pixel(0, 0).0, [255, 255, 255, 255]);
        assert_eq!(mask.get_pixel(1, 2).0[3], 128);
        assert_eq!(mask.get_pixel(0, 4).0[3], 0);
        assert_eq!(fade_mask(1, 1).get_pixel(0, 0).0[3], 255);
    }

    #[test]
    fn test_ebu_bars() {
        let bars = ebu_bars(480, 4);
        assert_eq!(bars.get_pixel(0, 0).0, [255, 255, 255]);
        assert_eq!(bars.get_pixel(60, 0).0, [191, 191, 0]);
        assert_eq!(bars.get_pixel(479, 3).0, [0, 0, 0]);
    }

    #[test]
    fn test_backup_path() {
        assert_eq!(
            backup_path(Path::new("/t/config.json")),
            PathBuf::from("/t/config.json.old")
        );
    }
}
