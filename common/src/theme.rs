//! Persisted theme schema.
//!
//! A theme directory holds a `config.json` of the form:
//!
//! ```json
//! {
//!     "background": "/path/to/demo.jpg",
//!     "mask": "/path/to/mask.png",
//!     "widgets": [
//!         { "text": "CPU", "color": [255, 255, 255, 255], "xy": [16, 16], "size": 24 },
//!         { "widget": "CpuTemp000", "color": [255, 0, 0, 255], "xy": [16, 48], "size": 24, "unit": true }
//!     ]
//! }
//! ```

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Name of the theme configuration file inside a theme directory.
pub const THEME_CONFIG_FILE: &str = "config.json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThemeConfig {
    /// Background media (video, animation or still image)
    pub background: PathBuf,

    /// Translucent mask blended over every frame
    pub mask: PathBuf,

    /// Widgets, drawn in order
    #[serde(default)]
    pub widgets: Vec<WidgetConfig>,
}

/// One text element drawn over the frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WidgetConfig {
    #[serde(flatten)]
    pub content: WidgetContent,

    /// RGBA
    pub color: [u8; 4],

    /// Top-left corner in frame pixels
    pub xy: [i32; 2],

    /// Font size in pixels
    pub size: u32,

    /// Append the unit to sensor readings
    #[serde(default)]
    pub unit: bool,

    /// Celsius (`true`) or Fahrenheit (`false`) for temperatures
    #[serde(default = "default_true")]
    pub cels: bool,
}

/// What a widget displays.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum WidgetContent {
    /// Fixed text
    Literal { text: String },
    /// Telemetry key, formatted on every frame
    Sensor { widget: String },
}

fn default_true() -> bool {
    true
}

impl WidgetConfig {
    pub fn literal(text: impl Into<String>, xy: [i32; 2], size: u32, color: [u8; 4]) -> Self {
        Self {
            content: WidgetContent::Literal { text: text.into() },
            color,
            xy,
            size,
            unit: false,
            cels: true,
        }
    }

    pub fn sensor(key: impl Into<String>, xy: [i32; 2], size: u32, color: [u8; 4]) -> Self {
        Self {
            content: WidgetContent::Sensor { widget: key.into() },
            color,
            xy,
            size,
            unit: false,
            cels: true,
        }
    }
}
