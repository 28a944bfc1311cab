//! Common types and utilities for lcdc.
//!
//! This crate defines the I/O-free pieces shared by the daemon (`lcdc`) and
//! its tests:
//!
//! - [`protocol`]: wire framing for the two supported panel families
//! - [`theme`]: the persisted theme schema (`config.json`)
//! - [`LcdError`]: the error taxonomy surfaced to the owner of a display
//!
//! # Examples
//!
//! ```
//! use common::protocol::Protocol;
//!
//! let payload = [0xFF, 0xD8, 0xFF, 0xD9];
//! let message = Protocol::Bulk.frame_message(480, 480, &payload);
//! assert_eq!(&message[..4], &[0x12, 0x34, 0x56, 0x78]);
//! ```

pub mod protocol;
pub mod theme;

pub use protocol::{Protocol, ProtocolError};
pub use theme::{ThemeConfig, WidgetConfig, WidgetContent};

use thiserror::Error;

/// Error taxonomy shared by every display session.
///
/// `Source` and `Transport` are terminal for the session that raised them;
/// `Config` is normally recovered by regenerating the default theme.
#[derive(Error, Debug)]
pub enum LcdError {
    #[error("Source error: {0}")]
    Source(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(String),
}

impl From<std::io::Error> for LcdError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e.to_string())
    }
}

impl From<serde_json::Error> for LcdError {
    fn from(e: serde_json::Error) -> Self {
        Self::Config(e.to_string())
    }
}

impl From<ProtocolError> for LcdError {
    fn from(e: ProtocolError) -> Self {
        Self::Transport(e.to_string())
    }
}
