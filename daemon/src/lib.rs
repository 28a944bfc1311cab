//! lcdc: drives USB LCD panels with a looping themed background
//!
//! Media is demuxed on one thread and rendered by an audio and a video
//! thread, paced by a shared clock. Accepted video frames are composited
//! with the theme's mask and sensor widgets, encoded as JPEG and sent to
//! the panel.

#[macro_use]
pub mod macros;

pub mod canvas;
pub mod clock;
pub mod compositor;
pub mod config;
pub mod device;
pub mod media;
pub mod playback;
pub mod queue;
pub mod sensors;
pub mod theme;
