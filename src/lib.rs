pub mod capture;
pub mod descriptor;
pub mod error;
pub mod host;
pub mod pipeline;
pub mod stream;
pub mod usb;
pub mod utils;

use std::path::Path;

use serde::{Deserialize, Serialize};

pub use capture::frame::{Encoding, Frame, VideoFormat};
pub use error::{Error, Result};
pub use host::UvcHost;
pub use pipeline::frame_channel;
pub use stream::{
    EventCallback, FrameCallback, Stream, StreamConfig, StreamEvent, StreamState, StreamStats,
};
pub use utils::DeviceSelector;

/// Stream configuration, loadable from a TOML file and `UVC__*` environment
/// variables.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub device: DeviceSelector,
    /// Zero width, height or fps and `Any` encoding act as wildcards
    pub format: VideoFormat,
    pub advanced: AdvancedSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AdvancedSettings {
    pub number_of_frame_buffers: usize,
    /// Frame buffer size; the negotiated maximum frame size when unset
    pub frame_size: Option<usize>,
    pub number_of_transfers: usize,
    /// Bytes per USB transfer
    pub transfer_size: usize,
    /// Deliver overflowing frames cut to the buffer size instead of dropping them
    pub deliver_truncated: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            device: DeviceSelector::default(),
            format: VideoFormat::new(640, 480, 30.0, Encoding::Mjpeg),
            advanced: AdvancedSettings::default(),
        }
    }
}

impl Default for AdvancedSettings {
    fn default() -> Self {
        Self {
            number_of_frame_buffers: 3,
            frame_size: None,
            number_of_transfers: 3,
            transfer_size: 10 * 1024,
            deliver_truncated: false,
        }
    }
}

impl Settings {
    /// Read settings from `path` (TOML), overridden by `UVC__SECTION__KEY`
    /// environment variables. Missing keys keep their defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::from(path.as_ref()))
            .add_source(
                config::Environment::with_prefix("UVC")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;
        Ok(settings)
    }
}
