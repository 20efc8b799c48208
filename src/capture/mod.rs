pub mod channel;
pub mod frame;
pub mod negotiate;
pub mod pool;
pub mod source;
pub mod synthetic;
#[cfg(feature = "v4l2")]
pub mod v4l2;

use std::sync::Arc;

use tracing::info;

use crate::error::Result;
use crate::CaptureConfig;

pub use channel::{Acquired, Resolution, StreamRequest, VideoChannel};
pub use frame::{BufferId, FrameBuffer, FrameMetadata, PixelFormat, Rotation, StreamInfo};
pub use negotiate::ImageFit;
pub use source::{FrameSource, SourceStats, StopHandle};
pub use synthetic::{SyntheticChannel, SyntheticConfig};
#[cfg(feature = "v4l2")]
pub use v4l2::V4l2Channel;

/// Scheme selecting the synthetic channel
pub const STUB_SCHEME: &str = "stub://";

/// Open the channel named by `config.device`.
pub fn open_channel(config: &CaptureConfig) -> Result<Arc<dyn VideoChannel>> {
    if config.device.starts_with(STUB_SCHEME) {
        info!("Using synthetic channel {}", config.device);
        return Ok(Arc::new(SyntheticChannel::new(
            config.device.clone(),
            SyntheticConfig::default(),
        )));
    }
    open_device(config)
}

#[cfg(feature = "v4l2")]
fn open_device(config: &CaptureConfig) -> Result<Arc<dyn VideoChannel>> {
    let path = if config.device == "auto" {
        crate::utils::auto_detect_device()?.path
    } else {
        config.device.clone()
    };
    Ok(Arc::new(V4l2Channel::new(&path)?))
}

#[cfg(not(feature = "v4l2"))]
fn open_device(config: &CaptureConfig) -> Result<Arc<dyn VideoChannel>> {
    Err(crate::Error::ChannelUnavailable(format!(
        "{}: built without V4L2 support, only {STUB_SCHEME} devices are available",
        config.device
    )))
}
