//! Contract between the frame source and a hardware video channel

use std::time::Duration;

use crate::capture::frame::{FrameBuffer, PixelFormat, Rotation, StreamInfo};
use crate::error::Result;

/// A width/height pair reported by a channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub fn area(&self) -> u64 {
        self.width as u64 * self.height as u64
    }

    pub fn fits(&self, requested: Resolution) -> bool {
        self.width >= requested.width && self.height >= requested.height
    }

    pub fn swapped(self) -> Self {
        Self::new(self.height, self.width)
    }
}

/// Which resolutions a channel should report
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolutionSelect {
    /// Every supported resolution
    All,
    /// Exactly two entries: the minimum and the maximum
    MinMax,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolutionFilter {
    pub format: PixelFormat,
    pub select: ResolutionSelect,
    /// Only resolutions matching the sensor's native aspect ratio
    pub native_aspect: bool,
}

/// Parameters used to open a stream after negotiation
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StreamRequest {
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub framerate: f64,
    pub buffer_count: u32,
    pub rotation: Rotation,
}

/// Result of a non-blocking acquire
#[derive(Debug)]
pub enum Acquired {
    Frame(FrameBuffer),
    /// Woke up but nothing was ready; try again
    NoData,
    /// The stream was invalidated (e.g. global rotation); it must be rebuilt
    StructuralChange(String),
}

/// A hardware video channel.
///
/// Methods take `&self`: the acquisition thread acquires while the consumer
/// thread releases and changes the rate, so implementations synchronize
/// internally, just like the vendor APIs they wrap.
pub trait VideoChannel: Send + Sync {
    /// Human readable identifier for logs.
    fn name(&self) -> &str;

    /// Resolutions supported for `filter.format`. An empty list means the
    /// format is not available.
    fn resolutions(&self, filter: &ResolutionFilter) -> Result<Vec<Resolution>>;

    /// Rotation currently configured on the channel.
    fn rotation(&self) -> Result<Rotation> {
        Ok(Rotation::R0)
    }

    /// Open the stream. The returned info describes what the channel actually
    /// created and may differ from the request.
    fn open(&self, request: &StreamRequest) -> Result<StreamInfo>;

    /// Start filling buffers.
    fn start(&self) -> Result<()>;

    /// Block until the channel has data or `timeout` expires.
    /// Returns `false` on timeout.
    fn wait_ready(&self, timeout: Duration) -> Result<bool>;

    /// Take the next filled buffer without blocking.
    fn acquire(&self) -> Result<Acquired>;

    /// Hand a buffer back so the channel can fill it again.
    fn release(&self, buffer: FrameBuffer) -> Result<()>;

    /// Change the acquisition rate of a running stream.
    fn set_framerate(&self, fps: f64) -> Result<()>;

    /// Stop filling buffers. Outstanding buffers may still be released.
    fn stop(&self) {}
}
