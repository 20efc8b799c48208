use serde::{Deserialize, Serialize};
use std::fmt;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd};
use std::sync::Arc;
use std::time::Duration;

/// Identity of a hardware buffer: the raw number of its backing descriptor.
///
/// Channels rotate through a small fixed pool, so the same identity comes
/// back every `buffer_count` frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BufferId(pub i32);

impl fmt::Display for BufferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "buf#{}", self.0)
    }
}

/// One hardware-owned image buffer on loan from a [`VideoChannel`].
///
/// Not `Clone`: a buffer lives in exactly one place at a time (the source's
/// delivered queue, the consumer, or the recycled queue) and moves between
/// them by value.
///
/// [`VideoChannel`]: crate::capture::VideoChannel
pub struct FrameBuffer {
    /// Backing memory, shared with the channel's pool
    pub fd: Arc<OwnedFd>,

    /// Slot index inside the owning channel's pool
    pub slot: usize,

    /// Byte offset of the image inside the backing memory
    pub offset: u64,

    /// Usable bytes starting at `offset`
    pub capacity: usize,

    pub meta: FrameMetadata,
}

impl FrameBuffer {
    pub fn id(&self) -> BufferId {
        BufferId(self.fd.as_raw_fd())
    }

    pub fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }

    pub fn sequence(&self) -> u64 {
        self.meta.sequence
    }

    pub fn timestamp(&self) -> Duration {
        self.meta.timestamp
    }
}

impl fmt::Debug for FrameBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameBuffer")
            .field("id", &self.id())
            .field("slot", &self.slot)
            .field("capacity", &self.capacity)
            .field("sequence", &self.meta.sequence)
            .finish()
    }
}

/// Frame metadata
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrameMetadata {
    pub sequence: u64,
    pub width: u32,
    pub height: u32,
    pub pitch: u32,
    pub format: PixelFormat,
    pub rotation: Rotation,
    /// Monotonic capture time reported by the channel
    pub timestamp: Duration,
}

/// Pixel formats a channel can deliver and a model can consume
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PixelFormat {
    /// YUV 4:2:0 semi-planar
    Nv12,
    /// Interleaved RGB, 3 bytes per pixel
    Rgb24,
    /// Planar RGB, one full plane per channel
    PlanarRgb,
}

impl PixelFormat {
    /// Tensor layout an accelerator uses for a buffer of this format.
    pub fn tensor_layout(self) -> TensorLayout {
        match self {
            PixelFormat::Nv12 => TensorLayout::Yuv420Sp,
            PixelFormat::Rgb24 => TensorLayout::Nhwc,
            PixelFormat::PlanarRgb => TensorLayout::Nchw,
        }
    }

    /// Bytes needed for a `width x height` image with the given row pitch.
    pub fn frame_size(self, pitch: u32, height: u32) -> usize {
        let (pitch, height) = (pitch as usize, height as usize);
        match self {
            PixelFormat::Nv12 => pitch * height * 3 / 2,
            PixelFormat::Rgb24 => pitch * height,
            PixelFormat::PlanarRgb => pitch * height * 3,
        }
    }

    /// Natural row pitch in bytes for an unpadded image.
    pub fn natural_pitch(self, width: u32) -> u32 {
        match self {
            PixelFormat::Nv12 | PixelFormat::PlanarRgb => width,
            PixelFormat::Rgb24 => width * 3,
        }
    }
}

impl fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PixelFormat::Nv12 => "yuv",
            PixelFormat::Rgb24 => "rgb interleaved",
            PixelFormat::PlanarRgb => "planar rgb",
        };
        f.write_str(name)
    }
}

/// Memory layout of a tensor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TensorLayout {
    Nhwc,
    Nchw,
    Yuv420Sp,
}

/// Image rotation applied by the channel
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u32", into = "u32")]
pub enum Rotation {
    #[default]
    R0,
    R90,
    R180,
    R270,
}

impl Rotation {
    pub fn degrees(self) -> u32 {
        match self {
            Rotation::R0 => 0,
            Rotation::R90 => 90,
            Rotation::R180 => 180,
            Rotation::R270 => 270,
        }
    }

    /// 90 and 270 degree rotations deliver frames with width and height swapped.
    pub fn swaps_dimensions(self) -> bool {
        matches!(self, Rotation::R90 | Rotation::R270)
    }
}

impl TryFrom<u32> for Rotation {
    type Error = String;

    fn try_from(degrees: u32) -> Result<Self, Self::Error> {
        match degrees {
            0 => Ok(Rotation::R0),
            90 => Ok(Rotation::R90),
            180 => Ok(Rotation::R180),
            270 => Ok(Rotation::R270),
            other => Err(format!("unsupported rotation {other}")),
        }
    }
}

impl From<Rotation> for u32 {
    fn from(rotation: Rotation) -> u32 {
        rotation.degrees()
    }
}

/// Negotiated stream parameters. Immutable between structural changes.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StreamInfo {
    pub width: u32,
    pub height: u32,
    pub pitch: u32,
    pub format: PixelFormat,
    pub rotation: Rotation,
    pub framerate: f64,
    /// Number of buffers the channel rotates through
    pub buffer_count: u32,
}

impl StreamInfo {
    /// True when a job graph built for `self` cannot be reused for `other`.
    pub fn requires_rebuild(&self, other: &StreamInfo) -> bool {
        self.width != other.width
            || self.height != other.height
            || self.pitch != other.pitch
            || self.format != other.format
            || self.rotation != other.rotation
            || self.buffer_count != other.buffer_count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nv12_frame_size_includes_chroma_plane() {
        assert_eq!(PixelFormat::Nv12.frame_size(640, 480), 640 * 480 * 3 / 2);
        assert_eq!(PixelFormat::Rgb24.frame_size(900, 300), 900 * 300);
    }

    #[test]
    fn rotation_round_trips_through_degrees() {
        assert_eq!(Rotation::try_from(270), Ok(Rotation::R270));
        assert!(Rotation::try_from(45).is_err());
        assert!(Rotation::R90.swaps_dimensions());
        assert!(!Rotation::R180.swaps_dimensions());
    }

    #[test]
    fn framerate_change_alone_does_not_force_rebuild() {
        let info = StreamInfo {
            width: 640,
            height: 480,
            pitch: 640,
            format: PixelFormat::Nv12,
            rotation: Rotation::R0,
            framerate: 30.0,
            buffer_count: 4,
        };
        let slower = StreamInfo {
            framerate: 10.0,
            ..info
        };
        assert!(!info.requires_rebuild(&slower));
        let rotated = StreamInfo {
            rotation: Rotation::R90,
            ..info
        };
        assert!(info.requires_rebuild(&rotated));
    }
}
