//! Stream resolution negotiation against a channel's supported set

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::capture::channel::{Resolution, ResolutionFilter, ResolutionSelect, VideoChannel};
use crate::capture::frame::{PixelFormat, Rotation};
use crate::error::{Error, Result};

/// How the stream resolution relates to the model input
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageFit {
    /// Pick the smallest native-aspect resolution that covers the request and
    /// let preprocessing scale it down.
    #[default]
    Scale,
    /// Ask for the requested size directly (clamped to the channel limits);
    /// preprocessing center-crops when the aspect ratio differs.
    Crop,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NegotiationRequest {
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub rotation: Rotation,
    pub fit: ImageFit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Negotiated {
    pub resolution: Resolution,
    pub format: PixelFormat,
}

/// Choose the stream resolution and format to open on `channel`.
///
/// The requested format falls back to NV12 when the channel reports nothing
/// for it. With [`ImageFit::Scale`] an empty NV12 set means the channel has no
/// resolution metadata and the request is used verbatim.
pub fn choose_stream_resolution(
    channel: &dyn VideoChannel,
    request: &NegotiationRequest,
) -> Result<Negotiated> {
    // The channel reports unrotated resolutions
    let mut wanted = Resolution::new(request.width, request.height);
    if request.rotation.swaps_dimensions() {
        wanted = wanted.swapped();
    }

    let (select, native_aspect) = match request.fit {
        ImageFit::Scale => (ResolutionSelect::All, true),
        ImageFit::Crop => (ResolutionSelect::MinMax, false),
    };

    let mut format = request.format;
    let mut set = channel.resolutions(&ResolutionFilter {
        format,
        select,
        native_aspect,
    })?;

    if set.is_empty() && format != PixelFormat::Nv12 {
        warn!(
            "Channel {} reports no resolutions for {}, falling back to yuv",
            channel.name(),
            format
        );
        format = PixelFormat::Nv12;
        set = channel.resolutions(&ResolutionFilter {
            format,
            select,
            native_aspect,
        })?;
    }

    let resolution = match select {
        ResolutionSelect::All => smallest_fitting(&set, wanted).unwrap_or_else(|| {
            warn!(
                "Channel {} has no resolution info covering {}x{}, using the requested size",
                channel.name(),
                wanted.width,
                wanted.height
            );
            wanted
        }),
        ResolutionSelect::MinMax => {
            let (Some(min), Some(max)) = (set.first(), set.last()) else {
                return Err(Error::FormatUnsupported(format!(
                    "no resolutions available for {format} on {}",
                    channel.name()
                )));
            };
            clamp_to_limits(wanted, *min, *max)
        }
    };

    info!(
        "Selected stream {}x{} with format {} based on channel info",
        resolution.width, resolution.height, format
    );

    Ok(Negotiated { resolution, format })
}

/// Smallest-area resolution that covers `wanted` in both dimensions.
pub fn smallest_fitting(set: &[Resolution], wanted: Resolution) -> Option<Resolution> {
    set.iter()
        .filter(|res| res.fits(wanted))
        .min_by_key(|res| res.area())
        .copied()
}

fn clamp_to_limits(wanted: Resolution, min: Resolution, max: Resolution) -> Resolution {
    let mut chosen = wanted;
    if wanted.width > max.width || wanted.height > max.height {
        warn!(
            "Requested {}x{} exceeds max resolution, limiting to {}x{}",
            wanted.width, wanted.height, max.width, max.height
        );
        chosen = max;
    }
    if wanted.width < min.width || wanted.height < min.height {
        warn!(
            "Requested {}x{} is below min resolution, raising to {}x{}",
            wanted.width, wanted.height, min.width, min.height
        );
        chosen = min;
    }
    chosen
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::channel::{Acquired, StreamRequest};
    use crate::capture::frame::{FrameBuffer, StreamInfo};
    use std::time::Duration;

    struct FixedSet {
        rgb: Vec<Resolution>,
        yuv: Vec<Resolution>,
    }

    impl VideoChannel for FixedSet {
        fn name(&self) -> &str {
            "fixed"
        }

        fn resolutions(&self, filter: &ResolutionFilter) -> Result<Vec<Resolution>> {
            let set = match filter.format {
                PixelFormat::Nv12 => &self.yuv,
                _ => &self.rgb,
            };
            Ok(match filter.select {
                ResolutionSelect::All => set.clone(),
                ResolutionSelect::MinMax if set.is_empty() => Vec::new(),
                ResolutionSelect::MinMax => vec![set[0], set[set.len() - 1]],
            })
        }

        fn open(&self, _request: &StreamRequest) -> Result<StreamInfo> {
            unreachable!()
        }

        fn start(&self) -> Result<()> {
            Ok(())
        }

        fn wait_ready(&self, _timeout: Duration) -> Result<bool> {
            Ok(false)
        }

        fn acquire(&self) -> Result<Acquired> {
            Ok(Acquired::NoData)
        }

        fn release(&self, _buffer: FrameBuffer) -> Result<()> {
            Ok(())
        }

        fn set_framerate(&self, _fps: f64) -> Result<()> {
            Ok(())
        }
    }

    fn yuv_only() -> FixedSet {
        FixedSet {
            rgb: Vec::new(),
            yuv: vec![
                Resolution::new(320, 240),
                Resolution::new(640, 480),
                Resolution::new(1280, 720),
                Resolution::new(1920, 1080),
            ],
        }
    }

    fn request(width: u32, height: u32, fit: ImageFit) -> NegotiationRequest {
        NegotiationRequest {
            width,
            height,
            format: PixelFormat::Nv12,
            rotation: Rotation::R0,
            fit,
        }
    }

    #[test]
    fn picks_smallest_resolution_covering_request() {
        let chosen = choose_stream_resolution(&yuv_only(), &request(300, 300, ImageFit::Scale))
            .unwrap();
        assert_eq!(chosen.resolution, Resolution::new(640, 480));
        assert_eq!(chosen.format, PixelFormat::Nv12);
    }

    #[test]
    fn falls_back_to_request_when_nothing_fits() {
        let chosen = choose_stream_resolution(&yuv_only(), &request(4000, 3000, ImageFit::Scale))
            .unwrap();
        assert_eq!(chosen.resolution, Resolution::new(4000, 3000));
    }

    #[test]
    fn falls_back_to_request_without_resolution_metadata() {
        let channel = FixedSet {
            rgb: Vec::new(),
            yuv: Vec::new(),
        };
        let chosen = choose_stream_resolution(&channel, &request(300, 300, ImageFit::Scale))
            .unwrap();
        assert_eq!(chosen.resolution, Resolution::new(300, 300));
    }

    #[test]
    fn unsupported_format_falls_back_to_yuv() {
        let mut req = request(300, 300, ImageFit::Scale);
        req.format = PixelFormat::Rgb24;
        let chosen = choose_stream_resolution(&yuv_only(), &req).unwrap();
        assert_eq!(chosen.format, PixelFormat::Nv12);
    }

    #[test]
    fn rotation_swaps_requested_dimensions() {
        let mut req = request(480, 640, ImageFit::Scale);
        req.rotation = Rotation::R90;
        let chosen = choose_stream_resolution(&yuv_only(), &req).unwrap();
        assert_eq!(chosen.resolution, Resolution::new(640, 480));
    }

    #[test]
    fn crop_clamps_to_channel_limits() {
        let channel = yuv_only();
        let big = choose_stream_resolution(&channel, &request(4000, 300, ImageFit::Crop)).unwrap();
        assert_eq!(big.resolution, Resolution::new(1920, 1080));
        let small = choose_stream_resolution(&channel, &request(100, 100, ImageFit::Crop)).unwrap();
        assert_eq!(small.resolution, Resolution::new(320, 240));
        let exact = choose_stream_resolution(&channel, &request(800, 600, ImageFit::Crop)).unwrap();
        assert_eq!(exact.resolution, Resolution::new(800, 600));
    }

    #[test]
    fn crop_without_limits_is_unsupported() {
        let channel = FixedSet {
            rgb: Vec::new(),
            yuv: Vec::new(),
        };
        let err = choose_stream_resolution(&channel, &request(300, 300, ImageFit::Crop))
            .unwrap_err();
        assert!(matches!(err, Error::FormatUnsupported(_)));
    }
}
