use std::time::Instant;

/// Milliseconds since `start`, saturating at `u32::MAX`
pub fn elapsed_ms(start: Instant) -> u32 {
    u32::try_from(start.elapsed().as_millis()).unwrap_or(u32::MAX)
}

#[cfg(feature = "v4l2")]
pub use detect::{auto_detect_device, FoundDevice};

#[cfg(feature = "v4l2")]
mod detect {
    use std::path::Path;

    use tracing::info;
    use v4l::{capability::Flags, video::Capture, Device, FourCC};

    use crate::capture::frame::PixelFormat;
    use crate::error::{Error, Result};

    /// Detected capture device info
    #[derive(Debug, Clone)]
    pub struct FoundDevice {
        pub path: String,
        pub format: PixelFormat,
    }

    /// Probe `/dev/video*` for a capture node offering NV12 or RGB24
    pub fn auto_detect_device() -> Result<FoundDevice> {
        info!("Auto-detecting capture devices...");

        for i in 0..10 {
            let path = format!("/dev/video{}", i);
            if !Path::new(&path).exists() {
                continue;
            }

            let Ok(dev) = Device::with_path(&path) else {
                continue;
            };
            let Ok(caps) = dev.query_caps() else {
                continue;
            };
            if !caps.capabilities.contains(Flags::VIDEO_CAPTURE) {
                continue;
            }
            let Ok(formats) = dev.enum_formats() else {
                continue;
            };
            for fmt in formats {
                if fmt.fourcc == FourCC::new(b"NV12") {
                    info!("Found NV12 device: {} - {}", path, caps.card);
                    return Ok(FoundDevice {
                        path,
                        format: PixelFormat::Nv12,
                    });
                } else if fmt.fourcc == FourCC::new(b"RGB3") {
                    info!("Found RGB device: {} - {}", path, caps.card);
                    return Ok(FoundDevice {
                        path,
                        format: PixelFormat::Rgb24,
                    });
                }
            }
        }

        Err(Error::ChannelUnavailable(
            "no capture device offering NV12 or RGB24 found".into(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn elapsed_is_monotonic() {
        let start = Instant::now() - Duration::from_millis(25);
        assert!(elapsed_ms(start) >= 25);
    }
}
