//! V4L2 video channel with memory-mapped streaming.
//!
//! Kernel buffers are requeued by the MMAP stream as soon as the next one is
//! dequeued, so every frame is copied into a slot of a memfd pool. The pool
//! slots are the buffers the pipeline sees: stable identities, explicit
//! release, exactly like a vendor channel with explicit buffer strategy.

use std::collections::VecDeque;
use std::io;
use std::os::fd::BorrowedFd;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use tracing::{debug, info, instrument, warn};
use v4l::buffer::Type;
use v4l::capability::Flags as CapFlags;
use v4l::framesize::FrameSizeEnum;
use v4l::io::traits::CaptureStream;
use v4l::prelude::MmapStream;
use v4l::video::capture::Parameters;
use v4l::video::Capture;
use v4l::{Device, FourCC};

use crate::capture::channel::{
    Acquired, Resolution, ResolutionFilter, ResolutionSelect, StreamRequest, VideoChannel,
};
use crate::capture::frame::{FrameBuffer, FrameMetadata, PixelFormat, Rotation, StreamInfo};
use crate::capture::pool::BufferPool;
use crate::error::{Error, Result};

pub fn fourcc(format: PixelFormat) -> Option<FourCC> {
    match format {
        PixelFormat::Nv12 => Some(FourCC::new(b"NV12")),
        PixelFormat::Rgb24 => Some(FourCC::new(b"RGB3")),
        PixelFormat::PlanarRgb => None,
    }
}

struct Streaming {
    stream: MmapStream<'static>,
    active: bool,
    pool: BufferPool,
    free: VecDeque<usize>,
    info: StreamInfo,
    frame_size: usize,
}

pub struct V4l2Channel {
    path: String,
    device: Device,
    state: Mutex<Option<Streaming>>,
}

impl V4l2Channel {
    /// Open a capture device node
    #[instrument]
    pub fn new(path: &str) -> Result<Self> {
        let device = Device::with_path(path)
            .map_err(|e| Error::ChannelUnavailable(format!("{path}: {e}")))?;

        let caps = device.query_caps()?;
        info!("Device: {} ({})", caps.card, caps.driver);

        if !caps.capabilities.contains(CapFlags::VIDEO_CAPTURE) {
            return Err(Error::ChannelUnavailable(format!(
                "{path} doesn't support video capture"
            )));
        }

        Ok(Self {
            path: path.to_string(),
            device,
            state: Mutex::new(None),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Option<Streaming>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn discrete_sizes(&self, format: PixelFormat) -> Result<Vec<Resolution>> {
        let Some(fourcc) = fourcc(format) else {
            return Ok(Vec::new());
        };
        let sizes = match self.device.enum_framesizes(fourcc) {
            Ok(sizes) => sizes,
            // EINVAL: format not supported by this device
            Err(e) if e.raw_os_error() == Some(libc::EINVAL) => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut set = Vec::new();
        for size in sizes {
            match size.size {
                FrameSizeEnum::Discrete(d) => set.push(Resolution::new(d.width, d.height)),
                FrameSizeEnum::Stepwise(s) => {
                    set.push(Resolution::new(s.min_width, s.min_height));
                    set.push(Resolution::new(s.max_width, s.max_height));
                }
            }
        }
        set.sort_by_key(Resolution::area);
        set.dedup();
        Ok(set)
    }
}

impl VideoChannel for V4l2Channel {
    fn name(&self) -> &str {
        &self.path
    }

    fn resolutions(&self, filter: &ResolutionFilter) -> Result<Vec<Resolution>> {
        let set = self.discrete_sizes(filter.format)?;
        let Some(native) = set.last().copied() else {
            return Ok(set);
        };
        Ok(match filter.select {
            ResolutionSelect::MinMax => vec![set[0], native],
            ResolutionSelect::All if filter.native_aspect => set
                .into_iter()
                .filter(|r| r.width as u64 * native.height as u64 == native.width as u64 * r.height as u64)
                .collect(),
            ResolutionSelect::All => set,
        })
    }

    fn rotation(&self) -> Result<Rotation> {
        // Plain V4L2 devices do not rotate
        Ok(Rotation::R0)
    }

    #[instrument(skip(self))]
    fn open(&self, request: &StreamRequest) -> Result<StreamInfo> {
        let fourcc = fourcc(request.format).ok_or_else(|| {
            Error::FormatUnsupported(format!("{} is not available over V4L2", request.format))
        })?;

        let mut fmt = self.device.format()?;
        fmt.width = request.width;
        fmt.height = request.height;
        fmt.fourcc = fourcc;
        let actual = self.device.set_format(&fmt)?;
        if actual.fourcc != fourcc {
            return Err(Error::FormatUnsupported(format!(
                "{} refused {}, offered {}",
                self.path, fourcc, actual.fourcc
            )));
        }

        let fps = request.framerate.round().max(1.0) as u32;
        if let Err(e) = self.device.set_params(&Parameters::with_fps(fps)) {
            warn!("Device {} does not accept {} fps: {}", self.path, fps, e);
        }

        let stream =
            MmapStream::with_buffers(&self.device, Type::VideoCapture, request.buffer_count)?;

        let frame_size = (actual.size as usize)
            .max(request.format.frame_size(actual.stride, actual.height));
        let pool = BufferPool::new("v4l2", request.buffer_count as usize, frame_size)?;

        let info = StreamInfo {
            width: actual.width,
            height: actual.height,
            pitch: actual.stride,
            format: request.format,
            rotation: Rotation::R0,
            framerate: fps as f64,
            buffer_count: request.buffer_count,
        };

        *self.lock() = Some(Streaming {
            stream,
            active: false,
            free: (0..pool.len()).collect(),
            pool,
            info,
            frame_size,
        });
        Ok(info)
    }

    fn start(&self) -> Result<()> {
        match self.lock().as_ref() {
            Some(_) => {
                info!(
                    "Capture stream on {} will start on the first dequeue",
                    self.path
                );
                Ok(())
            }
            None => Err(Error::ChannelUnavailable(format!("{}: not open", self.path))),
        }
    }

    fn wait_ready(&self, timeout: Duration) -> Result<bool> {
        {
            let state = self.lock();
            match state.as_ref() {
                None => return Err(Error::ChannelUnavailable(format!("{}: not open", self.path))),
                // Buffers are only queued by the first dequeue
                Some(streaming) if !streaming.active => return Ok(true),
                Some(_) => {}
            }
        }

        let handle = self.device.handle();
        // SAFETY: `handle` keeps the descriptor open for the duration of the poll.
        let fd = unsafe { BorrowedFd::borrow_raw(handle.fd()) };
        let millis = u16::try_from(timeout.as_millis()).unwrap_or(u16::MAX);
        let mut fds = [PollFd::new(fd, PollFlags::POLLIN)];
        match poll(&mut fds, PollTimeout::from(millis)) {
            Ok(0) => Ok(false),
            Ok(_) => Ok(true),
            Err(Errno::EINTR) => Ok(false),
            Err(e) => Err(Error::Channel(format!("poll on {} failed: {e}", self.path))),
        }
    }

    fn acquire(&self) -> Result<Acquired> {
        let mut guard = self.lock();
        let Some(streaming) = guard.as_mut() else {
            return Err(Error::ChannelUnavailable(format!("{}: not open", self.path)));
        };

        let (data, meta) = match CaptureStream::next(&mut streaming.stream) {
            Ok(next) => next,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(Acquired::NoData),
            Err(e) if e.raw_os_error() == Some(libc::ENODEV) => {
                return Ok(Acquired::StructuralChange(format!(
                    "{} disappeared: {e}",
                    self.path
                )))
            }
            Err(e) => return Err(e.into()),
        };
        streaming.active = true;

        let Some(slot) = streaming.free.pop_front() else {
            debug!("All pool buffers checked out, dropping frame {}", meta.sequence);
            return Ok(Acquired::NoData);
        };

        let len = data.len().min(streaming.frame_size);
        streaming.pool.slot_mut(slot)[..len].copy_from_slice(&data[..len]);

        let info = streaming.info;
        let timestamp = Duration::from_secs(meta.timestamp.sec as u64)
            + Duration::from_micros(meta.timestamp.usec as u64);

        Ok(Acquired::Frame(FrameBuffer {
            fd: streaming.pool.fd(slot),
            slot,
            offset: 0,
            capacity: streaming.frame_size,
            meta: FrameMetadata {
                sequence: meta.sequence as u64,
                width: info.width,
                height: info.height,
                pitch: info.pitch,
                format: info.format,
                rotation: info.rotation,
                timestamp,
            },
        }))
    }

    fn release(&self, buffer: FrameBuffer) -> Result<()> {
        let mut guard = self.lock();
        let Some(streaming) = guard.as_mut() else {
            return Err(Error::Channel(format!("{}: release on closed stream", self.path)));
        };
        if streaming.pool.slot_of(buffer.id()) != Some(buffer.slot)
            || streaming.free.contains(&buffer.slot)
        {
            return Err(Error::Channel(format!(
                "{}: unexpected release of {}",
                self.path,
                buffer.id()
            )));
        }
        streaming.free.push_back(buffer.slot);
        Ok(())
    }

    fn set_framerate(&self, fps: f64) -> Result<()> {
        let fps = fps.round().max(1.0) as u32;
        self.device.set_params(&Parameters::with_fps(fps))?;
        Ok(())
    }

    fn stop(&self) {
        if let Some(streaming) = self.lock().as_mut() {
            if streaming.active {
                if let Err(e) = v4l::io::traits::Stream::stop(&mut streaming.stream) {
                    warn!("Failed to stop capture stream on {}: {}", self.path, e);
                }
                streaming.active = false;
            }
        }
    }
}
