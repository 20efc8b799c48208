//! Synthetic video channel for `stub://` devices.
//!
//! Generates frames into a memfd pool at the configured rate (or as fast as
//! buffers allow when unpaced), tracks buffer ownership strictly and can
//! script a structural change, which makes it the backbone of the tests and
//! of the simulation mode of the binary.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, info};

use crate::capture::channel::{
    Acquired, Resolution, ResolutionFilter, ResolutionSelect, StreamRequest, VideoChannel,
};
use crate::capture::frame::{FrameBuffer, FrameMetadata, PixelFormat, Rotation, StreamInfo};
use crate::capture::pool::BufferPool;
use crate::error::{Error, Result};

#[derive(Debug, Clone)]
pub struct SyntheticConfig {
    pub resolutions: Vec<Resolution>,
    pub formats: Vec<PixelFormat>,
    pub rotation: Rotation,
    /// Pace frames at the stream framerate. When false, a frame is ready
    /// whenever a free buffer exists.
    pub paced: bool,
    /// Stop producing after this many frames
    pub frame_limit: Option<u64>,
    /// Report a structural change once this many frames were produced
    pub structural_change_after: Option<u64>,
}

impl Default for SyntheticConfig {
    fn default() -> Self {
        Self {
            resolutions: vec![
                Resolution::new(320, 240),
                Resolution::new(640, 480),
                Resolution::new(1280, 720),
                Resolution::new(1920, 1080),
            ],
            formats: vec![PixelFormat::Nv12, PixelFormat::Rgb24],
            rotation: Rotation::R0,
            paced: true,
            frame_limit: None,
            structural_change_after: None,
        }
    }
}

struct Stream {
    info: StreamInfo,
    pool: BufferPool,
    free: VecDeque<usize>,
    frame_size: usize,
}

struct State {
    stream: Option<Stream>,
    started_at: Option<Instant>,
    next_due: Instant,
    framerate: f64,
    produced: u64,
    starved: u64,
}

pub struct SyntheticChannel {
    name: String,
    config: SyntheticConfig,
    state: Mutex<State>,
}

impl SyntheticChannel {
    pub fn new(name: impl Into<String>, config: SyntheticConfig) -> Self {
        Self {
            name: name.into(),
            config,
            state: Mutex::new(State {
                stream: None,
                started_at: None,
                next_due: Instant::now(),
                framerate: 0.0,
                produced: 0,
                starved: 0,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Frames produced so far
    pub fn produced(&self) -> u64 {
        self.lock().produced
    }

    /// Buffers currently owned by the channel
    pub fn free_buffers(&self) -> usize {
        self.lock().stream.as_ref().map_or(0, |s| s.free.len())
    }

    /// Wake-ups that found every buffer checked out
    pub fn starved(&self) -> u64 {
        self.lock().starved
    }

    pub fn framerate(&self) -> f64 {
        self.lock().framerate
    }

    fn exhausted(&self, state: &State) -> bool {
        self.config
            .frame_limit
            .is_some_and(|limit| state.produced >= limit)
    }
}

impl VideoChannel for SyntheticChannel {
    fn name(&self) -> &str {
        &self.name
    }

    fn resolutions(&self, filter: &ResolutionFilter) -> Result<Vec<Resolution>> {
        if !self.config.formats.contains(&filter.format) {
            return Ok(Vec::new());
        }
        let mut set = self.config.resolutions.clone();
        set.sort_by_key(Resolution::area);
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
        Ok(self.config.rotation)
    }

    fn open(&self, request: &StreamRequest) -> Result<StreamInfo> {
        if !self.config.formats.contains(&request.format) {
            return Err(Error::FormatUnsupported(format!(
                "{} does not produce {}",
                self.name, request.format
            )));
        }
        if request.buffer_count == 0 {
            return Err(Error::InvalidConfig("buffer_count must be non-zero".into()));
        }

        let pitch = request.format.natural_pitch(request.width);
        let frame_size = request.format.frame_size(pitch, request.height);
        let pool = BufferPool::new(&self.name, request.buffer_count as usize, frame_size)?;

        let info = StreamInfo {
            width: request.width,
            height: request.height,
            pitch,
            format: request.format,
            rotation: request.rotation,
            framerate: request.framerate,
            buffer_count: request.buffer_count,
        };

        let mut state = self.lock();
        state.framerate = request.framerate;
        state.stream = Some(Stream {
            info,
            free: (0..pool.len()).collect(),
            pool,
            frame_size,
        });
        debug!("Synthetic stream opened: {:?}", info);
        Ok(info)
    }

    fn start(&self) -> Result<()> {
        let mut state = self.lock();
        if state.stream.is_none() {
            return Err(Error::ChannelUnavailable(format!(
                "{}: stream must be opened before start",
                self.name
            )));
        }
        let now = Instant::now();
        state.started_at = Some(now);
        state.next_due = now;
        info!("Synthetic channel {} started", self.name);
        Ok(())
    }

    fn wait_ready(&self, timeout: Duration) -> Result<bool> {
        let (ready_in, idle) = {
            let state = self.lock();
            let Some(stream) = state.stream.as_ref() else {
                return Err(Error::ChannelUnavailable(format!("{}: not open", self.name)));
            };
            let idle = state.started_at.is_none()
                || self.exhausted(&state)
                || stream.free.is_empty();
            let ready_in = if self.config.paced {
                state.next_due.saturating_duration_since(Instant::now())
            } else {
                Duration::ZERO
            };
            (ready_in, idle)
        };

        if idle {
            // Nothing can become ready without a release; nap briefly
            thread::sleep(timeout.min(Duration::from_millis(1)));
            return Ok(false);
        }
        if ready_in > timeout {
            thread::sleep(timeout);
            return Ok(false);
        }
        if !ready_in.is_zero() {
            thread::sleep(ready_in);
        }
        Ok(true)
    }

    fn acquire(&self) -> Result<Acquired> {
        let mut guard = self.lock();
        let state = &mut *guard;
        if let Some(after) = self.config.structural_change_after {
            if state.produced >= after {
                return Ok(Acquired::StructuralChange(format!(
                    "{}: rotation changed after {} frames",
                    self.name, after
                )));
            }
        }
        if self.exhausted(state) {
            return Ok(Acquired::NoData);
        }

        let elapsed = state.started_at.map(|t| t.elapsed()).unwrap_or_default();
        let framerate = state.framerate;
        let sequence = state.produced + 1;

        let Some(stream) = state.stream.as_mut() else {
            return Err(Error::ChannelUnavailable(format!("{}: not open", self.name)));
        };
        let Some(slot) = stream.free.pop_front() else {
            state.starved += 1;
            return Ok(Acquired::NoData);
        };

        // Stamp the sequence into the image so consumers can tell frames apart
        stream.pool.slot_mut(slot)[..8].copy_from_slice(&sequence.to_le_bytes());

        let info = stream.info;
        let buffer = FrameBuffer {
            fd: stream.pool.fd(slot),
            slot,
            offset: 0,
            capacity: stream.frame_size,
            meta: FrameMetadata {
                sequence,
                width: info.width,
                height: info.height,
                pitch: info.pitch,
                format: info.format,
                rotation: info.rotation,
                timestamp: elapsed,
            },
        };

        state.produced = sequence;
        if framerate > 0.0 {
            // Never bursts to catch up after a stall
            let interval = Duration::from_secs_f64(1.0 / framerate);
            state.next_due = (state.next_due + interval).max(Instant::now());
        }
        Ok(Acquired::Frame(buffer))
    }

    fn release(&self, buffer: FrameBuffer) -> Result<()> {
        let mut guard = self.lock();
        let state = &mut *guard;
        let Some(stream) = state.stream.as_mut() else {
            return Err(Error::Channel(format!("{}: release on closed stream", self.name)));
        };
        match stream.pool.slot_of(buffer.id()) {
            Some(slot) if slot == buffer.slot => {}
            _ => {
                return Err(Error::Channel(format!(
                    "{}: {} does not belong to this stream",
                    self.name,
                    buffer.id()
                )))
            }
        }
        if stream.free.contains(&buffer.slot) {
            return Err(Error::Channel(format!(
                "{}: {} released twice",
                self.name,
                buffer.id()
            )));
        }
        stream.free.push_back(buffer.slot);
        Ok(())
    }

    fn set_framerate(&self, fps: f64) -> Result<()> {
        if fps <= 0.0 {
            return Err(Error::InvalidConfig(format!("invalid framerate {fps}")));
        }
        self.lock().framerate = fps;
        debug!("Synthetic channel {} framerate set to {}", self.name, fps);
        Ok(())
    }

    fn stop(&self) {
        self.lock().started_at = None;
    }
}
