//! Frame source: a background acquisition thread feeding the consumer the
//! most recent frame from a video channel.
//!
//! The producer keeps two queues under one mutex. `delivered` holds fresh
//! frames not yet handed to the consumer, `recycled` holds frames the
//! consumer is done with. Every arrival hands one buffer back to the channel:
//! the oldest recycled one if any, otherwise the oldest delivered one once
//! more than `app_frames` are waiting.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam::utils::CachePadded;
use tracing::{debug, error, info, instrument, warn};

use crate::capture::channel::{Acquired, StreamRequest, VideoChannel};
use crate::capture::frame::{FrameBuffer, StreamInfo};
use crate::capture::negotiate::{choose_stream_resolution, NegotiationRequest};
use crate::error::{Error, Result};
use crate::CaptureConfig;

/// Why the stream ended
#[derive(Debug, Clone)]
enum Terminal {
    Stopped,
    StructuralChange(String),
    Failed(String),
}

#[derive(Default)]
struct Queues {
    delivered: VecDeque<FrameBuffer>,
    recycled: VecDeque<FrameBuffer>,
    terminal: Option<Terminal>,
}

#[derive(Default)]
struct Stats {
    acquired: AtomicU64,
    dropped: AtomicU64,
    recycled: AtomicU64,
    flushed: AtomicU64,
}

/// Snapshot of the source counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SourceStats {
    /// Buffers received from the channel
    pub acquired: u64,
    /// Delivered buffers handed back unconsumed because newer ones arrived
    pub dropped: u64,
    /// Consumed buffers handed back to the channel
    pub recycled: u64,
    /// Buffers discarded by `flush_all`
    pub flushed: u64,
}

struct Shared {
    queues: Mutex<Queues>,
    frame_ready: Condvar,
    stop: AtomicBool,
    stats: CachePadded<Stats>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Queues> {
        self.queues.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn terminate(&self, terminal: Terminal) {
        let mut queues = self.lock();
        if queues.terminal.is_none() {
            queues.terminal = Some(terminal);
        }
        drop(queues);
        self.frame_ready.notify_all();
    }

    /// Producer step for one new buffer.
    fn deliver(&self, buffer: FrameBuffer, app_frames: usize, channel: &dyn VideoChannel) {
        let mut to_release = Vec::with_capacity(2);
        {
            let mut queues = self.lock();
            queues.delivered.push_back(buffer);

            if let Some(old) = queues.recycled.pop_front() {
                self.stats.recycled.fetch_add(1, Ordering::Relaxed);
                to_release.push(old);
            }
            // Drop-oldest backpressure, so the consumer always sees the newest frame
            while queues.delivered.len() > app_frames {
                if let Some(old) = queues.delivered.pop_front() {
                    self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                    to_release.push(old);
                }
            }
        }
        self.frame_ready.notify_one();

        for old in to_release {
            if let Err(e) = channel.release(old) {
                warn!("Failed to hand buffer back to channel: {}", e);
            }
        }
    }
}

#[derive(Clone)]
pub struct StopHandle {
    shared: Arc<Shared>,
}

impl StopHandle {
    pub fn stop(&self) {
        self.shared.stop.store(true, Ordering::Release);
        self.shared.terminate(Terminal::Stopped);
    }
}

/// Producer/consumer front end of a [`VideoChannel`].
pub struct FrameSource {
    channel: Arc<dyn VideoChannel>,
    shared: Arc<Shared>,
    info: StreamInfo,
    app_frames: usize,
    poll_interval: Duration,
    pin_cpu: Option<usize>,
    framerate_bits: AtomicU64,
    worker: Option<JoinHandle<()>>,
}

impl FrameSource {
    /// Negotiate and open a stream on `channel`.
    #[instrument(skip_all, fields(channel = channel.name()))]
    pub fn open(channel: Arc<dyn VideoChannel>, config: &CaptureConfig) -> Result<Self> {
        if config.app_frames == 0 {
            return Err(Error::InvalidConfig("app_frames must be at least 1".into()));
        }
        if config.width == 0 || config.height == 0 {
            return Err(Error::InvalidConfig(format!(
                "capture size {}x{} is not resolved",
                config.width, config.height
            )));
        }
        if (config.buffer_count as usize) <= config.app_frames {
            return Err(Error::InvalidConfig(format!(
                "buffer_count ({}) must exceed app_frames ({})",
                config.buffer_count, config.app_frames
            )));
        }

        let rotation = match config.rotation {
            Some(rotation) => rotation,
            None => channel.rotation()?,
        };

        let negotiated = choose_stream_resolution(
            channel.as_ref(),
            &NegotiationRequest {
                width: config.width,
                height: config.height,
                format: config.pixel_format(),
                rotation,
                fit: config.image_fit,
            },
        )?;

        let info = channel.open(&StreamRequest {
            width: negotiated.resolution.width,
            height: negotiated.resolution.height,
            format: negotiated.format,
            framerate: config.framerate,
            buffer_count: config.buffer_count,
            rotation,
        })?;

        info!(
            width = info.width,
            height = info.height,
            pitch = info.pitch,
            format = %info.format,
            rotation = info.rotation.degrees(),
            framerate = info.framerate,
            "Opened video stream"
        );

        Ok(Self {
            channel,
            shared: Arc::new(Shared {
                queues: Mutex::new(Queues::default()),
                frame_ready: Condvar::new(),
                stop: AtomicBool::new(false),
                stats: CachePadded::new(Stats::default()),
            }),
            info,
            app_frames: config.app_frames,
            poll_interval: Duration::from_millis(config.poll_interval_ms),
            pin_cpu: config.pin_cpu,
            framerate_bits: AtomicU64::new(info.framerate.to_bits()),
            worker: None,
        })
    }

    pub fn stream_info(&self) -> StreamInfo {
        self.info
    }

    /// Handle that ends the stream from another thread, waking a consumer
    /// blocked in [`get_frame`](Self::get_frame).
    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Start the channel and spawn the acquisition thread.
    pub fn start(&mut self) -> Result<()> {
        if self.worker.is_some() {
            return Ok(());
        }
        self.channel.start()?;

        let channel = Arc::clone(&self.channel);
        let shared = Arc::clone(&self.shared);
        let app_frames = self.app_frames;
        let poll_interval = self.poll_interval;
        let pin_cpu = self.pin_cpu;

        let worker = thread::Builder::new()
            .name("frame-acquire".into())
            .spawn(move || acquisition_loop(channel, shared, app_frames, poll_interval, pin_cpu))?;
        self.worker = Some(worker);

        info!("Frame acquisition started with {} app frames", self.app_frames);
        Ok(())
    }

    /// Block until a frame is delivered and return the most recent one.
    ///
    /// `Ok(None)` means the stream is over: either the channel changed
    /// structurally and the pipeline must be rebuilt, or [`stop`](Self::stop)
    /// was called.
    pub fn get_frame(&self) -> Result<Option<FrameBuffer>> {
        let mut queues = self.shared.lock();
        loop {
            match &queues.terminal {
                Some(Terminal::Failed(reason)) => return Err(Error::Channel(reason.clone())),
                Some(Terminal::StructuralChange(reason)) => {
                    debug!("Stream invalidated: {}", reason);
                    return Ok(None);
                }
                Some(Terminal::Stopped) => return Ok(None),
                None => {}
            }
            if let Some(buffer) = queues.delivered.pop_back() {
                return Ok(Some(buffer));
            }
            queues = self
                .shared
                .frame_ready
                .wait(queues)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// True when the stream ended because the channel changed structurally.
    pub fn structural_change(&self) -> Option<String> {
        match &self.shared.lock().terminal {
            Some(Terminal::StructuralChange(reason)) => Some(reason.clone()),
            _ => None,
        }
    }

    /// Hand a consumed buffer back for recycling.
    pub fn return_frame(&self, buffer: FrameBuffer) {
        let mut queues = self.shared.lock();
        if queues.terminal.is_none() {
            queues.recycled.push_back(buffer);
            return;
        }
        drop(queues);
        // The producer is gone, nobody else will recycle it
        if let Err(e) = self.channel.release(buffer) {
            warn!("Failed to release buffer after stream end: {}", e);
        }
    }

    /// Drop every stale frame, keeping only the newest delivered one.
    pub fn flush_all(&self) -> Result<()> {
        let stale: Vec<FrameBuffer> = {
            let mut queues = self.shared.lock();
            let newest = queues.delivered.pop_back();
            let mut stale: Vec<_> = queues.delivered.drain(..).collect();
            stale.extend(queues.recycled.drain(..));
            queues.delivered.extend(newest);
            stale
        };

        let count = stale.len() as u64;
        self.shared.stats.flushed.fetch_add(count, Ordering::Relaxed);
        metrics::counter!("frames_flushed_total").increment(count);

        let mut first_error = None;
        for buffer in stale {
            if let Err(e) = self.channel.release(buffer) {
                error!("Failed to release flushed buffer: {}", e);
                first_error.get_or_insert(e);
            }
        }
        debug!(count, "Flushed stale frames");
        first_error.map_or(Ok(()), Err)
    }

    /// Request a new acquisition rate. No-op when unchanged.
    pub fn set_rate(&self, fps: f64) -> Result<()> {
        let current = f64::from_bits(self.framerate_bits.load(Ordering::Relaxed));
        if current == fps {
            return Ok(());
        }
        self.channel.set_framerate(fps)?;
        self.framerate_bits.store(fps.to_bits(), Ordering::Relaxed);
        metrics::gauge!("acquisition_fps").set(fps);
        info!("Changed stream framerate from {} to {} fps", current, fps);
        Ok(())
    }

    pub fn framerate(&self) -> f64 {
        f64::from_bits(self.framerate_bits.load(Ordering::Relaxed))
    }

    pub fn stats(&self) -> SourceStats {
        let stats = &self.shared.stats;
        SourceStats {
            acquired: stats.acquired.load(Ordering::Relaxed),
            dropped: stats.dropped.load(Ordering::Relaxed),
            recycled: stats.recycled.load(Ordering::Relaxed),
            flushed: stats.flushed.load(Ordering::Relaxed),
        }
    }

    pub fn delivered_len(&self) -> usize {
        self.shared.lock().delivered.len()
    }

    pub fn recycled_len(&self) -> usize {
        self.shared.lock().recycled.len()
    }

    /// Stop acquisition, wake a blocked consumer, join the thread and give
    /// every queued buffer back to the channel.
    pub fn stop(&mut self) {
        self.shared.stop.store(true, Ordering::Release);
        self.shared.terminate(Terminal::Stopped);
        self.channel.stop();

        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                error!("Frame acquisition thread panicked");
            }
        }

        let leftovers: Vec<FrameBuffer> = {
            let mut queues = self.shared.lock();
            let mut all: Vec<_> = queues.delivered.drain(..).collect();
            all.extend(queues.recycled.drain(..));
            all
        };
        for buffer in leftovers {
            if let Err(e) = self.channel.release(buffer) {
                warn!("Failed to release buffer on stop: {}", e);
            }
        }
    }
}

impl Drop for FrameSource {
    fn drop(&mut self) {
        self.stop();
    }
}

fn acquisition_loop(
    channel: Arc<dyn VideoChannel>,
    shared: Arc<Shared>,
    app_frames: usize,
    poll_interval: Duration,
    pin_cpu: Option<usize>,
) {
    if let Some(id) = pin_cpu {
        if !core_affinity::set_for_current(core_affinity::CoreId { id }) {
            warn!("Could not pin acquisition thread to core {}", id);
        }
    }

    while !shared.stop.load(Ordering::Acquire) {
        match channel.wait_ready(poll_interval) {
            Ok(true) => {}
            Ok(false) => continue,
            Err(e) => {
                error!("Failed waiting for channel readiness: {}", e);
                shared.terminate(Terminal::Failed(e.to_string()));
                return;
            }
        }

        match channel.acquire() {
            Ok(Acquired::Frame(buffer)) => {
                shared.stats.acquired.fetch_add(1, Ordering::Relaxed);
                metrics::counter!("frames_acquired_total").increment(1);
                shared.deliver(buffer, app_frames, channel.as_ref());
            }
            Ok(Acquired::NoData) => continue,
            Ok(Acquired::StructuralChange(reason)) => {
                info!("Channel changed structurally, likely global rotation: {}", reason);
                shared.terminate(Terminal::StructuralChange(reason));
                return;
            }
            Err(e) => {
                error!("Unexpected channel error: {}", e);
                shared.terminate(Terminal::Failed(e.to_string()));
                return;
            }
        }
    }
    debug!("Frame acquisition thread exiting");
}
