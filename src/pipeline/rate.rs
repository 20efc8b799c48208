//! Adaptive acquisition rate.
//!
//! Latencies are averaged over fixed windows; each mean is mapped through the
//! step table to a framerate, capped at the configured maximum. A new rate is
//! applied only when it differs from the current one, followed by a flush so
//! the consumer does not work through frames captured at the old rate.

use tracing::{debug, info};

use crate::capture::FrameSource;
use crate::error::Result;
use crate::{RateConfig, RateStep};

/// Where rate decisions are applied
pub trait RateTarget {
    fn set_rate(&self, fps: f64) -> Result<()>;
    fn flush_all(&self) -> Result<()>;
}

impl RateTarget for FrameSource {
    fn set_rate(&self, fps: f64) -> Result<()> {
        FrameSource::set_rate(self, fps)
    }

    fn flush_all(&self) -> Result<()> {
        FrameSource::flush_all(self)
    }
}

#[derive(Debug, Clone)]
pub struct RateController {
    steps: Vec<RateStep>,
    slowest: RateStep,
    window: u32,
    max_fps: f64,
    count: u32,
    total_ms: u64,
    frametime_ms: u32,
    applied_fps: f64,
    last_mean_ms: Option<u32>,
    changes: u64,
}

impl RateController {
    /// Controller starting at `max_fps`, which it never exceeds.
    pub fn new(config: &RateConfig, max_fps: f64) -> Self {
        let slowest = RateStep {
            below_ms: u32::MAX,
            fps: config.slowest_fps,
            frametime_ms: config.slowest_frametime_ms,
        };
        Self {
            steps: config.steps.clone(),
            slowest,
            window: config.window.max(1),
            max_fps,
            count: 0,
            total_ms: 0,
            frametime_ms: (1000.0 / max_fps) as u32,
            applied_fps: max_fps,
            last_mean_ms: None,
            changes: 0,
        }
    }

    pub fn applied_fps(&self) -> f64 {
        self.applied_fps
    }

    pub fn frametime_ms(&self) -> u32 {
        self.frametime_ms
    }

    pub fn last_mean_ms(&self) -> Option<u32> {
        self.last_mean_ms
    }

    /// Number of rate changes applied so far
    pub fn changes(&self) -> u64 {
        self.changes
    }

    /// Bucket for a mean latency
    pub fn step_for(&self, mean_ms: u32) -> RateStep {
        self.steps
            .iter()
            .copied()
            .find(|step| mean_ms < step.below_ms)
            .unwrap_or(self.slowest)
    }

    /// Record the latency of one processed frame. Returns the new rate when a
    /// window completes and the rate changes.
    pub fn record_latency<T: RateTarget + ?Sized>(
        &mut self,
        latency_ms: u32,
        target: &T,
    ) -> Result<Option<f64>> {
        self.count += 1;
        self.total_ms += latency_ms as u64;
        if self.count < self.window {
            return Ok(None);
        }

        let mean = (self.total_ms / self.count as u64) as u32;
        self.count = 0;
        self.total_ms = 0;
        self.last_mean_ms = Some(mean);

        // Never re-evaluate downward from the last table bucket
        let floor = self.steps.last().map_or(0, |s| s.frametime_ms);
        let faster_than_mean = self.frametime_ms < mean && self.frametime_ms < floor;
        let slower_than_mean = self.frametime_ms > mean;
        if !(faster_than_mean || slower_than_mean) {
            debug!(mean, frametime = self.frametime_ms, "Rate unchanged");
            return Ok(None);
        }

        let step = self.step_for(mean);
        self.frametime_ms = step.frametime_ms;
        let fps = step.fps.min(self.max_fps);
        if fps == self.applied_fps {
            return Ok(None);
        }

        info!(
            mean_latency_ms = mean,
            "Changing framerate from {} to {} fps", self.applied_fps, fps
        );
        target.set_rate(fps)?;
        target.flush_all()?;
        self.applied_fps = fps;
        self.changes += 1;
        metrics::counter!("rate_changes_total").increment(1);
        Ok(Some(fps))
    }
}
