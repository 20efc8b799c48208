//! Pipeline statistics

use ringbuf::traits::{Consumer, Observer, RingBuffer};
use ringbuf::HeapRb;

/// Last N end-to-end latencies, oldest overwritten first
pub struct LatencyWindow {
    ring: HeapRb<u32>,
}

impl LatencyWindow {
    pub fn new(capacity: usize) -> Self {
        Self {
            ring: HeapRb::new(capacity.max(1)),
        }
    }

    pub fn record(&mut self, latency_ms: u32) {
        self.ring.push_overwrite(latency_ms);
        metrics::histogram!("inference_latency_ms").record(latency_ms as f64);
    }

    pub fn len(&self) -> usize {
        self.ring.occupied_len()
    }

    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }

    pub fn mean(&self) -> f64 {
        let len = self.len();
        if len == 0 {
            return 0.0;
        }
        self.ring.iter().map(|&v| v as f64).sum::<f64>() / len as f64
    }

    /// Nearest-rank percentile, `p` in `0.0..=1.0`
    pub fn percentile(&self, p: f64) -> f64 {
        let mut samples: Vec<u32> = self.ring.iter().copied().collect();
        if samples.is_empty() {
            return 0.0;
        }
        samples.sort_unstable();
        let rank = (p.clamp(0.0, 1.0) * samples.len() as f64).ceil() as usize;
        samples[rank.saturating_sub(1).min(samples.len() - 1)] as f64
    }
}

/// Counters owned by the driver thread
pub struct Telemetry {
    pub processed: u64,
    pub skipped: u64,
    pub latency: LatencyWindow,
}

impl Telemetry {
    pub fn new(window: usize) -> Self {
        Self {
            processed: 0,
            skipped: 0,
            latency: LatencyWindow::new(window),
        }
    }

    pub fn record_processed(&mut self, latency_ms: u32) {
        self.processed += 1;
        self.latency.record(latency_ms);
        metrics::counter!("frames_processed_total").increment(1);
    }

    /// Frames dropped because the accelerator asked for a retry. They do not
    /// contribute to latency.
    pub fn record_skipped(&mut self) {
        self.skipped += 1;
        metrics::counter!("frames_skipped_total").increment(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn window_keeps_latest_samples() {
        let mut window = LatencyWindow::new(4);
        for v in [100, 100, 10, 20, 30, 40] {
            window.record(v);
        }
        assert_eq!(window.len(), 4);
        assert_eq!(window.mean(), 25.0);
        assert_eq!(window.percentile(0.99), 40.0);
        assert_eq!(window.percentile(0.5), 20.0);
    }

    #[test]
    fn skipped_frames_leave_latency_untouched() {
        let mut telemetry = Telemetry::new(8);
        telemetry.record_processed(40);
        telemetry.record_skipped();
        telemetry.record_skipped();
        assert_eq!(telemetry.processed, 1);
        assert_eq!(telemetry.skipped, 2);
        assert_eq!(telemetry.latency.len(), 1);
        assert_eq!(telemetry.latency.mean(), 40.0);
    }

    #[test]
    fn empty_window_reports_zero() {
        let window = LatencyWindow::new(4);
        assert!(window.is_empty());
        assert_eq!(window.mean(), 0.0);
        assert_eq!(window.percentile(0.99), 0.0);
    }
}
