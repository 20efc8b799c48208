//! SSD-style detection decoding and delivery to consumers.

use std::time::Duration;

use tracing::{debug, info, warn};

use crate::error::Result;
use crate::infer::output::OutputTensor;

#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
    /// Normalized box corners, top-left then bottom-right
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
    pub class: u32,
    pub label: String,
    pub score: f32,
}

/// Detections for one frame
#[derive(Debug, Clone, PartialEq)]
pub struct FrameDetections {
    pub sequence: u64,
    pub timestamp: Duration,
    pub latency_ms: u32,
    pub detections: Vec<Detection>,
}

/// Decode locations, classes, scores and count outputs, keeping detections
/// at or above `threshold`.
pub fn decode_ssd(outputs: &[OutputTensor], threshold: f32, labels: &[String]) -> Vec<Detection> {
    let [locations, classes, scores, count, ..] = outputs else {
        debug!("Model has {} outputs, not an SSD head", outputs.len());
        return Vec::new();
    };
    let (Some(locations), Some(classes), Some(scores), Some(count)) = (
        locations.f32_values(),
        classes.f32_values(),
        scores.f32_values(),
        count.f32_values(),
    ) else {
        debug!("SSD outputs are not float tensors");
        return Vec::new();
    };

    let reported = count.first().copied().unwrap_or(0.0).max(0.0) as usize;
    let available = scores.len().min(classes.len()).min(locations.len() / 4);
    let n = reported.min(available);

    (0..n)
        .filter(|&i| scores[i] >= threshold)
        .map(|i| {
            let class = classes[i].max(0.0) as u32;
            let label = labels
                .get(class as usize)
                .cloned()
                .unwrap_or_else(|| format!("class {class}"));
            let bbox = &locations[i * 4..i * 4 + 4];
            Detection {
                y1: bbox[0],
                x1: bbox[1],
                y2: bbox[2],
                x2: bbox[3],
                class,
                label,
                score: scores[i],
            }
        })
        .collect()
}

/// Consumer of decoded detections
pub trait DetectionSink {
    fn submit(&mut self, frame: FrameDetections) -> Result<()>;
}

/// Logs every detection
#[derive(Debug, Default)]
pub struct LogSink;

impl DetectionSink for LogSink {
    fn submit(&mut self, frame: FrameDetections) -> Result<()> {
        for d in &frame.detections {
            info!(
                sequence = frame.sequence,
                "Object: {} ({:.2}) at [{:.3}, {:.3}, {:.3}, {:.3}]",
                d.label,
                d.score,
                d.x1,
                d.y1,
                d.x2,
                d.y2
            );
        }
        Ok(())
    }
}

/// Forwards detections over a bounded channel, dropping when the receiver
/// falls behind.
pub struct ChannelSink {
    tx: flume::Sender<FrameDetections>,
    dropped: u64,
    disconnected: bool,
}

impl ChannelSink {
    pub fn bounded(capacity: usize) -> (Self, flume::Receiver<FrameDetections>) {
        let (tx, rx) = flume::bounded(capacity.max(1));
        (
            Self {
                tx,
                dropped: 0,
                disconnected: false,
            },
            rx,
        )
    }

    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}

impl DetectionSink for ChannelSink {
    fn submit(&mut self, frame: FrameDetections) -> Result<()> {
        match self.tx.try_send(frame) {
            Ok(()) => {}
            Err(flume::TrySendError::Full(_)) => {
                self.dropped += 1;
                metrics::counter!("detections_dropped_total").increment(1);
            }
            Err(flume::TrySendError::Disconnected(_)) => {
                if !self.disconnected {
                    warn!("Detection receiver went away, discarding results");
                    self.disconnected = true;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(sequence: u64) -> FrameDetections {
        FrameDetections {
            sequence,
            timestamp: Duration::ZERO,
            latency_ms: 0,
            detections: Vec::new(),
        }
    }

    #[test]
    fn channel_sink_drops_when_full() {
        let (mut sink, rx) = ChannelSink::bounded(2);
        for seq in 1..=4 {
            sink.submit(frame(seq)).unwrap();
        }
        assert_eq!(sink.dropped(), 2);
        let received: Vec<u64> = rx.try_iter().map(|f| f.sequence).collect();
        assert_eq!(received, vec![1, 2]);
    }

    #[test]
    fn channel_sink_survives_disconnect() {
        let (mut sink, rx) = ChannelSink::bounded(1);
        drop(rx);
        assert!(sink.submit(frame(1)).is_ok());
    }

    #[test]
    fn non_ssd_outputs_decode_to_nothing() {
        assert!(decode_ssd(&[], 0.5, &[]).is_empty());
    }
}
