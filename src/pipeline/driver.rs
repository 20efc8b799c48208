//! Consumer loop tying the frame source, scheduler, rate controller and sink
//! together.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Instant;

use tracing::{debug, info, instrument};

use crate::capture::{FrameSource, StopHandle, VideoChannel};
use crate::error::Result;
use crate::infer::accelerator::Accelerator;
use crate::infer::scheduler::{InferenceScheduler, RunOutcome};
use crate::pipeline::detections::{decode_ssd, DetectionSink, FrameDetections};
use crate::pipeline::rate::RateController;
use crate::pipeline::telemetry::Telemetry;
use crate::utils::elapsed_ms;
use crate::{Config, PipelineConfig, PipelineStats};

/// Why [`Pipeline::run`] returned
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineExit {
    /// Shutdown was requested or the stream was stopped
    Shutdown,
    /// The channel changed structurally; open a new pipeline
    Rebuild(String),
}

pub struct Pipeline {
    source: FrameSource,
    rate: RateController,
    telemetry: Telemetry,
    settings: PipelineConfig,
}

impl Pipeline {
    /// Open a stream on `channel` sized for the model the scheduler loaded
    /// and build the scheduler's job graph for it.
    #[instrument(skip_all, fields(channel = channel.name()))]
    pub fn open<A: Accelerator>(
        channel: Arc<dyn VideoChannel>,
        config: &Config,
        scheduler: &mut InferenceScheduler<A>,
    ) -> Result<Self> {
        let capture = config.capture.for_model(&scheduler.input_spec());
        let source = FrameSource::open(channel, &capture)?;
        scheduler.build_job_graph(&source.stream_info())?;

        Ok(Self {
            rate: RateController::new(&config.rate, source.stream_info().framerate),
            source,
            telemetry: Telemetry::new(config.pipeline.latency_window),
            settings: config.pipeline.clone(),
        })
    }

    pub fn source(&self) -> &FrameSource {
        &self.source
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.source.stop_handle()
    }

    pub fn stats<A: Accelerator>(&self, scheduler: &InferenceScheduler<A>) -> PipelineStats {
        let bindings = scheduler.binding_stats();
        PipelineStats {
            frames_processed: self.telemetry.processed,
            frames_skipped: self.telemetry.skipped,
            rate_changes: self.rate.changes(),
            acquisition_fps: self.source.framerate(),
            avg_latency_ms: self.telemetry.latency.mean(),
            p99_latency_ms: self.telemetry.latency.percentile(0.99),
            binding_hits: bindings.hits,
            binding_misses: bindings.misses,
            source: self.source.stats(),
        }
    }

    /// Process frames until shutdown, a structural change or a fatal error.
    pub fn run<A: Accelerator, S: DetectionSink + ?Sized>(
        &mut self,
        scheduler: &mut InferenceScheduler<A>,
        sink: &mut S,
        shutdown: &AtomicBool,
    ) -> Result<PipelineExit> {
        self.source.start()?;
        info!("Start fetching video frames");

        loop {
            if shutdown.load(Ordering::Acquire) {
                info!("Shutdown requested");
                return Ok(PipelineExit::Shutdown);
            }

            let Some(frame) = self.source.get_frame()? else {
                return Ok(match self.source.structural_change() {
                    Some(reason) => PipelineExit::Rebuild(reason),
                    None => PipelineExit::Shutdown,
                });
            };

            let started = Instant::now();
            let outcome = match scheduler.run_inference(&frame) {
                Ok(outcome) => outcome,
                Err(e) => {
                    self.source.return_frame(frame);
                    return Err(e);
                }
            };

            if let RunOutcome::Retry { backoff } = outcome {
                self.source.return_frame(frame);
                self.telemetry.record_skipped();
                thread::sleep(backoff);
                // Whatever queued up while we waited is stale
                self.source.flush_all()?;
                continue;
            }

            let detections = decode_ssd(
                scheduler.outputs(),
                self.settings.confidence_threshold,
                &self.settings.labels,
            );
            let latency_ms = elapsed_ms(started);
            debug!(
                sequence = frame.sequence(),
                latency_ms,
                detections = detections.len(),
                "Ran inference"
            );

            let result = FrameDetections {
                sequence: frame.sequence(),
                timestamp: frame.timestamp(),
                latency_ms,
                detections,
            };
            self.source.return_frame(frame);

            sink.submit(result)?;
            self.telemetry.record_processed(latency_ms);
            self.rate.record_latency(latency_ms, &self.source)?;

            if self.settings.stats_interval > 0
                && self.telemetry.processed % self.settings.stats_interval == 0
            {
                let stats = self.stats(scheduler);
                info!(
                    processed = stats.frames_processed,
                    skipped = stats.frames_skipped,
                    dropped = stats.source.dropped,
                    fps = stats.acquisition_fps,
                    avg_ms = stats.avg_latency_ms,
                    p99_ms = stats.p99_latency_ms,
                    "Pipeline stats"
                );
            }
        }
    }

    /// Stop acquisition and hand every buffer back to the channel.
    pub fn close(mut self) {
        self.source.stop();
    }
}
