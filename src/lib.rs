pub mod capture;
pub mod error;
pub mod infer;
pub mod pipeline;
pub mod utils;

use std::path::{Path, PathBuf};

use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};

pub use capture::frame::{PixelFormat, Rotation};
pub use capture::negotiate::ImageFit;
pub use error::{Error, ErrorKind, Result};
pub use infer::graph::ModelInputSpec;
pub use infer::sim::SimConfig;

/// Active configuration, swapped in once loaded
pub static CONFIG: once_cell::sync::Lazy<ArcSwap<Config>> =
    once_cell::sync::Lazy::new(|| ArcSwap::from_pointee(Config::default()));

/// Environment variable prefix, e.g. `EDGEINFER__CAPTURE__APP_FRAMES=3`
pub const ENV_PREFIX: &str = "EDGEINFER";

/// System configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub capture: CaptureConfig,
    pub inference: InferenceConfig,
    pub rate: RateConfig,
    pub pipeline: PipelineConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// `stub://<name>` for the synthetic channel, `auto` to probe video
    /// nodes, or a device path
    pub device: String,
    /// Requested size; 0 follows the model input
    pub width: u32,
    pub height: u32,
    /// Requested format; `None` follows the model input
    pub format: Option<PixelFormat>,
    pub framerate: f64,
    pub buffer_count: u32,
    /// Frames the consumer may hold at once
    pub app_frames: usize,
    pub image_fit: ImageFit,
    /// Forced rotation; `None` uses the channel's current rotation
    pub rotation: Option<Rotation>,
    pub poll_interval_ms: u64,
    /// Pin the acquisition thread to this core
    pub pin_cpu: Option<usize>,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            device: "stub://camera".into(),
            width: 0,
            height: 0,
            format: None,
            framerate: 30.0,
            buffer_count: 4,
            app_frames: 2,
            image_fit: ImageFit::Scale,
            rotation: None,
            poll_interval_ms: 100,
            pin_cpu: None,
        }
    }
}

impl CaptureConfig {
    /// Fill unset size and format from the model input.
    pub fn for_model(&self, input: &ModelInputSpec) -> CaptureConfig {
        let mut resolved = self.clone();
        if resolved.width == 0 || resolved.height == 0 {
            resolved.width = input.width;
            resolved.height = input.height;
        }
        resolved.format.get_or_insert(input.format);
        resolved
    }

    /// Requested format, defaulting to YUV when nothing was resolved.
    pub fn pixel_format(&self) -> PixelFormat {
        self.format.unwrap_or(PixelFormat::Nv12)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InferenceConfig {
    /// Accelerator device running the model
    pub device: String,
    pub model_path: PathBuf,
    /// Accelerator device running image preprocessing
    pub preprocess_device: String,
    /// Attempts before power shortage becomes fatal
    pub max_power_attempts: u32,
    /// Attempt n waits n times this long
    pub power_backoff_ms: u64,
    pub sim: SimConfig,
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            device: "cpu-tflite".into(),
            model_path: PathBuf::from("model/model.tflite"),
            preprocess_device: "cpu-proc".into(),
            max_power_attempts: 50,
            power_backoff_ms: 250,
            sim: SimConfig::default(),
        }
    }
}

/// One bucket of the latency to framerate table
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RateStep {
    /// Upper bound (exclusive) of the mean latency for this bucket
    pub below_ms: u32,
    pub fps: f64,
    /// Frame time associated with `fps`
    pub frametime_ms: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateConfig {
    /// Observations per mean
    pub window: u32,
    /// Buckets in ascending `below_ms` order
    pub steps: Vec<RateStep>,
    /// Rate used when the mean exceeds every bucket
    pub slowest_fps: f64,
    pub slowest_frametime_ms: u32,
}

impl Default for RateConfig {
    fn default() -> Self {
        let step = |below_ms, fps, frametime_ms| RateStep {
            below_ms,
            fps,
            frametime_ms,
        };
        Self {
            window: 10,
            steps: vec![
                step(34, 30.0, 34),
                step(41, 25.0, 41),
                step(51, 20.0, 51),
                step(67, 15.0, 67),
                step(101, 10.0, 101),
                step(201, 5.0, 201),
            ],
            slowest_fps: 1.0,
            slowest_frametime_ms: 1001,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Minimum score for a detection to be reported
    pub confidence_threshold: f32,
    /// Class names indexed by class id
    pub labels: Vec<String>,
    /// Detections queued for the consumer before dropping
    pub sink_capacity: usize,
    /// Frames between two stats reports
    pub stats_interval: u64,
    /// Latency samples kept for percentiles
    pub latency_window: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            confidence_threshold: 0.4,
            labels: vec!["person".into(), "bicycle".into(), "car".into()],
            sink_capacity: 8,
            stats_interval: 100,
            latency_window: 256,
        }
    }
}

impl Config {
    /// Defaults, overlaid by an optional TOML file, overlaid by
    /// `EDGEINFER__SECTION__KEY` environment variables.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).format(config::FileFormat::Toml));
        }
        let config: Config = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let capture = &self.capture;
        if capture.app_frames == 0 {
            return Err(Error::InvalidConfig("capture.app_frames must be at least 1".into()));
        }
        if capture.buffer_count as usize <= capture.app_frames {
            return Err(Error::InvalidConfig(format!(
                "capture.buffer_count ({}) must exceed capture.app_frames ({})",
                capture.buffer_count, capture.app_frames
            )));
        }
        if capture.framerate <= 0.0 {
            return Err(Error::InvalidConfig("capture.framerate must be positive".into()));
        }
        if self.rate.window == 0 {
            return Err(Error::InvalidConfig("rate.window must be at least 1".into()));
        }
        if self
            .rate
            .steps
            .windows(2)
            .any(|pair| pair[0].below_ms >= pair[1].below_ms)
        {
            return Err(Error::InvalidConfig(
                "rate.steps must be sorted by ascending below_ms".into(),
            ));
        }
        if self.inference.max_power_attempts == 0 {
            return Err(Error::InvalidConfig(
                "inference.max_power_attempts must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

/// Latency, drop and retry figures for the running pipeline
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PipelineStats {
    pub frames_processed: u64,
    pub frames_skipped: u64,
    pub rate_changes: u64,
    pub acquisition_fps: f64,
    pub avg_latency_ms: f64,
    pub p99_latency_ms: f64,
    pub binding_hits: u64,
    pub binding_misses: u64,
    pub source: capture::SourceStats,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_are_valid() {
        Config::default().validate().unwrap();
    }

    #[test]
    fn toml_file_overrides_defaults() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
[capture]
device = "stub://front"
app_frames = 3
buffer_count = 6
image_fit = "crop"
rotation = 90

[rate]
window = 5
"#
        )
        .unwrap();

        let config = Config::load(Some(file.path())).unwrap();
        assert_eq!(config.capture.device, "stub://front");
        assert_eq!(config.capture.app_frames, 3);
        assert_eq!(config.capture.image_fit, ImageFit::Crop);
        assert_eq!(config.capture.rotation, Some(Rotation::R90));
        assert_eq!(config.rate.window, 5);
        assert_eq!(config.rate.steps.len(), 6);
        assert_eq!(config.inference.max_power_attempts, 50);
    }

    #[test]
    fn environment_overrides_defaults() {
        std::env::set_var("EDGEINFER__PIPELINE__CONFIDENCE_THRESHOLD", "0.75");
        let config = Config::load(None);
        std::env::remove_var("EDGEINFER__PIPELINE__CONFIDENCE_THRESHOLD");

        let config = config.unwrap();
        assert_eq!(config.pipeline.confidence_threshold, 0.75);
        assert_eq!(config.capture.device, "stub://camera");
    }

    #[test]
    fn inconsistent_buffer_counts_are_rejected() {
        let mut config = Config::default();
        config.capture.buffer_count = 2;
        assert!(matches!(config.validate(), Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn model_fills_unset_capture_fields() {
        let input = ModelInputSpec {
            format: PixelFormat::Rgb24,
            width: 300,
            height: 300,
            pitch: 900,
        };
        let resolved = CaptureConfig::default().for_model(&input);
        assert_eq!((resolved.width, resolved.height), (300, 300));
        assert_eq!(resolved.format, Some(PixelFormat::Rgb24));

        let explicit = CaptureConfig {
            width: 640,
            height: 480,
            format: Some(PixelFormat::Nv12),
            ..CaptureConfig::default()
        }
        .for_model(&input);
        assert_eq!((explicit.width, explicit.height), (640, 480));
        assert_eq!(explicit.format, Some(PixelFormat::Nv12));
    }
}
