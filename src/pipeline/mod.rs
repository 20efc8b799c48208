pub mod detections;
pub mod driver;
pub mod rate;
pub mod telemetry;

pub use detections::{ChannelSink, Detection, DetectionSink, FrameDetections, LogSink};
pub use driver::{Pipeline, PipelineExit};
pub use rate::{RateController, RateTarget};
