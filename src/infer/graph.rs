//! Job graph planning: whether a preprocessing stage is needed and which
//! region of the stream it should read.

use crate::capture::frame::{PixelFormat, StreamInfo, TensorLayout};
use crate::capture::negotiate::ImageFit;
use crate::error::{Error, Result};
use crate::infer::accelerator::{CropRegion, PreprocessParams, TensorInfo};

/// Image the model expects on its single input
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModelInputSpec {
    pub format: PixelFormat,
    pub width: u32,
    pub height: u32,
    pub pitch: u32,
}

impl ModelInputSpec {
    pub fn from_tensor(info: &TensorInfo) -> Result<Self> {
        let shape = &info.shape;
        let (format, width, height, pitch) = match shape.layout {
            TensorLayout::Nhwc => (
                PixelFormat::Rgb24,
                shape.dims[2],
                shape.dims[1],
                shape.pitches[2],
            ),
            TensorLayout::Nchw => (
                PixelFormat::PlanarRgb,
                shape.dims[3],
                shape.dims[2],
                shape.pitches[3],
            ),
            TensorLayout::Yuv420Sp => {
                return Err(Error::LoadFailed(
                    "model input layout must be NHWC or NCHW".into(),
                ))
            }
        };
        let narrow = |v: usize| {
            u32::try_from(v)
                .map_err(|_| Error::LoadFailed(format!("model input dimension {v} out of range")))
        };
        Ok(Self {
            format,
            width: narrow(width)?,
            height: narrow(height)?,
            pitch: narrow(pitch)?,
        })
    }
}

/// Lifecycle of the job graph owned by the scheduler
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GraphState {
    Unbuilt,
    Built,
    Running,
    Succeeded,
    RetryableFailure,
    FatalFailure,
}

/// Outcome of planning a graph for one stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GraphPlan {
    /// Parameters of the preprocessing stage, if the stream does not match
    /// the model input
    pub preprocess: Option<PreprocessParams>,
    pub crop: Option<CropRegion>,
}

impl GraphPlan {
    pub fn needs_preprocessing(&self) -> bool {
        self.preprocess.is_some()
    }
}

pub fn plan(stream: &StreamInfo, model: &ModelInputSpec, fit: ImageFit) -> GraphPlan {
    let matches = stream.format == model.format
        && stream.width == model.width
        && stream.height == model.height;
    if matches {
        return GraphPlan {
            preprocess: None,
            crop: None,
        };
    }

    let crop = match fit {
        ImageFit::Crop => center_crop(stream.width, stream.height, model.width, model.height),
        ImageFit::Scale => None,
    };

    GraphPlan {
        preprocess: Some(PreprocessParams {
            input_format: stream.format,
            input_width: stream.width,
            input_height: stream.height,
            input_pitch: stream.pitch,
            output_format: model.format,
            output_width: model.width,
            output_height: model.height,
            output_pitch: model.pitch,
        }),
        crop,
    }
}

/// Largest centered region of the stream with the model's aspect ratio.
/// `None` when that region is the whole frame.
pub fn center_crop(
    stream_width: u32,
    stream_height: u32,
    model_width: u32,
    model_height: u32,
) -> Option<CropRegion> {
    if model_width == 0 || model_height == 0 {
        return None;
    }
    let ratio = model_width as f64 / model_height as f64;

    let mut width = stream_width;
    let mut height = (width as f64 / ratio) as u32;
    if height > stream_height {
        height = stream_height;
        width = (height as f64 * ratio) as u32;
    }

    if width == stream_width && height == stream_height {
        return None;
    }
    Some(CropRegion {
        x: (stream_width - width) / 2,
        y: (stream_height - height) / 2,
        width,
        height,
    })
}
