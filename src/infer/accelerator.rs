//! Contract between the scheduler and an inference accelerator service

use std::fs::File;
use std::os::fd::{BorrowedFd, OwnedFd};

use crate::capture::frame::{PixelFormat, TensorLayout};
use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ModelId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TensorId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TensorDataType {
    Uint8,
    Int8,
    Int32,
    Float16,
    Float32,
}

impl TensorDataType {
    pub fn size(self) -> usize {
        match self {
            TensorDataType::Uint8 | TensorDataType::Int8 => 1,
            TensorDataType::Float16 => 2,
            TensorDataType::Int32 | TensorDataType::Float32 => 4,
        }
    }
}

/// Dims and pitches of a 4-dimensional tensor.
///
/// `pitches[i]` is the byte size of the sub-tensor spanned by `dims[i..]`,
/// so `pitches[0]` is the total byte size and the row pitch sits at index 2
/// for NHWC and index 3 for NCHW.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TensorShape {
    pub layout: TensorLayout,
    pub dims: [usize; 4],
    pub pitches: [usize; 4],
}

impl TensorShape {
    /// Shape of a single 3-channel image with the given row pitch.
    pub fn image(layout: TensorLayout, width: u32, height: u32, pitch: u32) -> Self {
        let (w, h, row) = (width as usize, height as usize, pitch as usize);
        match layout {
            TensorLayout::Nhwc => Self {
                layout,
                dims: [1, h, w, 3],
                pitches: [h * row, h * row, row, 3],
            },
            TensorLayout::Nchw => Self {
                layout,
                dims: [1, 3, h, w],
                pitches: [3 * h * row, 3 * h * row, h * row, row],
            },
            TensorLayout::Yuv420Sp => Self {
                layout,
                dims: [1, 3, h, w],
                pitches: [h * row * 3 / 2, h * row * 3 / 2, h * row, row],
            },
        }
    }

    pub fn byte_size(&self) -> usize {
        self.pitches[0]
    }
}

/// Description of one model tensor as reported by the accelerator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TensorInfo {
    pub shape: TensorShape,
    pub datatype: TensorDataType,
}

/// Parameters of an image preprocessing model (scale and convert)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PreprocessParams {
    pub input_format: PixelFormat,
    pub input_width: u32,
    pub input_height: u32,
    pub input_pitch: u32,
    pub output_format: PixelFormat,
    pub output_width: u32,
    pub output_height: u32,
    pub output_pitch: u32,
}

/// What to load
#[derive(Debug, Clone, Copy)]
pub enum ModelSource<'a> {
    /// A compiled model file
    File(&'a File),
    /// A parameterized preprocessing pipeline; no file involved
    Preprocessing(&'a PreprocessParams),
}

/// Region of the input image to use, in input pixels
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CropRegion {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

/// An output tensor allocated by the accelerator, exported as a mappable fd
#[derive(Debug)]
pub struct OutputAllocation {
    pub tensor: TensorId,
    pub fd: OwnedFd,
    pub byte_size: usize,
    pub info: TensorInfo,
}

/// An externally owned memory region to register as an input tensor
#[derive(Debug, Clone, Copy)]
pub struct TensorDescriptor<'a> {
    pub fd: BorrowedFd<'a>,
    pub offset: u64,
    pub byte_size: usize,
    pub datatype: TensorDataType,
    pub shape: TensorShape,
}

/// One job execution
#[derive(Debug, Clone, Copy)]
pub struct JobRequest<'a> {
    pub model: ModelId,
    pub inputs: &'a [TensorId],
    pub outputs: &'a [TensorId],
    pub crop: Option<CropRegion>,
}

/// A connected accelerator session.
///
/// `load_model` and `run_job` report temporary power shortage as
/// [`Error::PowerUnavailable`](crate::Error::PowerUnavailable); every other
/// error is fatal to the caller.
pub trait Accelerator: Send {
    fn list_devices(&self) -> Result<Vec<String>>;

    fn load_model(&mut self, source: ModelSource<'_>, device: &str, name: &str) -> Result<ModelId>;

    fn input_info(&self, model: ModelId) -> Result<Vec<TensorInfo>>;

    /// Allocate mappable output tensors for `model`.
    fn alloc_outputs(&mut self, model: ModelId) -> Result<Vec<OutputAllocation>>;

    /// Track an externally owned memory region as an input tensor. The
    /// descriptor must stay open until the tensor is released.
    fn register_tensor(&mut self, desc: &TensorDescriptor<'_>) -> Result<TensorId>;

    fn release_tensor(&mut self, tensor: TensorId) -> Result<()>;

    fn run_job(&mut self, job: &JobRequest<'_>) -> Result<()>;

    fn unload_model(&mut self, model: ModelId) -> Result<()>;
}
