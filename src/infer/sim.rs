//! Software accelerator.
//!
//! Runs no real network: inference sleeps for the configured latency and
//! writes scripted SSD detections into memfd-backed outputs. Power shortage
//! can be scripted for loads and runs, and every call is counted so tests
//! can assert on registration and release behavior.

use std::collections::HashMap;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::thread;
use std::time::Duration;

use memmap2::MmapMut;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::capture::frame::{PixelFormat, TensorLayout};
use crate::capture::pool::shared_region;
use crate::error::{Error, Result};
use crate::infer::accelerator::{
    Accelerator, JobRequest, ModelId, ModelSource, OutputAllocation, PreprocessParams,
    TensorDataType, TensorDescriptor, TensorId, TensorInfo, TensorShape,
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimDetection {
    pub class: u32,
    pub score: f32,
    /// Normalized `[ymin, xmin, ymax, xmax]`
    pub bbox: [f32; 4],
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimConfig {
    pub devices: Vec<String>,
    pub input_format: PixelFormat,
    pub input_width: u32,
    pub input_height: u32,
    pub latency_ms: u64,
    pub max_detections: usize,
    /// Number of model loads answered with power unavailable
    pub power_unavailable_loads: u32,
    /// Number of job runs answered with power unavailable
    pub power_unavailable_runs: u32,
    /// Output tensors reported by a preprocessing model
    pub preprocess_outputs: usize,
    pub detections: Vec<SimDetection>,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            devices: vec!["cpu-tflite".into(), "cpu-proc".into()],
            input_format: PixelFormat::Rgb24,
            input_width: 300,
            input_height: 300,
            latency_ms: 20,
            max_detections: 10,
            power_unavailable_loads: 0,
            power_unavailable_runs: 0,
            preprocess_outputs: 1,
            detections: vec![
                SimDetection {
                    class: 0,
                    score: 0.82,
                    bbox: [0.10, 0.20, 0.60, 0.45],
                },
                SimDetection {
                    class: 2,
                    score: 0.31,
                    bbox: [0.50, 0.50, 0.90, 0.95],
                },
            ],
        }
    }
}

/// Call counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SimCounters {
    pub load_attempts: u32,
    pub registrations: u64,
    pub releases: u64,
    pub jobs: u64,
    pub cropped_jobs: u64,
    pub power_failures: u64,
}

enum ModelKind {
    Inference,
    Preprocess(PreprocessParams),
}

struct SimModel {
    kind: ModelKind,
    name: String,
    outputs: Vec<TensorId>,
}

enum SimTensor {
    Input {
        fd: RawFd,
        byte_size: usize,
    },
    Output {
        map: MmapMut,
    },
}

pub struct SimAccelerator {
    config: SimConfig,
    next_id: u32,
    models: HashMap<ModelId, SimModel>,
    tensors: HashMap<TensorId, SimTensor>,
    failing_loads: u32,
    failing_runs: u32,
    counters: SimCounters,
}

impl SimAccelerator {
    pub fn connect(config: SimConfig) -> Result<Self> {
        if config.input_format == PixelFormat::Nv12 {
            return Err(Error::InvalidConfig(
                "simulated model input must be an RGB format".into(),
            ));
        }
        info!(devices = ?config.devices, "Connected to simulated accelerator");
        Ok(Self {
            failing_loads: config.power_unavailable_loads,
            failing_runs: config.power_unavailable_runs,
            config,
            next_id: 1,
            models: HashMap::new(),
            tensors: HashMap::new(),
            counters: SimCounters::default(),
        })
    }

    pub fn counters(&self) -> SimCounters {
        self.counters
    }

    /// Registered input tensors not yet released
    pub fn live_inputs(&self) -> usize {
        self.tensors
            .values()
            .filter(|t| matches!(t, SimTensor::Input { .. }))
            .count()
    }

    pub fn live_outputs(&self) -> usize {
        self.tensors
            .values()
            .filter(|t| matches!(t, SimTensor::Output { .. }))
            .count()
    }

    pub fn live_models(&self) -> usize {
        self.models.len()
    }

    /// Answer the next `n` job runs with power unavailable.
    pub fn fail_next_runs(&mut self, n: u32) {
        self.failing_runs = n;
    }

    fn next_id(&mut self) -> u32 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn model(&self, model: ModelId) -> Result<&SimModel> {
        self.models
            .get(&model)
            .ok_or_else(|| Error::Driver(format!("unknown model {}", model.0)))
    }

    fn image_info(format: PixelFormat, width: u32, height: u32, pitch: u32) -> TensorInfo {
        TensorInfo {
            shape: TensorShape::image(format.tensor_layout(), width, height, pitch),
            datatype: TensorDataType::Uint8,
        }
    }

    /// locations, classes, scores, count
    fn ssd_output_infos(&self) -> [TensorInfo; 4] {
        let n = self.config.max_detections.max(1);
        let f32_vector = |dims: [usize; 4]| {
            let total = dims.iter().product::<usize>() * 4;
            TensorInfo {
                shape: TensorShape {
                    layout: TensorLayout::Nhwc,
                    dims,
                    pitches: [total, total, dims[2] * dims[3] * 4, dims[3] * 4],
                },
                datatype: TensorDataType::Float32,
            }
        };
        [
            f32_vector([1, n, 4, 1]),
            f32_vector([1, 1, n, 1]),
            f32_vector([1, 1, n, 1]),
            f32_vector([1, 1, 1, 1]),
        ]
    }

    fn write_f32(&mut self, tensor: TensorId, values: &[f32]) {
        if let Some(SimTensor::Output { map }) = self.tensors.get_mut(&tensor) {
            for (chunk, value) in map.chunks_exact_mut(4).zip(values) {
                chunk.copy_from_slice(&value.to_ne_bytes());
            }
        }
    }

    fn write_detections(&mut self, outputs: &[TensorId]) {
        let [locations, classes, scores, count] = outputs else {
            return;
        };
        let (locations, classes, scores, count) = (*locations, *classes, *scores, *count);
        let shown: Vec<SimDetection> = self
            .config
            .detections
            .iter()
            .take(self.config.max_detections)
            .cloned()
            .collect();

        let boxes: Vec<f32> = shown.iter().flat_map(|d| d.bbox).collect();
        let class_ids: Vec<f32> = shown.iter().map(|d| d.class as f32).collect();
        let confidences: Vec<f32> = shown.iter().map(|d| d.score).collect();

        self.write_f32(locations, &boxes);
        self.write_f32(classes, &class_ids);
        self.write_f32(scores, &confidences);
        self.write_f32(count, &[shown.len() as f32]);
    }
}

impl Accelerator for SimAccelerator {
    fn list_devices(&self) -> Result<Vec<String>> {
        Ok(self.config.devices.clone())
    }

    fn load_model(&mut self, source: ModelSource<'_>, device: &str, name: &str) -> Result<ModelId> {
        self.counters.load_attempts += 1;
        if !self.config.devices.iter().any(|d| d == device) {
            return Err(Error::DeviceNotFound(device.to_string()));
        }
        if self.failing_loads > 0 {
            self.failing_loads -= 1;
            self.counters.power_failures += 1;
            return Err(Error::PowerUnavailable);
        }

        let kind = match source {
            ModelSource::File(file) => {
                if file.metadata()?.len() == 0 {
                    return Err(Error::LoadFailed(format!("{name}: model file is empty")));
                }
                ModelKind::Inference
            }
            ModelSource::Preprocessing(params) => {
                if params.output_format == PixelFormat::Nv12 {
                    return Err(Error::LoadFailed(
                        "preprocessing can only produce RGB output".into(),
                    ));
                }
                ModelKind::Preprocess(*params)
            }
        };

        let id = ModelId(self.next_id());
        debug!(model = id.0, device, name, "Simulated model loaded");
        self.models.insert(
            id,
            SimModel {
                kind,
                name: name.to_string(),
                outputs: Vec::new(),
            },
        );
        Ok(id)
    }

    fn input_info(&self, model: ModelId) -> Result<Vec<TensorInfo>> {
        let info = match &self.model(model)?.kind {
            ModelKind::Inference => {
                let format = self.config.input_format;
                Self::image_info(
                    format,
                    self.config.input_width,
                    self.config.input_height,
                    format.natural_pitch(self.config.input_width),
                )
            }
            ModelKind::Preprocess(p) => {
                Self::image_info(p.input_format, p.input_width, p.input_height, p.input_pitch)
            }
        };
        Ok(vec![info])
    }

    fn alloc_outputs(&mut self, model: ModelId) -> Result<Vec<OutputAllocation>> {
        let (infos, name) = {
            let sim = self.model(model)?;
            let infos = match &sim.kind {
                ModelKind::Inference => self.ssd_output_infos().to_vec(),
                ModelKind::Preprocess(p) => vec![
                    Self::image_info(
                        p.output_format,
                        p.output_width,
                        p.output_height,
                        p.output_pitch,
                    );
                    self.config.preprocess_outputs
                ],
            };
            (infos, sim.name.clone())
        };

        let mut allocations = Vec::with_capacity(infos.len());
        for (i, info) in infos.into_iter().enumerate() {
            let byte_size = info.shape.byte_size();
            let (file, map) = shared_region(&format!("{name}-out{i}"), byte_size)?;
            let tensor = TensorId(self.next_id());
            self.tensors.insert(tensor, SimTensor::Output { map });
            allocations.push(OutputAllocation {
                tensor,
                fd: OwnedFd::from(file),
                byte_size,
                info,
            });
        }

        if let Some(sim) = self.models.get_mut(&model) {
            sim.outputs = allocations.iter().map(|a| a.tensor).collect();
        }
        Ok(allocations)
    }

    fn register_tensor(&mut self, desc: &TensorDescriptor<'_>) -> Result<TensorId> {
        if desc.byte_size == 0 {
            return Err(Error::Driver("cannot register an empty tensor".into()));
        }
        let tensor = TensorId(self.next_id());
        self.tensors.insert(
            tensor,
            SimTensor::Input {
                fd: desc.fd.as_raw_fd(),
                byte_size: desc.byte_size,
            },
        );
        self.counters.registrations += 1;
        Ok(tensor)
    }

    fn release_tensor(&mut self, tensor: TensorId) -> Result<()> {
        match self.tensors.remove(&tensor) {
            Some(SimTensor::Input { .. }) => {
                self.counters.releases += 1;
                Ok(())
            }
            Some(SimTensor::Output { .. }) => Ok(()),
            None => Err(Error::Driver(format!("unknown tensor {}", tensor.0))),
        }
    }

    fn run_job(&mut self, job: &JobRequest<'_>) -> Result<()> {
        let model = self.model(job.model)?;
        let preprocess = match &model.kind {
            ModelKind::Preprocess(p) => Some(*p),
            ModelKind::Inference => None,
        };
        for id in job.inputs.iter().chain(job.outputs) {
            if !self.tensors.contains_key(id) {
                return Err(Error::Driver(format!("job references unknown tensor {}", id.0)));
            }
        }
        for id in job.inputs {
            if let Some(SimTensor::Input { fd, byte_size }) = self.tensors.get(id) {
                if *fd < 0 || *byte_size == 0 {
                    return Err(Error::Driver(format!("tensor {} has no backing memory", id.0)));
                }
            }
        }

        if self.failing_runs > 0 {
            self.failing_runs -= 1;
            self.counters.power_failures += 1;
            return Err(Error::PowerUnavailable);
        }
        self.counters.jobs += 1;

        match preprocess {
            Some(params) => {
                if let Some(crop) = job.crop {
                    if crop.x + crop.width > params.input_width
                        || crop.y + crop.height > params.input_height
                    {
                        return Err(Error::Driver(format!(
                            "crop {crop:?} outside {}x{} input",
                            params.input_width, params.input_height
                        )));
                    }
                    self.counters.cropped_jobs += 1;
                }
            }
            None => {
                if self.config.latency_ms > 0 {
                    thread::sleep(Duration::from_millis(self.config.latency_ms));
                }
                self.write_detections(job.outputs);
            }
        }
        Ok(())
    }

    fn unload_model(&mut self, model: ModelId) -> Result<()> {
        let sim = self
            .models
            .remove(&model)
            .ok_or_else(|| Error::Driver(format!("unknown model {}", model.0)))?;
        for tensor in sim.outputs {
            self.tensors.remove(&tensor);
        }
        debug!(model = model.0, "Simulated model unloaded");
        Ok(())
    }
}
