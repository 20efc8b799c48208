//! Inference scheduler: model lifecycle, job graph and per-frame execution.

use std::fs::File;
use std::thread;
use std::time::Duration;

use tracing::{debug, error, info, instrument, warn};

use crate::capture::frame::{FrameBuffer, StreamInfo};
use crate::capture::negotiate::ImageFit;
use crate::error::{Error, Result};
use crate::infer::accelerator::{
    Accelerator, CropRegion, JobRequest, ModelId, ModelSource, OutputAllocation, TensorId,
    TensorShape,
};
use crate::infer::binding::{BindingStats, TensorBindingCache};
use crate::infer::graph::{self, GraphPlan, GraphState, ModelInputSpec};
use crate::infer::output::OutputTensor;
use crate::infer::retry::RetryState;
use crate::InferenceConfig;

/// Result of one [`InferenceScheduler::run_inference`] call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// Outputs hold the results for the frame
    Completed,
    /// The accelerator lacked power; skip this frame and wait `backoff`
    Retry { backoff: Duration },
}

struct PreprocessStage {
    model: ModelId,
    output: OutputAllocation,
    crop: Option<CropRegion>,
}

struct JobGraph {
    stream: StreamInfo,
    plan: GraphPlan,
    input_shape: TensorShape,
    preprocess: Option<PreprocessStage>,
}

pub struct InferenceScheduler<A: Accelerator> {
    accel: A,
    model: ModelId,
    input: ModelInputSpec,
    outputs: Vec<OutputTensor>,
    output_ids: Vec<TensorId>,
    graph: Option<JobGraph>,
    bindings: TensorBindingCache,
    retry: RetryState,
    state: GraphState,
    fit: ImageFit,
    preprocess_device: String,
    shut_down: bool,
    _model_file: File,
}

impl<A: Accelerator> InferenceScheduler<A> {
    /// Load the model on `config.device`, retrying while the accelerator
    /// reports power shortage.
    #[instrument(skip_all, fields(device = %config.device, model = %config.model_path.display()))]
    pub fn new(mut accel: A, config: &InferenceConfig, fit: ImageFit) -> Result<Self> {
        let devices = accel.list_devices()?;
        if !devices.iter().any(|d| d == &config.device) {
            warn!("Available devices: {:?}", devices);
            return Err(Error::DeviceNotFound(config.device.clone()));
        }

        let model_file = File::open(&config.model_path).map_err(|e| {
            Error::LoadFailed(format!("could not open {}: {e}", config.model_path.display()))
        })?;

        let backoff = Duration::from_millis(config.power_backoff_ms);
        let name = config
            .model_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "model".into());

        info!("Loading the model... This might take up to 5 minutes depending on the device");
        let model = load_with_retry(
            &mut accel,
            ModelSource::File(&model_file),
            &config.device,
            &name,
            RetryState::new(config.max_power_attempts, backoff),
        )?;

        let inputs = accel.input_info(model)?;
        let [input] = inputs.as_slice() else {
            return Err(Error::LoadFailed(format!(
                "model has {} inputs, exactly one is supported",
                inputs.len()
            )));
        };
        let input = ModelInputSpec::from_tensor(input)?;

        let outputs = accel
            .alloc_outputs(model)?
            .into_iter()
            .map(OutputTensor::map)
            .collect::<Result<Vec<_>>>()?;
        let output_ids = outputs.iter().map(|o| o.tensor).collect();

        info!(
            width = input.width,
            height = input.height,
            pitch = input.pitch,
            format = %input.format,
            outputs = outputs.len(),
            "Model loaded"
        );

        Ok(Self {
            accel,
            model,
            input,
            outputs,
            output_ids,
            graph: None,
            bindings: TensorBindingCache::new(1),
            retry: RetryState::new(config.max_power_attempts, backoff),
            state: GraphState::Unbuilt,
            fit,
            preprocess_device: config.preprocess_device.clone(),
            shut_down: false,
            _model_file: model_file,
        })
    }

    pub fn input_spec(&self) -> ModelInputSpec {
        self.input
    }

    pub fn state(&self) -> GraphState {
        self.state
    }

    pub fn plan(&self) -> Option<GraphPlan> {
        self.graph.as_ref().map(|g| g.plan)
    }

    pub fn has_preprocessing(&self) -> bool {
        self.graph
            .as_ref()
            .is_some_and(|g| g.preprocess.is_some())
    }

    pub fn binding_stats(&self) -> BindingStats {
        self.bindings.stats()
    }

    pub fn accelerator(&self) -> &A {
        &self.accel
    }

    pub fn accelerator_mut(&mut self) -> &mut A {
        &mut self.accel
    }

    pub fn outputs(&self) -> &[OutputTensor] {
        &self.outputs
    }

    /// Build the job graph for `stream`. A graph for an equivalent stream is
    /// kept as is; anything else is torn down first.
    ///
    /// Every call starts a new stream session: input bindings from the
    /// previous session are released even when the graph is reused, since
    /// the new channel's buffers can reuse the old descriptor numbers.
    #[instrument(skip_all, fields(width = stream.width, height = stream.height, format = %stream.format))]
    pub fn build_job_graph(&mut self, stream: &StreamInfo) -> Result<()> {
        if let Some(current) = &self.graph {
            if !current.stream.requires_rebuild(stream) {
                let released = self.bindings.clear(&mut self.accel);
                debug!(released, "Job graph already matches the stream");
                self.bindings = TensorBindingCache::new(stream.buffer_count as usize);
                self.retry.reset();
                self.state = GraphState::Built;
                return Ok(());
            }
            info!("Stream changed, rebuilding job graph");
            self.teardown_graph();
        }

        let plan = graph::plan(stream, &self.input, self.fit);
        let preprocess = match &plan.preprocess {
            Some(params) => {
                let model = self.accel.load_model(
                    ModelSource::Preprocessing(params),
                    &self.preprocess_device,
                    "preprocessing",
                )?;
                let output = match self.preprocess_output(model) {
                    Ok(output) => output,
                    Err(e) => {
                        if let Err(unload) = self.accel.unload_model(model) {
                            warn!("Failed to unload preprocessing model: {}", unload);
                        }
                        return Err(e);
                    }
                };
                info!(
                    from = %params.input_format,
                    to = %params.output_format,
                    crop = ?plan.crop,
                    "Preprocessing {}x{} -> {}x{}",
                    params.input_width,
                    params.input_height,
                    params.output_width,
                    params.output_height
                );
                Some(PreprocessStage {
                    model,
                    output,
                    crop: plan.crop,
                })
            }
            None => {
                if stream.pitch != self.input.pitch {
                    return Err(Error::FormatUnsupported(format!(
                        "stream pitch {} differs from model pitch {} and no preprocessing is planned",
                        stream.pitch, self.input.pitch
                    )));
                }
                info!("Stream matches the model input, no preprocessing needed");
                None
            }
        };

        self.bindings = TensorBindingCache::new(stream.buffer_count as usize);
        self.graph = Some(JobGraph {
            stream: *stream,
            plan,
            input_shape: TensorShape::image(
                stream.format.tensor_layout(),
                stream.width,
                stream.height,
                stream.pitch,
            ),
            preprocess,
        });
        self.retry.reset();
        self.state = GraphState::Built;
        Ok(())
    }

    fn preprocess_output(&mut self, model: ModelId) -> Result<OutputAllocation> {
        let mut outputs = self.accel.alloc_outputs(model)?;
        if outputs.len() != 1 {
            let count = outputs.len();
            for output in outputs {
                self.release_output(output);
            }
            return Err(Error::LoadFailed(format!(
                "preprocessing model has {count} outputs, expected one"
            )));
        }
        let output = outputs.remove(0);
        let expected = 3 * self.input.width as usize * self.input.height as usize;
        if output.byte_size != expected {
            let byte_size = output.byte_size;
            self.release_output(output);
            return Err(Error::LoadFailed(format!(
                "preprocessing output is {} bytes, expected {}",
                byte_size, expected
            )));
        }
        Ok(output)
    }

    fn release_output(&mut self, output: OutputAllocation) {
        if let Err(e) = self.accel.release_tensor(output.tensor) {
            warn!("Failed to release preprocessing output: {}", e);
        }
    }

    /// Run the job graph on `frame`.
    ///
    /// Power shortage is not an error until it persists for the configured
    /// number of consecutive attempts; until then the caller gets
    /// [`RunOutcome::Retry`] and should drop the frame.
    pub fn run_inference(&mut self, frame: &FrameBuffer) -> Result<RunOutcome> {
        let Some(graph) = self.graph.as_ref() else {
            return Err(Error::GraphNotBuilt);
        };
        let meta = &frame.meta;
        if meta.width != graph.stream.width
            || meta.height != graph.stream.height
            || meta.format != graph.stream.format
        {
            return Err(Error::StructuralChange(format!(
                "frame {}x{} {} does not match the job graph",
                meta.width, meta.height, meta.format
            )));
        }

        self.state = GraphState::Running;
        let result = self
            .bindings
            .bind(frame, &mut self.accel, &graph.input_shape)
            .and_then(|bound| {
                run_graph(&mut self.accel, graph, self.model, bound.tensor, &self.output_ids)
            });

        match result {
            Ok(()) => {
                self.retry.reset();
                for output in &mut self.outputs {
                    output.timestamp = frame.timestamp();
                    output.sequence = frame.sequence();
                }
                self.state = GraphState::Succeeded;
                Ok(RunOutcome::Completed)
            }
            Err(Error::PowerUnavailable) => match self.retry.record_failure() {
                Ok(backoff) => {
                    self.state = GraphState::RetryableFailure;
                    metrics::counter!("inference_power_retries_total").increment(1);
                    info!(
                        attempt = self.retry.count(),
                        max = self.retry.max_attempts(),
                        "Power not available, retrying in {:?}",
                        backoff
                    );
                    Ok(RunOutcome::Retry { backoff })
                }
                Err(e) => {
                    self.state = GraphState::FatalFailure;
                    error!("Giving up on inference: {}", e);
                    Err(e)
                }
            },
            Err(e) => {
                self.state = GraphState::FatalFailure;
                error!("Inference failed: {}", e);
                Err(e)
            }
        }
    }

    fn teardown_graph(&mut self) {
        let released = self.bindings.clear(&mut self.accel);
        debug!(released, "Released input bindings");

        if let Some(graph) = self.graph.take() {
            if let Some(stage) = graph.preprocess {
                self.release_output(stage.output);
                if let Err(e) = self.accel.unload_model(stage.model) {
                    warn!("Failed to unload preprocessing model: {}", e);
                }
            }
        }
        self.state = GraphState::Unbuilt;
    }

    /// Release every binding, graph tensor and model.
    pub fn shutdown(&mut self) {
        if self.shut_down {
            return;
        }
        self.shut_down = true;
        self.teardown_graph();

        for id in &self.output_ids {
            if let Err(e) = self.accel.release_tensor(*id) {
                warn!("Failed to release output tensor {}: {}", id.0, e);
            }
        }
        if let Err(e) = self.accel.unload_model(self.model) {
            warn!("Failed to unload model: {}", e);
        }
        info!("Inference scheduler shut down");
    }
}

impl<A: Accelerator> Drop for InferenceScheduler<A> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_graph<A: Accelerator>(
    accel: &mut A,
    graph: &JobGraph,
    model: ModelId,
    input: TensorId,
    outputs: &[TensorId],
) -> Result<()> {
    match &graph.preprocess {
        Some(stage) => {
            let scaled = [stage.output.tensor];
            accel.run_job(&JobRequest {
                model: stage.model,
                inputs: &[input],
                outputs: &scaled,
                crop: stage.crop,
            })?;
            accel.run_job(&JobRequest {
                model,
                inputs: &scaled,
                outputs,
                crop: None,
            })
        }
        None => accel.run_job(&JobRequest {
            model,
            inputs: &[input],
            outputs,
            crop: None,
        }),
    }
}

/// Load a model, sleeping `n * step` after the n-th power shortage.
pub fn load_with_retry<A: Accelerator + ?Sized>(
    accel: &mut A,
    source: ModelSource<'_>,
    device: &str,
    name: &str,
    mut retry: RetryState,
) -> Result<ModelId> {
    loop {
        match accel.load_model(source, device, name) {
            Ok(model) => return Ok(model),
            Err(Error::PowerUnavailable) => {
                let backoff = retry.record_failure()?;
                info!(
                    attempt = retry.count(),
                    max = retry.max_attempts(),
                    "Power not available for model load, retrying in {:?}",
                    backoff
                );
                thread::sleep(backoff);
            }
            Err(e) => return Err(e),
        }
    }
}
