pub mod accelerator;
pub mod binding;
pub mod graph;
pub mod output;
pub mod retry;
pub mod scheduler;
pub mod sim;

pub use accelerator::{Accelerator, CropRegion, ModelId, TensorId, TensorInfo, TensorShape};
pub use binding::{BindingStats, TensorBindingCache};
pub use graph::{GraphState, ModelInputSpec};
pub use output::OutputTensor;
pub use retry::RetryState;
pub use scheduler::{InferenceScheduler, RunOutcome};
pub use sim::{SimAccelerator, SimConfig};
