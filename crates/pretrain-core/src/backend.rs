//! Backend aliases for the Burn framework.
//!
//! Model code is generic over `Backend` / `AutodiffBackend`; these aliases pick
//! the CPU `NdArray` backend for tools and tests.

use burn::backend::{Autodiff, NdArray};
use burn::tensor::backend::Backend;

/// Backend used for inference
pub type InferenceBackend = NdArray<f32>;

/// The default autodiff backend for training
pub type TrainingBackend = Autodiff<InferenceBackend>;

/// Get the default device of the inference backend
pub fn default_device() -> <InferenceBackend as Backend>::Device {
    Default::default()
}

/// Get a human-readable name for the current backend
pub fn backend_name() -> &'static str {
    "NdArray (CPU)"
}

/// Seed the random number generators used for initialization and corruption noise
pub fn seed(seed: u64) {
    TrainingBackend::seed(seed);
}
