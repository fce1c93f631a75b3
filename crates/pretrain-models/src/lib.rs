//! Model definitions for denoising pretraining and ResNet transfer learning.
//!
//! This crate provides:
//! - Convolutional denoising autoencoder layers that train on forward
//! - Stacks of denoising layers for greedy layer-wise pretraining
//! - ResNet-18/34/50/152 backbones and a transfer-learning classifier
//! - Freezing utilities and optimizer construction scoped to trainable parameters
//! - Loading of torchvision ImageNet checkpoints and classifier checkpointing

pub mod checkpoint;
pub mod classifier;
pub mod denoising;
pub mod freeze;
pub mod optimizer;
pub mod pretrained;
pub mod resnet;
pub mod stacked;

pub use checkpoint::{load_classifier, save_classifier, CheckpointMetadata};
pub use classifier::{ChildSummary, TransferClassifier, TransferClassifierConfig};
pub use denoising::{ConvAutoencoder, DenoisingLayer, DenoisingLayerConfig, LayerMode, PretrainStep};
pub use freeze::{Learnable, ParamPartition};
pub use optimizer::{net_frozen, FineTuneOptimizer, ModuleOptimizer, OptimizerSpec};
pub use pretrained::{load_torchvision_record, read_torchvision_state};
pub use resnet::{BackboneChild, BlockKind, ResNetBackbone, ResNetDepth};
pub use stacked::{StackedDenoisingConfig, StackedDenoisingEncoder, StackedPretrainStep};

/// Re-export commonly used types
pub mod prelude {
    pub use super::classifier::{TransferClassifier, TransferClassifierConfig};
    pub use super::denoising::{DenoisingLayer, DenoisingLayerConfig, LayerMode};
    pub use super::freeze::{Learnable, ParamPartition};
    pub use super::optimizer::{net_frozen, FineTuneOptimizer, OptimizerSpec};
    pub use super::resnet::{BackboneChild, ResNetDepth};
    pub use super::stacked::{StackedDenoisingConfig, StackedDenoisingEncoder};
}
