//! Saving and restoring fine-tuned classifiers.
//!
//! A checkpoint directory holds the model record (`model.mpk`, written with
//! [`CompactRecorder`]) and a `metadata.json` describing how to rebuild the
//! classifier before the record is loaded into it.

use std::fs;
use std::path::Path;

use burn::{module::Module, record::CompactRecorder, tensor::backend::Backend};
use pretrain_core::{Error, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::classifier::TransferClassifier;
use crate::resnet::ResNetDepth;

/// Record file stem; the recorder appends `.mpk`
pub const MODEL_FILE: &str = "model";

pub const METADATA_FILE: &str = "metadata.json";

/// Metadata stored next to the model record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointMetadata {
    pub depth: ResNetDepth,
    pub num_classes: usize,
    pub num_parameters: usize,
    /// Freezing threshold to re-apply after loading
    pub frozen_until: Option<usize>,
}

impl CheckpointMetadata {
    pub fn of<B: Backend>(model: &TransferClassifier<B>, frozen_until: Option<usize>) -> Self {
        Self {
            depth: model.depth(),
            num_classes: model.num_classes(),
            num_parameters: model.num_params(),
            frozen_until,
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| Error::Serialization(format!("Failed to serialize metadata: {e}")))?;
        fs::write(path, json)?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let json = fs::read_to_string(path)?;
        serde_json::from_str(&json)
            .map_err(|e| Error::Serialization(format!("Failed to deserialize metadata: {e}")))
    }
}

/// Write `model` and its metadata into `dir`, creating it if needed
pub fn save_classifier<B: Backend>(
    model: &TransferClassifier<B>,
    dir: &Path,
    frozen_until: Option<usize>,
) -> Result<CheckpointMetadata> {
    fs::create_dir_all(dir)?;

    let metadata = CheckpointMetadata::of(model, frozen_until);
    metadata.save(&dir.join(METADATA_FILE))?;

    model
        .clone()
        .save_file(dir.join(MODEL_FILE), &CompactRecorder::new())?;

    info!("Classifier checkpoint saved to {:?}", dir);
    Ok(metadata)
}

/// Rebuild a classifier from a checkpoint directory, re-applying the stored
/// freezing threshold.
pub fn load_classifier<B: Backend>(
    dir: &Path,
    device: &B::Device,
) -> Result<(TransferClassifier<B>, CheckpointMetadata)> {
    let metadata = CheckpointMetadata::load(&dir.join(METADATA_FILE))?;

    let model = TransferClassifier::<B>::new(metadata.depth.into(), metadata.num_classes, device)?
        .load_file(dir.join(MODEL_FILE), &CompactRecorder::new(), device)?;

    let model = match metadata.frozen_until {
        Some(frozen_until) => model.frozen_until(frozen_until),
        None => model,
    };

    info!("Classifier checkpoint loaded from {:?}", dir);
    Ok((model, metadata))
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::Autodiff;
    use burn::module::AutodiffModule;
    use burn::tensor::Tensor;
    use burn_ndarray::NdArray;
    use tempfile::TempDir;

    use crate::resnet::BackboneChild;

    type TestBackend = Autodiff<NdArray>;

    #[test]
    fn test_metadata_round_trip() -> Result<()> {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join(METADATA_FILE);

        let metadata = CheckpointMetadata {
            depth: ResNetDepth::R50,
            num_classes: 10,
            num_parameters: 1000,
            frozen_until: Some(5),
        };
        metadata.save(&path)?;

        let json = fs::read_to_string(&path)?;
        assert!(json.contains("\"depth\": 50"));
        assert_eq!(CheckpointMetadata::load(&path)?, metadata);
        Ok(())
    }

    #[test]
    fn test_save_and_load_classifier() -> Result<()> {
        let temp_dir = TempDir::new().unwrap();
        let device = Default::default();

        let model = TransferClassifier::<TestBackend>::new(18, 4, &device)?.frozen_until(6);
        let saved = save_classifier(&model, temp_dir.path(), Some(6))?;
        assert!(temp_dir.path().join("model.mpk").exists());

        let (loaded, metadata) = load_classifier::<TestBackend>(temp_dir.path(), &device)?;
        assert_eq!(metadata, saved);
        assert_eq!(loaded.head_dims(), [512, 4]);
        assert_eq!(loaded.num_params(), model.num_params());

        let summaries = loaded.child_summaries();
        assert!(summaries[BackboneChild::Layer3.index()].is_frozen());
        assert!(!summaries[BackboneChild::Layer4.index()].is_frozen());

        // Half precision storage, so compare outputs loosely
        let input = Tensor::<TestBackend, 4>::ones([1, 3, 32, 32], &device);
        let expected = model.valid().forward(input.clone().inner());
        let actual = loaded.valid().forward(input.inner());
        expected
            .into_data()
            .assert_approx_eq(&actual.into_data(), 1);
        Ok(())
    }

    #[test]
    fn test_load_missing_checkpoint() {
        let temp_dir = TempDir::new().unwrap();
        let device = Default::default();
        let result = load_classifier::<TestBackend>(&temp_dir.path().join("missing"), &device);
        assert!(matches!(result, Err(Error::Io(_))));
    }
}
