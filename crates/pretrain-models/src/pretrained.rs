//! Loading torchvision ImageNet checkpoints into a [`ResNetBackbone`].

use std::path::Path;

use burn::{
    module::Module,
    record::{FullPrecisionSettings, Record, Recorder},
    tensor::backend::Backend,
};
use burn_import::pytorch::{LoadArgs, PyTorchFileRecorder};
use pretrain_core::{Error, Result};
use tracing::{debug, info};

use crate::resnet::{ResNetBackbone, ResNetDepth};

/// Record type of a backbone
pub type BackboneRecord<B> = <ResNetBackbone<B> as Module<B>>::Record;

/// Regex remaps from torchvision state-dict keys to backbone record paths.
pub const TORCHVISION_KEY_REMAP: [(&str, &str); 3] = [
    (r"^(layer[1-4])\.([0-9]+)\.", "$1.blocks.$2."),
    (r"\.downsample\.0\.", ".downsample.conv."),
    (r"\.downsample\.1\.", ".downsample.bn."),
];

fn torchvision_load_args(path: &Path) -> LoadArgs {
    TORCHVISION_KEY_REMAP
        .iter()
        .fold(LoadArgs::new(path.to_path_buf()), |args, (pattern, replacement)| {
            args.with_key_remap(pattern, replacement)
        })
}

/// Decode a torchvision-style state dict into any record laid out like the
/// backbone (`layerN.blocks.M`, `downsample.conv`/`downsample.bn`).
pub fn read_torchvision_state<B: Backend, R: Record<B>>(
    path: &Path,
    device: &B::Device,
) -> Result<R> {
    PyTorchFileRecorder::<FullPrecisionSettings>::default()
        .load(torchvision_load_args(path), device)
        .map_err(|e| {
            Error::Weights(format!(
                "failed to decode checkpoint {}: {e:?}",
                path.display()
            ))
        })
}

/// Read a torchvision ResNet checkpoint as a backbone record.
///
/// The `fc.*` entries of the checkpoint have no counterpart in the backbone
/// and are left unused.
pub fn load_torchvision_record<B: Backend>(
    path: &Path,
    depth: ResNetDepth,
    device: &B::Device,
) -> Result<BackboneRecord<B>> {
    if !path.is_file() {
        return Err(Error::Weights(format!(
            "{} checkpoint not found at {} (download it from {})",
            depth,
            path.display(),
            depth.torchvision_url()
        )));
    }

    debug!("Reading {} weights from {:?}", depth, path);
    read_torchvision_state(path, device)
}

impl<B: Backend> ResNetBackbone<B> {
    /// Replace every backbone parameter and running statistic with the values
    /// stored in a torchvision checkpoint.
    pub fn load_torchvision_weights(
        self,
        path: &Path,
        depth: ResNetDepth,
        device: &B::Device,
    ) -> Result<Self> {
        let record = load_torchvision_record::<B>(path, depth, device)?;
        info!("Loaded pretrained {} backbone from {:?}", depth, path);
        Ok(self.load_record(record))
    }
}
