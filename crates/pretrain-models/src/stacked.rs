//! Stack of denoising layers pretrained greedily, one layer per forward step.

use burn::{
    config::Config,
    tensor::{backend::AutodiffBackend, Tensor},
};
use pretrain_core::Error;
use tracing::{debug, info};

use crate::denoising::{DenoisingLayer, DenoisingLayerConfig};

/// Configuration for a [`StackedDenoisingEncoder`]
#[derive(Config, Debug)]
pub struct StackedDenoisingConfig {
    /// Layers from input to output
    pub layers: Vec<DenoisingLayerConfig>,
}

impl StackedDenoisingConfig {
    /// Default layers for a channel progression, e.g. `[3, 16, 32]` gives two layers
    pub fn from_channels(channels: &[usize]) -> Self {
        let layers = channels
            .windows(2)
            .map(|pair| DenoisingLayerConfig::new(pair[0], pair[1]))
            .collect();
        Self::new(layers)
    }

    /// Checks that the stack is non-empty and that every layer consumes the
    /// channels the previous one produces.
    pub fn validate(&self) -> pretrain_core::Result<()> {
        if self.layers.is_empty() {
            return Err(Error::invalid_config("stacked encoder needs at least one layer"));
        }

        for (i, pair) in self.layers.windows(2).enumerate() {
            if pair[0].out_channels != pair[1].in_channels {
                return Err(Error::invalid_config(format!(
                    "layer {} outputs {} channels but layer {} expects {}",
                    i,
                    pair[0].out_channels,
                    i + 1,
                    pair[1].in_channels
                )));
            }
        }

        self.layers.iter().try_for_each(DenoisingLayerConfig::validate)
    }

    pub fn init<B: AutodiffBackend>(
        &self,
        device: &B::Device,
    ) -> pretrain_core::Result<StackedDenoisingEncoder<B>> {
        self.validate()?;

        let layers = self
            .layers
            .iter()
            .map(|config| config.init(device))
            .collect::<pretrain_core::Result<Vec<_>>>()?;

        debug!("Created stacked denoising encoder with {} layers", layers.len());
        Ok(StackedDenoisingEncoder { layers })
    }
}

/// Losses of one greedy pretraining pass
#[derive(Debug, Clone)]
pub struct StackedPretrainStep<B: AutodiffBackend> {
    /// Detached encoding of the last layer
    pub encoded: Tensor<B, 4>,
    /// Reconstruction loss of each layer, input side first
    pub losses: Vec<f64>,
}

#[derive(Debug)]
pub struct StackedDenoisingEncoder<B: AutodiffBackend> {
    layers: Vec<DenoisingLayer<B>>,
}

impl<B: AutodiffBackend> StackedDenoisingEncoder<B> {
    /// Feed `x` through every layer; layers in training mode update themselves
    pub fn forward(&mut self, x: Tensor<B, 4>) -> pretrain_core::Result<Tensor<B, 4>> {
        self.layers
            .iter_mut()
            .try_fold(x, |x, layer| layer.forward(x))
    }

    /// One training step per layer regardless of mode, each on the previous
    /// layer's detached encoding.
    pub fn pretrain_step(
        &mut self,
        x: Tensor<B, 4>,
    ) -> pretrain_core::Result<StackedPretrainStep<B>> {
        let mut encoded = x;
        let mut losses = Vec::with_capacity(self.layers.len());

        for (i, layer) in self.layers.iter_mut().enumerate() {
            let step = layer.train_step(encoded)?;
            debug!("Layer {} reconstruction loss: {:.6}", i, step.loss);
            losses.push(step.loss);
            encoded = step.encoded;
        }

        Ok(StackedPretrainStep { encoded, losses })
    }

    /// Run `steps` pretraining passes on the same batch, returning the losses
    /// of the last pass.
    pub fn pretrain(&mut self, x: Tensor<B, 4>, steps: usize) -> pretrain_core::Result<Vec<f64>> {
        let mut losses = Vec::new();
        for step in 0..steps {
            losses = self.pretrain_step(x.clone())?.losses;
            info!("Step {}/{}: losses {:?}", step + 1, steps, losses);
        }
        Ok(losses)
    }

    pub fn train(&mut self) {
        self.layers.iter_mut().for_each(DenoisingLayer::train);
    }

    pub fn eval(&mut self) {
        self.layers.iter_mut().for_each(DenoisingLayer::eval);
    }

    pub fn output_dims(&self, input_dims: [usize; 4]) -> pretrain_core::Result<[usize; 4]> {
        self.layers
            .iter()
            .try_fold(input_dims, |dims, layer| layer.output_dims(dims))
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    pub fn layer(&self, index: usize) -> Option<&DenoisingLayer<B>> {
        self.layers.get(index)
    }

    pub fn layers(&self) -> &[DenoisingLayer<B>] {
        &self.layers
    }
}
