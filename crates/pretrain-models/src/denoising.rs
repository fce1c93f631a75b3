//! Convolutional denoising autoencoder layer for layer-wise pretraining.
//!
//! A [`DenoisingLayer`] owns a strided convolution encoder, a transposed
//! convolution decoder and a plain SGD optimizer. In training mode every
//! forward call corrupts its (detached) input, reconstructs it and takes one
//! optimizer step on its own parameters before returning the detached encoding,
//! so layers can be stacked and pretrained greedily.

use burn::{
    config::Config,
    module::{AutodiffModule, Module, ParamId},
    nn::{
        conv::{Conv2d, Conv2dConfig, ConvTranspose2d, ConvTranspose2dConfig},
        loss::{MseLoss, Reduction},
        PaddingConfig2d, Relu,
    },
    optim::{GradientsParams, SgdConfig},
    tensor::{
        backend::{AutodiffBackend, Backend},
        Distribution, ElementConversion, Tensor,
    },
};
use pretrain_core::Error;
use tracing::debug;

use crate::freeze::Learnable;
use crate::optimizer::ModuleOptimizer;

/// Spatial size of both the encoder and the decoder kernels
pub const KERNEL_SIZE: usize = 2;

/// Configuration for a [`DenoisingLayer`]
#[derive(Config, Debug)]
pub struct DenoisingLayerConfig {
    /// Channels of the input image or previous encoding
    pub in_channels: usize,

    /// Channels of the encoding
    pub out_channels: usize,

    /// Encoder stride; the decoder always upsamples by 2
    #[config(default = "2")]
    pub stride: usize,

    /// Learning rate of the embedded SGD optimizer
    #[config(default = "0.1")]
    pub learning_rate: f64,

    /// Standard deviation of the corruption noise
    #[config(default = "0.1")]
    pub noise_std: f64,

    /// Elements whose noise draw is not above this value are zeroed
    #[config(default = "-0.1")]
    pub noise_threshold: f64,
}

impl DenoisingLayerConfig {
    pub fn validate(&self) -> pretrain_core::Result<()> {
        if self.in_channels == 0 || self.out_channels == 0 {
            return Err(Error::invalid_config(format!(
                "denoising layer channels must be positive, got {} -> {}",
                self.in_channels, self.out_channels
            )));
        }
        if self.stride == 0 {
            return Err(Error::invalid_config("denoising layer stride must be positive"));
        }
        if !(self.learning_rate.is_finite() && self.learning_rate > 0.0) {
            return Err(Error::invalid_config(format!(
                "learning rate must be positive, got {}",
                self.learning_rate
            )));
        }
        if !(self.noise_std.is_finite() && self.noise_std > 0.0) {
            return Err(Error::invalid_config(format!(
                "noise std must be positive, got {}",
                self.noise_std
            )));
        }
        Ok(())
    }

    /// Build the encoder/decoder pair alone
    pub fn init_autoencoder<B: Backend>(
        &self,
        device: &B::Device,
    ) -> pretrain_core::Result<ConvAutoencoder<B>> {
        self.validate()?;

        let encoder = Conv2dConfig::new(
            [self.in_channels, self.out_channels],
            [KERNEL_SIZE, KERNEL_SIZE],
        )
        .with_stride([self.stride, self.stride])
        .with_padding(PaddingConfig2d::Valid)
        .init(device);

        let decoder = ConvTranspose2dConfig::new(
            [self.out_channels, self.in_channels],
            [KERNEL_SIZE, KERNEL_SIZE],
        )
        .with_stride([2, 2])
        .init(device);

        Ok(ConvAutoencoder {
            encoder,
            decoder,
            relu: Relu::new(),
        })
    }

    /// Build a trainable layer in training mode
    pub fn init<B: AutodiffBackend>(
        &self,
        device: &B::Device,
    ) -> pretrain_core::Result<DenoisingLayer<B>> {
        let autoencoder = self.init_autoencoder(device)?;
        let optimizer: Box<dyn ModuleOptimizer<B, ConvAutoencoder<B>>> =
            Box::new(SgdConfig::new().init::<B, ConvAutoencoder<B>>());

        debug!(
            "Created denoising layer {} -> {} (stride {})",
            self.in_channels, self.out_channels, self.stride
        );

        Ok(DenoisingLayer {
            autoencoder,
            optimizer,
            config: self.clone(),
            mode: LayerMode::default(),
        })
    }
}

/// Strided convolution encoder with a 2x transposed convolution decoder
#[derive(Module, Debug)]
pub struct ConvAutoencoder<B: Backend> {
    pub encoder: Conv2d<B>,
    pub decoder: ConvTranspose2d<B>,
    relu: Relu,
}

impl<B: Backend> ConvAutoencoder<B> {
    pub fn encode(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        self.relu.forward(self.encoder.forward(x))
    }

    pub fn decode(&self, z: Tensor<B, 4>) -> Tensor<B, 4> {
        self.relu.forward(self.decoder.forward(z))
    }

    /// Encoding and reconstruction of `x`
    pub fn forward(&self, x: Tensor<B, 4>) -> (Tensor<B, 4>, Tensor<B, 4>) {
        let encoded = self.encode(x);
        let reconstruction = self.decode(encoded.clone());
        (encoded, reconstruction)
    }
}

impl<B: Backend> Learnable<B> for ConvAutoencoder<B> {
    fn visit_learnable(&self, f: &mut dyn FnMut(ParamId, bool)) {
        self.encoder.visit_learnable(f);
        self.decoder.visit_learnable(f);
    }

    fn set_trainable(mut self, trainable: bool) -> Self {
        self.encoder = self.encoder.set_trainable(trainable);
        self.decoder = self.decoder.set_trainable(trainable);
        self
    }
}

/// Whether forward calls train the layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LayerMode {
    #[default]
    Train,
    Eval,
}

/// Result of one pretraining step
#[derive(Debug, Clone)]
pub struct PretrainStep<B: Backend> {
    /// Detached encoding computed before the update
    pub encoded: Tensor<B, 4>,
    /// Mean squared reconstruction error
    pub loss: f64,
}

/// Self-training denoising autoencoder layer.
pub struct DenoisingLayer<B: AutodiffBackend> {
    autoencoder: ConvAutoencoder<B>,
    optimizer: Box<dyn ModuleOptimizer<B, ConvAutoencoder<B>>>,
    config: DenoisingLayerConfig,
    mode: LayerMode,
}

impl<B: AutodiffBackend> DenoisingLayer<B> {
    /// Zero each element whose `Normal(0, noise_std)` draw is not above the threshold
    pub fn corrupt(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let noise = Tensor::<B, 4>::random(
            x.shape(),
            Distribution::Normal(0.0, self.config.noise_std),
            &x.device(),
        );
        let mask = noise.greater_elem(self.config.noise_threshold).float();
        x * mask
    }

    /// Encoding of a corrupted copy of `x`, without any update
    pub fn encode(&self, x: Tensor<B, 4>) -> pretrain_core::Result<Tensor<B, 4>> {
        self.output_dims(x.dims())?;
        let corrupted = self.corrupt(x.detach());
        Ok(self.autoencoder.encode(corrupted).detach())
    }

    /// Reconstruct a corrupted copy of `x` and take one SGD step on the
    /// reconstruction error against the clean input.
    pub fn train_step(&mut self, x: Tensor<B, 4>) -> pretrain_core::Result<PretrainStep<B>> {
        let input_dims = x.dims();
        let [batch, channels, height, width] = self.output_dims(input_dims)?;
        let reconstruction_dims = [batch, self.config.in_channels, height * 2, width * 2];
        if reconstruction_dims != input_dims {
            return Err(Error::shape(format!(
                "reconstruction {reconstruction_dims:?} does not match input {input_dims:?} \
                 (encoding has {channels} channels, stride {})",
                self.config.stride
            )));
        }

        let clean = x.detach();
        let corrupted = self.corrupt(clean.clone());
        let (encoded, reconstruction) = self.autoencoder.forward(corrupted);

        let loss = MseLoss::new().forward(reconstruction, clean, Reduction::Mean);
        let loss_value: f64 = loss.clone().into_scalar().elem();

        let grads = GradientsParams::from_grads(loss.backward(), &self.autoencoder);
        self.autoencoder =
            self.optimizer
                .step(self.config.learning_rate, self.autoencoder.clone(), grads);

        Ok(PretrainStep {
            encoded: encoded.detach(),
            loss: loss_value,
        })
    }

    /// Train-on-forward: one update in [`LayerMode::Train`], plain encoding in
    /// [`LayerMode::Eval`]. Always returns the detached encoding.
    pub fn forward(&mut self, x: Tensor<B, 4>) -> pretrain_core::Result<Tensor<B, 4>> {
        match self.mode {
            LayerMode::Train => self.train_step(x).map(|step| step.encoded),
            LayerMode::Eval => self.encode(x),
        }
    }

    pub fn train(&mut self) {
        self.mode = LayerMode::Train;
    }

    pub fn eval(&mut self) {
        self.mode = LayerMode::Eval;
    }

    pub fn mode(&self) -> LayerMode {
        self.mode
    }

    /// Encoding dims for an input of `input_dims`, checking channels and size
    pub fn output_dims(&self, input_dims: [usize; 4]) -> pretrain_core::Result<[usize; 4]> {
        let [batch, channels, height, width] = input_dims;
        if channels != self.config.in_channels {
            return Err(Error::shape(format!(
                "expected {} input channels, got {channels}",
                self.config.in_channels
            )));
        }
        if height < KERNEL_SIZE || width < KERNEL_SIZE {
            return Err(Error::shape(format!(
                "input {height}x{width} is smaller than the {KERNEL_SIZE}x{KERNEL_SIZE} kernel"
            )));
        }

        let stride = self.config.stride;
        Ok([
            batch,
            self.config.out_channels,
            (height - KERNEL_SIZE) / stride + 1,
            (width - KERNEL_SIZE) / stride + 1,
        ])
    }

    pub fn config(&self) -> &DenoisingLayerConfig {
        &self.config
    }

    pub fn autoencoder(&self) -> &ConvAutoencoder<B> {
        &self.autoencoder
    }

    /// Trained encoder/decoder without autodiff tracking
    pub fn into_inference(self) -> ConvAutoencoder<B::InnerBackend> {
        self.autoencoder.valid()
    }
}

impl<B: AutodiffBackend> std::fmt::Debug for DenoisingLayer<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DenoisingLayer")
            .field("autoencoder", &self.autoencoder)
            .field("config", &self.config)
            .field("mode", &self.mode)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::Autodiff;
    use burn_ndarray::NdArray;

    type TestBackend = Autodiff<NdArray>;

    fn layer(in_channels: usize, out_channels: usize) -> DenoisingLayer<TestBackend> {
        let device = Default::default();
        DenoisingLayerConfig::new(in_channels, out_channels)
            .init(&device)
            .unwrap()
    }

    fn input(dims: [usize; 4]) -> Tensor<TestBackend, 4> {
        let device = Default::default();
        Tensor::random(dims, Distribution::Uniform(0.0, 1.0), &device)
    }

    fn weights(autoencoder: &ConvAutoencoder<TestBackend>) -> Vec<f32> {
        let mut values = autoencoder
            .encoder
            .weight
            .val()
            .into_data()
            .to_vec::<f32>()
            .unwrap();
        values.extend(
            autoencoder
                .decoder
                .weight
                .val()
                .into_data()
                .to_vec::<f32>()
                .unwrap(),
        );
        values
    }

    #[test]
    fn test_default_config() {
        let config = DenoisingLayerConfig::new(3, 16);
        assert_eq!(config.stride, 2);
        assert_eq!(config.learning_rate, 0.1);
        assert_eq!(config.noise_threshold, -0.1);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_json_round_trip() {
        let config = DenoisingLayerConfig::new(3, 16)
            .with_stride(1)
            .with_learning_rate(0.05);
        let json = serde_json::to_string(&config).unwrap();
        let restored: DenoisingLayerConfig = serde_json::from_str(&json).unwrap();

        assert_eq!(restored.stride, 1);
        assert_eq!(restored.learning_rate, 0.05);
        assert_eq!(restored.noise_std, 0.1);
    }

    #[test]
    fn test_invalid_config() {
        let device = Default::default();
        let result = DenoisingLayerConfig::new(0, 16).init::<TestBackend>(&device);
        assert!(matches!(result, Err(Error::InvalidConfig(_))));

        let result = DenoisingLayerConfig::new(3, 16)
            .with_stride(0)
            .init::<TestBackend>(&device);
        assert!(matches!(result, Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn test_forward_output_shape() {
        let mut layer = layer(3, 8);
        assert_eq!(layer.mode(), LayerMode::Train);

        let output = layer.forward(input([2, 3, 16, 16])).unwrap();
        assert_eq!(output.dims(), [2, 8, 8, 8]);
        assert_eq!(layer.output_dims([2, 3, 16, 16]).unwrap(), [2, 8, 8, 8]);
    }

    #[test]
    fn test_train_forward_updates_parameters() {
        let mut layer = layer(3, 8);
        let before = weights(layer.autoencoder());

        let x = input([4, 3, 8, 8]).require_grad();
        let output = layer.forward(x.clone()).unwrap();

        assert_ne!(before, weights(layer.autoencoder()));
        assert!(!output.is_require_grad());
        // Upstream tensor keeps its own graph
        assert!(x.is_require_grad());
    }

    #[test]
    fn test_train_step_reports_loss() {
        let mut layer = layer(3, 8);
        let step = layer.train_step(input([2, 3, 8, 8])).unwrap();

        assert!(step.loss.is_finite());
        assert!(step.loss >= 0.0);
        assert_eq!(step.encoded.dims(), [2, 8, 4, 4]);
    }

    #[test]
    fn test_eval_forward_keeps_parameters() {
        let mut layer = layer(3, 8);
        layer.eval();
        let before = weights(layer.autoencoder());

        let output = layer.forward(input([2, 3, 8, 8])).unwrap();

        assert_eq!(before, weights(layer.autoencoder()));
        assert_eq!(output.dims(), [2, 8, 4, 4]);
        assert!(!output.is_require_grad());
    }

    #[test]
    fn test_mismatched_reconstruction_is_shape_error() {
        let device = Default::default();
        let mut layer = DenoisingLayerConfig::new(3, 8)
            .with_stride(1)
            .init::<TestBackend>(&device)
            .unwrap();

        let result = layer.train_step(input([1, 3, 8, 8]));
        assert!(matches!(result, Err(Error::Shape(_))));

        // Encoding alone is still well defined
        let encoded = layer.encode(input([1, 3, 8, 8])).unwrap();
        assert_eq!(encoded.dims(), [1, 8, 7, 7]);
    }

    #[test]
    fn test_odd_input_is_shape_error() {
        let mut layer = layer(3, 8);
        let result = layer.forward(input([1, 3, 9, 9]));
        assert!(matches!(result, Err(Error::Shape(_))));
    }

    #[test]
    fn test_wrong_channels_is_shape_error() {
        let mut layer = layer(3, 8);
        assert!(matches!(
            layer.forward(input([1, 1, 8, 8])),
            Err(Error::Shape(_))
        ));

        layer.eval();
        assert!(matches!(
            layer.forward(input([1, 3, 1, 8])),
            Err(Error::Shape(_))
        ));
    }

    #[test]
    fn test_corrupt_keeps_most_elements() {
        let device = Default::default();
        let layer = layer(1, 1);
        let ones = Tensor::<TestBackend, 4>::ones([1, 1, 100, 100], &device);

        let values = layer.corrupt(ones).into_data().to_vec::<f32>().unwrap();
        assert!(values.iter().all(|&v| v == 0.0 || v == 1.0));

        let kept = values.iter().filter(|&&v| v == 1.0).count() as f64 / values.len() as f64;
        // P(N(0, 0.1) > -0.1) is about 0.84
        assert!(kept > 0.80 && kept < 0.88, "kept fraction {kept}");
    }

    #[test]
    fn test_into_inference() {
        let mut layer = layer(3, 4);
        layer.forward(input([1, 3, 4, 4])).unwrap();

        let autoencoder = layer.into_inference();
        let device = Default::default();
        let x = Tensor::<NdArray, 4>::ones([1, 3, 4, 4], &device);
        let (encoded, reconstruction) = autoencoder.forward(x);
        assert_eq!(encoded.dims(), [1, 4, 2, 2]);
        assert_eq!(reconstruction.dims(), [1, 3, 4, 4]);
    }
}
