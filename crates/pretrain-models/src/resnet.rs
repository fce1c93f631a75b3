//! Residual network backbones.
//!
//! Implements the torchvision ResNet layout (v1.5: stride on the 3x3 convolution
//! of bottleneck blocks) for depths 18, 34, 50 and 152, without the final
//! fully-connected layer. Field names mirror torchvision so that ImageNet
//! checkpoints map onto the modules with a couple of key remaps.

use burn::{
    module::{Module, ParamId},
    nn::{
        conv::{Conv2d, Conv2dConfig},
        pool::{AdaptiveAvgPool2d, AdaptiveAvgPool2dConfig, MaxPool2d, MaxPool2dConfig},
        BatchNorm, BatchNormConfig, PaddingConfig2d, Relu,
    },
    tensor::{backend::Backend, Tensor},
};
use pretrain_core::{Error, Result, SUPPORTED_DEPTHS};
use serde::{Deserialize, Serialize};

use crate::freeze::Learnable;

/// Supported backbone depths
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(try_from = "usize", into = "usize")]
pub enum ResNetDepth {
    R18,
    R34,
    R50,
    R152,
}

impl ResNetDepth {
    pub const ALL: [ResNetDepth; 4] = [
        ResNetDepth::R18,
        ResNetDepth::R34,
        ResNetDepth::R50,
        ResNetDepth::R152,
    ];

    /// Number of residual blocks in each of the four stages
    pub fn blocks(&self) -> [usize; 4] {
        match self {
            ResNetDepth::R18 => [2, 2, 2, 2],
            ResNetDepth::R34 | ResNetDepth::R50 => [3, 4, 6, 3],
            ResNetDepth::R152 => [3, 8, 36, 3],
        }
    }

    pub fn block_kind(&self) -> BlockKind {
        match self {
            ResNetDepth::R18 | ResNetDepth::R34 => BlockKind::Basic,
            ResNetDepth::R50 | ResNetDepth::R152 => BlockKind::Bottleneck,
        }
    }

    /// Width of the pooled feature vector fed to the classification head
    pub fn num_features(&self) -> usize {
        512 * self.block_kind().expansion()
    }

    /// File name of the torchvision ImageNet checkpoint
    pub fn torchvision_file_name(&self) -> &'static str {
        match self {
            ResNetDepth::R18 => "resnet18-f37072fd.pth",
            ResNetDepth::R34 => "resnet34-b627a593.pth",
            ResNetDepth::R50 => "resnet50-0676ba61.pth",
            ResNetDepth::R152 => "resnet152-394f9c45.pth",
        }
    }

    /// Download location of the torchvision ImageNet checkpoint
    pub fn torchvision_url(&self) -> String {
        format!(
            "https://download.pytorch.org/models/{}",
            self.torchvision_file_name()
        )
    }
}

impl TryFrom<usize> for ResNetDepth {
    type Error = Error;

    fn try_from(depth: usize) -> Result<Self> {
        match depth {
            18 => Ok(ResNetDepth::R18),
            34 => Ok(ResNetDepth::R34),
            50 => Ok(ResNetDepth::R50),
            152 => Ok(ResNetDepth::R152),
            other => Err(Error::invalid_config(format!(
                "unsupported ResNet depth {other}, expected one of {SUPPORTED_DEPTHS:?}"
            ))),
        }
    }
}

impl From<ResNetDepth> for usize {
    fn from(depth: ResNetDepth) -> Self {
        match depth {
            ResNetDepth::R18 => 18,
            ResNetDepth::R34 => 34,
            ResNetDepth::R50 => 50,
            ResNetDepth::R152 => 152,
        }
    }
}

impl std::fmt::Display for ResNetDepth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "resnet{}", usize::from(*self))
    }
}

/// Residual block flavour
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum BlockKind {
    /// Two 3x3 convolutions
    Basic,
    /// 1x1 reduce, 3x3, 1x1 expand
    Bottleneck,
}

impl BlockKind {
    /// Ratio between a block's output channels and its inner width
    pub fn expansion(&self) -> usize {
        match self {
            BlockKind::Basic => 1,
            BlockKind::Bottleneck => 4,
        }
    }
}

fn conv3x3<B: Backend>(in_channels: usize, out_channels: usize, stride: usize, device: &B::Device) -> Conv2d<B> {
    Conv2dConfig::new([in_channels, out_channels], [3, 3])
        .with_stride([stride, stride])
        .with_padding(PaddingConfig2d::Explicit(1, 1))
        .with_bias(false)
        .init(device)
}

fn conv1x1<B: Backend>(in_channels: usize, out_channels: usize, stride: usize, device: &B::Device) -> Conv2d<B> {
    Conv2dConfig::new([in_channels, out_channels], [1, 1])
        .with_stride([stride, stride])
        .with_bias(false)
        .init(device)
}

/// Projection shortcut used when a block changes resolution or width
#[derive(Module, Debug)]
pub struct Downsample<B: Backend> {
    pub conv: Conv2d<B>,
    pub bn: BatchNorm<B, 2>,
}

impl<B: Backend> Downsample<B> {
    pub fn new(in_channels: usize, out_channels: usize, stride: usize, device: &B::Device) -> Self {
        Self {
            conv: conv1x1(in_channels, out_channels, stride, device),
            bn: BatchNormConfig::new(out_channels).init(device),
        }
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        self.bn.forward(self.conv.forward(x))
    }
}

impl<B: Backend> Learnable<B> for Downsample<B> {
    fn visit_learnable(&self, f: &mut dyn FnMut(ParamId, bool)) {
        self.conv.visit_learnable(f);
        self.bn.visit_learnable(f);
    }

    fn set_trainable(mut self, trainable: bool) -> Self {
        self.conv = self.conv.set_trainable(trainable);
        self.bn = self.bn.set_trainable(trainable);
        self
    }
}

/// Residual block covering both the basic and the bottleneck layout.
///
/// Basic blocks leave `conv3`/`bn3` empty.
#[derive(Module, Debug)]
pub struct ResidualBlock<B: Backend> {
    pub conv1: Conv2d<B>,
    pub bn1: BatchNorm<B, 2>,
    pub conv2: Conv2d<B>,
    pub bn2: BatchNorm<B, 2>,
    pub conv3: Option<Conv2d<B>>,
    pub bn3: Option<BatchNorm<B, 2>>,
    pub relu: Relu,
    pub downsample: Option<Downsample<B>>,
}

impl<B: Backend> ResidualBlock<B> {
    /// Two 3x3 convolutions, `planes` output channels
    pub fn basic(in_channels: usize, planes: usize, stride: usize, device: &B::Device) -> Self {
        let downsample = (stride != 1 || in_channels != planes)
            .then(|| Downsample::new(in_channels, planes, stride, device));

        Self {
            conv1: conv3x3(in_channels, planes, stride, device),
            bn1: BatchNormConfig::new(planes).init(device),
            conv2: conv3x3(planes, planes, 1, device),
            bn2: BatchNormConfig::new(planes).init(device),
            conv3: None,
            bn3: None,
            relu: Relu::new(),
            downsample,
        }
    }

    /// 1x1 -> 3x3 (strided) -> 1x1, `planes * 4` output channels
    pub fn bottleneck(in_channels: usize, planes: usize, stride: usize, device: &B::Device) -> Self {
        let out_channels = planes * BlockKind::Bottleneck.expansion();
        let downsample = (stride != 1 || in_channels != out_channels)
            .then(|| Downsample::new(in_channels, out_channels, stride, device));

        Self {
            conv1: conv1x1(in_channels, planes, 1, device),
            bn1: BatchNormConfig::new(planes).init(device),
            conv2: conv3x3(planes, planes, stride, device),
            bn2: BatchNormConfig::new(planes).init(device),
            conv3: Some(conv1x1(planes, out_channels, 1, device)),
            bn3: Some(BatchNormConfig::new(out_channels).init(device)),
            relu: Relu::new(),
            downsample,
        }
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let identity = match &self.downsample {
            Some(downsample) => downsample.forward(x.clone()),
            None => x.clone(),
        };

        let out = self.conv1.forward(x);
        let out = self.bn1.forward(out);
        let out = self.relu.forward(out);
        let out = self.conv2.forward(out);
        let out = self.bn2.forward(out);

        let out = match (&self.conv3, &self.bn3) {
            (Some(conv3), Some(bn3)) => {
                let out = self.relu.forward(out);
                bn3.forward(conv3.forward(out))
            }
            _ => out,
        };

        self.relu.forward(out.add(identity))
    }
}

impl<B: Backend> Learnable<B> for ResidualBlock<B> {
    fn visit_learnable(&self, f: &mut dyn FnMut(ParamId, bool)) {
        self.conv1.visit_learnable(f);
        self.bn1.visit_learnable(f);
        self.conv2.visit_learnable(f);
        self.bn2.visit_learnable(f);
        self.conv3.visit_learnable(f);
        self.bn3.visit_learnable(f);
        self.downsample.visit_learnable(f);
    }

    fn set_trainable(mut self, trainable: bool) -> Self {
        self.conv1 = self.conv1.set_trainable(trainable);
        self.bn1 = self.bn1.set_trainable(trainable);
        self.conv2 = self.conv2.set_trainable(trainable);
        self.bn2 = self.bn2.set_trainable(trainable);
        self.conv3 = self.conv3.set_trainable(trainable);
        self.bn3 = self.bn3.set_trainable(trainable);
        self.downsample = self.downsample.set_trainable(trainable);
        self
    }
}

/// One of the four `layerN` stages
#[derive(Module, Debug)]
pub struct ResidualStage<B: Backend> {
    pub blocks: Vec<ResidualBlock<B>>,
}

impl<B: Backend> ResidualStage<B> {
    /// Only the first block strides and projects the shortcut
    pub fn new(
        kind: BlockKind,
        in_channels: usize,
        planes: usize,
        num_blocks: usize,
        stride: usize,
        device: &B::Device,
    ) -> Self {
        let out_channels = planes * kind.expansion();
        let blocks = (0..num_blocks)
            .map(|i| {
                let (block_in, block_stride) = if i == 0 {
                    (in_channels, stride)
                } else {
                    (out_channels, 1)
                };
                match kind {
                    BlockKind::Basic => ResidualBlock::basic(block_in, planes, block_stride, device),
                    BlockKind::Bottleneck => {
                        ResidualBlock::bottleneck(block_in, planes, block_stride, device)
                    }
                }
            })
            .collect();

        Self { blocks }
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        self.blocks.iter().fold(x, |x, block| block.forward(x))
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }
}

impl<B: Backend> Learnable<B> for ResidualStage<B> {
    fn visit_learnable(&self, f: &mut dyn FnMut(ParamId, bool)) {
        self.blocks.visit_learnable(f);
    }

    fn set_trainable(mut self, trainable: bool) -> Self {
        self.blocks = self.blocks.set_trainable(trainable);
        self
    }
}

/// Direct children of the backbone, in definition order.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum BackboneChild {
    Conv1,
    Bn1,
    Relu,
    MaxPool,
    Layer1,
    Layer2,
    Layer3,
    Layer4,
    AvgPool,
}

impl BackboneChild {
    pub const ALL: [BackboneChild; 9] = [
        BackboneChild::Conv1,
        BackboneChild::Bn1,
        BackboneChild::Relu,
        BackboneChild::MaxPool,
        BackboneChild::Layer1,
        BackboneChild::Layer2,
        BackboneChild::Layer3,
        BackboneChild::Layer4,
        BackboneChild::AvgPool,
    ];

    /// Zero-based position among the backbone children
    pub fn index(&self) -> usize {
        match self {
            BackboneChild::Conv1 => 0,
            BackboneChild::Bn1 => 1,
            BackboneChild::Relu => 2,
            BackboneChild::MaxPool => 3,
            BackboneChild::Layer1 => 4,
            BackboneChild::Layer2 => 5,
            BackboneChild::Layer3 => 6,
            BackboneChild::Layer4 => 7,
            BackboneChild::AvgPool => 8,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            BackboneChild::Conv1 => "conv1",
            BackboneChild::Bn1 => "bn1",
            BackboneChild::Relu => "relu",
            BackboneChild::MaxPool => "maxpool",
            BackboneChild::Layer1 => "layer1",
            BackboneChild::Layer2 => "layer2",
            BackboneChild::Layer3 => "layer3",
            BackboneChild::Layer4 => "layer4",
            BackboneChild::AvgPool => "avgpool",
        }
    }
}

impl std::fmt::Display for BackboneChild {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// ResNet feature extractor: every torchvision child except `fc`
#[derive(Module, Debug)]
pub struct ResNetBackbone<B: Backend> {
    pub conv1: Conv2d<B>,
    pub bn1: BatchNorm<B, 2>,
    pub relu: Relu,
    pub maxpool: MaxPool2d,
    pub layer1: ResidualStage<B>,
    pub layer2: ResidualStage<B>,
    pub layer3: ResidualStage<B>,
    pub layer4: ResidualStage<B>,
    pub avgpool: AdaptiveAvgPool2d,
}

impl<B: Backend> ResNetBackbone<B> {
    /// Create a randomly initialised backbone for 3-channel images
    pub fn new(depth: ResNetDepth, device: &B::Device) -> Self {
        let kind = depth.block_kind();
        let expansion = kind.expansion();
        let [n1, n2, n3, n4] = depth.blocks();

        // Stem: 3 -> 64, 7x7 stride 2, then 3x3 max pool stride 2
        let conv1 = Conv2dConfig::new([3, 64], [7, 7])
            .with_stride([2, 2])
            .with_padding(PaddingConfig2d::Explicit(3, 3))
            .with_bias(false)
            .init(device);
        let bn1 = BatchNormConfig::new(64).init(device);
        let maxpool = MaxPool2dConfig::new([3, 3])
            .with_strides([2, 2])
            .with_padding(PaddingConfig2d::Explicit(1, 1))
            .init();

        let layer1 = ResidualStage::new(kind, 64, 64, n1, 1, device);
        let layer2 = ResidualStage::new(kind, 64 * expansion, 128, n2, 2, device);
        let layer3 = ResidualStage::new(kind, 128 * expansion, 256, n3, 2, device);
        let layer4 = ResidualStage::new(kind, 256 * expansion, 512, n4, 2, device);

        let avgpool = AdaptiveAvgPool2dConfig::new([1, 1]).init();

        Self {
            conv1,
            bn1,
            relu: Relu::new(),
            maxpool,
            layer1,
            layer2,
            layer3,
            layer4,
            avgpool,
        }
    }

    /// `[batch, 3, height, width]` -> `[batch, features, 1, 1]`
    pub fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = self.conv1.forward(input);
        let x = self.bn1.forward(x);
        let x = self.relu.forward(x);
        let x = self.maxpool.forward(x);

        let x = self.layer1.forward(x);
        let x = self.layer2.forward(x);
        let x = self.layer3.forward(x);
        let x = self.layer4.forward(x);

        self.avgpool.forward(x)
    }

    /// Depth recovered from the block layout
    pub fn depth(&self) -> ResNetDepth {
        let bottleneck = self
            .layer1
            .blocks
            .first()
            .is_some_and(|block| block.conv3.is_some());

        match (bottleneck, self.layer3.len()) {
            (false, 2) => ResNetDepth::R18,
            (false, _) => ResNetDepth::R34,
            (true, 36) => ResNetDepth::R152,
            (true, _) => ResNetDepth::R50,
        }
    }

    /// Visit the learnable parameters of a single child
    pub fn visit_child(&self, child: BackboneChild, f: &mut dyn FnMut(ParamId, bool)) {
        match child {
            BackboneChild::Conv1 => self.conv1.visit_learnable(f),
            BackboneChild::Bn1 => self.bn1.visit_learnable(f),
            BackboneChild::Layer1 => self.layer1.visit_learnable(f),
            BackboneChild::Layer2 => self.layer2.visit_learnable(f),
            BackboneChild::Layer3 => self.layer3.visit_learnable(f),
            BackboneChild::Layer4 => self.layer4.visit_learnable(f),
            BackboneChild::Relu | BackboneChild::MaxPool | BackboneChild::AvgPool => {}
        }
    }

    /// Mark every learnable parameter of a single child as trainable or frozen
    pub fn set_child_trainable(mut self, child: BackboneChild, trainable: bool) -> Self {
        match child {
            BackboneChild::Conv1 => self.conv1 = self.conv1.set_trainable(trainable),
            BackboneChild::Bn1 => self.bn1 = self.bn1.set_trainable(trainable),
            BackboneChild::Layer1 => self.layer1 = self.layer1.set_trainable(trainable),
            BackboneChild::Layer2 => self.layer2 = self.layer2.set_trainable(trainable),
            BackboneChild::Layer3 => self.layer3 = self.layer3.set_trainable(trainable),
            BackboneChild::Layer4 => self.layer4 = self.layer4.set_trainable(trainable),
            BackboneChild::Relu | BackboneChild::MaxPool | BackboneChild::AvgPool => {}
        }
        self
    }

    /// Number of scalar values held by a child, running statistics included
    pub fn child_num_params(&self, child: BackboneChild) -> usize {
        match child {
            BackboneChild::Conv1 => self.conv1.num_params(),
            BackboneChild::Bn1 => self.bn1.num_params(),
            BackboneChild::Layer1 => self.layer1.num_params(),
            BackboneChild::Layer2 => self.layer2.num_params(),
            BackboneChild::Layer3 => self.layer3.num_params(),
            BackboneChild::Layer4 => self.layer4.num_params(),
            BackboneChild::Relu | BackboneChild::MaxPool | BackboneChild::AvgPool => 0,
        }
    }
}

impl<B: Backend> Learnable<B> for ResNetBackbone<B> {
    fn visit_learnable(&self, f: &mut dyn FnMut(ParamId, bool)) {
        for child in BackboneChild::ALL {
            self.visit_child(child, f);
        }
    }

    fn set_trainable(self, trainable: bool) -> Self {
        BackboneChild::ALL
            .into_iter()
            .fold(self, |backbone, child| backbone.set_child_trainable(child, trainable))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn_ndarray::NdArray;

    type TestBackend = NdArray;

    #[test]
    fn test_depth_from_usize() {
        for depth in SUPPORTED_DEPTHS {
            let parsed = ResNetDepth::try_from(depth).unwrap();
            assert_eq!(usize::from(parsed), depth);
        }

        let err = ResNetDepth::try_from(101).unwrap_err();
        assert!(matches!(err, Error::InvalidConfig(_)));
    }

    #[test]
    fn test_depth_layout() {
        assert_eq!(ResNetDepth::R18.num_features(), 512);
        assert_eq!(ResNetDepth::R34.num_features(), 512);
        assert_eq!(ResNetDepth::R50.num_features(), 2048);
        assert_eq!(ResNetDepth::R152.num_features(), 2048);
        assert_eq!(ResNetDepth::R152.blocks().iter().sum::<usize>(), 50);
        assert_eq!(ResNetDepth::R50.to_string(), "resnet50");
        assert!(ResNetDepth::R18.torchvision_url().ends_with("resnet18-f37072fd.pth"));
    }

    #[test]
    fn test_child_order() {
        for (index, child) in BackboneChild::ALL.iter().enumerate() {
            assert_eq!(child.index(), index);
        }
        assert_eq!(BackboneChild::Layer3.to_string(), "layer3");
    }

    #[test]
    fn test_stage_block_counts() {
        let device = Default::default();
        let backbone = ResNetBackbone::<TestBackend>::new(ResNetDepth::R34, &device);
        assert_eq!(backbone.layer1.len(), 3);
        assert_eq!(backbone.layer2.len(), 4);
        assert_eq!(backbone.layer3.len(), 6);
        assert_eq!(backbone.layer4.len(), 3);
        assert_eq!(backbone.depth(), ResNetDepth::R34);

        // Only the first block of a strided stage projects its shortcut
        assert!(backbone.layer1.blocks[0].downsample.is_none());
        assert!(backbone.layer2.blocks[0].downsample.is_some());
        assert!(backbone.layer2.blocks[1].downsample.is_none());
    }

    #[test]
    fn test_bottleneck_projects_first_stage() {
        let device = Default::default();
        let backbone = ResNetBackbone::<TestBackend>::new(ResNetDepth::R50, &device);
        assert!(backbone.layer1.blocks[0].downsample.is_some());
        assert!(backbone.layer1.blocks[0].conv3.is_some());
        assert_eq!(backbone.depth(), ResNetDepth::R50);
    }

    #[test]
    fn test_backbone_output_shape() {
        let device = Default::default();
        let backbone = ResNetBackbone::<TestBackend>::new(ResNetDepth::R18, &device);
        let input = Tensor::<TestBackend, 4>::zeros([2, 3, 32, 32], &device);

        let output = backbone.forward(input);
        assert_eq!(output.dims(), [2, 512, 1, 1]);
    }

    #[test]
    fn test_parameterless_children() {
        let device = Default::default();
        let backbone = ResNetBackbone::<TestBackend>::new(ResNetDepth::R18, &device);

        for child in [BackboneChild::Relu, BackboneChild::MaxPool, BackboneChild::AvgPool] {
            let mut count = 0;
            backbone.visit_child(child, &mut |_, _| count += 1);
            assert_eq!(count, 0);
            assert_eq!(backbone.child_num_params(child), 0);
        }

        // conv1 weight only, no bias
        let mut count = 0;
        backbone.visit_child(BackboneChild::Conv1, &mut |_, _| count += 1);
        assert_eq!(count, 1);
        assert_eq!(backbone.child_num_params(BackboneChild::Conv1), 64 * 3 * 7 * 7);
    }
}
