//! Transfer-learning classifier: pretrained ResNet backbone plus a fresh linear head.

use std::path::{Path, PathBuf};

use burn::{
    config::Config,
    module::{Module, ParamId},
    nn::{Linear, LinearConfig},
    tensor::{activation::softmax, backend::Backend, Tensor},
};
use pretrain_core::{Error, ModelSettings};
use tracing::{debug, info};

use crate::freeze::{Learnable, ParamPartition};
use crate::resnet::{BackboneChild, ResNetBackbone, ResNetDepth};

/// Configuration for a [`TransferClassifier`]
#[derive(Config, Debug)]
pub struct TransferClassifierConfig {
    /// Backbone depth (18, 34, 50 or 152)
    pub depth: usize,
    /// Number of output classes
    pub num_classes: usize,
    /// Torchvision checkpoint used to initialise the backbone
    pub weights: Option<PathBuf>,
}

impl TransferClassifierConfig {
    pub fn from_settings(settings: &ModelSettings) -> Self {
        Self::new(settings.depth, settings.num_classes).with_weights(settings.weights.clone())
    }

    /// Build the classifier, loading pretrained backbone weights when configured
    pub fn init<B: Backend>(
        &self,
        device: &B::Device,
    ) -> pretrain_core::Result<TransferClassifier<B>> {
        let model = TransferClassifier::new(self.depth, self.num_classes, device)?;

        match &self.weights {
            Some(path) => model.load_pretrained(path, device),
            None => Ok(model),
        }
    }
}

/// ResNet backbone without its final classification layer, followed by a new
/// `Linear(num_features, num_classes)` head.
#[derive(Module, Debug)]
pub struct TransferClassifier<B: Backend> {
    shared: ResNetBackbone<B>,
    target: Linear<B>,
    num_classes: usize,
}

impl<B: Backend> TransferClassifier<B> {
    /// Create a randomly initialised classifier.
    ///
    /// Fails for depths other than 18, 34, 50 and 152, and for zero classes.
    pub fn new(
        depth: usize,
        num_classes: usize,
        device: &B::Device,
    ) -> pretrain_core::Result<Self> {
        let depth = ResNetDepth::try_from(depth)?;
        if num_classes == 0 {
            return Err(Error::invalid_config("num_classes must be greater than 0"));
        }

        let shared = ResNetBackbone::new(depth, device);
        let target = LinearConfig::new(depth.num_features(), num_classes).init(device);

        debug!(
            "Created {} classifier: {} features -> {} classes",
            depth,
            depth.num_features(),
            num_classes
        );

        Ok(Self {
            shared,
            target,
            num_classes,
        })
    }

    /// Load torchvision ImageNet weights into the backbone; the head stays fresh
    pub fn load_pretrained(
        mut self,
        path: &Path,
        device: &B::Device,
    ) -> pretrain_core::Result<Self> {
        let depth = self.depth();
        self.shared = self.shared.load_torchvision_weights(path, depth, device)?;
        Ok(self)
    }

    /// `[batch, 3, height, width]` -> logits `[batch, num_classes]`
    pub fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 2> {
        let features = self.features(input);
        self.target.forward(features)
    }

    /// Pooled backbone features, `[batch, num_features]`
    pub fn features(&self, input: Tensor<B, 4>) -> Tensor<B, 2> {
        let x = self.shared.forward(input);
        let [batch, channels, _, _] = x.dims();
        // Only the two pooled spatial dims are dropped, a batch of one stays 2-D
        x.reshape([batch, channels])
    }

    /// Forward pass with class probabilities
    pub fn predict(&self, input: Tensor<B, 4>) -> Tensor<B, 2> {
        softmax(self.forward(input), 1)
    }

    /// Freeze every backbone child whose index is `<= frozen_layer` and unfreeze
    /// the rest. The head is left as is.
    ///
    /// Each call re-derives the whole backbone partition, so calling it again
    /// with a smaller threshold unfreezes children frozen earlier.
    pub fn frozen_until(mut self, frozen_layer: usize) -> Self {
        for child in BackboneChild::ALL {
            let freeze = child.index() <= frozen_layer;
            if freeze {
                debug!("Freezing {} ({})", child, child.index());
            } else {
                debug!("Unfreezing {} ({})", child, child.index());
            }
            self.shared = self.shared.set_child_trainable(child, !freeze);
        }

        let partition = self.partition();
        info!(
            "Frozen backbone children 0..={}: {} trainable / {} frozen parameter tensors",
            frozen_layer,
            partition.trainable().len(),
            partition.frozen().len()
        );

        self
    }

    /// Current trainable/frozen split of every learnable parameter
    pub fn partition(&self) -> ParamPartition {
        ParamPartition::of(self)
    }

    /// Per-child view of the freezing state, in backbone order
    pub fn child_summaries(&self) -> Vec<ChildSummary> {
        BackboneChild::ALL
            .into_iter()
            .map(|child| {
                let mut summary = ChildSummary {
                    child,
                    num_params: self.shared.child_num_params(child),
                    trainable: 0,
                    frozen: 0,
                };
                self.shared.visit_child(child, &mut |_, require_grad| {
                    if require_grad {
                        summary.trainable += 1;
                    } else {
                        summary.frozen += 1;
                    }
                });
                summary
            })
            .collect()
    }

    /// Ids of the head parameters
    pub fn head_ids(&self) -> Vec<ParamId> {
        self.target.learnable_ids()
    }

    pub fn backbone(&self) -> &ResNetBackbone<B> {
        &self.shared
    }

    pub fn head(&self) -> &Linear<B> {
        &self.target
    }

    /// `[in_features, out_features]` of the head
    pub fn head_dims(&self) -> [usize; 2] {
        self.target.weight.val().dims()
    }

    pub fn num_classes(&self) -> usize {
        self.num_classes
    }

    pub fn num_features(&self) -> usize {
        self.head_dims()[0]
    }

    pub fn depth(&self) -> ResNetDepth {
        self.shared.depth()
    }
}

impl<B: Backend> Learnable<B> for TransferClassifier<B> {
    fn visit_learnable(&self, f: &mut dyn FnMut(ParamId, bool)) {
        self.shared.visit_learnable(f);
        self.target.visit_learnable(f);
    }

    fn set_trainable(mut self, trainable: bool) -> Self {
        self.shared = self.shared.set_trainable(trainable);
        self.target = self.target.set_trainable(trainable);
        self
    }
}

/// Freezing state of one backbone child
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChildSummary {
    pub child: BackboneChild,
    /// Scalar values held by the child, running statistics included
    pub num_params: usize,
    /// Learnable tensors requiring gradients
    pub trainable: usize,
    /// Learnable tensors not requiring gradients
    pub frozen: usize,
}

impl ChildSummary {
    pub fn is_frozen(&self) -> bool {
        self.trainable == 0 && self.frozen > 0
    }
}
