//! Optimizer construction scoped to the trainable parameters of a model.

use burn::{
    module::{AutodiffModule, ParamId},
    optim::{
        decay::WeightDecayConfig, momentum::MomentumConfig, AdamConfig, GradientsParams,
        Optimizer, SgdConfig,
    },
    tensor::backend::AutodiffBackend,
};
use pretrain_core::{OptimizerKind, Result, TrainingArgs, SGD_MOMENTUM};
use tracing::info;

use crate::classifier::TransferClassifier;

/// Object-safe view of a Burn optimizer for a fixed module type.
pub trait ModuleOptimizer<B: AutodiffBackend, M: AutodiffModule<B>> {
    /// Apply one update to every parameter present in `grads`
    fn step(&mut self, lr: f64, module: M, grads: GradientsParams) -> M;
}

impl<B, M, O> ModuleOptimizer<B, M> for O
where
    B: AutodiffBackend,
    M: AutodiffModule<B>,
    O: Optimizer<M, B>,
{
    fn step(&mut self, lr: f64, module: M, grads: GradientsParams) -> M {
        Optimizer::step(self, lr, module, grads)
    }
}

/// Optimizer algorithm and its hyperparameters
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum OptimizerSpec {
    /// Adam with L2 weight decay
    Adam { weight_decay: f64 },
    /// SGD with L2 weight decay and classical momentum (no dampening)
    Sgd { weight_decay: f64, momentum: f64 },
}

impl OptimizerSpec {
    pub fn from_args(args: &TrainingArgs) -> Result<Self> {
        args.validate()?;

        let weight_decay = args.weight_decay;
        Ok(match args.optim {
            OptimizerKind::Adam => OptimizerSpec::Adam { weight_decay },
            OptimizerKind::Sgd => OptimizerSpec::Sgd {
                weight_decay,
                momentum: SGD_MOMENTUM,
            },
        })
    }

    pub fn kind(&self) -> OptimizerKind {
        match self {
            OptimizerSpec::Adam { .. } => OptimizerKind::Adam,
            OptimizerSpec::Sgd { .. } => OptimizerKind::Sgd,
        }
    }

    /// Build the Burn optimizer for module type `M`
    pub fn init<B, M>(&self) -> Box<dyn ModuleOptimizer<B, M>>
    where
        B: AutodiffBackend,
        M: AutodiffModule<B> + 'static,
    {
        match *self {
            OptimizerSpec::Adam { weight_decay } => Box::new(
                AdamConfig::new()
                    .with_weight_decay(Some(WeightDecayConfig::new(weight_decay)))
                    .init::<B, M>(),
            ),
            OptimizerSpec::Sgd {
                weight_decay,
                momentum,
            } => Box::new(
                SgdConfig::new()
                    .with_weight_decay(Some(WeightDecayConfig::new(weight_decay)))
                    .with_momentum(Some(
                        MomentumConfig::new()
                            .with_momentum(momentum)
                            .with_dampening(0.0),
                    ))
                    .init::<B, M>(),
            ),
        }
    }
}

impl std::fmt::Display for OptimizerSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OptimizerSpec::Adam { weight_decay } => write!(f, "adam(weight_decay={weight_decay})"),
            OptimizerSpec::Sgd {
                weight_decay,
                momentum,
            } => write!(f, "sgd(weight_decay={weight_decay}, momentum={momentum})"),
        }
    }
}

/// Optimizer that only ever updates a fixed set of parameters.
pub struct FineTuneOptimizer<B: AutodiffBackend, M: AutodiffModule<B>> {
    inner: Box<dyn ModuleOptimizer<B, M>>,
    spec: OptimizerSpec,
    learning_rate: f64,
    trainable: Vec<ParamId>,
}

impl<B, M> FineTuneOptimizer<B, M>
where
    B: AutodiffBackend,
    M: AutodiffModule<B> + 'static,
{
    pub fn new(spec: OptimizerSpec, learning_rate: f64, trainable: Vec<ParamId>) -> Self {
        Self {
            inner: spec.init::<B, M>(),
            spec,
            learning_rate,
            trainable,
        }
    }

    /// Apply one update using the gradients of the scoped parameters only
    pub fn step(&mut self, model: M, mut grads: B::Gradients) -> M {
        let grads = GradientsParams::from_params(&mut grads, &model, &self.trainable);
        self.inner.step(self.learning_rate, model, grads)
    }

    /// Parameters this optimizer updates
    pub fn trainable_ids(&self) -> &[ParamId] {
        &self.trainable
    }

    pub fn spec(&self) -> OptimizerSpec {
        self.spec
    }

    pub fn learning_rate(&self) -> f64 {
        self.learning_rate
    }
}

impl<B: AutodiffBackend, M: AutodiffModule<B>> std::fmt::Debug for FineTuneOptimizer<B, M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FineTuneOptimizer")
            .field("spec", &self.spec)
            .field("learning_rate", &self.learning_rate)
            .field("num_trainable", &self.trainable.len())
            .finish()
    }
}

/// Freeze the backbone up to `args.frozen_until` and build an optimizer over
/// the parameters left trainable.
pub fn net_frozen<B: AutodiffBackend>(
    args: &TrainingArgs,
    model: TransferClassifier<B>,
) -> Result<(
    TransferClassifier<B>,
    FineTuneOptimizer<B, TransferClassifier<B>>,
)> {
    let spec = OptimizerSpec::from_args(args)?;

    let model = model.frozen_until(args.frozen_until);
    let partition = model.partition();

    info!(
        "Optimizer {} with lr {} over {} of {} parameter tensors",
        spec,
        args.lr,
        partition.trainable().len(),
        partition.len()
    );

    let optimizer = FineTuneOptimizer::new(spec, args.lr, partition.trainable().to_vec());
    Ok((model, optimizer))
}
