//! Trainable/frozen bookkeeping for learnable parameters.
//!
//! Only `Param` tensors count as learnable. BatchNorm running statistics are
//! module state, not parameters, and are never touched by freezing.

use burn::{
    module::{Param, ParamId},
    nn::{
        conv::{Conv2d, ConvTranspose2d},
        BatchNorm, Linear,
    },
    tensor::{backend::Backend, Tensor},
};

/// Access to the learnable parameters of a module and their gradient requirement.
pub trait Learnable<B: Backend>: Sized {
    /// Calls `f` with the id of every learnable parameter and whether it currently
    /// requires gradients.
    fn visit_learnable(&self, f: &mut dyn FnMut(ParamId, bool));

    /// Marks every learnable parameter as trainable or frozen.
    fn set_trainable(self, trainable: bool) -> Self;

    /// Ids of every learnable parameter, in definition order.
    fn learnable_ids(&self) -> Vec<ParamId> {
        let mut ids = Vec::new();
        self.visit_learnable(&mut |id, _| ids.push(id));
        ids
    }

    /// Number of learnable parameter tensors.
    fn num_learnable(&self) -> usize {
        let mut count = 0;
        self.visit_learnable(&mut |_, _| count += 1);
        count
    }
}

fn visit_param<B: Backend, const D: usize>(
    param: &Param<Tensor<B, D>>,
    f: &mut dyn FnMut(ParamId, bool),
) {
    f(param.id.clone(), param.val().is_require_grad());
}

fn visit_optional<B: Backend, const D: usize>(
    param: &Option<Param<Tensor<B, D>>>,
    f: &mut dyn FnMut(ParamId, bool),
) {
    if let Some(param) = param {
        visit_param(param, f);
    }
}

impl<B: Backend> Learnable<B> for Conv2d<B> {
    fn visit_learnable(&self, f: &mut dyn FnMut(ParamId, bool)) {
        visit_param(&self.weight, f);
        visit_optional(&self.bias, f);
    }

    fn set_trainable(mut self, trainable: bool) -> Self {
        self.weight = self.weight.set_require_grad(trainable);
        self.bias = self.bias.map(|bias| bias.set_require_grad(trainable));
        self
    }
}

impl<B: Backend> Learnable<B> for ConvTranspose2d<B> {
    fn visit_learnable(&self, f: &mut dyn FnMut(ParamId, bool)) {
        visit_param(&self.weight, f);
        visit_optional(&self.bias, f);
    }

    fn set_trainable(mut self, trainable: bool) -> Self {
        self.weight = self.weight.set_require_grad(trainable);
        self.bias = self.bias.map(|bias| bias.set_require_grad(trainable));
        self
    }
}

impl<B: Backend> Learnable<B> for BatchNorm<B, 2> {
    fn visit_learnable(&self, f: &mut dyn FnMut(ParamId, bool)) {
        visit_param(&self.gamma, f);
        visit_param(&self.beta, f);
    }

    fn set_trainable(mut self, trainable: bool) -> Self {
        self.gamma = self.gamma.set_require_grad(trainable);
        self.beta = self.beta.set_require_grad(trainable);
        self
    }
}

impl<B: Backend> Learnable<B> for Linear<B> {
    fn visit_learnable(&self, f: &mut dyn FnMut(ParamId, bool)) {
        visit_param(&self.weight, f);
        visit_optional(&self.bias, f);
    }

    fn set_trainable(mut self, trainable: bool) -> Self {
        self.weight = self.weight.set_require_grad(trainable);
        self.bias = self.bias.map(|bias| bias.set_require_grad(trainable));
        self
    }
}

impl<B: Backend, M: Learnable<B>> Learnable<B> for Option<M> {
    fn visit_learnable(&self, f: &mut dyn FnMut(ParamId, bool)) {
        if let Some(module) = self {
            module.visit_learnable(f);
        }
    }

    fn set_trainable(self, trainable: bool) -> Self {
        self.map(|module| module.set_trainable(trainable))
    }
}

impl<B: Backend, M: Learnable<B>> Learnable<B> for Vec<M> {
    fn visit_learnable(&self, f: &mut dyn FnMut(ParamId, bool)) {
        for module in self {
            module.visit_learnable(f);
        }
    }

    fn set_trainable(self, trainable: bool) -> Self {
        self.into_iter()
            .map(|module| module.set_trainable(trainable))
            .collect()
    }
}

/// Disjoint split of a model's learnable parameters into trainable and frozen ids.
#[derive(Debug, Clone, Default)]
pub struct ParamPartition {
    trainable: Vec<ParamId>,
    frozen: Vec<ParamId>,
}

impl ParamPartition {
    /// Build the partition from the current gradient requirement of each parameter.
    pub fn of<B: Backend, M: Learnable<B>>(module: &M) -> Self {
        let mut partition = Self::default();
        module.visit_learnable(&mut |id, require_grad| partition.insert(id, require_grad));
        partition
    }

    fn insert(&mut self, id: ParamId, trainable: bool) {
        if trainable {
            self.trainable.push(id);
        } else {
            self.frozen.push(id);
        }
    }

    /// Parameters updated by the optimizer
    pub fn trainable(&self) -> &[ParamId] {
        &self.trainable
    }

    /// Parameters skipped by the optimizer
    pub fn frozen(&self) -> &[ParamId] {
        &self.frozen
    }

    pub fn is_trainable(&self, id: &ParamId) -> bool {
        self.trainable.contains(id)
    }

    pub fn is_frozen(&self, id: &ParamId) -> bool {
        self.frozen.contains(id)
    }

    /// Total number of learnable parameters covered
    pub fn len(&self) -> usize {
        self.trainable.len() + self.frozen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::Autodiff;
    use burn::nn::{conv::Conv2dConfig, BatchNormConfig, LinearConfig};
    use burn_ndarray::NdArray;

    type TestBackend = Autodiff<NdArray>;

    #[test]
    fn test_conv_learnable_ids() {
        let device = Default::default();
        let conv: Conv2d<TestBackend> = Conv2dConfig::new([3, 8], [3, 3]).init(&device);
        assert_eq!(conv.num_learnable(), 2);

        let conv: Conv2d<TestBackend> = Conv2dConfig::new([3, 8], [3, 3])
            .with_bias(false)
            .init(&device);
        assert_eq!(conv.num_learnable(), 1);
    }

    #[test]
    fn test_batch_norm_excludes_running_stats() {
        let device = Default::default();
        let bn: BatchNorm<TestBackend, 2> = BatchNormConfig::new(16).init(&device);
        assert_eq!(bn.num_learnable(), 2);
    }

    #[test]
    fn test_set_trainable_round_trip() {
        let device = Default::default();
        let linear: Linear<TestBackend> = LinearConfig::new(4, 2).init(&device);

        let partition = ParamPartition::of(&linear);
        assert_eq!(partition.trainable().len(), 2);
        assert!(partition.frozen().is_empty());

        let linear = linear.set_trainable(false);
        let partition = ParamPartition::of(&linear);
        assert!(partition.trainable().is_empty());
        assert_eq!(partition.frozen().len(), 2);

        let linear = linear.set_trainable(true);
        let partition = ParamPartition::of(&linear);
        assert_eq!(partition.trainable().len(), 2);
        assert_eq!(partition.len(), 2);
    }

    #[test]
    fn test_partition_is_disjoint() {
        let device = Default::default();
        let frozen: Linear<TestBackend> = LinearConfig::new(4, 4).init(&device);
        let trainable: Linear<TestBackend> = LinearConfig::new(4, 2).init(&device);
        let modules = vec![frozen.set_trainable(false), trainable];

        let partition = ParamPartition::of(&modules);
        assert_eq!(partition.len(), 4);
        for id in partition.trainable() {
            assert!(!partition.is_frozen(id));
        }
        for id in partition.frozen() {
            assert!(!partition.is_trainable(id));
        }
    }
}
