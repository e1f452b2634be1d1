use burn::{
    nn::{conv::Conv2d, pool::MaxPool2d, BatchNorm, Relu},
    prelude::*,
};

use crate::resnet::LayerBlock;

#[derive(Module, Debug)]
pub enum StemLayer<B: Backend> {
    Conv(Conv2d<B>),
    BatchNorm(BatchNorm<B, 2>),
    Relu(Relu),
    MaxPool(MaxPool2d),
    Residual(LayerBlock<B>),
}

impl<B: Backend> StemLayer<B> {
    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        match self {
            Self::Conv(conv) => conv.forward(x),
            Self::BatchNorm(bn) => bn.forward(x),
            Self::Relu(relu) => relu.forward(x),
            Self::MaxPool(pool) => pool.forward(x),
            Self::Residual(layer) => layer.forward(x),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Conv(_) => "conv1",
            Self::BatchNorm(_) => "bn1",
            Self::Relu(_) => "relu",
            Self::MaxPool(_) => "maxpool",
            Self::Residual(_) => "layer1",
        }
    }
}

/// The first ResNet stage of a segmentation backbone, run as a plain sequence.
///
/// Output: 256 channels at a quarter of the input resolution.
#[derive(Module, Debug)]
pub struct FeatureStem<B: Backend> {
    layers: Vec<StemLayer<B>>,
}

impl<B: Backend> FeatureStem<B> {
    pub fn new(
        conv1: Conv2d<B>,
        bn1: BatchNorm<B, 2>,
        relu: Relu,
        maxpool: MaxPool2d,
        layer1: LayerBlock<B>,
    ) -> Self {
        Self {
            layers: vec![
                StemLayer::Conv(conv1),
                StemLayer::BatchNorm(bn1),
                StemLayer::Relu(relu),
                StemLayer::MaxPool(maxpool),
                StemLayer::Residual(layer1),
            ],
        }
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        self.layers.iter().fold(x, |x, layer| layer.forward(x))
    }

    pub fn layers(&self) -> &[StemLayer<B>] {
        &self.layers
    }

    pub fn stage_names(&self) -> Vec<&'static str> {
        self.layers.iter().map(StemLayer::name).collect()
    }
}
