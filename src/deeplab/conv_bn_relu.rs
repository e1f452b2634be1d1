use burn::{
    nn::{
        conv::{Conv2d, Conv2dConfig},
        BatchNorm, BatchNormConfig, PaddingConfig2d, Relu,
    },
    prelude::*,
};

use crate::{
    state::{join, StateDict, StateDictModule, StateLayout},
    FfnError,
};

/// Bias-free convolution followed by batch norm and ReLU.
#[derive(Module, Debug)]
pub struct ConvBnRelu<B: Backend> {
    conv: Conv2d<B>,
    batchnorm: BatchNorm<B, 2>,
    relu: Relu,
}

impl<B: Backend> ConvBnRelu<B> {
    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = self.conv.forward(x);
        let x = self.batchnorm.forward(x);
        self.relu.forward(x)
    }

    /// torch keeps these layers inside an `nn.Sequential`, so the conv lives
    /// at `{prefix}.{index}` and the batch norm right after it.
    pub fn layout_at(&self, prefix: &str, index: usize, layout: &mut StateLayout) {
        self.conv.layout(&join(prefix, &index.to_string()), layout);
        self.batchnorm
            .layout(&join(prefix, &(index + 1).to_string()), layout);
    }

    pub fn load_state_at(
        self,
        prefix: &str,
        index: usize,
        state: &StateDict,
    ) -> Result<Self, FfnError> {
        Ok(Self {
            conv: self
                .conv
                .load_state(&join(prefix, &index.to_string()), state)?,
            batchnorm: self
                .batchnorm
                .load_state(&join(prefix, &(index + 1).to_string()), state)?,
            relu: self.relu,
        })
    }
}

#[derive(Config, Debug)]
pub struct ConvBnReluConfig {
    in_channels: usize,
    out_channels: usize,
    #[config(default = 1)]
    kernel_size: usize,
    #[config(default = 1)]
    dilation: usize,
}

impl ConvBnReluConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> ConvBnRelu<B> {
        let padding = self.dilation * (self.kernel_size / 2);

        ConvBnRelu {
            conv: Conv2dConfig::new(
                [self.in_channels, self.out_channels],
                [self.kernel_size, self.kernel_size],
            )
            .with_dilation([self.dilation, self.dilation])
            .with_padding(PaddingConfig2d::Explicit(padding, padding))
            .with_bias(false)
            .init(device),
            batchnorm: BatchNormConfig::new(self.out_channels).init(device),
            relu: Relu::new(),
        }
    }
}
