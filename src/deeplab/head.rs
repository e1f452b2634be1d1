use burn::{
    nn::{
        conv::{Conv2d, Conv2dConfig},
        Dropout, DropoutConfig,
    },
    prelude::*,
};

use super::{
    aspp::{Aspp, AsppConfig},
    conv_bn_relu::{ConvBnRelu, ConvBnReluConfig},
};
use crate::{
    state::{join, StateDict, StateDictModule, StateLayout},
    FfnError,
};

/// Main DeepLabV3 classifier: ASPP, a 3x3 refinement conv, then per-pixel logits.
///
/// torch layout: `0` ASPP, `1`/`2` conv and batch norm, `3` ReLU, `4` logits.
#[derive(Module, Debug)]
pub struct DeepLabHead<B: Backend> {
    aspp: Aspp<B>,
    refine: ConvBnRelu<B>,
    logits: Conv2d<B>,
}

impl<B: Backend> DeepLabHead<B> {
    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = self.aspp.forward(x);
        let x = self.refine.forward(x);
        self.logits.forward(x)
    }
}

impl<B: Backend> StateDictModule for DeepLabHead<B> {
    fn layout(&self, prefix: &str, layout: &mut StateLayout) {
        self.aspp.layout(&join(prefix, "0"), layout);
        self.refine.layout_at(prefix, 1, layout);
        self.logits.layout(&join(prefix, "4"), layout);
    }

    fn load_state(self, prefix: &str, state: &StateDict) -> Result<Self, FfnError> {
        Ok(Self {
            aspp: self.aspp.load_state(&join(prefix, "0"), state)?,
            refine: self.refine.load_state_at(prefix, 1, state)?,
            logits: self.logits.load_state(&join(prefix, "4"), state)?,
        })
    }
}

#[derive(Config, Debug)]
pub struct DeepLabHeadConfig {
    in_channels: usize,
    num_classes: usize,
    #[config(default = "[12, 24, 36]")]
    atrous_rates: [usize; 3],
}

impl DeepLabHeadConfig {
    pub fn init<B: Backend>(&self, device: &Device<B>) -> DeepLabHead<B> {
        DeepLabHead {
            aspp: AsppConfig::new(self.in_channels)
                .with_atrous_rates(self.atrous_rates)
                .init(device),
            refine: ConvBnReluConfig::new(256, 256)
                .with_kernel_size(3)
                .init(device),
            logits: Conv2dConfig::new([256, self.num_classes], [1, 1]).init(device),
        }
    }
}

/// Auxiliary FCN classifier applied to the `layer3` features.
///
/// torch layout: `0`/`1` conv and batch norm, `2` ReLU, `3` dropout, `4` logits.
#[derive(Module, Debug)]
pub struct FcnHead<B: Backend> {
    conv: ConvBnRelu<B>,
    dropout: Dropout,
    logits: Conv2d<B>,
}

impl<B: Backend> FcnHead<B> {
    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = self.conv.forward(x);
        let x = self.dropout.forward(x);
        self.logits.forward(x)
    }
}

impl<B: Backend> StateDictModule for FcnHead<B> {
    fn layout(&self, prefix: &str, layout: &mut StateLayout) {
        self.conv.layout_at(prefix, 0, layout);
        self.logits.layout(&join(prefix, "4"), layout);
    }

    fn load_state(self, prefix: &str, state: &StateDict) -> Result<Self, FfnError> {
        Ok(Self {
            conv: self.conv.load_state_at(prefix, 0, state)?,
            dropout: self.dropout,
            logits: self.logits.load_state(&join(prefix, "4"), state)?,
        })
    }
}

#[derive(Config, Debug)]
pub struct FcnHeadConfig {
    in_channels: usize,
    num_classes: usize,
}

impl FcnHeadConfig {
    pub fn init<B: Backend>(&self, device: &Device<B>) -> FcnHead<B> {
        let inter_channels = self.in_channels / 4;

        FcnHead {
            conv: ConvBnReluConfig::new(self.in_channels, inter_channels)
                .with_kernel_size(3)
                .init(device),
            dropout: DropoutConfig::new(0.1).init(),
            logits: Conv2dConfig::new([inter_channels, self.num_classes], [1, 1]).init(device),
        }
    }
}
