use burn::{
    nn::{
        pool::{AdaptiveAvgPool2d, AdaptiveAvgPool2dConfig},
        Dropout, DropoutConfig,
    },
    prelude::*,
    tensor::{
        module::interpolate,
        ops::{InterpolateMode, InterpolateOptions},
    },
};

use super::conv_bn_relu::{ConvBnRelu, ConvBnReluConfig};
use crate::{
    state::{join, StateDict, StateDictModule, StateLayout},
    FfnError,
};

/// Image-level branch: global average pooling, 1x1 conv, then broadcast back
/// to the input resolution.
#[derive(Module, Debug)]
pub struct AsppPooling<B: Backend> {
    pool: AdaptiveAvgPool2d,
    conv: ConvBnRelu<B>,
}

impl<B: Backend> AsppPooling<B> {
    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let [_, _, height, width] = x.dims();
        let x = self.conv.forward(self.pool.forward(x));

        interpolate(
            x,
            [height, width],
            InterpolateOptions::new(InterpolateMode::Bilinear),
        )
    }
}

/// Atrous spatial pyramid pooling.
/// Derived from torchvision.models.segmentation.deeplabv3.ASPP
#[derive(Module, Debug)]
pub struct Aspp<B: Backend> {
    convs: Vec<ConvBnRelu<B>>,
    pooling: AsppPooling<B>,
    project: ConvBnRelu<B>,
    dropout: Dropout,
}

impl<B: Backend> Aspp<B> {
    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let mut branches: Vec<_> = self
            .convs
            .iter()
            .map(|conv| conv.forward(x.clone()))
            .collect();
        branches.push(self.pooling.forward(x));

        let x = self.project.forward(Tensor::cat(branches, 1));
        self.dropout.forward(x)
    }
}

// torch: `convs.{0..n}` for the conv branches, `convs.{n+1}` for the pooling
// branch (pool at index 0, conv at 1), `project.0`/`project.1`.
impl<B: Backend> StateDictModule for Aspp<B> {
    fn layout(&self, prefix: &str, layout: &mut StateLayout) {
        let convs = join(prefix, "convs");
        for (idx, conv) in self.convs.iter().enumerate() {
            conv.layout_at(&join(&convs, &idx.to_string()), 0, layout);
        }
        let pooling = join(&convs, &self.convs.len().to_string());
        self.pooling.conv.layout_at(&pooling, 1, layout);
        self.project.layout_at(&join(prefix, "project"), 0, layout);
    }

    fn load_state(self, prefix: &str, state: &StateDict) -> Result<Self, FfnError> {
        let convs_prefix = join(prefix, "convs");
        let pooling_prefix = join(&convs_prefix, &self.convs.len().to_string());

        let convs = self
            .convs
            .into_iter()
            .enumerate()
            .map(|(idx, conv)| conv.load_state_at(&join(&convs_prefix, &idx.to_string()), 0, state))
            .collect::<Result<_, _>>()?;

        Ok(Self {
            convs,
            pooling: AsppPooling {
                pool: self.pooling.pool,
                conv: self.pooling.conv.load_state_at(&pooling_prefix, 1, state)?,
            },
            project: self.project.load_state_at(&join(prefix, "project"), 0, state)?,
            dropout: self.dropout,
        })
    }
}

#[derive(Config, Debug)]
pub struct AsppConfig {
    in_channels: usize,
    #[config(default = "[12, 24, 36]")]
    atrous_rates: [usize; 3],
    #[config(default = 256)]
    out_channels: usize,
    #[config(default = 0.5)]
    dropout: f64,
}

impl AsppConfig {
    pub fn init<B: Backend>(&self, device: &Device<B>) -> Aspp<B> {
        let out = self.out_channels;

        let convs = std::iter::once(ConvBnReluConfig::new(self.in_channels, out).init(device))
            .chain(self.atrous_rates.iter().map(|&rate| {
                ConvBnReluConfig::new(self.in_channels, out)
                    .with_kernel_size(3)
                    .with_dilation(rate)
                    .init(device)
            }))
            .collect::<Vec<_>>();

        let pooling = AsppPooling {
            pool: AdaptiveAvgPool2dConfig::new([1, 1]).init(),
            conv: ConvBnReluConfig::new(self.in_channels, out).init(device),
        };

        let project = ConvBnReluConfig::new((convs.len() + 1) * out, out).init(device);

        Aspp {
            convs,
            pooling,
            project,
            dropout: DropoutConfig::new(self.dropout).init(),
        }
    }
}
