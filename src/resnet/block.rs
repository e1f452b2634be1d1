use core::f64::consts::SQRT_2;

use burn::{
    nn::{
        conv::{Conv2d, Conv2dConfig},
        BatchNorm, BatchNormConfig, Initializer, PaddingConfig2d, Relu,
    },
    prelude::*,
};

use crate::{
    state::{join, StateDict, StateDictModule, StateLayout},
    FfnError,
};

const EXPANSION: usize = 4;

fn kaiming() -> Initializer {
    Initializer::KaimingNormal {
        gain: SQRT_2, // recommended value for ReLU
        fan_out_only: true,
    }
}

/// ResNet bottleneck residual block.
/// Derived from torchvision.models.resnet.Bottleneck
///
/// The stride sits on the 3x3 convolution (ResNet V1.5). That same
/// convolution carries the dilation used by DeepLab's later stages.
#[derive(Module, Debug)]
pub struct Bottleneck<B: Backend> {
    conv1: Conv2d<B>,
    bn1: BatchNorm<B, 2>,
    relu: Relu,
    conv2: Conv2d<B>,
    bn2: BatchNorm<B, 2>,
    conv3: Conv2d<B>,
    bn3: BatchNorm<B, 2>,
    downsample: Option<Downsample<B>>,
}

impl<B: Backend> Bottleneck<B> {
    pub fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        let identity = input.clone();

        // Conv block
        let out = self.conv1.forward(input);
        let out = self.bn1.forward(out);
        let out = self.relu.forward(out);
        let out = self.conv2.forward(out);
        let out = self.bn2.forward(out);
        let out = self.relu.forward(out);
        let out = self.conv3.forward(out);
        let out = self.bn3.forward(out);

        // Skip connection
        let out = match &self.downsample {
            Some(downsample) => out + downsample.forward(identity),
            None => out + identity,
        };

        self.relu.forward(out)
    }
}

impl<B: Backend> StateDictModule for Bottleneck<B> {
    fn layout(&self, prefix: &str, layout: &mut StateLayout) {
        self.conv1.layout(&join(prefix, "conv1"), layout);
        self.bn1.layout(&join(prefix, "bn1"), layout);
        self.conv2.layout(&join(prefix, "conv2"), layout);
        self.bn2.layout(&join(prefix, "bn2"), layout);
        self.conv3.layout(&join(prefix, "conv3"), layout);
        self.bn3.layout(&join(prefix, "bn3"), layout);
        if let Some(downsample) = &self.downsample {
            downsample.layout(&join(prefix, "downsample"), layout);
        }
    }

    fn load_state(self, prefix: &str, state: &StateDict) -> Result<Self, FfnError> {
        Ok(Self {
            conv1: self.conv1.load_state(&join(prefix, "conv1"), state)?,
            bn1: self.bn1.load_state(&join(prefix, "bn1"), state)?,
            relu: self.relu,
            conv2: self.conv2.load_state(&join(prefix, "conv2"), state)?,
            bn2: self.bn2.load_state(&join(prefix, "bn2"), state)?,
            conv3: self.conv3.load_state(&join(prefix, "conv3"), state)?,
            bn3: self.bn3.load_state(&join(prefix, "bn3"), state)?,
            downsample: match self.downsample {
                Some(downsample) => {
                    Some(downsample.load_state(&join(prefix, "downsample"), state)?)
                }
                None => None,
            },
        })
    }
}

#[derive(Config, Debug)]
pub struct BottleneckConfig {
    in_channels: usize,
    out_channels: usize,
    #[config(default = 1)]
    stride: usize,
    #[config(default = 1)]
    dilation: usize,
}

impl BottleneckConfig {
    pub fn init<B: Backend>(&self, device: &Device<B>) -> Bottleneck<B> {
        // Intermediate output channels w/ expansion = 4
        let width = self.out_channels / EXPANSION;

        // conv1x1
        let conv1 = Conv2dConfig::new([self.in_channels, width], [1, 1])
            .with_bias(false)
            .with_initializer(kaiming())
            .init(device);

        // conv3x3, padding follows the dilation so the resolution only depends on the stride
        let conv2 = Conv2dConfig::new([width, width], [3, 3])
            .with_stride([self.stride, self.stride])
            .with_dilation([self.dilation, self.dilation])
            .with_padding(PaddingConfig2d::Explicit(self.dilation, self.dilation))
            .with_bias(false)
            .with_initializer(kaiming())
            .init(device);

        // conv1x1
        let conv3 = Conv2dConfig::new([width, self.out_channels], [1, 1])
            .with_bias(false)
            .with_initializer(kaiming())
            .init(device);

        let downsample = (self.stride != 1 || self.in_channels != self.out_channels).then(|| {
            DownsampleConfig::new(self.in_channels, self.out_channels, self.stride).init(device)
        });

        Bottleneck {
            conv1,
            bn1: BatchNormConfig::new(width).init(device),
            relu: Relu::new(),
            conv2,
            bn2: BatchNormConfig::new(width).init(device),
            conv3,
            bn3: BatchNormConfig::new(self.out_channels).init(device),
            downsample,
        }
    }
}

/// 1x1 projection of the skip connection when the block changes resolution or width.
#[derive(Module, Debug)]
pub struct Downsample<B: Backend> {
    conv: Conv2d<B>,
    bn: BatchNorm<B, 2>,
}

impl<B: Backend> Downsample<B> {
    pub fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        let out = self.conv.forward(input);
        self.bn.forward(out)
    }
}

// torch stores the projection as `downsample.0` (conv) and `downsample.1` (bn).
impl<B: Backend> StateDictModule for Downsample<B> {
    fn layout(&self, prefix: &str, layout: &mut StateLayout) {
        self.conv.layout(&join(prefix, "0"), layout);
        self.bn.layout(&join(prefix, "1"), layout);
    }

    fn load_state(self, prefix: &str, state: &StateDict) -> Result<Self, FfnError> {
        Ok(Self {
            conv: self.conv.load_state(&join(prefix, "0"), state)?,
            bn: self.bn.load_state(&join(prefix, "1"), state)?,
        })
    }
}

#[derive(Config, Debug)]
pub struct DownsampleConfig {
    in_channels: usize,
    out_channels: usize,
    stride: usize,
}

impl DownsampleConfig {
    pub fn init<B: Backend>(&self, device: &Device<B>) -> Downsample<B> {
        Downsample {
            conv: Conv2dConfig::new([self.in_channels, self.out_channels], [1, 1])
                .with_stride([self.stride, self.stride])
                .with_bias(false)
                .with_initializer(kaiming())
                .init(device),
            bn: BatchNormConfig::new(self.out_channels).init(device),
        }
    }
}

/// Collection of sequential residual blocks.
#[derive(Module, Debug)]
pub struct LayerBlock<B: Backend> {
    blocks: Vec<Bottleneck<B>>,
}

impl<B: Backend> LayerBlock<B> {
    pub fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        self.blocks
            .iter()
            .fold(input, |out, block| block.forward(out))
    }
}

impl<B: Backend> StateDictModule for LayerBlock<B> {
    fn layout(&self, prefix: &str, layout: &mut StateLayout) {
        for (idx, block) in self.blocks.iter().enumerate() {
            block.layout(&join(prefix, &idx.to_string()), layout);
        }
    }

    fn load_state(self, prefix: &str, state: &StateDict) -> Result<Self, FfnError> {
        let blocks = self
            .blocks
            .into_iter()
            .enumerate()
            .map(|(idx, block)| block.load_state(&join(prefix, &idx.to_string()), state))
            .collect::<Result<_, _>>()?;
        Ok(Self { blocks })
    }
}

/// [LayerBlock](LayerBlock) configuration.
///
/// With `dilate` set the stage keeps its input resolution: the stride is
/// folded into the dilation of every block after the first, as torchvision
/// does for `replace_stride_with_dilation`.
#[derive(Config, Debug)]
pub struct LayerBlockConfig {
    num_blocks: usize,
    in_channels: usize,
    out_channels: usize,
    stride: usize,
    #[config(default = false)]
    dilate: bool,
    #[config(default = 1)]
    previous_dilation: usize,
}

impl LayerBlockConfig {
    /// Dilation reached at the end of this stage.
    pub fn dilation(&self) -> usize {
        if self.dilate {
            self.previous_dilation * self.stride
        } else {
            self.previous_dilation
        }
    }

    pub fn init<B: Backend>(&self, device: &Device<B>) -> LayerBlock<B> {
        let stride = if self.dilate { 1 } else { self.stride };
        let dilation = self.dilation();

        let blocks = (0..self.num_blocks)
            .map(|b| {
                if b == 0 {
                    // First block uses the specified stride and the dilation of the previous stage
                    BottleneckConfig::new(self.in_channels, self.out_channels)
                        .with_stride(stride)
                        .with_dilation(self.previous_dilation)
                        .init(device)
                } else {
                    BottleneckConfig::new(self.out_channels, self.out_channels)
                        .with_dilation(dilation)
                        .init(device)
                }
            })
            .collect();

        LayerBlock { blocks }
    }
}
