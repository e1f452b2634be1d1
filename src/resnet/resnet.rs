use core::f64::consts::SQRT_2;

use burn::{
    module::Module,
    nn::{
        conv::{Conv2d, Conv2dConfig},
        pool::{MaxPool2d, MaxPool2dConfig},
        BatchNorm, BatchNormConfig, Initializer, PaddingConfig2d, Relu,
    },
    tensor::{backend::Backend, Device, Tensor},
};

use crate::{
    state::{join, StateDict, StateDictModule, StateLayout},
    FfnError,
};

use super::block::{LayerBlock, LayerBlockConfig};

/// Feature maps consumed by the segmentation heads.
#[derive(Debug, Clone)]
pub struct BackboneFeatures<B: Backend> {
    /// `layer3` output, input of the auxiliary classifier.
    pub aux: Tensor<B, 4>,
    /// `layer4` output, input of the main classifier.
    pub out: Tensor<B, 4>,
}

/// Dilated ResNet backbone without the classification head.
/// Derived from [torchvision.models.resnet.ResNet](https://github.com/pytorch/vision/blob/main/torchvision/models/resnet.py)
#[derive(Module, Debug)]
pub struct ResNetBackbone<B: Backend> {
    pub(crate) conv1: Conv2d<B>,
    pub(crate) bn1: BatchNorm<B, 2>,
    pub(crate) relu: Relu,
    pub(crate) maxpool: MaxPool2d,
    pub(crate) layer1: LayerBlock<B>,
    pub(crate) layer2: LayerBlock<B>,
    pub(crate) layer3: LayerBlock<B>,
    pub(crate) layer4: LayerBlock<B>,
}

impl<B: Backend> ResNetBackbone<B> {
    pub fn forward(&self, x: Tensor<B, 4>) -> BackboneFeatures<B> {
        // First block
        let x = self.conv1.forward(x);
        let x = self.bn1.forward(x);
        let x = self.relu.forward(x);
        let x = self.maxpool.forward(x);

        // Residual blocks
        let x = self.layer1.forward(x);
        let x = self.layer2.forward(x);
        let aux = self.layer3.forward(x);
        let out = self.layer4.forward(aux.clone());

        BackboneFeatures { aux, out }
    }
}

impl<B: Backend> StateDictModule for ResNetBackbone<B> {
    fn layout(&self, prefix: &str, layout: &mut StateLayout) {
        self.conv1.layout(&join(prefix, "conv1"), layout);
        self.bn1.layout(&join(prefix, "bn1"), layout);
        self.layer1.layout(&join(prefix, "layer1"), layout);
        self.layer2.layout(&join(prefix, "layer2"), layout);
        self.layer3.layout(&join(prefix, "layer3"), layout);
        self.layer4.layout(&join(prefix, "layer4"), layout);
    }

    fn load_state(self, prefix: &str, state: &StateDict) -> Result<Self, FfnError> {
        Ok(Self {
            conv1: self.conv1.load_state(&join(prefix, "conv1"), state)?,
            bn1: self.bn1.load_state(&join(prefix, "bn1"), state)?,
            relu: self.relu,
            maxpool: self.maxpool,
            layer1: self.layer1.load_state(&join(prefix, "layer1"), state)?,
            layer2: self.layer2.load_state(&join(prefix, "layer2"), state)?,
            layer3: self.layer3.load_state(&join(prefix, "layer3"), state)?,
            layer4: self.layer4.load_state(&join(prefix, "layer4"), state)?,
        })
    }
}

/// [ResNetBackbone](ResNetBackbone) configuration.
pub struct ResNetConfig {
    conv1: Conv2dConfig,
    bn1: BatchNormConfig,
    maxpool: MaxPool2dConfig,
    layer1: LayerBlockConfig,
    layer2: LayerBlockConfig,
    layer3: LayerBlockConfig,
    layer4: LayerBlockConfig,
}

impl ResNetConfig {
    /// Create a bottleneck ResNet whose last stages trade stride for dilation.
    pub fn new(blocks: [usize; 4], replace_stride_with_dilation: [bool; 3]) -> Self {
        // 7x7 conv, 64, /2
        let conv1 = Conv2dConfig::new([3, 64], [7, 7])
            .with_stride([2, 2])
            .with_padding(PaddingConfig2d::Explicit(3, 3))
            .with_bias(false);
        let bn1 = BatchNormConfig::new(64);

        // 3x3 maxpool, /2
        let maxpool = MaxPool2dConfig::new([3, 3])
            .with_strides([2, 2])
            .with_padding(PaddingConfig2d::Explicit(1, 1));

        // Residual blocks
        let layer1 = LayerBlockConfig::new(blocks[0], 64, 256, 1);
        let layer2 = LayerBlockConfig::new(blocks[1], 256, 512, 2)
            .with_dilate(replace_stride_with_dilation[0])
            .with_previous_dilation(layer1.dilation());
        let layer3 = LayerBlockConfig::new(blocks[2], 512, 1024, 2)
            .with_dilate(replace_stride_with_dilation[1])
            .with_previous_dilation(layer2.dilation());
        let layer4 = LayerBlockConfig::new(blocks[3], 1024, 2048, 2)
            .with_dilate(replace_stride_with_dilation[2])
            .with_previous_dilation(layer3.dilation());

        Self {
            conv1,
            bn1,
            maxpool,
            layer1,
            layer2,
            layer3,
            layer4,
        }
    }

    /// DeepLabV3 layout: output stride 8.
    pub fn deeplab(blocks: [usize; 4]) -> Self {
        Self::new(blocks, [false, true, true])
    }

    /// Initialize a new [ResNetBackbone](ResNetBackbone) module.
    pub fn init<B: Backend>(self, device: &Device<B>) -> ResNetBackbone<B> {
        // Conv initializer
        let initializer = Initializer::KaimingNormal {
            gain: SQRT_2, // recommended value for ReLU
            fan_out_only: true,
        };

        ResNetBackbone {
            conv1: self.conv1.with_initializer(initializer).init(device),
            bn1: self.bn1.init(device),
            relu: Relu::new(),
            maxpool: self.maxpool.init(),
            layer1: self.layer1.init(device),
            layer2: self.layer2.init(device),
            layer3: self.layer3.init(device),
            layer4: self.layer4.init(device),
        }
    }
}
