use burn::{
    prelude::*,
    tensor::{
        module::interpolate,
        ops::{InterpolateMode, InterpolateOptions},
    },
};

use super::head::{DeepLabHead, DeepLabHeadConfig, FcnHead, FcnHeadConfig};
use crate::{
    constructor::BackboneWeights,
    resnet::{resnet_backbone, ResNetBackbone},
    state::{join, StateDict, StateDictModule, StateLayout},
    stem::FeatureStem,
    Constructor, FfnError,
};

/// Per-pixel logits at the input resolution.
#[derive(Debug, Clone)]
pub struct DeepLabV3Output<B: Backend> {
    pub out: Tensor<B, 4>,
    pub aux: Option<Tensor<B, 4>>,
}

/// DeepLabV3 segmentation network.
/// Derived from torchvision.models.segmentation.deeplabv3
#[derive(Module, Debug)]
pub struct DeepLabV3<B: Backend> {
    backbone: ResNetBackbone<B>,
    classifier: DeepLabHead<B>,
    aux_classifier: Option<FcnHead<B>>,
}

impl<B: Backend> DeepLabV3<B> {
    /// Logits for a `[N, 3, H, W]` batch, upsampled back to `H x W`.
    ///
    /// The ASPP runs on a map of `H / 8 x W / 8`, which must be larger than
    /// the largest atrous rate on each side. With the default rates of
    /// `[12, 24, 36]` this means inputs of at least 320 x 320; the NdArray
    /// convolution kernel panics on smaller maps.
    pub fn forward(&self, x: Tensor<B, 4>) -> DeepLabV3Output<B> {
        let [_, _, height, width] = x.dims();
        let upsample = |x: Tensor<B, 4>| {
            interpolate(
                x,
                [height, width],
                InterpolateOptions::new(InterpolateMode::Bilinear),
            )
        };

        let features = self.backbone.forward(x);
        let aux = self
            .aux_classifier
            .as_ref()
            .map(|head| upsample(head.forward(features.aux)));
        let out = upsample(self.classifier.forward(features.out));

        DeepLabV3Output { out, aux }
    }

    /// Keep only `conv1`, `bn1`, `relu`, `maxpool` and `layer1`; everything
    /// else is dropped with `self`.
    pub fn into_feature_stem(self) -> FeatureStem<B> {
        let backbone = self.backbone;
        FeatureStem::new(
            backbone.conv1,
            backbone.bn1,
            backbone.relu,
            backbone.maxpool,
            backbone.layer1,
        )
    }
}

impl<B: Backend> StateDictModule for DeepLabV3<B> {
    fn layout(&self, prefix: &str, layout: &mut StateLayout) {
        self.backbone.layout(&join(prefix, "backbone"), layout);
        self.classifier.layout(&join(prefix, "classifier"), layout);
        if let Some(aux) = &self.aux_classifier {
            aux.layout(&join(prefix, "aux_classifier"), layout);
        }
    }

    fn load_state(self, prefix: &str, state: &StateDict) -> Result<Self, FfnError> {
        Ok(Self {
            backbone: self.backbone.load_state(&join(prefix, "backbone"), state)?,
            classifier: self
                .classifier
                .load_state(&join(prefix, "classifier"), state)?,
            aux_classifier: match self.aux_classifier {
                Some(aux) => Some(aux.load_state(&join(prefix, "aux_classifier"), state)?),
                None => None,
            },
        })
    }
}

#[derive(Config, Debug)]
pub struct DeepLabV3Config {
    constructor: Constructor,
    #[config(default = 21)]
    num_classes: usize,
    #[config(default = false)]
    aux_loss: bool,
    #[config(default = "BackboneWeights::ImageNet1kV1")]
    backbone_weights: BackboneWeights,
    /// Dilations of the three 3x3 ASPP branches.
    #[config(default = "[12, 24, 36]")]
    atrous_rates: [usize; 3],
}

impl DeepLabV3Config {
    /// Build the network. Only the backbone starts from pretrained weights;
    /// both classifiers are randomly initialised.
    pub fn init<B: Backend>(&self, device: &Device<B>) -> Result<DeepLabV3<B>, FfnError> {
        let backbone = resnet_backbone(self.constructor, self.backbone_weights, device)?;

        Ok(DeepLabV3 {
            backbone,
            classifier: DeepLabHeadConfig::new(2048, self.num_classes)
                .with_atrous_rates(self.atrous_rates)
                .init(device),
            aux_classifier: self
                .aux_loss
                .then(|| FcnHeadConfig::new(1024, self.num_classes).init(device)),
        })
    }
}
