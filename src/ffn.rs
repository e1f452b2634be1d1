use std::path::PathBuf;

use burn::prelude::*;

use crate::{
    constructor::BackboneWeights,
    deeplab::DeepLabV3Config,
    registry::BackboneRegistry,
    state::{filter_pretrained, load_checkpoint, StateDictModule},
    stem::FeatureStem,
    Constructor, FfnError,
};

/// ImageNet statistics the pretrained ResNet weights were trained with.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NormalizationStats {
    pub mean: [f32; 3],
    pub std: [f32; 3],
}

pub const IMAGENET_NORMALIZATION: NormalizationStats = NormalizationStats {
    mean: [0.485, 0.456, 0.406],
    std: [0.229, 0.224, 0.225],
};

/// Frustum feature network: the first residual stage of a DeepLabV3 backbone,
/// used to extract image features for depth distribution estimation.
#[derive(Module, Debug)]
pub struct FrustumFeatureNet<B: Backend> {
    stem: FeatureStem<B>,
    pretrained: bool,
}

impl<B: Backend> FrustumFeatureNet<B> {
    /// Key under which [`register`](Self::register) installs the network.
    pub const NAME: &'static str = "FFN";

    /// Build the network for `constructor_name`, optionally overlaying the
    /// weights stored at `pretrained_path`.
    pub fn new(
        constructor_name: &str,
        pretrained_path: Option<PathBuf>,
        device: &Device<B>,
    ) -> Result<Self, FfnError> {
        FrustumFeatureNetConfig::new(constructor_name.to_owned())
            .with_pretrained_path(pretrained_path)
            .init(device)
    }

    pub fn register(registry: &mut BackboneRegistry<B>) {
        registry.register(Self::NAME, FrustumFeatureNetConfig::init::<B>);
    }

    /// Extract features from a `[N, 3, H, W]` image batch.
    ///
    /// Returns `[N, 256, H / 4, W / 4]` features.
    pub fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = self.preprocess(images);
        self.stem.forward(x)
    }

    /// Padded pixels are marked with NaN. With pretrained weights they are
    /// set to zero; otherwise the batch is returned as is.
    pub fn preprocess(&self, images: Tensor<B, 4>) -> Tensor<B, 4> {
        if !self.pretrained {
            return images;
        }

        // ImageNet normalisation is intentionally not applied here.
        let mask = images.clone().is_nan();
        images.mask_fill(mask, 0.0)
    }

    /// Normalisation statistics matching the pretrained weights, if any.
    pub fn normalization(&self) -> Option<NormalizationStats> {
        self.pretrained.then_some(IMAGENET_NORMALIZATION)
    }

    pub fn is_pretrained(&self) -> bool {
        self.pretrained
    }

    pub fn stem(&self) -> &FeatureStem<B> {
        &self.stem
    }
}

#[derive(Config, Debug)]
pub struct FrustumFeatureNetConfig {
    /// `ResNet50` or `ResNet101`.
    constructor_name: String,
    /// safetensors checkpoint applied on top of the freshly built network.
    #[config(default = "None")]
    pretrained_path: Option<PathBuf>,
    #[config(default = "BackboneWeights::ImageNet1kV1")]
    backbone_weights: BackboneWeights,
}

impl FrustumFeatureNetConfig {
    pub fn init<B: Backend>(&self, device: &Device<B>) -> Result<FrustumFeatureNet<B>, FfnError> {
        let constructor: Constructor = self.constructor_name.parse()?;
        log::info!(
            "Building frustum feature network from DeepLabV3 {constructor} ({:?} backbone)",
            self.backbone_weights
        );

        let model = DeepLabV3Config::new(constructor)
            .with_backbone_weights(self.backbone_weights)
            .init(device)?;

        let model = match &self.pretrained_path {
            Some(path) => {
                let pretrained = load_checkpoint(path)?;
                let pretrained = filter_pretrained(&model.state_layout(), pretrained)?;
                log::info!(
                    "Applying {} entries from {}",
                    pretrained.len(),
                    path.display()
                );
                model.load_state("", &pretrained)?
            }
            None => model,
        };

        Ok(FrustumFeatureNet {
            stem: model.into_feature_stem(),
            pretrained: self.pretrained_path.is_some(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{save_checkpoint, StateDict, WeightTensor};
    use crate::stem::StemLayer;
    use burn::backend::NdArray;
    use std::path::Path;

    type TestBackend = NdArray<f32>;

    fn config(name: &str) -> FrustumFeatureNetConfig {
        FrustumFeatureNetConfig::new(name.to_owned()).with_backbone_weights(BackboneWeights::Random)
    }

    /// Checkpoint with a recognisable `conv1`, a classifier for `classes`
    /// outputs and an auxiliary head the model does not have.
    fn write_checkpoint(path: &Path, classes: usize) -> Vec<f32> {
        let conv1: Vec<f32> = (0..64 * 3 * 7 * 7).map(|v| v as f32 * 1e-3).collect();

        let mut state = StateDict::new();
        state.insert(
            "backbone.conv1.weight".into(),
            WeightTensor::float([64, 3, 7, 7], conv1.clone()).unwrap(),
        );
        state.insert(
            "backbone.bn1.num_batches_tracked".into(),
            WeightTensor::int(Vec::new(), vec![100]).unwrap(),
        );
        state.insert(
            "classifier.4.weight".into(),
            WeightTensor::full([classes, 256, 1, 1], 0.1),
        );
        state.insert("classifier.4.bias".into(), WeightTensor::full([classes], 0.0));
        state.insert(
            "aux_classifier.0.weight".into(),
            WeightTensor::full([256, 1024, 3, 3], 0.0),
        );
        state.insert(
            "aux_classifier.4.weight".into(),
            WeightTensor::full([classes, 256, 1, 1], 0.0),
        );
        save_checkpoint(path, &state).unwrap();

        conv1
    }

    fn nan_batch(device: &<TestBackend as Backend>::Device) -> Tensor<TestBackend, 4> {
        let values: Vec<f32> = (0..2 * 3 * 8 * 8)
            .map(|i| if i % 7 == 0 { f32::NAN } else { i as f32 / 100.0 })
            .collect();
        Tensor::from_data(TensorData::new(values, [2, 3, 8, 8]), device)
    }

    #[test]
    fn supported_constructors_build_five_stage_stem() {
        let device = Default::default();
        for name in ["ResNet50", "ResNet101"] {
            let ffn: FrustumFeatureNet<TestBackend> = config(name).init(&device).unwrap();

            assert_eq!(ffn.stem().layers().len(), 5);
            assert_eq!(
                ffn.stem().stage_names(),
                ["conv1", "bn1", "relu", "maxpool", "layer1"]
            );
            assert!(!ffn.is_pretrained());
            assert_eq!(ffn.normalization(), None);
        }
    }

    #[test]
    fn unsupported_constructor_fails() {
        let device = Default::default();
        match config("ResNet18").init::<TestBackend>(&device) {
            Err(FfnError::UnsupportedConstructor { name }) => assert_eq!(name, "ResNet18"),
            other => panic!("expected UnsupportedConstructor, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn forward_without_checkpoint_is_deterministic() {
        let device = Default::default();
        let ffn: FrustumFeatureNet<TestBackend> = config("ResNet50").init(&device).unwrap();
        let images = Tensor::<TestBackend, 4>::random(
            [2, 3, 32, 48],
            burn::tensor::Distribution::Uniform(0.0, 1.0),
            &device,
        );

        let first = ffn.forward(images.clone());
        let second = ffn.forward(images);

        assert_eq!(first.dims(), [2, 256, 8, 12]);
        first.into_data().assert_eq(&second.into_data(), true);
    }

    #[test]
    fn preprocess_without_checkpoint_keeps_nan() {
        let device = Default::default();
        let ffn: FrustumFeatureNet<TestBackend> = config("ResNet50").init(&device).unwrap();
        let images = nan_batch(&device);

        let expected = images.clone().is_nan().into_data();
        ffn.preprocess(images)
            .is_nan()
            .into_data()
            .assert_eq(&expected, true);
    }

    #[test]
    fn preprocess_with_checkpoint_zeroes_nan_only() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("deeplab.safetensors");
        write_checkpoint(&path, 21);

        let device = Default::default();
        let ffn: FrustumFeatureNet<TestBackend> = config("ResNet50")
            .with_pretrained_path(Some(path))
            .init(&device)
            .unwrap();
        assert_eq!(ffn.normalization(), Some(IMAGENET_NORMALIZATION));

        let images = nan_batch(&device);
        let before = images.clone().into_data().to_vec::<f32>().unwrap();
        let after = ffn
            .preprocess(images)
            .into_data()
            .to_vec::<f32>()
            .unwrap();

        for (original, processed) in before.iter().zip(&after) {
            if original.is_nan() {
                assert_eq!(*processed, 0.0);
            } else {
                assert_eq!(processed, original);
            }
        }
    }

    #[test]
    fn checkpoint_weights_reach_the_stem() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("deeplab.safetensors");
        // 10 classes: the classifier is dropped, the backbone is still applied.
        let conv1 = write_checkpoint(&path, 10);

        let device = Default::default();
        let ffn: FrustumFeatureNet<TestBackend> = config("ResNet101")
            .with_pretrained_path(Some(path))
            .init(&device)
            .unwrap();

        let StemLayer::Conv(conv) = &ffn.stem().layers()[0] else {
            panic!("first stage must be the stem convolution");
        };
        conv.weight
            .val()
            .into_data()
            .assert_eq(&TensorData::new(conv1, [64, 3, 7, 7]), false);

        let images = nan_batch(&device);
        let features = ffn.forward(images);
        assert_eq!(features.dims(), [2, 256, 2, 2]);
        let nan = features.is_nan().into_data().to_vec::<bool>().unwrap();
        assert!(nan.iter().all(|is_nan| !is_nan));
    }

    #[test]
    fn missing_checkpoint_fails() {
        let dir = tempfile::tempdir().unwrap();
        let device = Default::default();

        let result = config("ResNet50")
            .with_pretrained_path(Some(dir.path().join("missing.safetensors")))
            .init::<TestBackend>(&device);
        assert!(matches!(result, Err(FfnError::CheckpointLoad { .. })));
    }

    #[test]
    fn checkpoint_without_classifier_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("backbone-only.safetensors");
        let mut state = StateDict::new();
        state.insert(
            "backbone.bn1.weight".into(),
            WeightTensor::full([64], 1.0),
        );
        save_checkpoint(&path, &state).unwrap();

        let device = Default::default();
        let result = config("ResNet50")
            .with_pretrained_path(Some(path))
            .init::<TestBackend>(&device);
        match result {
            Err(FfnError::IncompatibleCheckpoint { key, dict }) => {
                assert_eq!(key, "classifier.4.weight");
                assert_eq!(dict, "pretrained");
            }
            other => panic!("expected IncompatibleCheckpoint, got {:?}", other.map(|_| ())),
        }
    }
}
