use core::{fmt, str::FromStr};

use crate::FfnError;

/// Segmentation network the feature stem is cut from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum Constructor {
    /// DeepLabV3 on a ResNet-50 backbone.
    ResNet50,
    /// DeepLabV3 on a ResNet-101 backbone.
    ResNet101,
}

/// Weights the ResNet backbone starts from before any checkpoint is applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
pub enum BackboneWeights {
    /// Kaiming-initialised backbone, nothing is downloaded.
    Random,
    /// These weights reproduce closely the results of the original paper.
    /// ResNet-50 top-1 accuracy: 76.130%, ResNet-101 top-1 accuracy: 77.374%.
    #[default]
    ImageNet1kV1,
}

/// Backbone structure metadata.
#[derive(Debug, Clone, Copy)]
pub struct BackboneStructure {
    pub blocks: [usize; 4],
    pub url: Option<&'static str>,
}

impl Constructor {
    pub const ALL: [Constructor; 2] = [Constructor::ResNet50, Constructor::ResNet101];

    pub fn name(&self) -> &'static str {
        match self {
            Self::ResNet50 => "ResNet50",
            Self::ResNet101 => "ResNet101",
        }
    }

    pub fn structure(&self, weights: BackboneWeights) -> BackboneStructure {
        let (blocks, url) = match self {
            Self::ResNet50 => (
                [3, 4, 6, 3],
                "https://download.pytorch.org/models/resnet50-0676ba61.pth",
            ),
            Self::ResNet101 => (
                [3, 4, 23, 3],
                "https://download.pytorch.org/models/resnet101-63fe2227.pth",
            ),
        };

        BackboneStructure {
            blocks,
            url: match weights {
                BackboneWeights::Random => None,
                BackboneWeights::ImageNet1kV1 => Some(url),
            },
        }
    }
}

impl FromStr for Constructor {
    type Err = FfnError;

    fn from_str(name: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|constructor| constructor.name() == name)
            .ok_or_else(|| FfnError::UnsupportedConstructor {
                name: name.to_owned(),
            })
    }
}

impl fmt::Display for Constructor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_supported_names() {
        assert_eq!("ResNet50".parse::<Constructor>().unwrap(), Constructor::ResNet50);
        assert_eq!(
            "ResNet101".parse::<Constructor>().unwrap(),
            Constructor::ResNet101
        );
    }

    #[test]
    fn rejects_other_names() {
        for name in ["ResNet18", "resnet50", ""] {
            match name.parse::<Constructor>() {
                Err(FfnError::UnsupportedConstructor { name: got }) => assert_eq!(got, name),
                other => panic!("expected UnsupportedConstructor for {name:?}, got {other:?}"),
            }
        }
    }

    #[test]
    fn random_weights_have_no_url() {
        let structure = Constructor::ResNet101.structure(BackboneWeights::Random);
        assert_eq!(structure.blocks, [3, 4, 23, 3]);
        assert!(structure.url.is_none());
        assert!(Constructor::ResNet50
            .structure(BackboneWeights::ImageNet1kV1)
            .url
            .is_some());
    }
}
