use std::path::Path;

use burn::{
    module::Module,
    record::{FullPrecisionSettings, Recorder, RecorderError},
    tensor::{backend::Backend, Device},
};
use burn_import::pytorch::{LoadArgs, PyTorchFileRecorder};

use crate::{constructor::BackboneWeights, Constructor, FfnError};

use super::{ResNetBackbone, ResNetBackboneRecord, ResNetConfig};

/// Build the dilated DeepLab backbone for `constructor`, starting from the
/// requested backbone weights.
pub fn resnet_backbone<B: Backend>(
    constructor: Constructor,
    weights: BackboneWeights,
    device: &Device<B>,
) -> Result<ResNetBackbone<B>, FfnError> {
    let structure = constructor.structure(weights);
    let model = ResNetConfig::deeplab(structure.blocks).init(device);

    let Some(url) = structure.url else {
        log::debug!("Using randomly initialised {constructor} backbone");
        return Ok(model);
    };

    let weights = fetch(url)?;
    log::info!("Loading {constructor} backbone weights from {}", weights.display());
    let record = load_weights_record(weights, device).map_err(|err| FfnError::BackboneWeights {
        reason: format!("{err:?}"),
    })?;

    Ok(model.load_record(record))
}

#[cfg(feature = "pretrained")]
fn fetch(url: &str) -> Result<std::path::PathBuf, FfnError> {
    crate::download("resnet", url).map_err(|err| FfnError::BackboneWeights {
        reason: format!("could not download weights: {err}"),
    })
}

#[cfg(not(feature = "pretrained"))]
fn fetch(url: &str) -> Result<std::path::PathBuf, FfnError> {
    Err(FfnError::BackboneWeights {
        reason: format!("cannot fetch {url}: built without the `pretrained` feature"),
    })
}

/// Load torchvision ImageNet weights as a backbone record. The `fc.*` entries
/// have no counterpart and are skipped.
fn load_weights_record<B: Backend, P: AsRef<Path>>(
    torch_weights: P,
    device: &Device<B>,
) -> Result<ResNetBackboneRecord<B>, RecorderError> {
    let load_args = LoadArgs::new(torch_weights.as_ref().into())
        // Map *.downsample.0.* -> *.downsample.conv.*
        .with_key_remap("(.+)\\.downsample\\.0\\.(.+)", "$1.downsample.conv.$2")
        // Map *.downsample.1.* -> *.downsample.bn.*
        .with_key_remap("(.+)\\.downsample\\.1\\.(.+)", "$1.downsample.bn.$2")
        // Map layer[i].[j].* -> layer[i].blocks.[j].*
        .with_key_remap("(layer[1-4])\\.([0-9]+)\\.(.+)", "$1.blocks.$2.$3");

    PyTorchFileRecorder::<FullPrecisionSettings>::new().load(load_args, device)
}
