use std::path::PathBuf;

use thiserror::Error;

/// Errors raised while building or loading the feature network.
#[derive(Debug, Error)]
pub enum FfnError {
    /// Constructor name outside the supported set
    #[error("unsupported constructor '{name}' - supported constructors: ResNet50, ResNet101")]
    UnsupportedConstructor { name: String },

    /// Checkpoint file missing, unreadable or malformed
    #[error("failed to load checkpoint '{}': {reason}", path.display())]
    CheckpointLoad { path: PathBuf, reason: String },

    /// A key needed to compare classifier shapes is absent
    #[error("incompatible checkpoint: required key '{key}' is missing from the {dict} state dict")]
    IncompatibleCheckpoint { key: String, dict: &'static str },

    #[error("shape mismatch for '{key}': model expects {expected:?}, checkpoint has {actual:?}")]
    ShapeMismatch {
        key: String,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    #[error("{len} values cannot fill a tensor of shape {shape:?}")]
    ValueCount { shape: Vec<usize>, len: usize },

    #[error("unsupported dtype {dtype} for '{key}'")]
    UnsupportedDtype { key: String, dtype: String },

    /// Backbone weights could not be downloaded or decoded
    #[error("failed to load backbone weights: {reason}")]
    BackboneWeights { reason: String },

    /// Registry lookup with an unknown key
    #[error("unknown component '{name}' - registered components: {available}")]
    UnknownComponent { name: String, available: String },
}
