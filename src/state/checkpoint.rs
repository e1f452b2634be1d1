use std::{borrow::Cow, path::Path};

use safetensors::{tensor::TensorView, Dtype, SafeTensors, View};

use super::{StateDict, WeightTensor, WeightValues};
use crate::FfnError;

/// On-disk checkpoint formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckpointFormat {
    /// PyTorch pickle archives (`.pt`, `.pth`)
    PyTorch,
    /// `.safetensors` files, also the fallback for unknown extensions
    SafeTensors,
}

impl CheckpointFormat {
    /// Detect the format from the file extension.
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|ext| ext.to_str()) {
            Some("pt") | Some("pth") => Self::PyTorch,
            _ => Self::SafeTensors,
        }
    }
}

/// Read a safetensors checkpoint into a [`StateDict`].
///
/// Floating point entries are widened or narrowed to `f32` and integer
/// entries to `i64`. PyTorch archives are rejected with a hint on how to
/// convert them.
pub fn load_checkpoint<P: AsRef<Path>>(path: P) -> Result<StateDict, FfnError> {
    let path = path.as_ref();
    let load_error = |reason: String| FfnError::CheckpointLoad {
        path: path.to_path_buf(),
        reason,
    };

    if CheckpointFormat::from_path(path) == CheckpointFormat::PyTorch {
        return Err(load_error(
            "PyTorch archives are not read directly; convert the state dict with \
             `safetensors.torch.save_file(torch.load(path), \"model.safetensors\")`"
                .to_owned(),
        ));
    }

    let buffer = std::fs::read(path).map_err(|err| load_error(err.to_string()))?;
    let tensors = SafeTensors::deserialize(&buffer).map_err(|err| load_error(err.to_string()))?;

    log::debug!("Loaded {} tensors from {}", tensors.len(), path.display());

    tensors
        .tensors()
        .into_iter()
        .map(|(name, view)| {
            let weight = decode(&name, &view)?;
            Ok((name, weight))
        })
        .collect()
}

/// Write a [`StateDict`] as a safetensors checkpoint.
pub fn save_checkpoint<P: AsRef<Path>>(path: P, state: &StateDict) -> Result<(), FfnError> {
    let path = path.as_ref();
    safetensors::serialize_to_file(state.iter(), &None, path).map_err(|err| {
        FfnError::CheckpointLoad {
            path: path.to_path_buf(),
            reason: err.to_string(),
        }
    })
}

fn decode(name: &str, view: &TensorView<'_>) -> Result<WeightTensor, FfnError> {
    let shape = view.shape().to_vec();
    let data = view.data();

    match view.dtype() {
        Dtype::F32 => WeightTensor::float(shape, bytemuck::pod_collect_to_vec(data)),
        Dtype::F64 => {
            let values: Vec<f64> = bytemuck::pod_collect_to_vec(data);
            WeightTensor::float(shape, values.into_iter().map(|v| v as f32).collect())
        }
        Dtype::F16 => {
            let values: Vec<half::f16> = bytemuck::pod_collect_to_vec(data);
            WeightTensor::float(shape, values.into_iter().map(half::f16::to_f32).collect())
        }
        Dtype::BF16 => {
            let values: Vec<half::bf16> = bytemuck::pod_collect_to_vec(data);
            WeightTensor::float(shape, values.into_iter().map(half::bf16::to_f32).collect())
        }
        Dtype::I64 => WeightTensor::int(shape, bytemuck::pod_collect_to_vec(data)),
        Dtype::I32 => {
            let values: Vec<i32> = bytemuck::pod_collect_to_vec(data);
            WeightTensor::int(shape, values.into_iter().map(i64::from).collect())
        }
        Dtype::U8 => WeightTensor::int(shape, data.iter().map(|&v| i64::from(v)).collect()),
        dtype => Err(FfnError::UnsupportedDtype {
            key: name.to_owned(),
            dtype: format!("{dtype:?}"),
        }),
    }
}

impl View for &WeightTensor {
    fn dtype(&self) -> Dtype {
        match self.values() {
            WeightValues::Float(_) => Dtype::F32,
            WeightValues::Int(_) => Dtype::I64,
        }
    }

    fn shape(&self) -> &[usize] {
        WeightTensor::shape(self)
    }

    fn data(&self) -> Cow<[u8]> {
        match self.values() {
            WeightValues::Float(values) => Cow::Borrowed(bytemuck::cast_slice(values)),
            WeightValues::Int(values) => Cow::Borrowed(bytemuck::cast_slice(values)),
        }
    }

    fn data_len(&self) -> usize {
        match self.values() {
            WeightValues::Float(values) => values.len() * std::mem::size_of::<f32>(),
            WeightValues::Int(values) => values.len() * std::mem::size_of::<i64>(),
        }
    }
}
