//! Named state dictionaries.
//!
//! Keys follow the torchvision naming scheme (`backbone.layer1.0.conv1.weight`,
//! `classifier.4.bias`, ...) so that checkpoints exported from the reference
//! segmentation models can be applied without any remapping.

mod checkpoint;
mod filter;

pub use checkpoint::*;
pub use filter::*;

use std::collections::BTreeMap;

use burn::{
    module::{Param, RunningState},
    nn::{conv::Conv2d, BatchNorm},
    prelude::*,
};

use crate::FfnError;

/// Mapping from parameter key to its weights.
pub type StateDict = BTreeMap<String, WeightTensor>;

/// Mapping from parameter key to the shape a live model expects.
pub type StateLayout = BTreeMap<String, Vec<usize>>;

#[derive(Debug, Clone, PartialEq)]
pub enum WeightValues {
    Float(Vec<f32>),
    Int(Vec<i64>),
}

/// A single entry of a [`StateDict`].
#[derive(Debug, Clone, PartialEq)]
pub struct WeightTensor {
    shape: Vec<usize>,
    values: WeightValues,
}

impl WeightTensor {
    pub fn float(shape: impl Into<Vec<usize>>, values: Vec<f32>) -> Result<Self, FfnError> {
        let shape = check_len(shape.into(), values.len())?;
        Ok(Self {
            shape,
            values: WeightValues::Float(values),
        })
    }

    pub fn int(shape: impl Into<Vec<usize>>, values: Vec<i64>) -> Result<Self, FfnError> {
        let shape = check_len(shape.into(), values.len())?;
        Ok(Self {
            shape,
            values: WeightValues::Int(values),
        })
    }

    /// Float tensor of the given shape filled with `value`.
    pub fn full(shape: impl Into<Vec<usize>>, value: f32) -> Self {
        let shape = shape.into();
        let len = shape.iter().product();
        Self {
            shape,
            values: WeightValues::Float(vec![value; len]),
        }
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn values(&self) -> &WeightValues {
        &self.values
    }

    fn to_float_data(&self, key: &str) -> Result<TensorData, FfnError> {
        match &self.values {
            WeightValues::Float(values) => Ok(TensorData::new(values.clone(), self.shape.clone())),
            WeightValues::Int(_) => Err(FfnError::UnsupportedDtype {
                key: key.to_owned(),
                dtype: "integer".to_owned(),
            }),
        }
    }
}

fn check_len(shape: Vec<usize>, len: usize) -> Result<Vec<usize>, FfnError> {
    let expected = shape.iter().product::<usize>();
    if expected == len {
        Ok(shape)
    } else {
        Err(FfnError::ValueCount { shape, len })
    }
}

/// Modules that expose their parameters under torchvision-style names.
pub trait StateDictModule: Sized {
    /// Record the key and shape of every persisted entry below `prefix`.
    fn layout(&self, prefix: &str, layout: &mut StateLayout);

    /// Overwrite every parameter whose key is present in `state`.
    ///
    /// Parameters without an entry keep their current value, which makes this
    /// equivalent to updating the model's own state dict with `state` and
    /// loading the result back.
    fn load_state(self, prefix: &str, state: &StateDict) -> Result<Self, FfnError>;

    fn state_layout(&self) -> StateLayout {
        let mut layout = StateLayout::new();
        self.layout("", &mut layout);
        layout
    }
}

pub(crate) fn join(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        name.to_owned()
    } else {
        format!("{prefix}.{name}")
    }
}

fn lookup<'a>(
    state: &'a StateDict,
    key: &str,
    expected: &[usize],
) -> Result<Option<&'a WeightTensor>, FfnError> {
    match state.get(key) {
        Some(weight) if weight.shape() != expected => Err(FfnError::ShapeMismatch {
            key: key.to_owned(),
            expected: expected.to_vec(),
            actual: weight.shape().to_vec(),
        }),
        found => Ok(found),
    }
}

fn load_param<B: Backend, const D: usize>(
    param: Param<Tensor<B, D>>,
    key: &str,
    state: &StateDict,
) -> Result<Param<Tensor<B, D>>, FfnError> {
    match lookup(state, key, &param.dims())? {
        Some(weight) => {
            let tensor = Tensor::from_data(weight.to_float_data(key)?, &param.device());
            Ok(Param::from_tensor(tensor))
        }
        None => Ok(param),
    }
}

fn load_running<B: Backend>(
    running: RunningState<Tensor<B, 1>>,
    key: &str,
    shape: &[usize],
    device: &B::Device,
    state: &StateDict,
) -> Result<RunningState<Tensor<B, 1>>, FfnError> {
    match lookup(state, key, shape)? {
        Some(weight) => Ok(RunningState::new(Tensor::from_data(
            weight.to_float_data(key)?,
            device,
        ))),
        None => Ok(running),
    }
}

impl<B: Backend> StateDictModule for Conv2d<B> {
    fn layout(&self, prefix: &str, layout: &mut StateLayout) {
        layout.insert(join(prefix, "weight"), self.weight.dims().to_vec());
        if let Some(bias) = &self.bias {
            layout.insert(join(prefix, "bias"), bias.dims().to_vec());
        }
    }

    fn load_state(mut self, prefix: &str, state: &StateDict) -> Result<Self, FfnError> {
        self.weight = load_param(self.weight, &join(prefix, "weight"), state)?;
        self.bias = match self.bias {
            Some(bias) => Some(load_param(bias, &join(prefix, "bias"), state)?),
            None => None,
        };
        Ok(self)
    }
}

impl<B: Backend> StateDictModule for BatchNorm<B, 2> {
    fn layout(&self, prefix: &str, layout: &mut StateLayout) {
        let shape = self.gamma.dims().to_vec();
        for name in ["weight", "bias", "running_mean", "running_var"] {
            layout.insert(join(prefix, name), shape.clone());
        }
        // Scalar counter kept by torch; there is no burn counterpart.
        layout.insert(join(prefix, "num_batches_tracked"), Vec::new());
    }

    fn load_state(mut self, prefix: &str, state: &StateDict) -> Result<Self, FfnError> {
        let shape = self.gamma.dims().to_vec();
        let device = self.gamma.device();

        self.gamma = load_param(self.gamma, &join(prefix, "weight"), state)?;
        self.beta = load_param(self.beta, &join(prefix, "bias"), state)?;
        self.running_mean = load_running(
            self.running_mean,
            &join(prefix, "running_mean"),
            &shape,
            &device,
            state,
        )?;
        self.running_var = load_running(
            self.running_var,
            &join(prefix, "running_var"),
            &shape,
            &device,
            state,
        )?;
        Ok(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::{
        backend::NdArray,
        nn::{conv::Conv2dConfig, BatchNormConfig},
    };

    type TestBackend = NdArray<f32>;

    #[test]
    fn value_count_must_fill_the_shape() {
        match WeightTensor::float([2, 3], vec![1.0; 5]) {
            Err(FfnError::ValueCount { shape, len }) => {
                assert_eq!(shape, vec![2, 3]);
                assert_eq!(len, 5);
            }
            other => panic!("expected ValueCount, got {other:?}"),
        }
        assert!(WeightTensor::int(Vec::new(), vec![1, 2]).is_err());
        assert!(WeightTensor::int(Vec::new(), vec![1]).unwrap().shape().is_empty());
    }

    #[test]
    fn conv_layout_uses_torch_names() {
        let device = Default::default();
        let conv: Conv2d<TestBackend> = Conv2dConfig::new([3, 8], [3, 3]).init(&device);

        let layout = conv.state_layout();
        assert_eq!(layout["weight"], vec![8, 3, 3, 3]);
        assert_eq!(layout["bias"], vec![8]);
    }

    #[test]
    fn batchnorm_layout_includes_running_stats() {
        let device = Default::default();
        let bn: BatchNorm<TestBackend, 2> = BatchNormConfig::new(4).init(&device);

        let mut layout = StateLayout::new();
        bn.layout("bn1", &mut layout);
        let keys: Vec<_> = layout.keys().map(String::as_str).collect();
        assert_eq!(
            keys,
            [
                "bn1.bias",
                "bn1.num_batches_tracked",
                "bn1.running_mean",
                "bn1.running_var",
                "bn1.weight",
            ]
        );
        assert!(layout["bn1.num_batches_tracked"].is_empty());
    }

    #[test]
    fn load_state_overwrites_present_keys_only() {
        let device = Default::default();
        let conv: Conv2d<TestBackend> = Conv2dConfig::new([1, 2], [1, 1]).init(&device);
        let bias_before = conv.bias.as_ref().unwrap().val().into_data();

        let mut state = StateDict::new();
        state.insert("weight".into(), WeightTensor::float([2, 1, 1, 1], vec![0.5, -2.0]).unwrap());

        let conv = conv.load_state("", &state).unwrap();
        conv.weight
            .val()
            .into_data()
            .assert_eq(&TensorData::new(vec![0.5f32, -2.0], [2, 1, 1, 1]), false);
        conv.bias
            .unwrap()
            .val()
            .into_data()
            .assert_eq(&bias_before, true);
    }

    #[test]
    fn load_state_rejects_wrong_shape() {
        let device = Default::default();
        let bn: BatchNorm<TestBackend, 2> = BatchNormConfig::new(4).init(&device);

        let mut state = StateDict::new();
        state.insert("running_var".into(), WeightTensor::full([3], 1.0));

        match bn.load_state("", &state) {
            Err(FfnError::ShapeMismatch {
                key,
                expected,
                actual,
            }) => {
                assert_eq!(key, "running_var");
                assert_eq!(expected, vec![4]);
                assert_eq!(actual, vec![3]);
            }
            other => panic!("expected ShapeMismatch, got {:?}", other.map(|_| ())),
        }
    }
}
