use super::{StateDict, StateLayout};
use crate::FfnError;

const AUX_CLASSIFIER: &str = "aux_classifier";
const AUX_CLASSIFIER_WEIGHT: &str = "aux_classifier.0.weight";
const CLASSIFIER_WEIGHT: &str = "classifier.4.weight";
const CLASSIFIER_BIAS: &str = "classifier.4.bias";

/// Remove the entries of a pretrained state dict that the current model does
/// not use or has changed.
///
/// - Auxiliary classifier weights are dropped when the model has no auxiliary
///   classifier.
/// - The final classifier weight and bias are dropped when the number of
///   output classes differs.
/// - Any other entry missing from `current`, or with a different shape, is
///   dropped.
///
/// Everything else is returned untouched.
pub fn filter_pretrained(
    current: &StateLayout,
    mut pretrained: StateDict,
) -> Result<StateDict, FfnError> {
    if pretrained.contains_key(AUX_CLASSIFIER_WEIGHT) && !current.contains_key(AUX_CLASSIFIER_WEIGHT)
    {
        let before = pretrained.len();
        pretrained.retain(|key, _| !key.contains(AUX_CLASSIFIER));
        log::debug!(
            "Dropped {} auxiliary classifier entries",
            before - pretrained.len()
        );
    }

    let model_classes = current
        .get(CLASSIFIER_WEIGHT)
        .and_then(|shape| shape.first().copied())
        .ok_or_else(|| missing(CLASSIFIER_WEIGHT, "model"))?;
    let pretrained_classes = pretrained
        .get(CLASSIFIER_WEIGHT)
        .and_then(|weight| weight.shape().first().copied())
        .ok_or_else(|| missing(CLASSIFIER_WEIGHT, "pretrained"))?;

    if model_classes != pretrained_classes {
        log::info!(
            "Checkpoint has {pretrained_classes} classes, model has {model_classes}; \
             keeping the model's final classifier"
        );
        pretrained.remove(CLASSIFIER_WEIGHT);
        pretrained
            .remove(CLASSIFIER_BIAS)
            .ok_or_else(|| missing(CLASSIFIER_BIAS, "pretrained"))?;
    }

    pretrained.retain(|key, weight| match current.get(key) {
        Some(shape) if shape.as_slice() == weight.shape() => true,
        Some(shape) => {
            log::warn!(
                "Skipping '{key}': checkpoint shape {:?} does not match model shape {shape:?}",
                weight.shape()
            );
            false
        }
        None => {
            log::warn!("Skipping '{key}': not present in the model");
            false
        }
    });

    Ok(pretrained)
}

fn missing(key: &str, dict: &'static str) -> FfnError {
    FfnError::IncompatibleCheckpoint {
        key: key.to_owned(),
        dict,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::WeightTensor;

    fn layout(classes: usize, aux: bool) -> StateLayout {
        let mut layout = StateLayout::new();
        layout.insert("backbone.conv1.weight".into(), vec![4, 3, 1, 1]);
        layout.insert("classifier.1.weight".into(), vec![4, 4, 3, 3]);
        layout.insert(CLASSIFIER_WEIGHT.into(), vec![classes, 4, 1, 1]);
        layout.insert(CLASSIFIER_BIAS.into(), vec![classes]);
        if aux {
            layout.insert(AUX_CLASSIFIER_WEIGHT.into(), vec![4, 4, 3, 3]);
            layout.insert("aux_classifier.4.weight".into(), vec![classes, 4, 1, 1]);
        }
        layout
    }

    // Every entry gets distinct values so a mutated entry cannot go unnoticed.
    fn pretrained(classes: usize, aux: bool) -> StateDict {
        layout(classes, aux)
            .into_iter()
            .enumerate()
            .map(|(idx, (key, shape))| {
                let len = shape.iter().product();
                let values = (0..len).map(|v| (idx * 1000 + v) as f32).collect();
                (key, WeightTensor::float(shape, values).unwrap())
            })
            .collect()
    }

    #[test]
    fn drops_aux_classifier_when_model_has_none() {
        let source = pretrained(21, true);
        let filtered = filter_pretrained(&layout(21, false), source.clone()).unwrap();

        assert!(filtered.keys().all(|key| !key.contains(AUX_CLASSIFIER)));
        let expected: StateDict = source
            .into_iter()
            .filter(|(key, _)| !key.contains(AUX_CLASSIFIER))
            .collect();
        assert_eq!(filtered, expected);
    }

    #[test]
    fn keeps_aux_classifier_when_model_has_one() {
        let source = pretrained(21, true);
        let filtered = filter_pretrained(&layout(21, true), source.clone()).unwrap();
        assert_eq!(filtered, source);
    }

    #[test]
    fn drops_final_classifier_on_class_mismatch() {
        let source = pretrained(21, false);
        let filtered = filter_pretrained(&layout(10, false), source.clone()).unwrap();

        let mut expected = source;
        expected.remove(CLASSIFIER_WEIGHT);
        expected.remove(CLASSIFIER_BIAS);
        assert_eq!(filtered, expected);
        assert_eq!(filtered.len(), 2);
    }

    #[test]
    fn keeps_final_classifier_when_classes_match() {
        let source = pretrained(10, false);
        let filtered = filter_pretrained(&layout(10, false), source.clone()).unwrap();
        assert_eq!(filtered, source);
    }

    #[test]
    fn missing_classifier_in_checkpoint_is_an_error() {
        let mut source = pretrained(21, false);
        source.remove(CLASSIFIER_WEIGHT);

        match filter_pretrained(&layout(21, false), source) {
            Err(FfnError::IncompatibleCheckpoint { key, dict }) => {
                assert_eq!(key, CLASSIFIER_WEIGHT);
                assert_eq!(dict, "pretrained");
            }
            other => panic!("expected IncompatibleCheckpoint, got {other:?}"),
        }
    }

    #[test]
    fn missing_classifier_in_model_is_an_error() {
        let mut current = layout(21, false);
        current.remove(CLASSIFIER_WEIGHT);

        match filter_pretrained(&current, pretrained(21, false)) {
            Err(FfnError::IncompatibleCheckpoint { key, dict }) => {
                assert_eq!(key, CLASSIFIER_WEIGHT);
                assert_eq!(dict, "model");
            }
            other => panic!("expected IncompatibleCheckpoint, got {other:?}"),
        }
    }

    #[test]
    fn missing_bias_on_mismatch_is_an_error() {
        let mut source = pretrained(21, false);
        source.remove(CLASSIFIER_BIAS);

        assert!(matches!(
            filter_pretrained(&layout(10, false), source),
            Err(FfnError::IncompatibleCheckpoint { .. })
        ));
    }

    #[test]
    fn drops_unknown_and_misshapen_entries() {
        let mut source = pretrained(21, false);
        source.insert("backbone.fc.weight".into(), WeightTensor::full([2, 2], 1.0));
        source.insert(
            "classifier.1.weight".into(),
            WeightTensor::full([4, 4, 1, 1], 1.0),
        );

        let filtered = filter_pretrained(&layout(21, false), source).unwrap();
        assert!(!filtered.contains_key("backbone.fc.weight"));
        assert!(!filtered.contains_key("classifier.1.weight"));
        assert!(filtered.contains_key("backbone.conv1.weight"));
    }
}
