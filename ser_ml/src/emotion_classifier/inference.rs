use std::sync::Arc;

use burn::data::dataloader::DataLoader;
use burn::prelude::{Backend, Tensor};
use burn::tensor::activation::softmax;
use itertools::Itertools;

use crate::emotion_classifier::data::EmotionBatch;
use crate::emotion_classifier::model::EmotionModel;
use crate::emotion_classifier::{OutOfRangeError, SpeechEmotion};

#[derive(Debug, Clone, PartialEq)]
pub struct Prediction {
    /// Index of the highest scoring class.
    pub label: usize,
    pub probabilities: Vec<f32>,
}

impl Prediction {
    /// Render the probabilities as `[p0, p1, ...]` with four decimals.
    pub fn probs_string(&self) -> String {
        format!("[{}]", self.probabilities.iter().map(|p| format!("{p:.4}")).join(", "))
    }

    pub fn emotion(&self) -> Result<SpeechEmotion, OutOfRangeError> {
        SpeechEmotion::try_from(self.label as i32)
    }
}

/// Classify every row of `inputs`.
pub fn predict<B: Backend>(model: &EmotionModel<B>, inputs: Tensor<B, 2>) -> eyre::Result<Vec<Prediction>> {
    let logits = model.forward(inputs);
    let [_, classes] = logits.dims();

    let labels = logits
        .clone()
        .argmax(1)
        .into_data()
        .convert::<i64>()
        .to_vec::<i64>()
        .map_err(|e| eyre::eyre!("Could not read predicted labels: {e:?}"))?;

    labels
        .into_iter()
        .enumerate()
        .map(|(row, label)| {
            let scores = logits.clone().slice([row..row + 1, 0..classes]);
            let probabilities = softmax(scores, 1)
                .into_data()
                .convert::<f32>()
                .to_vec::<f32>()
                .map_err(|e| eyre::eyre!("Could not read probabilities: {e:?}"))?;

            Ok(Prediction {
                label: label as usize,
                probabilities,
            })
        })
        .collect()
}

/// Run the model over every batch of `loader`, in loader order.
#[tracing::instrument(skip_all)]
pub fn infer<B: Backend>(
    model: &EmotionModel<B>,
    loader: &Arc<dyn DataLoader<EmotionBatch<B>>>,
) -> eyre::Result<Vec<Prediction>> {
    let mut predictions = Vec::with_capacity(loader.num_items());

    for batch in loader.iter() {
        predictions.extend(predict(model, batch.inputs)?);
    }

    tracing::debug!(predictions = predictions.len(), "Finished inference");
    Ok(predictions)
}

#[cfg(test)]
mod tests {
    use burn::backend::NdArray;
    use burn::data::dataloader::batcher::Batcher;
    use burn::data::dataloader::DataLoaderBuilder;
    use burn::data::dataset::InMemDataset;

    use super::*;
    use crate::emotion_classifier::data::{EmotionBatcher, EmotionItem};
    use crate::emotion_classifier::model::tests::tiny_model_config;

    type TestBackend = NdArray<f32, i32>;

    #[test]
    fn probabilities_render_with_four_decimals() {
        let prediction = Prediction {
            label: 1,
            probabilities: vec![0.1, 0.65432, 0.24568],
        };

        assert_eq!(prediction.probs_string(), "[0.1000, 0.6543, 0.2457]");
        assert_eq!(prediction.emotion().unwrap(), SpeechEmotion::Fear);
    }

    #[test]
    fn infers_one_prediction_per_clip_in_order() -> eyre::Result<()> {
        let device: <TestBackend as Backend>::Device = Default::default();
        let model = tiny_model_config(6).init::<TestBackend>(&device);
        let items = (0..5)
            .map(|i| EmotionItem {
                input_values: (0..800).map(|s| ((s + i * 7) as f32 * 0.03).cos()).collect(),
                label: None,
            })
            .collect::<Vec<_>>();

        let loader = DataLoaderBuilder::new(EmotionBatcher::<TestBackend>::new(device))
            .batch_size(2)
            .build(InMemDataset::new(items.clone()));
        let predictions = infer(&model, &loader)?;

        assert_eq!(predictions.len(), 5);
        for prediction in &predictions {
            assert!(prediction.label < 6);
            assert_eq!(prediction.probabilities.len(), 6);
            assert!((prediction.probabilities.iter().sum::<f32>() - 1.0).abs() < 1e-4);
            let max = prediction.probabilities.iter().copied().fold(f32::MIN, f32::max);
            assert_eq!(prediction.probabilities[prediction.label], max);
        }

        // Batching must not change the outcome for a given clip.
        let single = EmotionBatcher::<TestBackend>::new(Default::default()).batch(vec![items[3].clone()]);
        let alone = predict(&model, single.inputs)?;
        assert_eq!(alone[0].label, predictions[3].label);
        Ok(())
    }
}
