use burn::data::dataloader::batcher::Batcher;
use burn::data::dataset::transform::MapperDataset;
use burn::data::dataset::InMemDataset;
use burn::prelude::{Backend, Int, Tensor, TensorData};

use crate::emotion_classifier::mapper::FeatureMapper;

/// A decoded clip, prior to feature extraction.
#[derive(Debug, Clone)]
pub struct ClipItem {
    pub samples: Vec<f32>,
    /// Index into [super::SPEECH_EMOTIONS], absent for unlabeled data.
    pub label: Option<usize>,
}

/// A clip that is ready to be fed to the model.
#[derive(Debug, Clone)]
pub struct EmotionItem {
    pub input_values: Vec<f32>,
    pub label: Option<usize>,
}

#[derive(Clone, Debug)]
pub struct EmotionBatch<B: Backend> {
    /// [batch_size, samples]
    pub inputs: Tensor<B, 2>,
    /// Only present when every item in the batch had a label.
    pub labels: Option<Tensor<B, 1, Int>>,
}

/// Clips are normalised lazily, as they are pulled out of the dataset.
pub type EmotionDataset = MapperDataset<InMemDataset<ClipItem>, FeatureMapper, ClipItem>;

pub fn emotion_dataset(clips: Vec<ClipItem>, mapper: FeatureMapper) -> EmotionDataset {
    MapperDataset::new(InMemDataset::new(clips), mapper)
}

#[derive(Clone)]
pub struct EmotionBatcher<B: Backend> {
    device: B::Device,
    padding_value: f32,
}

impl<B: Backend> EmotionBatcher<B> {
    pub fn new(device: B::Device) -> Self {
        Self {
            device,
            padding_value: 0.0,
        }
    }

    pub fn with_padding_value(mut self, padding_value: f32) -> Self {
        self.padding_value = padding_value;
        self
    }
}

impl<B: Backend> Batcher<EmotionItem, EmotionBatch<B>> for EmotionBatcher<B> {
    fn batch(&self, items: Vec<EmotionItem>) -> EmotionBatch<B> {
        // Clips are normally all the same length already, but don't rely on it.
        let width = items.iter().map(|item| item.input_values.len()).max().unwrap_or(0);

        let labels = items
            .iter()
            .map(|item| item.label.map(|label| label as i64))
            .collect::<Option<Vec<_>>>()
            .map(|labels| {
                let len = labels.len();
                Tensor::<B, 1, Int>::from_data(TensorData::new(labels, [len]).convert::<B::IntElem>(), &self.device)
            });

        let rows = items
            .into_iter()
            .map(|item| {
                let mut values = item.input_values;
                values.resize(width, self.padding_value);
                TensorData::new(values, [width]).convert::<B::FloatElem>()
            })
            .map(|data| Tensor::<B, 1>::from_data(data, &self.device))
            .map(|tens| tens.unsqueeze_dim(0))
            .collect();

        let inputs = Tensor::cat(rows, 0).to_device(&self.device);

        EmotionBatch { inputs, labels }
    }
}

#[cfg(test)]
mod tests {
    use burn::backend::NdArray;
    use burn::data::dataset::Dataset;

    use super::*;
    use crate::processor::Wav2Vec2FeatureExtractor;

    type TestBackend = NdArray<f32, i32>;

    fn item(values: &[f32], label: Option<usize>) -> EmotionItem {
        EmotionItem {
            input_values: values.to_vec(),
            label,
        }
    }

    #[test]
    fn batches_labeled_items() -> eyre::Result<()> {
        let batcher = EmotionBatcher::<TestBackend>::new(Default::default());
        let batch = batcher.batch(vec![item(&[1.0, 2.0], Some(3)), item(&[3.0, 4.0], Some(5))]);

        assert_eq!(batch.inputs.dims(), [2, 2]);
        let labels = batch.labels.ok_or_else(|| eyre::eyre!("Missing labels"))?;
        let labels = labels.into_data().convert::<i64>().to_vec::<i64>().map_err(|e| eyre::eyre!("{e:?}"))?;
        assert_eq!(labels, vec![3, 5]);
        Ok(())
    }

    #[test]
    fn any_missing_label_drops_all_labels() {
        let batcher = EmotionBatcher::<TestBackend>::new(Default::default());
        let batch = batcher.batch(vec![item(&[1.0], Some(0)), item(&[2.0], None)]);

        assert!(batch.labels.is_none());
    }

    #[test]
    fn pads_to_longest_item() -> eyre::Result<()> {
        let batcher = EmotionBatcher::<TestBackend>::new(Default::default()).with_padding_value(-1.0);
        let batch = batcher.batch(vec![item(&[1.0, 2.0, 3.0], None), item(&[4.0], None)]);

        assert_eq!(batch.inputs.dims(), [2, 3]);
        let values = batch.inputs.into_data().to_vec::<f32>().map_err(|e| eyre::eyre!("{e:?}"))?;
        assert_eq!(values, vec![1.0, 2.0, 3.0, 4.0, -1.0, -1.0]);
        Ok(())
    }

    #[test]
    fn dataset_normalises_on_access() {
        let clips = vec![ClipItem {
            samples: vec![1.0, 2.0, 3.0],
            label: Some(2),
        }];
        let dataset = emotion_dataset(clips, FeatureMapper::new(Wav2Vec2FeatureExtractor::default()));

        assert_eq!(dataset.len(), 1);
        let item = dataset.get(0).unwrap();
        assert_eq!(item.label, Some(2));
        assert!(item.input_values.iter().sum::<f32>().abs() < 1e-5);
    }
}
