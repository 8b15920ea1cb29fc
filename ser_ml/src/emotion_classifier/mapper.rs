use burn::data::dataset::transform::Mapper;

use crate::emotion_classifier::data::{ClipItem, EmotionItem};
use crate::processor::Wav2Vec2FeatureExtractor;

/// Turns raw clips into normalised model inputs.
#[derive(Debug, Clone)]
pub struct FeatureMapper {
    extractor: Wav2Vec2FeatureExtractor,
}

impl FeatureMapper {
    pub fn new(extractor: Wav2Vec2FeatureExtractor) -> Self {
        Self { extractor }
    }

    pub fn extractor(&self) -> &Wav2Vec2FeatureExtractor {
        &self.extractor
    }
}

impl Mapper<ClipItem, EmotionItem> for FeatureMapper {
    fn map(&self, item: &ClipItem) -> EmotionItem {
        EmotionItem {
            input_values: self.extractor.process(&item.samples),
            label: item.label,
        }
    }
}
