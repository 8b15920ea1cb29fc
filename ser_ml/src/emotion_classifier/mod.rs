use std::fmt::Debug;
use std::path::{Path, PathBuf};

use burn::backend::NdArray;
use burn::prelude::{Backend, Config, Module};
use burn::record::{CompactRecorder, Recorder};
use error_set::error_set;

use crate::emotion_classifier::data::{ClipItem, EmotionBatcher};
use crate::emotion_classifier::inference::Prediction;
use crate::emotion_classifier::mapper::FeatureMapper;
use crate::emotion_classifier::model::{EmotionModel, EmotionModelConfig};
use crate::emotion_classifier::training::TrainingConfig;
use crate::processor::Wav2Vec2FeatureExtractor;
use crate::wav2vec2::Wav2Vec2Config;

pub mod data;
pub mod inference;
pub mod mapper;
pub mod model;
pub mod training;

/// File names used both in HuggingFace checkpoints and in our own training artifacts.
pub const CONFIG_FILE: &str = "config.json";
pub const PREPROCESSOR_FILE: &str = "preprocessor_config.json";
pub const WEIGHTS_FILE: &str = "pytorch_model.bin";
pub const MODEL_FILE: &str = "model";

pub const SPEECH_EMOTIONS: [&str; 6] = ["angry", "fear", "sad", "disgust", "neutral", "happy"];

error_set! {
    LoadError = {
        #[display("Could not find the model at {path:?}")]
        ModelNotFound {
            path: PathBuf
        },
        #[display("Could not fetch from the HuggingFace hub: {0}")]
        Hub(hf_hub::api::sync::ApiError),
        BurnConfig(burn::config::ConfigError),
        Recorder(burn::record::RecorderError),
        Io(std::io::Error),
        Json(serde_json::Error),
        Eyre(eyre::Error)
    };
    OutOfRangeError = {
        NoEmotionMapped,
    };
}

/// Locations of the three files that make up a pretrained checkpoint.
#[derive(Debug, Clone)]
pub struct PretrainedFiles {
    pub config: PathBuf,
    pub preprocessor: PathBuf,
    pub weights: PathBuf,
}

impl PretrainedFiles {
    /// Use a checkpoint that already lives on disk.
    pub fn from_dir(dir: impl AsRef<Path>) -> Result<Self, LoadError> {
        let dir = dir.as_ref();
        let files = Self {
            config: dir.join(CONFIG_FILE),
            preprocessor: dir.join(PREPROCESSOR_FILE),
            weights: dir.join(WEIGHTS_FILE),
        };

        for path in [&files.config, &files.preprocessor, &files.weights] {
            if !path.exists() {
                return Err(LoadError::ModelNotFound { path: path.clone() });
            }
        }

        Ok(files)
    }

    /// Download (or reuse from the local hub cache) the checkpoint `model_id`.
    #[tracing::instrument]
    pub fn fetch(model_id: &str, cache_dir: Option<&Path>) -> Result<Self, LoadError> {
        use hf_hub::api::sync::{Api, ApiBuilder};

        let api = match cache_dir {
            Some(dir) => ApiBuilder::new().with_cache_dir(dir.to_path_buf()).build(),
            None => Api::new(),
        }?;
        let repo = api.model(model_id.to_string());

        Ok(Self {
            config: repo.get(CONFIG_FILE)?,
            preprocessor: repo.get(PREPROCESSOR_FILE)?,
            weights: repo.get(WEIGHTS_FILE)?,
        })
    }
}

/// A freshly assembled classifier: pretrained backbone plus a new, randomly initialised head.
pub struct PretrainedEmotionModel<B: Backend> {
    pub config: EmotionModelConfig,
    pub model: EmotionModel<B>,
    pub extractor: Wav2Vec2FeatureExtractor,
}

impl<B: Backend> PretrainedEmotionModel<B> {
    #[tracing::instrument(skip(device))]
    pub fn load(files: &PretrainedFiles, num_classes: usize, device: &B::Device) -> Result<Self, LoadError> {
        let backbone_config = Wav2Vec2Config::from_file(&files.config)?;
        let extractor = Wav2Vec2FeatureExtractor::from_file(&files.preprocessor)?;

        tracing::info!(
            hidden_size = backbone_config.hidden_size,
            layers = backbone_config.num_hidden_layers,
            "Loading pretrained backbone"
        );
        let backbone = backbone_config.load_pretrained::<B>(&files.weights, device)?;
        let config = EmotionModelConfig::new(backbone_config, num_classes);
        let model = config.init_with_backbone(backbone, device);

        Ok(Self {
            config,
            model,
            extractor,
        })
    }
}

/// Classifier restored from the artifacts written by [training::train].
pub struct SpeechEmotionClassifier<B: Backend = NdArray> {
    model: EmotionModel<B>,
    mapper: FeatureMapper,
    batcher: EmotionBatcher<B>,
}

impl<B: Backend> SpeechEmotionClassifier<B> {
    /// Load a fine-tuned classifier from a training artifact directory.
    #[tracing::instrument]
    pub fn new(artifact_dir: impl AsRef<Path> + Debug, device: B::Device) -> Result<Self, LoadError> {
        tracing::trace!("Loading speech emotion classifier");
        let artifact_dir = artifact_dir.as_ref();
        let config = TrainingConfig::load(artifact_dir.join(CONFIG_FILE))?;
        let record = CompactRecorder::new().load(artifact_dir.join(MODEL_FILE), &device)?;
        let model = config.model.init::<B>(&device).load_record(record);
        let extractor = Wav2Vec2FeatureExtractor::from_file(artifact_dir.join(PREPROCESSOR_FILE))?;

        Ok(Self {
            model,
            batcher: EmotionBatcher::new(device).with_padding_value(extractor.padding_value),
            mapper: FeatureMapper::new(extractor),
        })
    }

    /// Infer the [SpeechEmotion] of each clip provided in `clips`.
    ///
    /// # Arguments
    /// * `clips` - Decoded mono waveforms at the model's sample rate, see [crate::audio::load_clip].
    ///   The first item in the result matches the first clip in the iterator.
    #[tracing::instrument(skip_all)]
    pub fn infer(&self, clips: impl IntoIterator<Item = Vec<f32>>) -> Result<Vec<Prediction>, LoadError> {
        use burn::data::dataloader::batcher::Batcher;
        use burn::data::dataset::transform::Mapper;

        let items = clips
            .into_iter()
            .map(|samples| self.mapper.map(&ClipItem { samples, label: None }))
            .collect::<Vec<_>>();

        if items.is_empty() {
            return Ok(Vec::new());
        }

        let batch = self.batcher.batch(items);
        Ok(inference::predict(&self.model, batch.inputs)?)
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Ord, PartialOrd, Eq)]
pub enum SpeechEmotion {
    Angry = 0,
    Fear = 1,
    Sad = 2,
    Disgust = 3,
    Neutral = 4,
    Happy = 5,
}

impl SpeechEmotion {
    pub fn name(self) -> &'static str {
        SPEECH_EMOTIONS[self as usize]
    }
}

impl TryFrom<i32> for SpeechEmotion {
    type Error = OutOfRangeError;

    fn try_from(value: i32) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(SpeechEmotion::Angry),
            1 => Ok(SpeechEmotion::Fear),
            2 => Ok(SpeechEmotion::Sad),
            3 => Ok(SpeechEmotion::Disgust),
            4 => Ok(SpeechEmotion::Neutral),
            5 => Ok(SpeechEmotion::Happy),
            _ => Err(OutOfRangeError::NoEmotionMapped),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn emotions_round_trip_through_indices() {
        for index in 0..6 {
            let emotion = SpeechEmotion::try_from(index).unwrap();
            assert_eq!(emotion as i32, index);
            assert_eq!(emotion.name(), SPEECH_EMOTIONS[index as usize]);
        }
        assert!(SpeechEmotion::try_from(6).is_err());
        assert!(SpeechEmotion::try_from(-1).is_err());
    }

    #[test]
    fn missing_checkpoint_dir_is_reported() {
        let err = PretrainedFiles::from_dir("no/such/checkpoint").unwrap_err();
        assert!(matches!(err, LoadError::ModelNotFound { .. }));
    }
}
