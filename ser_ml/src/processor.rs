//! Waveform normalisation matching the pretrained checkpoint's `preprocessor_config.json`.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::emotion_classifier::LoadError;

/// Small constant added to the variance to avoid dividing by zero on silent clips.
const NORMALIZE_EPS: f32 = 1e-7;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Wav2Vec2FeatureExtractor {
    #[serde(default = "default_feature_size")]
    pub feature_size: usize,
    #[serde(default = "default_sampling_rate")]
    pub sampling_rate: u32,
    #[serde(default)]
    pub padding_value: f32,
    #[serde(default = "default_do_normalize")]
    pub do_normalize: bool,
}

fn default_feature_size() -> usize {
    1
}

fn default_sampling_rate() -> u32 {
    16_000
}

fn default_do_normalize() -> bool {
    true
}

impl Default for Wav2Vec2FeatureExtractor {
    fn default() -> Self {
        Self {
            feature_size: default_feature_size(),
            sampling_rate: default_sampling_rate(),
            padding_value: 0.0,
            do_normalize: default_do_normalize(),
        }
    }
}

impl Wav2Vec2FeatureExtractor {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, LoadError> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(LoadError::ModelNotFound { path: path.to_path_buf() });
        }

        Ok(serde_json::from_slice(&std::fs::read(path)?)?)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), LoadError> {
        std::fs::write(path, serde_json::to_vec_pretty(self)?)?;
        Ok(())
    }

    /// Turn a raw waveform into the model's input values.
    ///
    /// With `do_normalize` every clip is independently scaled to zero mean and unit variance.
    pub fn process(&self, samples: &[f32]) -> Vec<f32> {
        if !self.do_normalize || samples.is_empty() {
            return samples.to_vec();
        }

        let n = samples.len() as f32;
        let mean = samples.iter().sum::<f32>() / n;
        let variance = samples.iter().map(|s| (s - mean).powi(2)).sum::<f32>() / n;
        let std = (variance + NORMALIZE_EPS).sqrt();

        samples.iter().map(|s| (s - mean) / std).collect()
    }
}
