//! A `burn` rendition of the wav2vec2 sequence-classification architecture, laid out so that the
//! parameter names line up with the published PyTorch checkpoints.

use std::path::Path;

use burn::prelude::{Backend, Module};
use burn::record::{FullPrecisionSettings, Recorder};
use burn_import::pytorch::{LoadArgs, PyTorchFileRecorder};
use serde::{Deserialize, Serialize};

use crate::emotion_classifier::LoadError;

pub use model::*;
pub use spec_augment::SpanMasking;

mod model;
mod spec_augment;

/// Normalisation used inside the convolutional feature encoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FeatExtractNorm {
    /// Only the first convolution is followed by a (per-channel) group norm.
    Group,
    /// Every convolution is followed by a layer norm over the channels.
    Layer,
}

/// Subset of the HuggingFace `config.json` needed to rebuild the backbone.
///
/// Unknown keys are ignored, missing keys fall back to the reference defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Wav2Vec2Config {
    pub hidden_size: usize,
    pub num_hidden_layers: usize,
    pub num_attention_heads: usize,
    pub intermediate_size: usize,
    pub hidden_dropout: f64,
    pub activation_dropout: f64,
    pub attention_dropout: f64,
    pub feat_proj_dropout: f64,
    pub layer_norm_eps: f64,
    pub feat_extract_norm: FeatExtractNorm,
    pub conv_dim: Vec<usize>,
    pub conv_stride: Vec<usize>,
    pub conv_kernel: Vec<usize>,
    pub conv_bias: bool,
    pub num_conv_pos_embeddings: usize,
    pub num_conv_pos_embedding_groups: usize,
    /// Pre-norm transformer layers with a final encoder norm, used by the large checkpoints.
    pub do_stable_layer_norm: bool,
    /// Width of the `projector` layer, which is the width of the pooled backbone output.
    pub classifier_proj_size: usize,
    /// Mask spans of the projected features while training.
    pub apply_spec_augment: bool,
    pub mask_time_prob: f64,
    pub mask_time_length: usize,
    pub mask_time_min_masks: usize,
    pub mask_feature_prob: f64,
    pub mask_feature_length: usize,
    pub mask_feature_min_masks: usize,
    /// Probability of skipping each transformer layer while training.
    pub layerdrop: f64,
}

impl Default for Wav2Vec2Config {
    fn default() -> Self {
        Self {
            hidden_size: 768,
            num_hidden_layers: 12,
            num_attention_heads: 12,
            intermediate_size: 3072,
            hidden_dropout: 0.1,
            activation_dropout: 0.1,
            attention_dropout: 0.1,
            feat_proj_dropout: 0.0,
            layer_norm_eps: 1e-5,
            feat_extract_norm: FeatExtractNorm::Group,
            conv_dim: vec![512; 7],
            conv_stride: vec![5, 2, 2, 2, 2, 2, 2],
            conv_kernel: vec![10, 3, 3, 3, 3, 2, 2],
            conv_bias: false,
            num_conv_pos_embeddings: 128,
            num_conv_pos_embedding_groups: 16,
            do_stable_layer_norm: false,
            classifier_proj_size: 256,
            apply_spec_augment: true,
            mask_time_prob: 0.05,
            mask_time_length: 10,
            mask_time_min_masks: 2,
            mask_feature_prob: 0.0,
            mask_feature_length: 10,
            mask_feature_min_masks: 0,
            layerdrop: 0.1,
        }
    }
}

impl burn::config::Config for Wav2Vec2Config {}

impl Wav2Vec2Config {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, LoadError> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(LoadError::ModelNotFound { path: path.to_path_buf() });
        }

        Ok(serde_json::from_slice(&std::fs::read(path)?)?)
    }

    /// Number of output frames the feature encoder produces for `num_samples` input samples.
    pub fn output_frames(&self, num_samples: usize) -> usize {
        self.conv_kernel
            .iter()
            .zip(&self.conv_stride)
            .fold(num_samples, |len, (kernel, stride)| {
                len.saturating_sub(*kernel) / stride + 1
            })
    }

    /// Whether the checkpoint carries the learned `masked_spec_embed` which fills masked frames.
    pub fn has_masked_spec_embed(&self) -> bool {
        self.mask_time_prob > 0.0 || self.mask_feature_prob > 0.0
    }

    pub fn time_masking(&self) -> SpanMasking {
        SpanMasking {
            prob: self.mask_time_prob,
            length: self.mask_time_length,
            min_masks: self.mask_time_min_masks,
        }
    }

    pub fn feature_masking(&self) -> SpanMasking {
        SpanMasking {
            prob: self.mask_feature_prob,
            length: self.mask_feature_length,
            min_masks: self.mask_feature_min_masks,
        }
    }

    /// Load the backbone, minus its classification head, from a PyTorch `pytorch_model.bin`.
    #[tracing::instrument(skip(self, device))]
    pub fn load_pretrained<B: Backend>(
        &self,
        weights: &Path,
        device: &B::Device,
    ) -> Result<Wav2Vec2ForSequenceClassification<B>, LoadError> {
        if !weights.exists() {
            return Err(LoadError::ModelNotFound { path: weights.to_path_buf() });
        }

        let mut args = LoadArgs::new(weights.to_path_buf())
            // Newer checkpoints store weight norm through `torch.nn.utils.parametrize`.
            .with_key_remap(r"(.*)\.parametrizations\.weight\.original0$", "$1.weight_g")
            .with_key_remap(r"(.*)\.parametrizations\.weight\.original1$", "$1.weight_v");

        if self.feat_extract_norm == FeatExtractNorm::Group {
            // The group norm is registered as `layer_norm` upstream.
            args = args.with_key_remap(
                r"^wav2vec2\.feature_extractor\.conv_layers\.0\.layer_norm\.(.*)",
                "wav2vec2.feature_extractor.conv_layers.0.group_norm.$1",
            );
        }

        let record = PyTorchFileRecorder::<FullPrecisionSettings>::default().load(args, device)?;
        tracing::debug!("Loaded pretrained backbone weights");

        Ok(self.init::<B>(device).load_record(record))
    }
}
