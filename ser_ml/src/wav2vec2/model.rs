use burn::module::Param;
use burn::nn::conv::{Conv1d, Conv1dConfig};
use burn::nn::{
    Dropout, DropoutConfig, GroupNorm, GroupNormConfig, Initializer, LayerNorm, LayerNormConfig, Linear,
    LinearConfig,
};
use burn::prelude::{Backend, Module, Tensor};
use burn::tensor::activation::{gelu, softmax};
use burn::tensor::module::conv1d;
use burn::tensor::ops::ConvOptions;
use burn::tensor::Distribution;

use crate::wav2vec2::{FeatExtractNorm, SpanMasking, Wav2Vec2Config};

/// The pretrained backbone: wav2vec2 encoder, `projector`, and mean pooling over time.
///
/// The checkpoint's own `classifier` is not loaded, the output is the pooled projector activations.
#[derive(Module, Debug)]
pub struct Wav2Vec2ForSequenceClassification<B: Backend> {
    wav2vec2: Wav2Vec2Model<B>,
    projector: Linear<B>,
}

impl<B: Backend> Wav2Vec2ForSequenceClassification<B> {
    /// # Shapes
    ///   - Input [batch_size, samples]
    ///   - Output [batch_size, classifier_proj_size]
    pub fn forward(&self, input_values: Tensor<B, 2>) -> Tensor<B, 2> {
        let hidden = self.wav2vec2.forward(input_values);
        let projected = self.projector.forward(hidden);

        projected.mean_dim(1).squeeze::<2>(1)
    }
}

#[derive(Module, Debug)]
pub struct Wav2Vec2Model<B: Backend> {
    feature_extractor: FeatureEncoder<B>,
    feature_projection: FeatureProjection<B>,
    encoder: Encoder<B>,
    /// Replacement for time-masked frames, `[hidden_size]`.
    masked_spec_embed: Option<Param<Tensor<B, 1>>>,
    apply_spec_augment: bool,
    mask_time_prob: f64,
    mask_time_length: usize,
    mask_time_min_masks: usize,
    mask_feature_prob: f64,
    mask_feature_length: usize,
    mask_feature_min_masks: usize,
}

impl<B: Backend> Wav2Vec2Model<B> {
    /// # Shapes
    ///   - Input [batch_size, samples]
    ///   - Output [batch_size, frames, hidden_size]
    pub fn forward(&self, input_values: Tensor<B, 2>) -> Tensor<B, 3> {
        let features = self.feature_extractor.forward(input_values).swap_dims(1, 2);
        let hidden = self.feature_projection.forward(features);
        let hidden = self.mask_hidden_states(hidden);

        self.encoder.forward(hidden)
    }

    /// SpecAugment over the projected features, only while training on an autodiff backend.
    fn mask_hidden_states(&self, hidden: Tensor<B, 3>) -> Tensor<B, 3> {
        if !B::ad_enabled() || !self.apply_spec_augment {
            return hidden;
        }

        let [batch, frames, width] = hidden.dims();
        let device = hidden.device();
        let mut hidden = hidden;

        if let Some(embed) = &self.masked_spec_embed {
            let time = SpanMasking {
                prob: self.mask_time_prob,
                length: self.mask_time_length,
                min_masks: self.mask_time_min_masks,
            };

            if let Some(mask) = time.sample::<B>(batch, frames, &device) {
                let mask = mask.reshape([batch, frames, 1]);
                let keep = mask.clone().neg().add_scalar(1.0);
                hidden = hidden * keep + mask * embed.val().reshape([1, 1, width]);
            }
        }

        let feature = SpanMasking {
            prob: self.mask_feature_prob,
            length: self.mask_feature_length,
            min_masks: self.mask_feature_min_masks,
        };

        if let Some(mask) = feature.sample::<B>(batch, width, &device) {
            hidden = hidden * mask.reshape([batch, 1, width]).neg().add_scalar(1.0);
        }

        hidden
    }
}

#[derive(Module, Debug)]
pub struct FeatureEncoder<B: Backend> {
    conv_layers: Vec<FeatureConvLayer<B>>,
}

impl<B: Backend> FeatureEncoder<B> {
    /// Returns `[batch_size, conv_dim, frames]`.
    pub fn forward(&self, input_values: Tensor<B, 2>) -> Tensor<B, 3> {
        self.conv_layers
            .iter()
            .fold(input_values.unsqueeze_dim(1), |x, layer| layer.forward(x))
    }
}

#[derive(Module, Debug)]
pub struct FeatureConvLayer<B: Backend> {
    conv: Conv1d<B>,
    layer_norm: Option<LayerNorm<B>>,
    group_norm: Option<GroupNorm<B>>,
}

impl<B: Backend> FeatureConvLayer<B> {
    pub fn forward(&self, x: Tensor<B, 3>) -> Tensor<B, 3> {
        let x = self.conv.forward(x);
        let x = match (&self.layer_norm, &self.group_norm) {
            // Layer norm runs over the channels, which are the middle dimension here.
            (Some(norm), _) => norm.forward(x.swap_dims(1, 2)).swap_dims(1, 2),
            (None, Some(norm)) => norm.forward(x),
            (None, None) => x,
        };

        gelu(x)
    }
}

#[derive(Module, Debug)]
pub struct FeatureProjection<B: Backend> {
    layer_norm: LayerNorm<B>,
    projection: Linear<B>,
    dropout: Dropout,
}

impl<B: Backend> FeatureProjection<B> {
    pub fn forward(&self, features: Tensor<B, 3>) -> Tensor<B, 3> {
        let x = self.layer_norm.forward(features);
        let x = self.projection.forward(x);

        self.dropout.forward(x)
    }
}

/// A grouped 1D convolution whose kernel is stored as a weight-norm decomposition along the kernel axis.
#[derive(Module, Debug)]
pub struct WeightNormConv1d<B: Backend> {
    /// Magnitude, `[1, 1, kernel_size]`.
    weight_g: Param<Tensor<B, 3>>,
    /// Direction, `[channels_out, channels_in / groups, kernel_size]`.
    weight_v: Param<Tensor<B, 3>>,
    bias: Param<Tensor<B, 1>>,
    padding: usize,
    groups: usize,
}

impl<B: Backend> WeightNormConv1d<B> {
    pub fn new(channels: usize, kernel_size: usize, groups: usize, device: &B::Device) -> Self {
        Self {
            weight_g: Initializer::Ones.init([1, 1, kernel_size], device),
            weight_v: Initializer::Normal { mean: 0.0, std: 0.02 }.init([channels, channels / groups, kernel_size], device),
            bias: Initializer::Zeros.init([channels], device),
            padding: kernel_size / 2,
            groups,
        }
    }

    pub fn weight(&self) -> Tensor<B, 3> {
        let v = self.weight_v.val();
        let norm = v.clone().powf_scalar(2.0).sum_dim(0).sum_dim(1).sqrt();

        v.div(norm).mul(self.weight_g.val())
    }

    pub fn forward(&self, x: Tensor<B, 3>) -> Tensor<B, 3> {
        let options = ConvOptions::new([1], [self.padding], [1], self.groups);

        conv1d(x, self.weight(), Some(self.bias.val()), options)
    }
}

#[derive(Module, Debug)]
pub struct PositionalConvEmbedding<B: Backend> {
    conv: WeightNormConv1d<B>,
    /// Even kernels produce one frame too many with symmetric padding.
    trim_last: bool,
}

impl<B: Backend> PositionalConvEmbedding<B> {
    /// `[batch_size, frames, hidden_size]` in and out.
    pub fn forward(&self, hidden: Tensor<B, 3>) -> Tensor<B, 3> {
        let [batch, frames, channels] = hidden.dims();
        let x = self.conv.forward(hidden.swap_dims(1, 2));
        let x = if self.trim_last {
            x.slice([0..batch, 0..channels, 0..frames])
        } else {
            x
        };

        gelu(x).swap_dims(1, 2)
    }
}

#[derive(Module, Debug)]
pub struct SelfAttention<B: Backend> {
    q_proj: Linear<B>,
    k_proj: Linear<B>,
    v_proj: Linear<B>,
    out_proj: Linear<B>,
    dropout: Dropout,
    num_heads: usize,
}

impl<B: Backend> SelfAttention<B> {
    pub fn forward(&self, hidden: Tensor<B, 3>) -> Tensor<B, 3> {
        let [batch, frames, width] = hidden.dims();
        let head_dim = width / self.num_heads;
        let scale = (head_dim as f64).powf(-0.5);

        let split_heads = |x: Tensor<B, 3>| x.reshape([batch, frames, self.num_heads, head_dim]).swap_dims(1, 2);

        let query = split_heads(self.q_proj.forward(hidden.clone()).mul_scalar(scale));
        let key = split_heads(self.k_proj.forward(hidden.clone()));
        let value = split_heads(self.v_proj.forward(hidden));

        let weights = softmax(query.matmul(key.swap_dims(2, 3)), 3);
        let weights = self.dropout.forward(weights);

        let context = weights
            .matmul(value)
            .swap_dims(1, 2)
            .reshape([batch, frames, width]);

        self.out_proj.forward(context)
    }
}

#[derive(Module, Debug)]
pub struct FeedForward<B: Backend> {
    intermediate_dense: Linear<B>,
    intermediate_dropout: Dropout,
    output_dense: Linear<B>,
    output_dropout: Dropout,
}

impl<B: Backend> FeedForward<B> {
    pub fn forward(&self, hidden: Tensor<B, 3>) -> Tensor<B, 3> {
        let x = gelu(self.intermediate_dense.forward(hidden));
        let x = self.intermediate_dropout.forward(x);
        let x = self.output_dense.forward(x);

        self.output_dropout.forward(x)
    }
}

#[derive(Module, Debug)]
pub struct EncoderLayer<B: Backend> {
    attention: SelfAttention<B>,
    dropout: Dropout,
    layer_norm: LayerNorm<B>,
    feed_forward: FeedForward<B>,
    final_layer_norm: LayerNorm<B>,
    /// Pre-norm when set, post-norm otherwise.
    stable: bool,
}

impl<B: Backend> EncoderLayer<B> {
    pub fn forward(&self, hidden: Tensor<B, 3>) -> Tensor<B, 3> {
        if self.stable {
            let attended = self.attention.forward(self.layer_norm.forward(hidden.clone()));
            let hidden = hidden + self.dropout.forward(attended);
            let fed = self.feed_forward.forward(self.final_layer_norm.forward(hidden.clone()));

            hidden + fed
        } else {
            let attended = self.attention.forward(hidden.clone());
            let hidden = self.layer_norm.forward(hidden + self.dropout.forward(attended));
            let fed = self.feed_forward.forward(hidden.clone());

            self.final_layer_norm.forward(hidden + fed)
        }
    }
}

#[derive(Module, Debug)]
pub struct Encoder<B: Backend> {
    pos_conv_embed: PositionalConvEmbedding<B>,
    layer_norm: LayerNorm<B>,
    dropout: Dropout,
    layers: Vec<EncoderLayer<B>>,
    stable: bool,
    /// Probability of skipping a layer while training.
    layerdrop: f64,
}

impl<B: Backend> Encoder<B> {
    pub fn forward(&self, hidden: Tensor<B, 3>) -> Tensor<B, 3> {
        let active = self.active_layers(&hidden.device());
        let hidden = hidden.clone() + self.pos_conv_embed.forward(hidden);
        let run_layers = |hidden: Tensor<B, 3>| {
            self.layers
                .iter()
                .zip(&active)
                .filter(|(_, active)| **active)
                .fold(hidden, |x, (layer, _)| layer.forward(x))
        };

        if self.stable {
            let hidden = run_layers(self.dropout.forward(hidden));

            self.layer_norm.forward(hidden)
        } else {
            run_layers(self.dropout.forward(self.layer_norm.forward(hidden)))
        }
    }

    /// Which layers run in this forward pass, layerdrop only applies on an autodiff backend.
    fn active_layers(&self, device: &B::Device) -> Vec<bool> {
        if !B::ad_enabled() || self.layerdrop <= 0.0 || self.layers.is_empty() {
            return vec![true; self.layers.len()];
        }

        Tensor::<B, 1>::random([self.layers.len()], Distribution::Default, device)
            .into_data()
            .iter::<f32>()
            .map(|draw| draw as f64 >= self.layerdrop)
            .collect()
    }
}

impl Wav2Vec2Config {
    /// Create a randomly initialised backbone, [Self::load_pretrained] fills it with the checkpoint weights.
    pub fn init<B: Backend>(&self, device: &B::Device) -> Wav2Vec2ForSequenceClassification<B> {
        Wav2Vec2ForSequenceClassification {
            wav2vec2: Wav2Vec2Model {
                feature_extractor: self.init_feature_encoder(device),
                feature_projection: FeatureProjection {
                    layer_norm: self.layer_norm(self.conv_dim.last().copied().unwrap_or(self.hidden_size), device),
                    projection: LinearConfig::new(
                        self.conv_dim.last().copied().unwrap_or(self.hidden_size),
                        self.hidden_size,
                    )
                    .init(device),
                    dropout: DropoutConfig::new(self.feat_proj_dropout).init(),
                },
                encoder: self.init_encoder(device),
                masked_spec_embed: self
                    .has_masked_spec_embed()
                    .then(|| Initializer::Uniform { min: 0.0, max: 1.0 }.init([self.hidden_size], device)),
                apply_spec_augment: self.apply_spec_augment,
                mask_time_prob: self.mask_time_prob,
                mask_time_length: self.mask_time_length,
                mask_time_min_masks: self.mask_time_min_masks,
                mask_feature_prob: self.mask_feature_prob,
                mask_feature_length: self.mask_feature_length,
                mask_feature_min_masks: self.mask_feature_min_masks,
            },
            projector: LinearConfig::new(self.hidden_size, self.classifier_proj_size).init(device),
        }
    }

    fn layer_norm<B: Backend>(&self, width: usize, device: &B::Device) -> LayerNorm<B> {
        LayerNormConfig::new(width).with_epsilon(self.layer_norm_eps).init(device)
    }

    fn init_feature_encoder<B: Backend>(&self, device: &B::Device) -> FeatureEncoder<B> {
        let conv_layers = self
            .conv_dim
            .iter()
            .zip(&self.conv_kernel)
            .zip(&self.conv_stride)
            .enumerate()
            .map(|(i, ((&channels_out, &kernel), &stride))| {
                let channels_in = if i == 0 { 1 } else { self.conv_dim[i - 1] };
                let conv = Conv1dConfig::new(channels_in, channels_out, kernel)
                    .with_stride(stride)
                    .with_bias(self.conv_bias)
                    .init(device);

                let (layer_norm, group_norm) = match self.feat_extract_norm {
                    FeatExtractNorm::Layer => (Some(self.layer_norm(channels_out, device)), None),
                    FeatExtractNorm::Group if i == 0 => (
                        None,
                        Some(
                            GroupNormConfig::new(channels_out, channels_out)
                                .with_epsilon(self.layer_norm_eps)
                                .init(device),
                        ),
                    ),
                    FeatExtractNorm::Group => (None, None),
                };

                FeatureConvLayer {
                    conv,
                    layer_norm,
                    group_norm,
                }
            })
            .collect();

        FeatureEncoder { conv_layers }
    }

    fn init_encoder<B: Backend>(&self, device: &B::Device) -> Encoder<B> {
        let layers = (0..self.num_hidden_layers)
            .map(|_| EncoderLayer {
                attention: SelfAttention {
                    q_proj: LinearConfig::new(self.hidden_size, self.hidden_size).init(device),
                    k_proj: LinearConfig::new(self.hidden_size, self.hidden_size).init(device),
                    v_proj: LinearConfig::new(self.hidden_size, self.hidden_size).init(device),
                    out_proj: LinearConfig::new(self.hidden_size, self.hidden_size).init(device),
                    dropout: DropoutConfig::new(self.attention_dropout).init(),
                    num_heads: self.num_attention_heads,
                },
                dropout: DropoutConfig::new(self.hidden_dropout).init(),
                layer_norm: self.layer_norm(self.hidden_size, device),
                feed_forward: FeedForward {
                    intermediate_dense: LinearConfig::new(self.hidden_size, self.intermediate_size).init(device),
                    intermediate_dropout: DropoutConfig::new(self.activation_dropout).init(),
                    output_dense: LinearConfig::new(self.intermediate_size, self.hidden_size).init(device),
                    output_dropout: DropoutConfig::new(self.hidden_dropout).init(),
                },
                final_layer_norm: self.layer_norm(self.hidden_size, device),
                stable: self.do_stable_layer_norm,
            })
            .collect();

        Encoder {
            pos_conv_embed: PositionalConvEmbedding {
                conv: WeightNormConv1d::new(
                    self.hidden_size,
                    self.num_conv_pos_embeddings,
                    self.num_conv_pos_embedding_groups,
                    device,
                ),
                trim_last: self.num_conv_pos_embeddings % 2 == 0,
            },
            layer_norm: self.layer_norm(self.hidden_size, device),
            dropout: DropoutConfig::new(self.hidden_dropout).init(),
            layers,
            stable: self.do_stable_layer_norm,
            layerdrop: self.layerdrop,
        }
    }
}

#[cfg(test)]
mod tests {
    use burn::backend::{Autodiff, NdArray};
    use burn::module::AutodiffModule;
    use burn::prelude::TensorData;

    use super::*;

    type TestBackend = NdArray<f32, i32>;

    fn tiny_config(norm: FeatExtractNorm, stable: bool) -> Wav2Vec2Config {
        Wav2Vec2Config {
            hidden_size: 16,
            num_hidden_layers: 2,
            num_attention_heads: 2,
            intermediate_size: 32,
            feat_extract_norm: norm,
            conv_dim: vec![8, 8, 8],
            conv_stride: vec![5, 4, 4],
            conv_kernel: vec![10, 3, 3],
            conv_bias: true,
            num_conv_pos_embeddings: 4,
            num_conv_pos_embedding_groups: 2,
            do_stable_layer_norm: stable,
            classifier_proj_size: 12,
            ..Default::default()
        }
    }

    #[test]
    fn encoder_output_matches_frame_count() {
        let device = Default::default();
        let config = tiny_config(FeatExtractNorm::Group, false);
        let model = config.init::<TestBackend>(&device);

        let input = Tensor::<TestBackend, 2>::ones([3, 4_000], &device);
        let hidden = model.wav2vec2.forward(input);

        assert_eq!(hidden.dims(), [3, config.output_frames(4_000), 16]);
    }

    #[test]
    fn pooled_output_has_projector_width() {
        let device = Default::default();
        for (norm, stable) in [(FeatExtractNorm::Layer, true), (FeatExtractNorm::Group, false)] {
            let model = tiny_config(norm, stable).init::<TestBackend>(&device);
            let input = Tensor::<TestBackend, 2>::random([2, 2_000], burn::tensor::Distribution::Default, &device);

            assert_eq!(model.forward(input).dims(), [2, 12]);
        }
    }

    #[test]
    fn masking_and_layerdrop_only_apply_with_autodiff() {
        type TrainBackend = Autodiff<TestBackend>;

        let device = Default::default();
        let regularised = Wav2Vec2Config {
            hidden_dropout: 0.0,
            activation_dropout: 0.0,
            attention_dropout: 0.0,
            feat_proj_dropout: 0.0,
            mask_time_prob: 1.0,
            mask_time_length: 2,
            layerdrop: 1.0,
            ..tiny_config(FeatExtractNorm::Group, false)
        };
        let plain = Wav2Vec2Config {
            apply_spec_augment: false,
            layerdrop: 0.0,
            ..regularised.clone()
        };

        let model = regularised.init::<TrainBackend>(&device);
        let same_weights = plain
            .init::<TrainBackend>(&device)
            .load_record(model.clone().into_record());
        let input = Tensor::<TrainBackend, 2>::random([2, 2_000], Distribution::Default, &device);

        let validation = model.valid().wav2vec2.forward(input.clone().inner()).into_data();
        let unregularised = same_weights.wav2vec2.forward(input.clone()).inner().into_data();
        let training = model.wav2vec2.forward(input).inner().into_data();

        validation.assert_approx_eq(&unregularised, 4);

        let max_diff = validation
            .iter::<f32>()
            .zip(training.iter::<f32>())
            .map(|(a, b)| (a - b).abs())
            .fold(0.0f32, f32::max);
        assert!(max_diff > 1e-3, "training forward matched validation forward");
    }

    #[test]
    fn masked_spec_embed_follows_masking_config() {
        let device = Default::default();
        let masked = tiny_config(FeatExtractNorm::Group, false).init::<TestBackend>(&device);
        assert_eq!(masked.wav2vec2.masked_spec_embed.map(|p| p.val().dims()), Some([16]));

        let unmasked = Wav2Vec2Config {
            mask_time_prob: 0.0,
            ..tiny_config(FeatExtractNorm::Group, false)
        }
        .init::<TestBackend>(&device);
        assert!(unmasked.wav2vec2.masked_spec_embed.is_none());
    }

    #[test]
    fn weight_norm_restores_direction_magnitude() {
        let device = Default::default();
        let conv = WeightNormConv1d::<TestBackend>::new(4, 3, 2, &device);

        // With unit magnitudes every kernel slice has unit norm across channels.
        let weight = conv.weight();
        let norms = weight.powf_scalar(2.0).sum_dim(0).sum_dim(1).sqrt();
        norms
            .into_data()
            .assert_approx_eq(&TensorData::from([[[1.0f32, 1.0, 1.0]]]), 4);
    }

    #[test]
    fn even_positional_kernel_keeps_frame_count() {
        let device = Default::default();
        let embedding = PositionalConvEmbedding {
            conv: WeightNormConv1d::<TestBackend>::new(8, 4, 2, &device),
            trim_last: true,
        };
        let hidden = Tensor::<TestBackend, 3>::zeros([1, 10, 8], &device);

        assert_eq!(embedding.forward(hidden).dims(), [1, 10, 8]);
    }
}
