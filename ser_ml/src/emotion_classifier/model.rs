use burn::config::Config;
use burn::module::Module;
use burn::nn::loss::CrossEntropyLossConfig;
use burn::nn::{Linear, LinearConfig};
use burn::prelude::{Backend, Int, Tensor};
use burn::train::ClassificationOutput;

use crate::wav2vec2::{Wav2Vec2Config, Wav2Vec2ForSequenceClassification};

#[derive(Module, Debug)]
pub struct EmotionModel<B: Backend> {
    /// Pretrained wav2vec2 encoder, including the projector used for pooling.
    pub backbone: Wav2Vec2ForSequenceClassification<B>,
    classifier: Linear<B>,
}

#[derive(Config, Debug)]
pub struct EmotionModelConfig {
    pub backbone: Wav2Vec2Config,
    /// Number of output classes
    pub num_classes: usize,
}

impl EmotionModelConfig {
    /// Initialise a model with random weights everywhere.
    pub fn init<B: Backend>(&self, device: &B::Device) -> EmotionModel<B> {
        self.init_with_backbone(self.backbone.init(device), device)
    }

    /// Put a fresh classification head on top of an already loaded backbone.
    pub fn init_with_backbone<B: Backend>(
        &self,
        backbone: Wav2Vec2ForSequenceClassification<B>,
        device: &B::Device,
    ) -> EmotionModel<B> {
        EmotionModel {
            backbone,
            classifier: LinearConfig::new(self.backbone.classifier_proj_size, self.num_classes).init(device),
        }
    }
}

impl<B: Backend> EmotionModel<B> {
    /// # Shapes
    ///   - Input values [batch_size, samples]
    ///   - Output [batch_size, num_classes]
    pub fn forward(&self, input_values: Tensor<B, 2>) -> Tensor<B, 2> {
        let pooled = self.backbone.forward(input_values);

        self.classifier.forward(pooled)
    }

    pub fn forward_classification(&self, input_values: Tensor<B, 2>, targets: Tensor<B, 1, Int>) -> ClassificationOutput<B> {
        let logits = self.forward(input_values);
        let loss = CrossEntropyLossConfig::new()
            .init(&logits.device())
            .forward(logits.clone(), targets.clone());

        ClassificationOutput::new(loss, logits, targets)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use burn::backend::NdArray;

    use super::*;
    use crate::wav2vec2::FeatExtractNorm;

    type TestBackend = NdArray<f32, i32>;

    /// Backbone small enough to run a forward pass in a unit test.
    pub fn tiny_model_config(num_classes: usize) -> EmotionModelConfig {
        let backbone = Wav2Vec2Config {
            hidden_size: 16,
            num_hidden_layers: 1,
            num_attention_heads: 2,
            intermediate_size: 32,
            feat_extract_norm: FeatExtractNorm::Group,
            conv_dim: vec![8, 8],
            conv_stride: vec![5, 4],
            conv_kernel: vec![10, 4],
            num_conv_pos_embeddings: 4,
            num_conv_pos_embedding_groups: 2,
            classifier_proj_size: 8,
            ..Default::default()
        };

        EmotionModelConfig::new(backbone, num_classes)
    }

    #[test]
    fn logits_have_one_column_per_class() {
        let device = Default::default();
        let model = tiny_model_config(6).init::<TestBackend>(&device);

        let input = Tensor::<TestBackend, 2>::random([2, 800], burn::tensor::Distribution::Default, &device);
        assert_eq!(model.forward(input).dims(), [2, 6]);
    }

    #[test]
    fn classification_loss_is_finite() {
        let device = Default::default();
        let model = tiny_model_config(6).init::<TestBackend>(&device);

        let input = Tensor::<TestBackend, 2>::random([2, 800], burn::tensor::Distribution::Default, &device);
        let targets = Tensor::<TestBackend, 1, Int>::from_data([1, 4], &device);
        let output = model.forward_classification(input, targets);

        let loss = output.loss.into_scalar();
        assert!(loss.is_finite());
    }
}
