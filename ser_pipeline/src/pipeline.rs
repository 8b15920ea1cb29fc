use std::path::{Path, PathBuf};

use eyre::WrapErr;
use itertools::Itertools;
use ser_ml::audio;
use ser_ml::burn::data::dataloader::DataLoaderBuilder;
use ser_ml::burn::optim::AdamWConfig;
use ser_ml::burn::prelude::Backend;
use ser_ml::burn::tensor::backend::AutodiffBackend;
use ser_ml::emotion_classifier::data::{emotion_dataset, ClipItem, EmotionBatcher};
use ser_ml::emotion_classifier::inference::{self, Prediction};
use ser_ml::emotion_classifier::mapper::FeatureMapper;
use ser_ml::emotion_classifier::model::{EmotionModel, EmotionModelConfig};
use ser_ml::emotion_classifier::training::{self, EpochSummary, TrainingConfig};
use ser_ml::emotion_classifier::{
    PretrainedEmotionModel, PretrainedFiles, SpeechEmotion, SpeechEmotionClassifier, PREPROCESSOR_FILE,
};
use ser_ml::processor::Wav2Vec2FeatureExtractor;

use crate::config::SharedConfig;
use crate::metadata::{self, MetadataRow};
use crate::split::train_valid_split;
use crate::submission::write_submission;

/// Summary of a full fine-tuning run.
#[derive(Debug, Clone)]
pub struct PipelineReport {
    pub train_rows: usize,
    pub valid_rows: usize,
    pub test_rows: usize,
    pub best_epoch: Option<usize>,
    pub best_accuracy: f64,
    pub history: Vec<EpochSummary>,
    pub submission: PathBuf,
}

/// Runs the stages of the fine-tuning pipeline in order: metadata, preprocessing, training, inference, submission.
pub struct Pipeline {
    config: SharedConfig,
}

impl Pipeline {
    pub fn new(config: SharedConfig) -> Self {
        Self { config }
    }

    /// Fine-tune the configured pretrained checkpoint and write the submission.
    #[tracing::instrument(skip_all)]
    pub fn run<B: AutodiffBackend>(&self, device: B::Device) -> eyre::Result<PipelineReport> {
        B::seed(self.config.training.seed);

        let files = self.pretrained_files()?;
        let pretrained = PretrainedEmotionModel::<B>::load(&files, self.config.training.num_labels, &device)?;

        self.run_with_model(pretrained.config, pretrained.model, pretrained.extractor, device)
    }

    /// Same as [Self::run], but starting from an already constructed model.
    pub fn run_with_model<B: AutodiffBackend>(
        &self,
        model_config: EmotionModelConfig,
        model: EmotionModel<B>,
        extractor: Wav2Vec2FeatureExtractor,
        device: B::Device,
    ) -> eyre::Result<PipelineReport> {
        let conf = &self.config;
        B::seed(conf.training.seed);

        if extractor.sampling_rate != conf.training.sample_rate {
            tracing::warn!(
                checkpoint = extractor.sampling_rate,
                configured = conf.training.sample_rate,
                "Checkpoint was trained at a different sample rate"
            );
        }

        let labeled = metadata::read_labeled(conf.dirs.train_csv_path(), conf.training.num_labels)?;
        let test_rows = metadata::read_unlabeled(conf.dirs.test_csv_path())?;
        let (train_rows, valid_rows) = train_valid_split(labeled, conf.training.valid_ratio, conf.training.seed);

        let train_clips = self.load_split("train", &train_rows)?;
        let valid_clips = self.load_split("valid", &valid_rows)?;
        let test_clips = self.load_split("test", &test_rows)?;

        let artifact_dir = &conf.dirs.artifact_dir;
        std::fs::create_dir_all(artifact_dir)?;
        extractor
            .save(artifact_dir.join(PREPROCESSOR_FILE))
            .wrap_err("Failed to save preprocessor config")?;

        let backbone = &model_config.backbone;
        let frames = backbone.output_frames(conf.audio.max_samples);
        tracing::debug!(samples = conf.audio.max_samples, frames, "Encoder frames per clip");
        if backbone.apply_spec_augment && backbone.mask_time_prob > 0.0 && frames < backbone.mask_time_length {
            tracing::warn!(
                frames,
                mask_time_length = backbone.mask_time_length,
                "Clips are shorter than one time mask span, time masking will be skipped"
            );
        }

        let mapper = FeatureMapper::new(extractor);
        let training_config = self.training_config(model_config, mapper.extractor().padding_value);

        let outcome = training::train::<B>(
            artifact_dir,
            model,
            emotion_dataset(train_clips, mapper.clone()),
            emotion_dataset(valid_clips, mapper.clone()),
            &training_config,
            device.clone(),
        )?;

        // No workers, so batches come back in table order.
        let test_loader = DataLoaderBuilder::new(
            EmotionBatcher::<B::InnerBackend>::new(device).with_padding_value(training_config.padding_value),
        )
        .batch_size(conf.training.batch_size)
        .build(emotion_dataset(test_clips, mapper));

        let predictions = inference::infer(&outcome.model, &test_loader)?;
        log_distribution(&predictions);

        write_submission(&conf.dirs.sample_submission_path(), &conf.dirs.output, &predictions)?;

        Ok(PipelineReport {
            train_rows: train_rows.len(),
            valid_rows: valid_rows.len(),
            test_rows: test_rows.len(),
            best_epoch: outcome.best_epoch,
            best_accuracy: outcome.best_accuracy,
            history: outcome.history,
            submission: conf.dirs.output.clone(),
        })
    }

    /// Write a submission using a model previously fine-tuned by [Self::run].
    #[tracing::instrument(skip(self, device))]
    pub fn predict<B: Backend>(&self, artifact_dir: &Path, output: &Path, device: B::Device) -> eyre::Result<usize> {
        let conf = &self.config;
        let classifier = SpeechEmotionClassifier::<B>::new(artifact_dir, device)?;

        let test_rows = metadata::read_unlabeled(conf.dirs.test_csv_path())?;
        let clips = self.load_split("test", &test_rows)?;

        let mut predictions = Vec::with_capacity(clips.len());
        for chunk in &clips.into_iter().map(|clip| clip.samples).chunks(conf.training.batch_size.max(1)) {
            predictions.extend(classifier.infer(chunk)?);
        }
        log_distribution(&predictions);

        Ok(write_submission(&conf.dirs.sample_submission_path(), output, &predictions)?)
    }

    fn pretrained_files(&self) -> eyre::Result<PretrainedFiles> {
        let model = &self.config.model;
        let files = match &model.local_dir {
            Some(dir) => PretrainedFiles::from_dir(dir)?,
            None => PretrainedFiles::fetch(&model.model_id, model.cache_dir.as_deref())?,
        };

        Ok(files)
    }

    fn training_config(&self, model: EmotionModelConfig, padding_value: f32) -> TrainingConfig {
        let training = &self.config.training;
        let optimizer = AdamWConfig::new()
            .with_weight_decay(training.weight_decay)
            .with_epsilon(1e-8);

        TrainingConfig::new(model, optimizer)
            .with_num_epochs(training.epochs)
            .with_batch_size(training.batch_size)
            .with_total_batch_size(training.total_batch_size)
            .with_num_workers(training.num_workers)
            .with_seed(training.seed)
            .with_learning_rate(training.learning_rate)
            .with_padding_value(padding_value)
    }

    /// Decode every clip of a split, keeping the table order.
    #[tracing::instrument(skip(self, rows), fields(clips = rows.len()))]
    fn load_split(&self, split: &str, rows: &[MetadataRow]) -> eyre::Result<Vec<ClipItem>> {
        let paths = rows
            .iter()
            .map(|row| row.resolve(&self.config.dirs.data_dir))
            .collect::<Vec<_>>();
        let clips = audio::load_clips(&paths, &self.config.clip_config())
            .wrap_err_with(|| format!("Failed to preprocess the {split} split"))?;

        Ok(clips
            .into_iter()
            .zip(rows)
            .map(|(samples, row)| ClipItem {
                samples,
                label: row.label,
            })
            .collect())
    }
}

fn log_distribution(predictions: &[Prediction]) {
    let counts = predictions
        .iter()
        .counts_by(|p| (p.label, p.emotion().map(SpeechEmotion::name).unwrap_or("unknown")));

    for ((label, emotion), count) in counts.into_iter().sorted() {
        tracing::debug!(label, emotion, count, "Predicted label distribution");
    }
}
