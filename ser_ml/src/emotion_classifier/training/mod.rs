use std::path::Path;
use std::sync::Arc;

use burn::data::dataloader::{DataLoader, DataLoaderBuilder};
use burn::data::dataset::Dataset;
use burn::module::AutodiffModule;
use burn::optim::{AdamWConfig, GradientsAccumulator, GradientsParams, Optimizer};
use burn::prelude::{Backend, Config, ElementConversion, Module};
use burn::record::CompactRecorder;
use burn::tensor::backend::AutodiffBackend;
use eyre::{ContextCompat, WrapErr};

use crate::emotion_classifier::data::{EmotionBatch, EmotionBatcher, EmotionItem};
use crate::emotion_classifier::model::{EmotionModel, EmotionModelConfig};
use crate::emotion_classifier::{CONFIG_FILE, MODEL_FILE};

pub use scheduler::*;

mod scheduler;

/// Data loaders with more workers than this hand out batches in arrival order instead of table order.
pub const MAX_LOADER_WORKERS: usize = 1;

#[derive(Config)]
pub struct TrainingConfig {
    pub model: EmotionModelConfig,
    pub optimizer: AdamWConfig,
    #[config(default = "ReduceLrOnPlateauConfig::new()")]
    pub scheduler: ReduceLrOnPlateauConfig,
    #[config(default = 5)]
    pub num_epochs: usize,
    /// Number of clips per forward pass.
    #[config(default = 8)]
    pub batch_size: usize,
    /// Number of clips per optimizer step.
    #[config(default = 32)]
    pub total_batch_size: usize,
    #[config(default = 1)]
    pub num_workers: usize,
    #[config(default = 42)]
    pub seed: u64,
    #[config(default = 1.0e-5)]
    pub learning_rate: f64,
    #[config(default = 0.0)]
    pub padding_value: f32,
}

impl TrainingConfig {
    /// Number of consecutive batches whose gradients make up one optimizer step.
    pub fn accumulation_step(&self) -> usize {
        (self.total_batch_size / self.batch_size.max(1)).max(1)
    }

    /// Reject settings the training loop cannot honour.
    pub fn ensure_valid(&self) -> eyre::Result<()> {
        eyre::ensure!(self.batch_size > 0, "batch_size must be at least 1");
        eyre::ensure!(
            self.num_workers <= MAX_LOADER_WORKERS,
            "num_workers is {} but at most {MAX_LOADER_WORKERS} keeps the batch order fixed",
            self.num_workers
        );
        Ok(())
    }
}

/// Counts batches and signals when an optimizer step is due.
#[derive(Debug, Clone)]
pub struct AccumulationSteps {
    every: usize,
    pending: usize,
}

impl AccumulationSteps {
    pub fn new(every: usize) -> Self {
        Self {
            every: every.max(1),
            pending: 0,
        }
    }

    /// Register one more backward pass, returns `true` when the accumulated gradients should be applied.
    pub fn tick(&mut self) -> bool {
        self.pending += 1;
        if self.pending == self.every {
            self.pending = 0;
            true
        } else {
            false
        }
    }

    /// Number of backward passes that have not been applied yet.
    pub fn pending(&self) -> usize {
        self.pending
    }
}

/// Keeps a copy of the model with the highest validation accuracy seen so far.
#[derive(Debug)]
pub struct BestSnapshot<M> {
    accuracy: f64,
    epoch: Option<usize>,
    model: Option<M>,
}

impl<M> Default for BestSnapshot<M> {
    fn default() -> Self {
        Self {
            accuracy: 0.0,
            epoch: None,
            model: None,
        }
    }
}

impl<M> BestSnapshot<M> {
    /// Replace the snapshot if `accuracy` is strictly better than the current best.
    ///
    /// `snapshot` is only invoked on replacement.
    pub fn offer(&mut self, epoch: usize, accuracy: f64, snapshot: impl FnOnce() -> M) -> bool {
        if accuracy > self.accuracy {
            self.accuracy = accuracy;
            self.epoch = Some(epoch);
            self.model = Some(snapshot());
            true
        } else {
            false
        }
    }

    pub fn accuracy(&self) -> f64 {
        self.accuracy
    }

    pub fn epoch(&self) -> Option<usize> {
        self.epoch
    }

    pub fn into_model(self) -> Option<M> {
        self.model
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ValidationSummary {
    /// Mean of the per-batch losses.
    pub loss: f64,
    /// Fraction of correctly classified clips.
    pub accuracy: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EpochSummary {
    pub epoch: usize,
    pub train_loss: f64,
    pub valid: ValidationSummary,
    pub learning_rate: f64,
    pub optimizer_steps: usize,
}

pub struct TrainingOutcome<B: Backend> {
    /// Best model by validation accuracy, or the final model if no epoch improved on zero accuracy.
    pub model: EmotionModel<B>,
    pub best_epoch: Option<usize>,
    pub best_accuracy: f64,
    pub history: Vec<EpochSummary>,
}

/// Evaluate `model` on every batch of `loader` without tracking gradients.
#[tracing::instrument(skip_all)]
pub fn validate<B: Backend>(
    model: &EmotionModel<B>,
    loader: &Arc<dyn DataLoader<EmotionBatch<B>>>,
) -> eyre::Result<ValidationSummary> {
    let mut loss_sum = 0.0;
    let mut batches = 0usize;
    let mut correct = 0i64;
    let mut total = 0usize;

    for batch in loader.iter() {
        let labels = batch.labels.context("Validation batch is missing labels")?;
        let output = model.forward_classification(batch.inputs, labels);

        loss_sum += output.loss.into_scalar().elem::<f64>();
        batches += 1;

        total += output.targets.dims()[0];
        correct += output
            .output
            .argmax(1)
            .squeeze::<1>(1)
            .equal(output.targets)
            .int()
            .sum()
            .into_scalar()
            .elem::<i64>();
    }

    if total == 0 {
        return Ok(ValidationSummary { loss: 0.0, accuracy: 0.0 });
    }

    Ok(ValidationSummary {
        loss: loss_sum / batches as f64,
        accuracy: correct as f64 / total as f64,
    })
}

/// Fine-tune `model` on `train`, validating on `valid` after every epoch.
///
/// The training config is written to `artifact_dir` before the first epoch, the returned model after the last.
#[tracing::instrument(skip_all, fields(epochs = config.num_epochs))]
pub fn train<B: AutodiffBackend>(
    artifact_dir: &Path,
    mut model: EmotionModel<B>,
    train: impl Dataset<EmotionItem> + 'static,
    valid: impl Dataset<EmotionItem> + 'static,
    config: &TrainingConfig,
    device: B::Device,
) -> eyre::Result<TrainingOutcome<B::InnerBackend>> {
    config.ensure_valid()?;
    std::fs::create_dir_all(artifact_dir)?;
    config
        .save(artifact_dir.join(CONFIG_FILE))
        .wrap_err("Failed to save training config")?;

    B::seed(config.seed);

    let batcher_train = EmotionBatcher::<B>::new(device.clone()).with_padding_value(config.padding_value);
    let batcher_valid = EmotionBatcher::<B::InnerBackend>::new(device.clone()).with_padding_value(config.padding_value);

    // Batch order is fixed, no shuffling.
    let dataloader_train = DataLoaderBuilder::new(batcher_train)
        .batch_size(config.batch_size)
        .num_workers(config.num_workers)
        .build(train);

    let dataloader_valid = DataLoaderBuilder::new(batcher_valid)
        .batch_size(config.batch_size)
        .num_workers(config.num_workers)
        .build(valid);

    let accumulation_step = config.accumulation_step();
    let mut optimizer = config.optimizer.init();
    let mut scheduler = config.scheduler.init(config.learning_rate);
    let mut best = BestSnapshot::default();
    let mut history = Vec::with_capacity(config.num_epochs);

    tracing::info!(
        train = dataloader_train.num_items(),
        valid = dataloader_valid.num_items(),
        accumulation_step,
        "Starting training"
    );

    for epoch in 1..=config.num_epochs {
        let _span = tracing::info_span!("epoch", epoch).entered();
        let lr = scheduler.lr();
        let mut accumulator = GradientsAccumulator::<EmotionModel<B>>::new();
        let mut steps = AccumulationSteps::new(accumulation_step);
        let mut optimizer_steps = 0;
        let mut loss_sum = 0.0;
        let mut batches = 0usize;

        for batch in dataloader_train.iter() {
            let labels = batch.labels.context("Training batch is missing labels")?;
            let output = model.forward_classification(batch.inputs, labels);

            loss_sum += output.loss.clone().into_scalar().elem::<f64>();
            batches += 1;

            let loss = output.loss.div_scalar(accumulation_step as f32);
            let grads = GradientsParams::from_grads(loss.backward(), &model);
            accumulator.accumulate(&model, grads);

            if steps.tick() {
                model = optimizer.step(lr, model, accumulator.grads());
                optimizer_steps += 1;
            }
        }

        if steps.pending() > 0 {
            tracing::debug!(batches = steps.pending(), "Discarding gradients of trailing partial group");
        }

        let valid_summary = validate(&model.valid(), &dataloader_valid)?;
        let next_lr = scheduler.step(valid_summary.accuracy);
        let train_loss = if batches == 0 { 0.0 } else { loss_sum / batches as f64 };

        tracing::info!(
            epoch,
            train_loss,
            valid_loss = valid_summary.loss,
            valid_accuracy = valid_summary.accuracy,
            lr,
            optimizer_steps,
            "Finished epoch"
        );

        if best.offer(epoch, valid_summary.accuracy, || model.valid()) {
            tracing::info!(epoch, accuracy = valid_summary.accuracy, "New best model");
        }

        history.push(EpochSummary {
            epoch,
            train_loss,
            valid: valid_summary,
            learning_rate: next_lr,
            optimizer_steps,
        });
    }

    let best_epoch = best.epoch();
    let best_accuracy = best.accuracy();
    let model = match best.into_model() {
        Some(model) => model,
        None => {
            tracing::warn!("No epoch improved on zero validation accuracy, keeping the final model");
            model.valid()
        }
    };

    model
        .clone()
        .save_file(artifact_dir.join(MODEL_FILE), &CompactRecorder::new())
        .wrap_err("Failed to save trained model")?;

    Ok(TrainingOutcome {
        model,
        best_epoch,
        best_accuracy,
        history,
    })
}
