use ser_ml::burn::tensor::backend::AutodiffBackend;
use ser_pipeline::config::SharedConfig;
use ser_pipeline::pipeline::Pipeline;

use crate::args::ClapBackend;

#[derive(clap::Args, Debug)]
pub struct TrainCommand {
    /// Override the number of epochs from the config
    #[clap(long)]
    pub epochs: Option<usize>,
    /// Override the compute backend from the config
    #[clap(long, value_enum)]
    pub backend: Option<ClapBackend>,
}

impl TrainCommand {
    #[tracing::instrument(skip_all)]
    pub fn run<B: AutodiffBackend>(self, config: SharedConfig, device: B::Device) -> eyre::Result<()> {
        let report = Pipeline::new(config).run::<B>(device)?;

        tracing::info!(
            train = report.train_rows,
            valid = report.valid_rows,
            test = report.test_rows,
            best_epoch = ?report.best_epoch,
            best_accuracy = report.best_accuracy,
            submission = ?report.submission,
            "Finished fine-tuning"
        );

        Ok(())
    }
}
