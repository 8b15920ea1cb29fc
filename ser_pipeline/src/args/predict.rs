use std::path::PathBuf;

use ser_ml::burn::prelude::Backend;
use ser_pipeline::config::SharedConfig;
use ser_pipeline::pipeline::Pipeline;

use crate::args::ClapBackend;

#[derive(clap::Args, Debug)]
pub struct PredictCommand {
    /// Directory containing the fine-tuned model, defaults to the configured artifact directory
    #[clap(long)]
    pub artifact_dir: Option<PathBuf>,
    /// Where to write the submission, defaults to the configured output
    #[clap(long, short)]
    pub output: Option<PathBuf>,
    /// Override the compute backend from the config
    #[clap(long, value_enum)]
    pub backend: Option<ClapBackend>,
}

impl PredictCommand {
    #[tracing::instrument(skip_all)]
    pub fn run<B: Backend>(self, config: SharedConfig, device: B::Device) -> eyre::Result<()> {
        let artifact_dir = self.artifact_dir.unwrap_or_else(|| config.dirs.artifact_dir.clone());
        let output = self.output.unwrap_or_else(|| config.dirs.output.clone());

        let rows = Pipeline::new(config).predict::<B>(&artifact_dir, &output, device)?;
        tracing::info!(rows, ?output, "Finished prediction");

        Ok(())
    }
}
