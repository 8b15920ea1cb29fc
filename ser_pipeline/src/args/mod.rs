use std::path::PathBuf;

use ser_ml::burn::backend::ndarray::NdArrayDevice;
use ser_ml::burn::backend::wgpu::WgpuDevice;
use ser_ml::burn::backend::Autodiff;
use ser_ml::{CpuBackend, GpuBackend};
use ser_pipeline::config::{ComputeBackend, Config, SharedConfig};

use crate::args::predict::PredictCommand;
use crate::args::train::TrainCommand;

pub mod predict;
pub mod train;

#[derive(clap::Parser, Debug)]
#[clap(version, about)]
pub struct ClapArgs {
    /// Config file to use instead of `config.toml` in the working directory
    #[clap(long, short, global = true)]
    pub config: Option<PathBuf>,
    #[clap(subcommand)]
    pub commands: SubCommands,
}

#[derive(clap::Subcommand, Debug)]
pub enum SubCommands {
    /// Fine-tune the pretrained checkpoint and write a submission
    #[clap(alias = "t")]
    Train(TrainCommand),
    /// Write a submission with a previously fine-tuned model
    #[clap(alias = "p")]
    Predict(PredictCommand),
}

#[derive(clap::ValueEnum, Clone, Copy, Debug)]
pub enum ClapBackend {
    Wgpu,
    Ndarray,
}

impl From<ClapBackend> for ComputeBackend {
    fn from(value: ClapBackend) -> Self {
        match value {
            ClapBackend::Wgpu => ComputeBackend::Wgpu,
            ClapBackend::Ndarray => ComputeBackend::Ndarray,
        }
    }
}

impl SubCommands {
    /// Command line flags take precedence over the config file and environment.
    pub fn apply_overrides(&self, conf: &mut Config) {
        let backend = match self {
            SubCommands::Train(train) => {
                if let Some(epochs) = train.epochs {
                    conf.training.epochs = epochs;
                }
                train.backend
            }
            SubCommands::Predict(predict) => predict.backend,
        };

        if let Some(backend) = backend {
            conf.training.backend = backend.into();
        }
    }

    pub fn run(self, conf: SharedConfig) -> eyre::Result<()> {
        tracing::info!(backend = ?conf.training.backend, "Selected compute backend");

        match (self, conf.training.backend) {
            (SubCommands::Train(train), ComputeBackend::Wgpu) => {
                train.run::<Autodiff<GpuBackend>>(conf, WgpuDevice::default())
            }
            (SubCommands::Train(train), ComputeBackend::Ndarray) => {
                train.run::<Autodiff<CpuBackend>>(conf, NdArrayDevice::Cpu)
            }
            (SubCommands::Predict(predict), ComputeBackend::Wgpu) => predict.run::<GpuBackend>(conf, WgpuDevice::default()),
            (SubCommands::Predict(predict), ComputeBackend::Ndarray) => predict.run::<CpuBackend>(conf, NdArrayDevice::Cpu),
        }
    }
}
