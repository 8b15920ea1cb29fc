use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use ser_ml::audio::ClipConfig;
use ser_ml::emotion_classifier::training::MAX_LOADER_WORKERS;

pub type SharedConfig = Arc<Config>;

static CONFIG_FILE: &str = "config.toml";

/// Prefix for environment variable overrides, e.g. `SER_TRAINING__EPOCHS=10`.
static ENV_PREFIX: &str = "SER";

/// Initialise the config file in the working directory.
///
/// Creates a new config file if it doesn't yet exist, otherwise loads the existing one.
pub fn initialise_config() -> eyre::Result<Config> {
    initialise_config_at(get_full_config_path())
}

/// Same as [initialise_config], but with an explicit config file location.
pub fn initialise_config_at(c_path: impl AsRef<Path>) -> eyre::Result<Config> {
    let c_path = c_path.as_ref();

    if !c_path.exists() {
        save_config(&Config::default(), c_path)?;
    }

    let c = config::Config::builder()
        .add_source(config::File::from(c_path).required(true))
        .add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        )
        .build()?;

    let conf: Config = c.try_deserialize()?;
    conf.validate()?;

    Ok(conf)
}

/// Save the provided config to `path`.
pub fn save_config(app_settings: &Config, path: impl AsRef<Path>) -> eyre::Result<()> {
    let path = path.as_ref();
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }

    let mut config_file = std::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)?;

    let basic_output = toml::to_string_pretty(app_settings)?;

    config_file.write_all(basic_output.as_bytes())?;

    Ok(())
}

#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct Config {
    /// Optimisation and data split settings
    pub training: TrainingSettings,
    /// Clip preprocessing
    pub audio: AudioSettings,
    /// Which pretrained checkpoint to fine-tune
    pub model: ModelSettings,
    /// All directory related configs
    pub dirs: DirectoryConfig,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ComputeBackend {
    /// GPU through `wgpu`
    Wgpu,
    /// CPU
    Ndarray,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct TrainingSettings {
    pub sample_rate: u32,
    pub seed: u64,
    /// Clips per forward pass
    pub batch_size: usize,
    /// Clips per optimizer step, must be a positive multiple of `batch_size`
    pub total_batch_size: usize,
    pub epochs: usize,
    pub learning_rate: f64,
    pub weight_decay: f32,
    pub num_labels: usize,
    /// Fraction of the labeled data held out for validation
    pub valid_ratio: f64,
    /// Data loader workers, at most 1 so batches keep the table order
    pub num_workers: usize,
    pub backend: ComputeBackend,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct AudioSettings {
    /// Every clip is truncated or zero-padded to this many samples
    pub max_samples: usize,
    /// Silence threshold in decibels below the loudest frame
    pub top_db: f32,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct ModelSettings {
    /// HuggingFace hub identifier of the checkpoint
    pub model_id: String,
    /// Use an already downloaded checkpoint instead of the hub
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_dir: Option<PathBuf>,
    /// Hub cache location, defaults to the standard HuggingFace cache
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_dir: Option<PathBuf>,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct DirectoryConfig {
    /// Root of the competition data, audio paths in the CSV files are relative to this
    pub data_dir: PathBuf,
    pub train_csv: PathBuf,
    pub test_csv: PathBuf,
    pub sample_submission: PathBuf,
    /// Where the final submission is written
    pub output: PathBuf,
    /// Training config and model weights
    pub artifact_dir: PathBuf,
}

impl Config {
    /// Reject settings which would only fail, or silently misbehave, once the pipeline is running.
    pub fn validate(&self) -> eyre::Result<()> {
        let training = &self.training;

        eyre::ensure!(training.batch_size > 0, "training.batch_size must be at least 1");
        eyre::ensure!(
            training.total_batch_size >= training.batch_size && training.total_batch_size % training.batch_size == 0,
            "training.total_batch_size ({}) must be a positive multiple of training.batch_size ({})",
            training.total_batch_size,
            training.batch_size
        );
        eyre::ensure!(
            (0.0..1.0).contains(&training.valid_ratio),
            "training.valid_ratio must be in [0, 1), got {}",
            training.valid_ratio
        );
        eyre::ensure!(training.num_labels > 0, "training.num_labels must be at least 1");
        eyre::ensure!(training.epochs > 0, "training.epochs must be at least 1");
        eyre::ensure!(
            training.num_workers <= MAX_LOADER_WORKERS,
            "training.num_workers is {} but at most {MAX_LOADER_WORKERS} keeps the batch order fixed",
            training.num_workers
        );

        Ok(())
    }

    pub fn clip_config(&self) -> ClipConfig {
        ClipConfig {
            sample_rate: self.training.sample_rate,
            max_samples: self.audio.max_samples,
            top_db: self.audio.top_db,
            ..Default::default()
        }
    }
}

impl DirectoryConfig {
    pub fn train_csv_path(&self) -> PathBuf {
        self.data_dir.join(&self.train_csv)
    }

    pub fn test_csv_path(&self) -> PathBuf {
        self.data_dir.join(&self.test_csv)
    }

    pub fn sample_submission_path(&self) -> PathBuf {
        self.data_dir.join(&self.sample_submission)
    }
}

impl Default for TrainingSettings {
    fn default() -> Self {
        Self {
            sample_rate: 16_000,
            seed: 42,
            batch_size: 8,
            total_batch_size: 32,
            epochs: 5,
            learning_rate: 1e-5,
            weight_decay: 0.01,
            num_labels: 6,
            valid_ratio: 0.2,
            num_workers: 1,
            backend: ComputeBackend::Wgpu,
        }
    }
}

impl Default for AudioSettings {
    fn default() -> Self {
        Self {
            max_samples: 80_000,
            top_db: 40.0,
        }
    }
}

impl Default for ModelSettings {
    fn default() -> Self {
        Self {
            model_id: "ehcalabres/wav2vec2-lg-xlsr-en-speech-emotion-recognition".to_string(),
            local_dir: None,
            cache_dir: None,
        }
    }
}

impl Default for DirectoryConfig {
    fn default() -> Self {
        Self {
            data_dir: "data".into(),
            train_csv: "train.csv".into(),
            test_csv: "test.csv".into(),
            sample_submission: "sample_submission.csv".into(),
            output: "baseline_submission.csv".into(),
            artifact_dir: "artifacts".into(),
        }
    }
}

/// Retrieve the *full* path to the config file.
///
/// This is just [get_config_directory] + [CONFIG_FILE]
pub fn get_full_config_path() -> PathBuf {
    get_config_directory().join(CONFIG_FILE)
}

/// Retrieve the directory which will be used to locate/save the config file.
pub fn get_config_directory() -> PathBuf {
    std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn creates_default_config_on_first_run() -> eyre::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("nested").join(CONFIG_FILE);

        let config = initialise_config_at(&path)?;

        assert!(path.exists());
        assert_eq!(config.training.batch_size, 8);
        assert_eq!(config.training.total_batch_size, 32);
        assert_eq!(config.training.backend, ComputeBackend::Wgpu);
        assert!(config.model.local_dir.is_none());
        Ok(())
    }

    #[test]
    fn existing_config_is_respected() -> eyre::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join(CONFIG_FILE);
        let mut conf = Config::default();
        conf.training.epochs = 1;
        conf.training.backend = ComputeBackend::Ndarray;
        conf.model.local_dir = Some("checkpoint".into());
        save_config(&conf, &path)?;

        let loaded = initialise_config_at(&path)?;

        assert_eq!(loaded.training.epochs, 1);
        assert_eq!(loaded.training.backend, ComputeBackend::Ndarray);
        assert_eq!(loaded.model.local_dir, Some(PathBuf::from("checkpoint")));
        Ok(())
    }

    #[test]
    fn rejects_settings_that_break_training() {
        let broken: [fn(&mut Config); 6] = [
            |c| c.training.batch_size = 0,
            |c| c.training.total_batch_size = 12,
            |c| c.training.valid_ratio = 1.5,
            |c| c.training.valid_ratio = -0.1,
            |c| c.training.num_workers = 16,
            |c| c.training.epochs = 0,
        ];

        assert!(Config::default().validate().is_ok());
        for breakage in broken {
            let mut conf = Config::default();
            breakage(&mut conf);
            assert!(conf.validate().is_err(), "{:?} should be rejected", conf.training);
        }
    }

    #[test]
    fn invalid_config_file_fails_to_load() -> eyre::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join(CONFIG_FILE);
        let mut conf = Config::default();
        conf.training.num_workers = 16;
        save_config(&conf, &path)?;

        let err = initialise_config_at(&path).unwrap_err();
        assert!(err.to_string().contains("num_workers"));
        Ok(())
    }

    #[test]
    fn clip_config_follows_settings() {
        let mut conf = Config::default();
        conf.audio.max_samples = 16_000;

        let clip = conf.clip_config();
        assert_eq!(clip.max_samples, 16_000);
        assert_eq!(clip.sample_rate, 16_000);
        assert_eq!(clip.hop_length, 512);
    }
}
