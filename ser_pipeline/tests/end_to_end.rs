use std::path::Path;
use std::sync::Arc;

use ser_ml::burn::backend::{Autodiff, NdArray};
use ser_ml::emotion_classifier::model::EmotionModelConfig;
use ser_ml::processor::Wav2Vec2FeatureExtractor;
use ser_ml::wav2vec2::{FeatExtractNorm, Wav2Vec2Config};
use ser_pipeline::config::{ComputeBackend, Config};
use ser_pipeline::pipeline::Pipeline;

type TrainBackend = Autodiff<NdArray<f32, i32>>;
type InferBackend = NdArray<f32, i32>;

const SAMPLE_RATE: u32 = 16_000;

fn tiny_model_config() -> EmotionModelConfig {
    let backbone = Wav2Vec2Config {
        hidden_size: 16,
        num_hidden_layers: 1,
        num_attention_heads: 2,
        intermediate_size: 32,
        feat_extract_norm: FeatExtractNorm::Group,
        conv_dim: vec![8, 8, 8],
        conv_stride: vec![5, 4, 4],
        conv_kernel: vec![10, 4, 4],
        num_conv_pos_embeddings: 4,
        num_conv_pos_embedding_groups: 2,
        classifier_proj_size: 8,
        ..Default::default()
    };

    EmotionModelConfig::new(backbone, 6)
}

/// One second of a tone whose pitch depends on `index`.
fn write_clip(path: &Path, index: usize) -> eyre::Result<()> {
    let freq = 220.0 + 55.0 * index as f32;
    let samples = (0..SAMPLE_RATE as usize)
        .map(|i| 0.5 * (i as f32 * freq * std::f32::consts::TAU / SAMPLE_RATE as f32).sin())
        .collect::<Vec<f32>>();
    std::fs::create_dir_all(path.parent().unwrap())?;
    wavers::write(path, &samples, SAMPLE_RATE as i32, 1)?;
    Ok(())
}

/// Lay out a small competition data directory and return a config pointing at it.
fn fixture(root: &Path) -> eyre::Result<Config> {
    let data_dir = root.join("data");

    let mut train_csv = String::from("id,path,label\n");
    for i in 0..10 {
        let id = format!("TRAIN_{i:04}");
        write_clip(&data_dir.join("train").join(format!("{id}.wav")), i)?;
        train_csv.push_str(&format!("{id},./train/{id}.wav,{}\n", i % 6));
    }

    let mut test_csv = String::from("id,path\n");
    let mut sample_submission = String::from("id,label\n");
    for i in 0..4 {
        let id = format!("TEST_{i:04}");
        write_clip(&data_dir.join("test").join(format!("{id}.wav")), i + 3)?;
        test_csv.push_str(&format!("{id},./test/{id}.wav\n"));
        sample_submission.push_str(&format!("{id},0\n"));
    }

    std::fs::write(data_dir.join("train.csv"), train_csv)?;
    std::fs::write(data_dir.join("test.csv"), test_csv)?;
    std::fs::write(data_dir.join("sample_submission.csv"), sample_submission)?;

    let mut conf = Config::default();
    conf.training.batch_size = 2;
    conf.training.total_batch_size = 4;
    conf.training.epochs = 1;
    conf.training.backend = ComputeBackend::Ndarray;
    conf.audio.max_samples = SAMPLE_RATE as usize;
    conf.dirs.data_dir = data_dir;
    conf.dirs.output = root.join("submission.csv");
    conf.dirs.artifact_dir = root.join("artifacts");

    Ok(conf)
}

fn read_submission(path: &Path) -> eyre::Result<Vec<(String, usize, String)>> {
    let mut reader = csv::Reader::from_path(path)?;
    assert_eq!(reader.headers()?.iter().collect::<Vec<_>>(), vec!["id", "label", "probs"]);

    reader
        .records()
        .map(|record| -> eyre::Result<(String, usize, String)> {
            let record = record?;
            Ok((record[0].to_string(), record[1].parse()?, record[2].to_string()))
        })
        .collect()
}

#[test]
fn fine_tunes_and_writes_submission() -> eyre::Result<()> {
    let dir = tempfile::tempdir()?;
    let conf = Arc::new(fixture(dir.path())?);
    let device = Default::default();
    let model_config = tiny_model_config();
    let model = model_config.init::<TrainBackend>(&device);

    let pipeline = Pipeline::new(conf.clone());
    let report = pipeline.run_with_model::<TrainBackend>(model_config, model, Wav2Vec2FeatureExtractor::default(), device)?;

    assert_eq!(report.train_rows, 8);
    assert_eq!(report.valid_rows, 2);
    assert_eq!(report.test_rows, 4);
    assert_eq!(report.history.len(), 1);
    // Four training batches with two batches per step.
    assert_eq!(report.history[0].optimizer_steps, 2);

    let rows = read_submission(&conf.dirs.output)?;
    assert_eq!(rows.len(), 4);
    for (i, (id, label, probs)) in rows.iter().enumerate() {
        assert_eq!(id, &format!("TEST_{i:04}"));
        assert!(*label <= 5);
        assert!(probs.starts_with('[') && probs.ends_with(']'));
        assert_eq!(probs.split(", ").count(), 6);
    }

    // The saved artifacts can be reloaded for a separate prediction run.
    let replay = dir.path().join("replay.csv");
    let replayed = pipeline.predict::<InferBackend>(&conf.dirs.artifact_dir, &replay, Default::default())?;
    assert_eq!(replayed, 4);
    let replay_rows = read_submission(&replay)?;
    assert_eq!(replay_rows.len(), 4);
    assert!(replay_rows.iter().all(|(_, label, _)| *label <= 5));
    Ok(())
}

#[test]
fn missing_audio_aborts_the_run() -> eyre::Result<()> {
    let dir = tempfile::tempdir()?;
    let conf = fixture(dir.path())?;
    std::fs::remove_file(conf.dirs.data_dir.join("train").join("TRAIN_0003.wav"))?;

    let device = Default::default();
    let model_config = tiny_model_config();
    let model = model_config.init::<TrainBackend>(&device);

    let result = Pipeline::new(Arc::new(conf.clone())).run_with_model::<TrainBackend>(
        model_config,
        model,
        Wav2Vec2FeatureExtractor::default(),
        device,
    );

    assert!(result.is_err());
    assert!(!conf.dirs.output.exists());
    Ok(())
}
