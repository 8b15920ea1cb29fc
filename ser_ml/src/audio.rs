//! Decoding of speech clips into fixed-length, mono waveforms.

use std::ops::Range;
use std::path::{Path, PathBuf};

use rayon::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum AudioError {
    #[error("Could not decode audio file {path:?}: {source}")]
    Decode {
        path: PathBuf,
        #[source]
        source: wavers::WaversError,
    },
    #[error("Audio file {path:?} reports zero channels")]
    NoChannels { path: PathBuf },
    #[error("Could not resample {path:?} from {from} Hz to {to} Hz: {message}")]
    Resample {
        path: PathBuf,
        from: u32,
        to: u32,
        message: String,
    },
}

/// Parameters used to turn an arbitrary clip into a model-ready waveform.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClipConfig {
    /// Sample rate every clip is resampled to.
    pub sample_rate: u32,
    /// Exact length of every returned waveform, in samples.
    pub max_samples: usize,
    /// Frames quieter than the loudest frame by more than this many decibels count as silence.
    pub top_db: f32,
    #[serde(default = "default_frame_length")]
    pub frame_length: usize,
    #[serde(default = "default_hop_length")]
    pub hop_length: usize,
}

fn default_frame_length() -> usize {
    2048
}

fn default_hop_length() -> usize {
    512
}

impl Default for ClipConfig {
    fn default() -> Self {
        Self {
            sample_rate: 16_000,
            max_samples: 80_000,
            top_db: 40.0,
            frame_length: default_frame_length(),
            hop_length: default_hop_length(),
        }
    }
}

/// Decode, trim, and pad/truncate a single clip.
///
/// The result always has exactly [ClipConfig::max_samples] samples. An all-zero clip has no frame above
/// the silence floor, so nothing is trimmed and it simply ends up as zeros.
pub fn load_clip(path: impl AsRef<Path>, config: &ClipConfig) -> Result<Vec<f32>, AudioError> {
    let samples = decode_mono(path.as_ref(), config.sample_rate)?;
    let voiced = trim_silence(&samples, config.top_db, config.frame_length, config.hop_length);

    Ok(fix_length(voiced, config.max_samples))
}

/// Load all the given clips in parallel, the output order matches the order of `paths`.
///
/// The first decode failure aborts the whole batch.
#[tracing::instrument(skip_all, fields(clips = paths.len()))]
pub fn load_clips(paths: &[PathBuf], config: &ClipConfig) -> Result<Vec<Vec<f32>>, AudioError> {
    let clips = paths
        .par_iter()
        .map(|path| load_clip(path, config))
        .collect::<Result<Vec<_>, _>>()?;

    tracing::debug!(clips = clips.len(), "Decoded clips");
    Ok(clips)
}

/// Decode the `.wav` file at `path` into mono samples at `target_rate`.
pub fn decode_mono(path: &Path, target_rate: u32) -> Result<Vec<f32>, AudioError> {
    let decode_err = |source| AudioError::Decode {
        path: path.to_path_buf(),
        source,
    };
    let mut reader: wavers::Wav<f32> = wavers::Wav::from_path(path).map_err(decode_err)?;
    let n_channels = reader.n_channels();
    let sample_rate = reader.sample_rate() as u32;
    let samples = reader.read().map_err(decode_err)?;

    if n_channels == 0 {
        return Err(AudioError::NoChannels {
            path: path.to_path_buf(),
        });
    }

    let mono = convert_any_to_mono(&samples, n_channels as usize);

    if sample_rate == target_rate {
        return Ok(mono);
    }

    // We've converted the audio to mono already, so it's only 1 channel.
    audio_resample(&mono, sample_rate, target_rate, 1).map_err(|message| AudioError::Resample {
        path: path.to_path_buf(),
        from: sample_rate,
        to: target_rate,
        message,
    })
}

/// Convert the given, potentially multi-channel, audio into a mono-channel sequence.
pub fn convert_any_to_mono(samples: &[f32], channels: usize) -> Vec<f32> {
    if channels == 1 {
        samples.to_vec()
    } else {
        samples
            .chunks_exact(channels)
            .map(|x| x.iter().sum::<f32>() / channels as f32)
            .collect()
    }
}

fn audio_resample(data: &[f32], from_rate: u32, to_rate: u32, channels: u16) -> Result<Vec<f32>, String> {
    use samplerate::{convert, ConverterType};
    convert(
        from_rate as _,
        to_rate as _,
        channels as _,
        ConverterType::SincBestQuality,
        data,
    )
    .map_err(|e| e.to_string())
}

/// Strip leading and trailing silence.
///
/// Energy is measured as the RMS of centred, zero-padded frames of `frame_length` samples taken every
/// `hop_length` samples. Frames more than `top_db` decibels below the loudest frame are silent.
pub fn trim_silence(samples: &[f32], top_db: f32, frame_length: usize, hop_length: usize) -> &[f32] {
    let range = non_silent_range(samples, top_db, frame_length, hop_length);
    &samples[range]
}

fn non_silent_range(samples: &[f32], top_db: f32, frame_length: usize, hop_length: usize) -> Range<usize> {
    // Power floor, matches an amplitude floor of 1e-5.
    const AMIN: f32 = 1e-10;

    if samples.is_empty() {
        return 0..0;
    }

    let rms = frame_rms(samples, frame_length, hop_length);
    let reference = rms.iter().copied().fold(0.0f32, f32::max);
    let ref_db = 10.0 * (reference * reference).max(AMIN).log10();

    let is_voiced = |rms: &f32| 10.0 * (rms * rms).max(AMIN).log10() - ref_db > -top_db;

    let Some(first) = rms.iter().position(is_voiced) else {
        return 0..0;
    };
    let last = rms.iter().rposition(is_voiced).unwrap_or(first);

    let start = (first * hop_length).min(samples.len());
    let end = ((last + 1) * hop_length).min(samples.len());

    start..end.max(start)
}

fn frame_rms(samples: &[f32], frame_length: usize, hop_length: usize) -> Vec<f32> {
    let pad = frame_length / 2;
    let padded_len = samples.len() + 2 * pad;
    let n_frames = 1 + padded_len.saturating_sub(frame_length) / hop_length;

    // Index into the virtual zero-padded signal without materialising it.
    let padded = |i: usize| -> f32 {
        if i < pad || i >= pad + samples.len() {
            0.0
        } else {
            samples[i - pad]
        }
    };

    (0..n_frames)
        .map(|frame| {
            let start = frame * hop_length;
            let power = (start..start + frame_length)
                .map(|i| padded(i).powi(2))
                .sum::<f32>();
            (power / frame_length as f32).sqrt()
        })
        .collect()
}

/// Force `samples` to exactly `len` samples by truncating, or padding with zeros at the end.
pub fn fix_length(samples: &[f32], len: usize) -> Vec<f32> {
    let mut out = samples[..samples.len().min(len)].to_vec();
    out.resize(len, 0.0);
    out
}
