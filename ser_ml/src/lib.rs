pub type CpuBackend = burn::backend::NdArray<f32, i32>;
pub type GpuBackend = burn::backend::Wgpu<f32, i32>;

pub use burn;

pub mod audio;
pub mod emotion_classifier;
pub mod processor;
pub mod wav2vec2;
