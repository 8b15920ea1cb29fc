pub mod config;
pub mod metadata;
pub mod pipeline;
pub mod split;
pub mod submission;
pub mod telemetry;
