//! Multi-stage denoise filtering.

pub mod pipeline;
pub mod task;

pub use pipeline::DenoisePipeline;
pub use task::{DenoiseTask, NlmParams};
