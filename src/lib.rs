pub mod backend;
pub mod decode;
pub mod geometry;
pub mod pipeline;
pub mod preprocess;

// Re-export the top-level error type so callers only need `cardscan_core::Error`
pub use anyhow::Error;
pub use anyhow::Result;

pub use backend::{ConfigureError, InferenceBackend, OutputTensor};
pub use geometry::{Rect, Size};
pub use pipeline::{Detection, Detector, ModelConfig};
pub use preprocess::RgbFrame;
