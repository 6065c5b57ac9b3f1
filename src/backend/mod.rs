//! backend — ONNX Runtime session wrapper behind a small trait
//!
//! The pipeline only needs one capability from a backend: take a planar CHW
//! float tensor, return the raw output buffer plus its shape metadata. The
//! trait seam keeps the decode/NMS stages testable without a model file.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use ort::execution_providers as ep;
use ort::session::builder::GraphOptimizationLevel;
use ort::session::Session;
use ort::value::Tensor;
use thiserror::Error;
use tracing::{debug, info};

/// Raw model output: a flat float buffer plus shape metadata. The shape may
/// be empty when the runtime cannot report it; the decoder copes.
#[derive(Debug, Clone, Default)]
pub struct OutputTensor {
    pub values: Vec<f32>,
    pub shape: Vec<usize>,
}

/// Executes a model on a `[1, 3, input_size, input_size]` CHW float tensor.
pub trait InferenceBackend: Send {
    fn run(&mut self, values: &[f32], input_size: u32) -> Result<OutputTensor>;
}

/// Errors surfaced by configuration. These are the only errors the pipeline
/// exposes; per-call inference failures degrade to an empty detection list.
#[derive(Debug, Error)]
pub enum ConfigureError {
    #[error("model not found at {0}")]
    ModelNotFound(PathBuf),
    #[error("labels not found at {0}")]
    LabelsNotFound(PathBuf),
    #[error("invalid model graph: {0}")]
    InvalidModelGraph(String),
}

/// Parse a label file: one label per line, trimmed, blank lines ignored.
/// Line order is the class-index order used everywhere downstream.
pub fn load_labels(path: &Path) -> Result<Vec<String>, ConfigureError> {
    let raw = std::fs::read_to_string(path)
        .map_err(|_| ConfigureError::LabelsNotFound(path.to_path_buf()))?;
    Ok(raw
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(str::to_owned)
        .collect())
}

/// ONNX Runtime backend. Hardware execution providers are registered in
/// preference order (CoreML, then XNNPACK) and fall back to CPU silently
/// when unsupported on the running platform.
#[derive(Debug)]
pub struct OrtBackend {
    session: Session,
    input_name: String,
    output_name: String,
}

impl OrtBackend {
    pub fn load(model_path: &Path) -> Result<Self, ConfigureError> {
        if !model_path.is_file() {
            return Err(ConfigureError::ModelNotFound(model_path.to_path_buf()));
        }

        let graph_err = |e: ort::Error| ConfigureError::InvalidModelGraph(e.to_string());

        let session = Session::builder()
            .map_err(graph_err)?
            .with_optimization_level(GraphOptimizationLevel::Level3)
            .map_err(graph_err)?
            .with_intra_threads(2)
            .map_err(graph_err)?
            .with_execution_providers([
                ep::CoreMLExecutionProvider::default().build(),
                ep::XNNPACKExecutionProvider::default().build(),
            ])
            .map_err(graph_err)?
            .commit_from_file(model_path)
            .map_err(graph_err)?;

        let input_name = session
            .inputs
            .first()
            .map(|i| i.name.clone())
            .ok_or_else(|| {
                ConfigureError::InvalidModelGraph("model declares no input tensor".into())
            })?;
        let output_name = session
            .outputs
            .first()
            .map(|o| o.name.clone())
            .ok_or_else(|| {
                ConfigureError::InvalidModelGraph("model declares no output tensor".into())
            })?;

        info!(
            model = %model_path.display(),
            input = %input_name,
            output = %output_name,
            "ONNX session ready"
        );

        Ok(Self {
            session,
            input_name,
            output_name,
        })
    }
}

impl InferenceBackend for OrtBackend {
    fn run(&mut self, values: &[f32], input_size: u32) -> Result<OutputTensor> {
        let side = input_size as usize;
        let shape = [1usize, 3, side, side];
        let input = Tensor::from_array((shape, values.to_vec().into_boxed_slice()))
            .context("failed to create input tensor")?;

        let outputs = self
            .session
            .run(ort::inputs![self.input_name.as_str() => input])
            .context("inference run failed")?;

        let value = outputs
            .get(self.output_name.as_str())
            .with_context(|| format!("output tensor '{}' missing", self.output_name))?;
        let (shape, data) = value
            .try_extract_tensor::<f32>()
            .context("failed to extract output tensor")?;

        let shape: Vec<usize> = shape.iter().map(|&d| d.max(0) as usize).collect();
        debug!(?shape, len = data.len(), "inference output extracted");

        Ok(OutputTensor {
            values: data.to_vec(),
            shape,
        })
    }
}
