//! ONNX Runtime session construction shared by the model-backed capabilities

use anyhow::{Context, Result};
use ndarray::{Array, IxDyn};
use ort::{
    execution_providers::{CPUExecutionProvider, CUDAExecutionProvider, TensorRTExecutionProvider},
    session::{builder::GraphOptimizationLevel, Session},
    value::DynValue,
};
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionConfig {
    /// Execution provider preference (CPU, CUDA, TensorRT)
    #[serde(default = "default_execution_provider")]
    pub provider: String,

    /// GPU device ID (0, 1, 2, etc.)
    #[serde(default = "default_device_id")]
    pub device_id: i32,

    /// Number of intra-operation threads
    #[serde(default = "default_intra_threads")]
    pub intra_threads: usize,

    /// Number of inter-operation threads
    #[serde(default = "default_inter_threads")]
    pub inter_threads: usize,
}

fn default_execution_provider() -> String {
    "CPU".to_string()
}

fn default_device_id() -> i32 {
    0
}

fn default_intra_threads() -> usize {
    4
}

fn default_inter_threads() -> usize {
    1
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            provider: default_execution_provider(),
            device_id: default_device_id(),
            intra_threads: default_intra_threads(),
            inter_threads: default_inter_threads(),
        }
    }
}

impl ExecutionConfig {
    /// Apply `LPR_EXECUTION_PROVIDER` / `LPR_DEVICE_ID` overrides
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(provider) = std::env::var("LPR_EXECUTION_PROVIDER") {
            self.provider = provider;
        }
        if let Ok(device_id) = std::env::var("LPR_DEVICE_ID") {
            if let Ok(id) = device_id.parse::<i32>() {
                self.device_id = id;
            }
        }
        self
    }
}

/// Create an ONNX session, falling back TensorRT -> CUDA -> CPU.
///
/// Returns the session and the name of the provider actually configured.
pub fn create_session(model_path: &Path, config: &ExecutionConfig) -> Result<(Session, String)> {
    if !model_path.exists() {
        anyhow::bail!("Model file not found: {}", model_path.display());
    }

    match config.provider.to_uppercase().as_str() {
        "TENSORRT" => {
            tracing::info!(model = %model_path.display(), "attempting TensorRT");
            let result = Session::builder()
                .context("Failed to create session builder")?
                .with_optimization_level(GraphOptimizationLevel::Level3)
                .context("Failed to set optimization level")?
                .with_intra_threads(config.intra_threads)
                .context("Failed to set intra threads")?
                .with_inter_threads(config.inter_threads)
                .context("Failed to set inter threads")?
                .with_execution_providers([
                    TensorRTExecutionProvider::default()
                        .with_device_id(config.device_id)
                        .build(),
                    CUDAExecutionProvider::default()
                        .with_device_id(config.device_id)
                        .build(),
                    CPUExecutionProvider::default().build(),
                ])
                .context("Failed to set execution providers")?
                .commit_from_file(model_path);

            match result {
                Ok(session) => Ok((session, "TensorRT".to_string())),
                Err(e) => {
                    tracing::warn!(error = %e, "TensorRT failed, trying CUDA");
                    try_cuda(model_path, config)
                }
            }
        }
        "CUDA" => try_cuda(model_path, config),
        _ => try_cpu(model_path, config),
    }
}

fn try_cuda(model_path: &Path, config: &ExecutionConfig) -> Result<(Session, String)> {
    tracing::info!(model = %model_path.display(), device_id = config.device_id, "attempting CUDA");
    let result = Session::builder()
        .context("Failed to create session builder")?
        .with_optimization_level(GraphOptimizationLevel::Level3)
        .context("Failed to set optimization level")?
        .with_intra_threads(config.intra_threads)
        .context("Failed to set intra threads")?
        .with_inter_threads(config.inter_threads)
        .context("Failed to set inter threads")?
        .with_execution_providers([
            CUDAExecutionProvider::default()
                .with_device_id(config.device_id)
                .build(),
            CPUExecutionProvider::default().build(),
        ])
        .context("Failed to set execution providers")?
        .commit_from_file(model_path);

    match result {
        Ok(session) => Ok((session, "CUDA".to_string())),
        Err(e) => {
            tracing::warn!(error = %e, "CUDA failed, using CPU");
            try_cpu(model_path, config)
        }
    }
}

fn try_cpu(model_path: &Path, config: &ExecutionConfig) -> Result<(Session, String)> {
    tracing::info!(model = %model_path.display(), "using CPU");
    let session = Session::builder()
        .context("Failed to create session builder")?
        .with_optimization_level(GraphOptimizationLevel::Level3)
        .context("Failed to set optimization level")?
        .with_intra_threads(config.intra_threads)
        .context("Failed to set intra threads")?
        .with_inter_threads(config.inter_threads)
        .context("Failed to set inter threads")?
        .commit_from_file(model_path)
        .context("Failed to load model from file")?;
    Ok((session, "CPU".to_string()))
}

/// Copy an f32 output tensor into an owned ndarray
pub fn to_array(output_value: &DynValue) -> Result<Array<f32, IxDyn>> {
    let (shape, data) = output_value.try_extract_tensor::<f32>()?;

    let shape_usize: Vec<usize> = shape.iter().map(|&x| x as usize).collect();
    let output = Array::from_shape_vec(IxDyn(&shape_usize), data.to_vec())?;
    Ok(output)
}
