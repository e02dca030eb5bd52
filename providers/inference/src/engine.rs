mod tract;

pub use self::tract::TractEngine;

use async_trait::async_trait;
use ml_types::{MlError, Tensor};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;

/// Graph (model number)
pub type Graph = u32;

/// Named tensors fed to or produced by a session.
pub type TensorMap = HashMap<String, Tensor>;

/// ExecutionTarget
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionTarget {
    #[default]
    Cpu,
    Gpu,
    Npu,
    Tpu,
}

impl FromStr for ExecutionTarget {
    type Err = InferenceError;

    fn from_str(et: &str) -> Result<Self, Self::Err> {
        match et.to_lowercase().as_str() {
            "cpu" => Ok(ExecutionTarget::Cpu),
            "tpu" => Ok(ExecutionTarget::Tpu),
            "gpu" => Ok(ExecutionTarget::Gpu),
            "npu" => Ok(ExecutionTarget::Npu),
            _ => {
                log::warn!(
                    "invalid or missing execution target detected: '{}' - defaults to cpu",
                    et,
                );

                Ok(ExecutionTarget::Cpu)
            }
        }
    }
}

/// How aggressively the graph is rewritten before it becomes runnable.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GraphOptimization {
    Disabled,
    #[default]
    All,
}

/// Options applied when a session is created.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SessionOptions {
    pub execution_target: ExecutionTarget,
    pub optimization: GraphOptimization,
    /// Worker threads available to one inference call
    pub intra_op_threads: usize,
    /// Concrete input shape, `None` keeps whatever the model declares
    pub input_shape: Option<Vec<usize>>,
}

impl Default for SessionOptions {
    fn default() -> Self {
        SessionOptions {
            execution_target: ExecutionTarget::Cpu,
            optimization: GraphOptimization::All,
            intra_op_threads: 1,
            input_shape: Some(
                imagenetpreprocessor::SHAPE
                    .iter()
                    .map(|d| *d as usize)
                    .collect(),
            ),
        }
    }
}

/// A loaded, runnable model. The graph itself is owned by the runtime that
/// created the session; this handle only names it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Session {
    pub graph: Graph,
    pub input_names: Vec<String>,
    pub output_names: Vec<String>,
}

impl Session {
    /// Input fed by convention: the first declared one.
    pub fn primary_input(&self) -> InferenceResult<&str> {
        self.input_names
            .first()
            .map(String::as_str)
            .ok_or(InferenceError::MissingInput("<none declared>".to_string()))
    }

    /// Output read by convention: the first declared one.
    pub fn primary_output(&self) -> InferenceResult<&str> {
        self.output_names
            .first()
            .map(String::as_str)
            .ok_or(InferenceError::MissingOutput("<none declared>".to_string()))
    }
}

/// The inference engine seam. Everything model specific stays behind it.
#[async_trait]
pub trait ModelRuntime: Send + Sync {
    /// Build a session from a serialized model. The buffer is consumed.
    async fn load(&self, model: Vec<u8>, options: &SessionOptions) -> InferenceResult<Session>;

    /// Execute `session` on `inputs`, keyed by input name.
    async fn run(&self, session: &Session, inputs: TensorMap) -> InferenceResult<TensorMap>;

    /// Release the graph behind `session`.
    async fn drop_session(&self, session: &Session);
}

/// InferenceResult
pub type InferenceResult<T> = Result<T, InferenceError>;

#[derive(Debug, thiserror::Error)]
pub enum InferenceError {
    #[error("runtime error: {0}")]
    RuntimeError(String),

    #[error("Unsupported ExecutionTarget {0:?}")]
    UnsupportedExecutionTarget(ExecutionTarget),

    #[error("Failed to build model from buffer: {0}")]
    FailedToBuildModelFromBuffer(String),

    #[error("Graph {0} is not loaded")]
    GraphNotFound(Graph),

    #[error("Missing input tensor '{0}'")]
    MissingInput(String),

    #[error("Missing output tensor '{0}'")]
    MissingOutput(String),

    #[error("Corrupt input tensor: {0}")]
    CorruptInputTensor(#[from] MlError),

    #[error("Re-shaping of tensor failed {0}")]
    ReShapeError(String),

    #[error("Inference did not finish within {0:?}")]
    Timeout(Duration),

    #[error("Configuration of model's input type and/or shape failed")]
    CorruptInputTypeOrShape(#[from] tract_onnx::prelude::TractError),
}
