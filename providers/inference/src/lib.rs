//! Image classification pipeline: capability probe, presigned model
//! download with progress, ONNX session creation and single-image
//! inference over ImageNet classes.

pub mod capability;
pub mod config;
pub mod data_loader;
pub mod engine;
pub mod errors;
pub mod logging;
pub mod orchestrator;
pub mod progress;

pub use crate::config::ClassifierConfig;
pub use crate::errors::{ClassifierError, Surface};
pub use crate::orchestrator::{InferenceResult, Orchestrator, Phase};
pub use ml_types::{DataType, MlError, Tensor};
