mod engine;
#[cfg(feature = "llama")]
pub mod llama;
mod manager;
mod params;
mod registry;
pub mod scripted;

pub use engine::{ChatTurn, EngineLoader, Generation, GenerationStep, InferenceEngine};
pub use manager::{EngineManager, GenerationGuard};
pub use params::InferenceParameters;
pub use registry::EngineRegistry;

use ndis_models::ModelError;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("no model loaded")]
    NoModelLoaded,
    #[error("model already loaded: {0}")]
    AlreadyLoaded(String),
    #[error("model already loading: {0}")]
    AlreadyLoading(String),
    #[error("a completion is already running")]
    Generating,
    #[error("no engine loader for model: {0}")]
    NoLoaderFound(String),
    #[error("load failed: {0}")]
    LoadFailed(String),
    #[error("chat template failed: {0}")]
    Template(String),
    #[error("inference failed: {0}")]
    Inference(String),
    #[error("release failed: {0}")]
    Release(String),
    #[error(transparent)]
    Catalog(ModelError),
}

impl From<ModelError> for EngineError {
    fn from(err: ModelError) -> Self {
        match err {
            ModelError::AlreadyLoaded(id) => Self::AlreadyLoaded(id),
            ModelError::AlreadyLoading(id) => Self::AlreadyLoading(id),
            other => Self::Catalog(other),
        }
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
