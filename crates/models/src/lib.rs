mod catalog;
mod descriptor;
mod download;
mod fetch;
mod metadata;

pub use catalog::{ModelCatalog, ProgressUpdate};
pub use descriptor::{ModelDescriptor, ModelSource, ModelState};
pub use download::{DownloadHandle, DownloadProgress, Downloader};
pub use fetch::{ArtifactBody, ArtifactFetcher, HttpFetcher};
pub use metadata::default_catalog;

#[derive(Debug, thiserror::Error)]
pub enum ModelError {
    #[error("model not found: {0}")]
    NotFound(String),
    #[error("a download is already in progress: {0}")]
    Busy(String),
    #[error("model {id} cannot move from {from} to {to}")]
    InvalidTransition {
        id: String,
        from: ModelState,
        to: ModelState,
    },
    #[error("a model is already loaded: {0}")]
    AlreadyLoaded(String),
    #[error("a model is already loading: {0}")]
    AlreadyLoading(String),
    #[error("model already in catalog: {0}")]
    Duplicate(String),
    #[error("invalid model descriptor: {0}")]
    InvalidDescriptor(String),
    #[error("invalid model url: {0}")]
    InvalidUrl(String),
    #[error("download failed: {0}")]
    Network(String),
    #[error("download cancelled: {0}")]
    Cancelled(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ModelError>;
