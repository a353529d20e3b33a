use crate::{ModelError, Result};
use ndis_events::ModelStateSignal;
use serde::{Deserialize, Serialize};
use std::fmt;

const HUGGINGFACE_HOST: &str = "https://huggingface.co/";

/// Lifecycle of a model artifact.
///
/// ```text
/// NOT_DOWNLOADED -> DOWNLOADING -> READY -> LOADING -> LOADED
///        ^               |          ^  ^       |          |
///        +---- failure --+          |  +-fail--+          |
///                                   +------ unload -------+
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ModelState {
    NotDownloaded,
    Downloading,
    Ready,
    Loading,
    Loaded,
}

impl ModelState {
    pub fn signal(self) -> ModelStateSignal {
        match self {
            Self::NotDownloaded => ModelStateSignal::NotDownloaded,
            Self::Downloading => ModelStateSignal::Downloading,
            Self::Ready => ModelStateSignal::Ready,
            Self::Loading => ModelStateSignal::Loading,
            Self::Loaded => ModelStateSignal::Loaded,
        }
    }

}

impl fmt::Display for ModelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::NotDownloaded => "NOT_DOWNLOADED",
            Self::Downloading => "DOWNLOADING",
            Self::Ready => "READY",
            Self::Loading => "LOADING",
            Self::Loaded => "LOADED",
        };
        f.write_str(name)
    }
}

/// A single, non-special path segment.
fn is_path_component(name: &str) -> bool {
    !name.is_empty()
        && name != "."
        && name != ".."
        && !name.contains(['/', '\\', '\0'])
}

/// Where an artifact is fetched from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ModelSource {
    HuggingFace {
        repo: String,
        revision: String,
        file: String,
    },
    Url {
        url: String,
    },
}

impl ModelSource {
    pub fn huggingface(repo: impl Into<String>, file: impl Into<String>) -> Self {
        Self::HuggingFace {
            repo: repo.into(),
            revision: "main".to_string(),
            file: file.into(),
        }
    }

    /// Parse a user-supplied link.
    ///
    /// `https://huggingface.co/{owner}/{repo}/resolve/{rev}/{path}` becomes a
    /// Hugging Face source; any other http(s) URL ending in a file name is kept
    /// as a plain URL.
    pub fn parse(url: &str) -> Result<Self> {
        let url = url.trim();
        if let Some(rest) = url.strip_prefix(HUGGINGFACE_HOST) {
            let parts: Vec<&str> = rest.splitn(5, '/').collect();
            if let [owner, repo, "resolve", revision, file] = parts.as_slice() {
                if !owner.is_empty() && !repo.is_empty() && !file.is_empty() {
                    return Self::HuggingFace {
                        repo: format!("{owner}/{repo}"),
                        revision: (*revision).to_string(),
                        file: (*file).to_string(),
                    }
                    .checked(url);
                }
            }
            return Err(ModelError::InvalidUrl(url.to_string()));
        }

        let has_scheme = url.starts_with("https://") || url.starts_with("http://");
        let source = Self::Url {
            url: url.to_string(),
        };
        if has_scheme && !source.filename().contains(':') {
            source.checked(url)
        } else {
            Err(ModelError::InvalidUrl(url.to_string()))
        }
    }

    /// The artifact must land directly inside its model directory.
    fn checked(self, url: &str) -> Result<Self> {
        if is_path_component(self.filename()) {
            Ok(self)
        } else {
            Err(ModelError::InvalidUrl(url.to_string()))
        }
    }

    pub fn download_url(&self) -> String {
        match self {
            Self::HuggingFace {
                repo,
                revision,
                file,
            } => format!("{HUGGINGFACE_HOST}{repo}/resolve/{revision}/{file}"),
            Self::Url { url } => url.clone(),
        }
    }

    /// Artifact file name on disk (last path segment, query stripped).
    pub fn filename(&self) -> &str {
        let path = match self {
            Self::HuggingFace { file, .. } => file.as_str(),
            Self::Url { url } => url.split(['?', '#']).next().unwrap_or(url),
        };
        path.rsplit('/').next().unwrap_or(path)
    }

    pub fn repository(&self) -> Option<&str> {
        match self {
            Self::HuggingFace { repo, .. } => Some(repo),
            Self::Url { .. } => None,
        }
    }
}

/// A downloadable model artifact and its lifecycle state.
///
/// `state` and `download_percent` are only ever changed by the catalog's
/// transition functions; copies handed out by the catalog are snapshots.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelDescriptor {
    pub id: String,
    pub display_name: String,
    pub source: ModelSource,
    pub size_bytes: u64,
    #[serde(default)]
    pub custom: bool,
    #[serde(skip, default = "not_downloaded")]
    pub(crate) state: ModelState,
    #[serde(skip)]
    pub(crate) download_percent: f64,
}

fn not_downloaded() -> ModelState {
    ModelState::NotDownloaded
}

impl ModelDescriptor {
    pub fn new(
        id: impl Into<String>,
        display_name: impl Into<String>,
        source: ModelSource,
        size_bytes: u64,
    ) -> Self {
        Self {
            id: id.into(),
            display_name: display_name.into(),
            source,
            size_bytes,
            custom: false,
            state: ModelState::NotDownloaded,
            download_percent: 0.0,
        }
    }

    /// Build a user-added entry from a download link.
    ///
    /// The id is derived from the file name without its extension.
    pub fn from_url(url: &str) -> Result<Self> {
        let source = ModelSource::parse(url)?;
        let filename = source.filename().to_string();
        let id = filename
            .strip_suffix(".gguf")
            .unwrap_or(&filename)
            .to_lowercase();
        let mut descriptor = Self::new(id, filename, source, 0);
        descriptor.custom = true;
        descriptor.validate()?;
        Ok(descriptor)
    }

    /// Reject ids and file names that would escape the models directory.
    pub fn validate(&self) -> Result<()> {
        if !is_path_component(&self.id) {
            return Err(ModelError::InvalidDescriptor(format!("bad id {:?}", self.id)));
        }
        if !is_path_component(self.filename()) {
            return Err(ModelError::InvalidDescriptor(format!(
                "bad file name {:?} for {}",
                self.filename(),
                self.id
            )));
        }
        Ok(())
    }

    pub fn state(&self) -> ModelState {
        self.state
    }

    pub fn download_percent(&self) -> f64 {
        self.download_percent
    }

    pub fn filename(&self) -> &str {
        self.source.filename()
    }
}
