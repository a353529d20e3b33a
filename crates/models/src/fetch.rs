use crate::{ModelError, Result};
use futures::stream::BoxStream;
use futures::StreamExt;

/// An artifact response: optional total length plus the byte chunks.
pub struct ArtifactBody {
    pub total_bytes: Option<u64>,
    pub chunks: BoxStream<'static, Result<Vec<u8>>>,
}

/// Transport used by the downloader to fetch artifact bytes.
#[async_trait::async_trait]
pub trait ArtifactFetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<ArtifactBody>;
}

/// Streams artifacts over HTTP(S).
#[derive(Debug, Clone, Default)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl ArtifactFetcher for HttpFetcher {
    async fn fetch(&self, url: &str) -> Result<ArtifactBody> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| ModelError::Network(e.to_string()))?;

        if !response.status().is_success() {
            return Err(ModelError::Network(format!(
                "HTTP {}: {}",
                response.status(),
                url
            )));
        }

        let total_bytes = response.content_length();
        let chunks = response
            .bytes_stream()
            .map(|chunk| {
                chunk
                    .map(|bytes| bytes.to_vec())
                    .map_err(|e| ModelError::Network(e.to_string()))
            })
            .boxed();

        Ok(ArtifactBody {
            total_bytes,
            chunks,
        })
    }
}
