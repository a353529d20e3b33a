//! Artifact downloads driven through the catalog's transition functions.

use crate::{ArtifactFetcher, ModelCatalog, ModelError, ProgressUpdate, Result};
use futures::{Stream, StreamExt};
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll};
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Stream of accepted progress values for one download.
///
/// Values are non-decreasing; the final item is 1.0 on success, after which
/// the stream ends. On failure the stream ends early.
pub struct DownloadProgress {
    rx: mpsc::UnboundedReceiver<f64>,
}

impl Stream for DownloadProgress {
    type Item = f64;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<f64>> {
        self.rx.poll_recv(cx)
    }
}

/// An accepted download: its progress stream and the task doing the work.
pub struct DownloadHandle {
    pub model_id: String,
    pub progress: DownloadProgress,
    task: JoinHandle<Result<PathBuf>>,
    cancel: CancellationToken,
}

impl DownloadHandle {
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Wait for the transfer to settle, returning the artifact path.
    pub async fn wait(self) -> Result<PathBuf> {
        match self.task.await {
            Ok(result) => result,
            Err(e) => Err(ModelError::Network(format!("download task aborted: {e}"))),
        }
    }
}

/// The transfer the downloader is currently driving, if any.
///
/// Each accepted download gets a fresh ticket so a finishing job can only
/// clear its own entry.
#[derive(Default)]
struct ActiveSlot {
    current: Option<ActiveDownload>,
    next_ticket: u64,
}

struct ActiveDownload {
    model_id: String,
    ticket: u64,
    cancel: CancellationToken,
}

type SharedSlot = Arc<Mutex<ActiveSlot>>;

fn lock_slot(slot: &SharedSlot) -> MutexGuard<'_, ActiveSlot> {
    slot.lock().expect("download slot mutex poisoned")
}

pub struct Downloader {
    catalog: Arc<ModelCatalog>,
    fetcher: Arc<dyn ArtifactFetcher>,
    active: SharedSlot,
}

impl Downloader {
    pub fn new(catalog: Arc<ModelCatalog>, fetcher: Arc<dyn ArtifactFetcher>) -> Self {
        Self {
            catalog,
            fetcher,
            active: SharedSlot::default(),
        }
    }

    /// Claim the download slot for `model_id` and start fetching it on the
    /// current Tokio runtime.
    ///
    /// Fails with [`ModelError::Busy`] while another download is running and
    /// with [`ModelError::InvalidTransition`] unless the model is NOT_DOWNLOADED.
    pub fn start_download(&self, model_id: &str) -> Result<DownloadHandle> {
        let descriptor = self
            .catalog
            .get(model_id)
            .ok_or_else(|| ModelError::NotFound(model_id.to_string()))?;
        let dest = self.catalog.local_path(model_id)?;

        self.catalog.begin_download(model_id)?;
        let cancel = CancellationToken::new();
        let ticket = {
            let mut slot = lock_slot(&self.active);
            slot.next_ticket += 1;
            let ticket = slot.next_ticket;
            slot.current = Some(ActiveDownload {
                model_id: model_id.to_string(),
                ticket,
                cancel: cancel.clone(),
            });
            ticket
        };
        let (tx, rx) = mpsc::unbounded_channel();

        let job = DownloadJob {
            model_id: model_id.to_string(),
            url: descriptor.source.download_url(),
            size_hint: descriptor.size_bytes,
            dest,
            catalog: self.catalog.clone(),
            fetcher: self.fetcher.clone(),
            progress: tx,
            cancel: cancel.clone(),
            active: self.active.clone(),
            ticket,
        };

        tracing::info!(model_id, url = %job.url, "Starting model download");

        Ok(DownloadHandle {
            model_id: model_id.to_string(),
            progress: DownloadProgress { rx },
            task: tokio::spawn(job.run()),
            cancel,
        })
    }

    /// Cancel an in-flight download. Returns false if none was running.
    pub fn cancel_download(&self, model_id: &str) -> bool {
        match &lock_slot(&self.active).current {
            Some(active) if active.model_id == model_id => {
                active.cancel.cancel();
                true
            }
            _ => false,
        }
    }

    pub fn is_downloading(&self, model_id: &str) -> bool {
        lock_slot(&self.active)
            .current
            .as_ref()
            .is_some_and(|active| active.model_id == model_id)
    }
}

struct DownloadJob {
    model_id: String,
    url: String,
    size_hint: u64,
    dest: PathBuf,
    catalog: Arc<ModelCatalog>,
    fetcher: Arc<dyn ArtifactFetcher>,
    progress: mpsc::UnboundedSender<f64>,
    cancel: CancellationToken,
    active: SharedSlot,
    ticket: u64,
}

impl DownloadJob {
    async fn run(self) -> Result<PathBuf> {
        let partial = partial_path(&self.dest);

        let outcome = match self.transfer(&partial).await {
            Ok(bytes) => tokio::fs::rename(&partial, &self.dest)
                .await
                .map(|_| bytes)
                .map_err(ModelError::Io),
            Err(e) => Err(e),
        };

        // The slot must be empty before the catalog accepts the next download.
        self.release_slot();

        match outcome {
            Ok(bytes) => {
                if self.catalog.record_progress(&self.model_id, 1.0)? == ProgressUpdate::Completed {
                    let _ = self.progress.send(1.0);
                }
                tracing::info!(model_id = %self.model_id, bytes, "Model download complete");
                Ok(self.dest)
            }
            Err(e) => {
                let _ = tokio::fs::remove_file(&partial).await;
                if let Err(rollback) = self.catalog.fail_download(&self.model_id) {
                    tracing::error!(model_id = %self.model_id, "Failed to roll back download: {}", rollback);
                }
                match &e {
                    ModelError::Cancelled(_) => {
                        tracing::info!(model_id = %self.model_id, "Model download cancelled")
                    }
                    _ => tracing::error!(model_id = %self.model_id, "Model download failed: {}", e),
                }
                Err(e)
            }
        }
    }

    fn release_slot(&self) {
        let mut slot = lock_slot(&self.active);
        if slot.current.as_ref().is_some_and(|a| a.ticket == self.ticket) {
            slot.current = None;
        }
    }

    async fn transfer(&self, partial: &Path) -> Result<u64> {
        let body = tokio::select! {
            _ = self.cancel.cancelled() => return Err(ModelError::Cancelled(self.model_id.clone())),
            body = self.fetcher.fetch(&self.url) => body?,
        };

        let total = body
            .total_bytes
            .filter(|t| *t > 0)
            .or(Some(self.size_hint).filter(|t| *t > 0));

        if let Some(parent) = partial.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = tokio::fs::File::create(partial).await?;
        let mut chunks = body.chunks;
        let mut received = 0u64;

        loop {
            let next = tokio::select! {
                _ = self.cancel.cancelled() => return Err(ModelError::Cancelled(self.model_id.clone())),
                next = chunks.next() => next,
            };
            let Some(chunk) = next else { break };
            let chunk = chunk?;

            file.write_all(&chunk).await?;
            received += chunk.len() as u64;

            // 1.0 is only recorded once the artifact has been moved into place.
            if let Some(total) = total.filter(|t| received < *t) {
                let percent = received as f64 / total as f64;
                if let ProgressUpdate::Progressed(p) =
                    self.catalog.record_progress(&self.model_id, percent)?
                {
                    let _ = self.progress.send(p);
                }
            }
        }

        file.flush().await?;
        Ok(received)
    }
}

fn partial_path(dest: &Path) -> PathBuf {
    let mut name = dest.file_name().unwrap_or_default().to_os_string();
    name.push(".partial");
    dest.with_file_name(name)
}
