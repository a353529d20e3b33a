//! Streaming completion against the loaded engine.

use ndis_engine::{EngineError, EngineManager, GenerationStep};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// The engine signalled end of sequence.
    EndOfSequence,
    /// The `n_predict` budget was used up.
    MaxTokens,
    /// Stopped on request. The last delivered content is final.
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    pub content: String,
    pub stop_reason: StopReason,
    /// Pieces delivered to the callback.
    pub steps: usize,
}

/// A generation that failed, with whatever was produced before the failure.
#[derive(Debug, thiserror::Error)]
#[error("completion failed: {source}")]
pub struct CompletionError {
    #[source]
    pub source: EngineError,
    pub partial: String,
}

impl CompletionError {
    fn new(source: EngineError, partial: String) -> Self {
        Self { source, partial }
    }
}

pub struct CompletionController {
    engine: Arc<EngineManager>,
}

impl CompletionController {
    pub fn new(engine: Arc<EngineManager>) -> Self {
        Self { engine }
    }

    /// Generate a completion for `prompt`.
    ///
    /// `on_token` receives the cumulative content after every piece, in
    /// generation order; callers overwrite rather than append. Fails with
    /// [`EngineError::Generating`] if another completion is running.
    pub async fn create_completion<F>(&self, prompt: &str, on_token: F) -> Result<Completion, CompletionError>
    where
        F: FnMut(&str) + Send,
    {
        self.create_completion_with(prompt, CancellationToken::new(), on_token)
            .await
    }

    /// Same as [`create_completion`](Self::create_completion) with an
    /// explicit cancellation token, checked at every step boundary.
    pub async fn create_completion_with<F>(
        &self,
        prompt: &str,
        cancel: CancellationToken,
        mut on_token: F,
    ) -> Result<Completion, CompletionError>
    where
        F: FnMut(&str) + Send,
    {
        let guard = self
            .engine
            .begin_generation(cancel)
            .map_err(|e| CompletionError::new(e, String::new()))?;
        let budget = guard.params().n_predict as usize;
        let mut generation = guard
            .instance()
            .start_generation(prompt, guard.params())
            .map_err(|e| CompletionError::new(e, String::new()))?;

        let token = guard.cancel_token().clone();
        let mut content = String::new();
        let mut steps = 0usize;

        let stop_reason = loop {
            if token.is_cancelled() {
                break StopReason::Cancelled;
            }
            if steps >= budget {
                break StopReason::MaxTokens;
            }

            let step = generation.next_step().await;
            // A step finished after a stop request is discarded.
            if token.is_cancelled() {
                break StopReason::Cancelled;
            }

            match step {
                Ok(GenerationStep::Piece(piece)) => {
                    content.push_str(&piece);
                    steps += 1;
                    on_token(&content);
                }
                Ok(GenerationStep::EndOfSequence) => break StopReason::EndOfSequence,
                Err(e) => {
                    tracing::error!(steps, "Generation failed: {}", e);
                    return Err(CompletionError::new(e, content));
                }
            }
        };

        drop(generation);
        drop(guard);

        tracing::debug!(steps, ?stop_reason, "Completion settled");
        Ok(Completion {
            content,
            stop_reason,
            steps,
        })
    }

    /// Ask the running completion to stop at its next step boundary.
    /// Returns false if nothing was running.
    pub fn stop_completion(&self) -> bool {
        let stopped = self.engine.request_stop();
        if stopped {
            tracing::info!("Stop requested");
        }
        stopped
    }

    pub fn is_generating(&self) -> bool {
        self.engine.is_generating()
    }
}
