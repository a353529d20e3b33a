use crate::{InferenceParameters, Result};
use ndis_models::ModelDescriptor;
use std::path::Path;

/// One unit of generated output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GenerationStep {
    /// Next decoded text piece.
    Piece(String),
    /// The model emitted its end-of-sequence token.
    EndOfSequence,
}

/// One role-tagged message handed to a model's own chat template.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChatTurn<'a> {
    /// "system", "user" or "assistant".
    pub role: &'a str,
    pub content: &'a str,
}

/// A loaded model, ready to generate.
///
/// The instance is owned by the engine manager; callers get a shared handle
/// for the duration of one completion.
pub trait InferenceEngine: Send + Sync {
    fn model_name(&self) -> &str;

    /// Raw chat template shipped with the model, if any.
    fn chat_template(&self) -> Option<&str>;

    /// Render `turns` with the model's embedded template, ending with an open
    /// assistant turn.
    ///
    /// `None` means the runtime cannot render templates itself and the caller
    /// should fall back to [`chat_template`](Self::chat_template).
    fn apply_chat_template(&self, _turns: &[ChatTurn<'_>]) -> Option<Result<String>> {
        None
    }

    /// Start generating from a fully formatted prompt.
    fn start_generation(
        &self,
        prompt: &str,
        params: &InferenceParameters,
    ) -> Result<Box<dyn Generation>>;

    /// Free native resources. Called once, on unload.
    fn release(&self) -> Result<()> {
        Ok(())
    }
}

/// An in-flight generation, advanced one step at a time.
///
/// Each call is a suspension point; cancellation is checked between steps.
#[async_trait::async_trait]
pub trait Generation: Send {
    async fn next_step(&mut self) -> Result<GenerationStep>;
}

/// Factory for inference engines.
///
/// Runtime crates implement this to register their engine types.
pub trait EngineLoader: Send + Sync {
    /// Human-readable name of the engine type.
    fn name(&self) -> &str;

    fn can_load(&self, model: &ModelDescriptor) -> bool;

    /// Build an engine from the artifact at `model_path`. May block.
    fn load(
        &self,
        model: &ModelDescriptor,
        model_path: &Path,
        params: &InferenceParameters,
    ) -> Result<Box<dyn InferenceEngine>>;
}
