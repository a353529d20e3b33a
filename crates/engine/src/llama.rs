//! GGUF runtime on llama.cpp.
//!
//! Generation runs on its own thread, which owns the decoding context and
//! hands pieces to the async side over a bounded channel. Dropping the
//! [`Generation`] closes the channel and the thread stops at its next piece.

use crate::{
    ChatTurn, EngineError, EngineLoader, Generation, GenerationStep, InferenceEngine,
    InferenceParameters, Result,
};
use llama_cpp_2::context::params::LlamaContextParams;
use llama_cpp_2::llama_backend::LlamaBackend;
use llama_cpp_2::llama_batch::LlamaBatch;
use llama_cpp_2::model::params::LlamaModelParams;
use llama_cpp_2::model::{AddBos, LlamaChatMessage, LlamaChatTemplate, LlamaModel};
use llama_cpp_2::sampling::LlamaSampler;
use ndis_models::ModelDescriptor;
use std::num::NonZeroU32;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::mpsc;

const STEP_BUFFER: usize = 32;
const FALLBACK_TEMPLATE: &str = "chatml";

fn is_gguf(model: &ModelDescriptor) -> bool {
    model.filename().to_ascii_lowercase().ends_with(".gguf")
}

/// Loads `.gguf` artifacts. Holds the process-wide llama.cpp backend.
pub struct LlamaLoader {
    backend: Arc<LlamaBackend>,
}

impl LlamaLoader {
    /// Initialise the llama.cpp backend. Call once per process.
    pub fn new() -> Result<Self> {
        let backend = LlamaBackend::init()
            .map_err(|e| EngineError::LoadFailed(format!("llama backend: {e}")))?;
        Ok(Self {
            backend: Arc::new(backend),
        })
    }
}

impl EngineLoader for LlamaLoader {
    fn name(&self) -> &str {
        "llama.cpp"
    }

    fn can_load(&self, model: &ModelDescriptor) -> bool {
        is_gguf(model)
    }

    fn load(
        &self,
        model: &ModelDescriptor,
        model_path: &Path,
        _params: &InferenceParameters,
    ) -> Result<Box<dyn InferenceEngine>> {
        tracing::info!(model = %model.id, path = %model_path.display(), "Loading GGUF model");
        let llama = LlamaModel::load_from_file(&self.backend, model_path, &LlamaModelParams::default())
            .map_err(|e| EngineError::LoadFailed(e.to_string()))?;

        let (template, raw_template) = match llama.chat_template(None) {
            Ok(template) => {
                let raw = template.to_str().map(str::to_string).ok();
                (Some(template), raw)
            }
            Err(e) => {
                tracing::warn!(model = %model.id, "No embedded chat template ({e}), using {FALLBACK_TEMPLATE}");
                (None, None)
            }
        };

        Ok(Box::new(LlamaEngine {
            model_name: model.id.clone(),
            backend: self.backend.clone(),
            model: Arc::new(llama),
            template,
            raw_template: raw_template.unwrap_or_else(|| FALLBACK_TEMPLATE.to_string()),
        }))
    }
}

pub struct LlamaEngine {
    model_name: String,
    backend: Arc<LlamaBackend>,
    model: Arc<LlamaModel>,
    template: Option<LlamaChatTemplate>,
    raw_template: String,
}

impl InferenceEngine for LlamaEngine {
    fn model_name(&self) -> &str {
        &self.model_name
    }

    fn chat_template(&self) -> Option<&str> {
        Some(&self.raw_template)
    }

    fn apply_chat_template(&self, turns: &[ChatTurn<'_>]) -> Option<Result<String>> {
        let template = self.template.as_ref()?;
        let rendered = turns
            .iter()
            .map(|turn| {
                LlamaChatMessage::new(turn.role.to_string(), turn.content.to_string())
                    .map_err(|e| EngineError::Template(e.to_string()))
            })
            .collect::<Result<Vec<_>>>()
            .and_then(|messages| {
                self.model
                    .apply_chat_template(template, &messages, true)
                    .map_err(|e| EngineError::Template(e.to_string()))
            });
        Some(rendered)
    }

    fn start_generation(
        &self,
        prompt: &str,
        params: &InferenceParameters,
    ) -> Result<Box<dyn Generation>> {
        let (tx, rx) = mpsc::channel(STEP_BUFFER);
        let backend = self.backend.clone();
        let model = self.model.clone();
        let prompt = prompt.to_string();
        let params = params.clone();

        std::thread::Builder::new()
            .name("llama-generation".to_string())
            .spawn(move || {
                if let Err(e) = generate(&backend, &model, &prompt, &params, &tx) {
                    tracing::error!("Generation failed: {e}");
                    let _ = tx.blocking_send(Err(e));
                }
            })
            .map_err(|e| EngineError::Inference(format!("failed to start generation thread: {e}")))?;

        Ok(Box::new(LlamaGeneration { rx }))
    }
}

struct LlamaGeneration {
    rx: mpsc::Receiver<Result<GenerationStep>>,
}

#[async_trait::async_trait]
impl Generation for LlamaGeneration {
    async fn next_step(&mut self) -> Result<GenerationStep> {
        self.rx.recv().await.unwrap_or(Ok(GenerationStep::EndOfSequence))
    }
}

fn inference<E: std::fmt::Display>(context: &'static str) -> impl Fn(E) -> EngineError {
    move |e| EngineError::Inference(format!("{context}: {e}"))
}

fn context_params(params: &InferenceParameters) -> LlamaContextParams {
    let mut ctx = LlamaContextParams::default()
        .with_n_ctx(NonZeroU32::new(params.n_context))
        .with_n_batch(params.n_batch);
    if params.n_threads > 0 {
        ctx = ctx
            .with_n_threads(params.n_threads)
            .with_n_threads_batch(params.n_threads);
    }
    ctx
}

fn sampler(temperature: f32) -> LlamaSampler {
    if temperature <= 0.0 {
        LlamaSampler::greedy()
    } else {
        LlamaSampler::chain_simple([LlamaSampler::temp(temperature), LlamaSampler::dist(0)])
    }
}

/// Prefill the prompt, then sample until end of sequence, a full context
/// window, or a closed receiver.
fn generate(
    backend: &LlamaBackend,
    model: &LlamaModel,
    prompt: &str,
    params: &InferenceParameters,
    tx: &mpsc::Sender<Result<GenerationStep>>,
) -> Result<()> {
    let tokens = model
        .str_to_token(prompt, AddBos::Never)
        .map_err(inference("tokenize"))?;
    let mut ctx = model
        .new_context(backend, context_params(params))
        .map_err(inference("create context"))?;

    let n_batch = (ctx.n_batch() as usize).max(1);
    for chunk in tokens.chunks(n_batch) {
        let mut batch = LlamaBatch::get_one(chunk).map_err(inference("prefill batch"))?;
        ctx.decode(&mut batch).map_err(inference("prefill"))?;
    }

    let mut sampler = sampler(params.temperature);
    let mut decoder = encoding_rs::UTF_8.new_decoder();
    let budget = (params.n_context as usize).saturating_sub(tokens.len());

    for _ in 0..budget {
        let token = sampler.sample(&ctx, -1);
        sampler.accept(token);
        if model.is_eog_token(token) {
            let _ = tx.blocking_send(Ok(GenerationStep::EndOfSequence));
            return Ok(());
        }

        let piece = model
            .token_to_piece(token, &mut decoder, true, None)
            .map_err(inference("decode token"))?;
        if !piece.is_empty() && tx.blocking_send(Ok(GenerationStep::Piece(piece))).is_err() {
            tracing::debug!("Generation dropped, stopping");
            return Ok(());
        }

        let next = [token];
        let mut batch = LlamaBatch::get_one(&next).map_err(inference("batch"))?;
        ctx.decode(&mut batch).map_err(inference("decode"))?;
    }

    tracing::warn!(prompt_tokens = tokens.len(), "Context window exhausted");
    let _ = tx.blocking_send(Ok(GenerationStep::EndOfSequence));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndis_models::ModelSource;

    #[test]
    fn test_only_gguf_artifacts_are_accepted() {
        let gguf = ModelDescriptor::new("a", "A", ModelSource::huggingface("o/r", "a.Q4_K_M.GGUF"), 1);
        let onnx = ModelDescriptor::new("b", "B", ModelSource::huggingface("o/r", "b.onnx"), 1);
        assert!(is_gguf(&gguf));
        assert!(!is_gguf(&onnx));
    }
}
