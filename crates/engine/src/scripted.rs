//! Deterministic engine that replays a fixed list of pieces.
//!
//! Used by tests and by headless runs without a native runtime attached.

use crate::{
    ChatTurn, EngineError, EngineLoader, Generation, GenerationStep, InferenceEngine,
    InferenceParameters, Result,
};
use ndis_models::ModelDescriptor;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Debug, Clone, Default)]
struct Script {
    pieces: Arc<Vec<String>>,
    template: Option<String>,
    native_template: bool,
    step_delay: Option<Duration>,
    fail_at: Option<(usize, String)>,
    release_error: Option<String>,
}

#[derive(Debug, Default)]
struct Counters {
    loads: AtomicUsize,
    generations: AtomicUsize,
    releases: AtomicUsize,
    prompts: Mutex<Vec<String>>,
}

/// Loader producing [`ScriptedEngine`]s.
#[derive(Debug, Clone)]
pub struct ScriptedLoader {
    name: String,
    suffix: Option<String>,
    load_error: Option<String>,
    load_delay: Option<Duration>,
    script: Script,
    counters: Arc<Counters>,
}

impl ScriptedLoader {
    pub fn new<S: Into<String>>(pieces: Vec<S>) -> Self {
        Self {
            name: "scripted".to_string(),
            suffix: None,
            load_error: None,
            load_delay: None,
            script: Script {
                pieces: Arc::new(pieces.into_iter().map(Into::into).collect()),
                template: Some("chatml".to_string()),
                ..Script::default()
            },
            counters: Arc::default(),
        }
    }

    /// One piece per character of `text`.
    pub fn chars(text: &str) -> Self {
        Self::new(text.chars().map(String::from).collect::<Vec<_>>())
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Only accept artifacts whose file name ends with `suffix`.
    pub fn accepting(mut self, suffix: impl Into<String>) -> Self {
        self.suffix = Some(suffix.into());
        self
    }

    pub fn with_template(mut self, template: Option<&str>) -> Self {
        self.script.template = template.map(str::to_string);
        self
    }

    /// Let the engine render prompts itself as `role: content` lines.
    pub fn rendering_natively(mut self) -> Self {
        self.script.native_template = true;
        self
    }

    pub fn with_step_delay(mut self, delay: Duration) -> Self {
        self.script.step_delay = Some(delay);
        self
    }

    /// Fail the generation when asked for step `step` (zero-based).
    pub fn failing_at(mut self, step: usize, message: impl Into<String>) -> Self {
        self.script.fail_at = Some((step, message.into()));
        self
    }

    /// Block the loading thread for `delay` before building the engine.
    pub fn with_load_delay(mut self, delay: Duration) -> Self {
        self.load_delay = Some(delay);
        self
    }

    pub fn failing_load(mut self, message: impl Into<String>) -> Self {
        self.load_error = Some(message.into());
        self
    }

    pub fn failing_release(mut self, message: impl Into<String>) -> Self {
        self.script.release_error = Some(message.into());
        self
    }

    pub fn loads(&self) -> usize {
        self.counters.loads.load(Ordering::SeqCst)
    }

    pub fn generations(&self) -> usize {
        self.counters.generations.load(Ordering::SeqCst)
    }

    pub fn releases(&self) -> usize {
        self.counters.releases.load(Ordering::SeqCst)
    }

    /// Prompts passed to `start_generation`, oldest first.
    pub fn prompts(&self) -> Vec<String> {
        self.counters.prompts.lock().unwrap().clone()
    }
}

impl EngineLoader for ScriptedLoader {
    fn name(&self) -> &str {
        &self.name
    }

    fn can_load(&self, model: &ModelDescriptor) -> bool {
        self.suffix
            .as_deref()
            .map_or(true, |suffix| model.filename().ends_with(suffix))
    }

    fn load(
        &self,
        model: &ModelDescriptor,
        _model_path: &Path,
        _params: &InferenceParameters,
    ) -> Result<Box<dyn InferenceEngine>> {
        self.counters.loads.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.load_delay {
            std::thread::sleep(delay);
        }
        if let Some(message) = &self.load_error {
            return Err(EngineError::LoadFailed(message.clone()));
        }
        Ok(Box::new(ScriptedEngine {
            model_name: model.id.clone(),
            script: self.script.clone(),
            counters: self.counters.clone(),
        }))
    }
}

pub struct ScriptedEngine {
    model_name: String,
    script: Script,
    counters: Arc<Counters>,
}

impl InferenceEngine for ScriptedEngine {
    fn model_name(&self) -> &str {
        &self.model_name
    }

    fn chat_template(&self) -> Option<&str> {
        self.script.template.as_deref()
    }

    fn apply_chat_template(&self, turns: &[ChatTurn<'_>]) -> Option<Result<String>> {
        if !self.script.native_template {
            return None;
        }
        if turns.is_empty() {
            return Some(Err(EngineError::Template("no messages".to_string())));
        }
        let mut prompt: String = turns
            .iter()
            .map(|t| format!("{}: {}\n", t.role, t.content))
            .collect();
        prompt.push_str("assistant: ");
        Some(Ok(prompt))
    }

    fn start_generation(
        &self,
        prompt: &str,
        _params: &InferenceParameters,
    ) -> Result<Box<dyn Generation>> {
        self.counters.generations.fetch_add(1, Ordering::SeqCst);
        self.counters.prompts.lock().unwrap().push(prompt.to_string());
        Ok(Box::new(ScriptedGeneration {
            script: self.script.clone(),
            step: 0,
        }))
    }

    fn release(&self) -> Result<()> {
        self.counters.releases.fetch_add(1, Ordering::SeqCst);
        match &self.script.release_error {
            Some(message) => Err(EngineError::Release(message.clone())),
            None => Ok(()),
        }
    }
}

struct ScriptedGeneration {
    script: Script,
    step: usize,
}

#[async_trait::async_trait]
impl Generation for ScriptedGeneration {
    async fn next_step(&mut self) -> Result<GenerationStep> {
        match self.script.step_delay {
            Some(delay) => tokio::time::sleep(delay).await,
            None => tokio::task::yield_now().await,
        }

        if let Some((at, message)) = &self.script.fail_at {
            if *at == self.step {
                return Err(EngineError::Inference(message.clone()));
            }
        }

        let step = match self.script.pieces.get(self.step) {
            Some(piece) => GenerationStep::Piece(piece.clone()),
            None => GenerationStep::EndOfSequence,
        };
        self.step += 1;
        Ok(step)
    }
}
