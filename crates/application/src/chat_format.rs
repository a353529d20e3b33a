//! Chat-prompt rendering.
//!
//! Engines that can apply the template embedded in the model render the
//! prompt themselves. Otherwise the template family is detected from the raw
//! template text (or a bare family name) and rendered here. Every rendering
//! ends with an open assistant turn.

use ndis_conversation::{Message, Role};
use ndis_engine::{ChatTurn, InferenceEngine};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TemplateError {
    #[error("nothing to format")]
    EmptyConversation,
    #[error("model has no chat template")]
    MissingTemplate,
    #[error("unsupported chat template: {0}")]
    UnsupportedTemplate(String),
    #[error("chat template could not be applied: {0}")]
    Render(String),
}

/// Template families rendered without help from the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatTemplate {
    ChatMl,
    Llama3,
    Gemma,
    Phi3,
    Mistral,
}

impl ChatTemplate {
    pub fn detect(raw: &str) -> Result<Self, TemplateError> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(TemplateError::MissingTemplate);
        }
        if raw.contains("<|im_start|>") {
            return Ok(Self::ChatMl);
        }
        if raw.contains("<|start_header_id|>") {
            return Ok(Self::Llama3);
        }
        if raw.contains("<start_of_turn>") {
            return Ok(Self::Gemma);
        }
        if raw.contains("<|user|>") && raw.contains("<|end|>") {
            return Ok(Self::Phi3);
        }
        if raw.contains("[INST]") {
            return Ok(Self::Mistral);
        }
        match raw.to_ascii_lowercase().as_str() {
            "chatml" => Ok(Self::ChatMl),
            "llama3" | "llama-3" => Ok(Self::Llama3),
            "gemma" => Ok(Self::Gemma),
            "phi3" | "phi-3" => Ok(Self::Phi3),
            "mistral" | "llama2" | "llama-2" => Ok(Self::Mistral),
            _ => Err(TemplateError::UnsupportedTemplate(preview(raw))),
        }
    }

    pub fn render(self, messages: &[Message]) -> Result<String, TemplateError> {
        if messages.is_empty() {
            return Err(TemplateError::EmptyConversation);
        }
        Ok(match self {
            Self::ChatMl => render_chatml(messages),
            Self::Llama3 => render_llama3(messages),
            Self::Gemma => render_gemma(messages),
            Self::Phi3 => render_phi3(messages),
            Self::Mistral => render_mistral(messages),
        })
    }
}

/// Render `messages` into the prompt the loaded engine expects.
///
/// The engine's own template rendering wins; family detection over
/// [`InferenceEngine::chat_template`] is the fallback.
pub fn format_chat(engine: &dyn InferenceEngine, messages: &[Message]) -> Result<String, TemplateError> {
    if messages.is_empty() {
        return Err(TemplateError::EmptyConversation);
    }

    let turns: Vec<ChatTurn<'_>> = messages
        .iter()
        .map(|m| ChatTurn {
            role: m.role().as_str(),
            content: m.content(),
        })
        .collect();
    if let Some(rendered) = engine.apply_chat_template(&turns) {
        tracing::debug!(messages = messages.len(), "Formatting chat with the model template");
        return rendered.map_err(|e| TemplateError::Render(e.to_string()));
    }

    let raw = engine.chat_template().ok_or(TemplateError::MissingTemplate)?;
    let template = ChatTemplate::detect(raw)?;
    tracing::debug!(?template, messages = messages.len(), "Formatting chat");
    template.render(messages)
}

fn render_chatml(messages: &[Message]) -> String {
    let mut out = String::new();
    for m in messages {
        out.push_str(&format!("<|im_start|>{}\n{}<|im_end|>\n", m.role().as_str(), m.content()));
    }
    out.push_str("<|im_start|>assistant\n");
    out
}

fn render_llama3(messages: &[Message]) -> String {
    let mut out = String::from("<|begin_of_text|>");
    for m in messages {
        out.push_str(&format!(
            "<|start_header_id|>{}<|end_header_id|>\n\n{}<|eot_id|>",
            m.role().as_str(),
            m.content()
        ));
    }
    out.push_str("<|start_header_id|>assistant<|end_header_id|>\n\n");
    out
}

/// Folds system text into the next user turn, for templates without a
/// system role. Trailing system text becomes a user turn of its own.
fn fold_system(messages: &[Message]) -> Vec<(Role, String)> {
    let mut turns = Vec::with_capacity(messages.len());
    let mut pending_system: Vec<&str> = Vec::new();

    for m in messages {
        match m.role() {
            Role::System => pending_system.push(m.content()),
            Role::User => {
                let mut content = String::new();
                for system in pending_system.drain(..) {
                    content.push_str(system);
                    content.push_str("\n\n");
                }
                content.push_str(m.content());
                turns.push((Role::User, content));
            }
            Role::Assistant => turns.push((Role::Assistant, m.content().to_string())),
        }
    }
    if !pending_system.is_empty() {
        turns.push((Role::User, pending_system.join("\n\n")));
    }
    turns
}

fn render_gemma(messages: &[Message]) -> String {
    let mut out = String::new();
    for (role, content) in fold_system(messages) {
        let tag = if role == Role::User { "user" } else { "model" };
        out.push_str(&format!("<start_of_turn>{tag}\n{content}<end_of_turn>\n"));
    }
    out.push_str("<start_of_turn>model\n");
    out
}

/// `[INST]` style; the prompt ends right after the last `[/INST]`.
fn render_mistral(messages: &[Message]) -> String {
    let mut out = String::from("<s>");
    for (role, content) in fold_system(messages) {
        match role {
            Role::Assistant => out.push_str(&format!("{content}</s>")),
            _ => out.push_str(&format!("[INST] {content} [/INST]")),
        }
    }
    out
}

fn render_phi3(messages: &[Message]) -> String {
    let mut out = String::new();
    for m in messages {
        out.push_str(&format!("<|{}|>\n{}<|end|>\n", m.role().as_str(), m.content()));
    }
    out.push_str("<|assistant|>\n");
    out
}

fn preview(raw: &str) -> String {
    const MAX: usize = 40;
    match raw.char_indices().nth(MAX) {
        Some((idx, _)) => format!("{}...", &raw[..idx]),
        None => raw.to_string(),
    }
}
