//! Built-in model catalog entries.

use crate::{ModelDescriptor, ModelSource};

/// Small instruction-tuned GGUF models that run on a laptop CPU.
pub fn default_catalog() -> Vec<ModelDescriptor> {
    vec![
        ModelDescriptor::new(
            "qwen2.5-0.5b-instruct",
            "Qwen 2.5 0.5B Instruct (Q8_0)",
            ModelSource::huggingface(
                "Qwen/Qwen2.5-0.5B-Instruct-GGUF",
                "qwen2.5-0.5b-instruct-q8_0.gguf",
            ),
            675_710_816,
        ),
        ModelDescriptor::new(
            "llama-3.2-1b-instruct",
            "Llama 3.2 1B Instruct (Q4_K_M)",
            ModelSource::huggingface(
                "bartowski/Llama-3.2-1B-Instruct-GGUF",
                "Llama-3.2-1B-Instruct-Q4_K_M.gguf",
            ),
            807_694_464,
        ),
        ModelDescriptor::new(
            "gemma-2-2b-it",
            "Gemma 2 2B Instruct (Q4_K_M)",
            ModelSource::huggingface("bartowski/gemma-2-2b-it-GGUF", "gemma-2-2b-it-Q4_K_M.gguf"),
            1_708_582_752,
        ),
        ModelDescriptor::new(
            "phi-3.5-mini-instruct",
            "Phi 3.5 Mini Instruct (Q4_K_M)",
            ModelSource::huggingface(
                "bartowski/Phi-3.5-mini-instruct-GGUF",
                "Phi-3.5-mini-instruct-Q4_K_M.gguf",
            ),
            2_393_232_672,
        ),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_default_catalog_ids_are_unique() {
        let models = default_catalog();
        let ids: HashSet<_> = models.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids.len(), models.len());
        assert!(models.iter().all(|m| !m.custom && m.size_bytes > 0));
        assert!(models.iter().all(|m| m.filename().ends_with(".gguf")));
    }
}
