use serde::{Deserialize, Serialize};

/// Engine configuration record, passed through to the engine untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InferenceParameters {
    /// Worker threads; -1 lets the engine decide.
    pub n_threads: i32,
    pub n_context: u32,
    pub n_batch: u32,
    pub temperature: f32,
    /// Maximum number of generated pieces per completion.
    pub n_predict: u32,
}

impl Default for InferenceParameters {
    fn default() -> Self {
        Self {
            n_threads: -1,
            n_context: 4096,
            n_batch: 128,
            temperature: 0.2,
            n_predict: 4096,
        }
    }
}
