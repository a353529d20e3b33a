use serde::{Deserialize, Serialize};

/// Topic names used when events are routed by string.
pub mod event_names {
    pub const MODEL_STATE_CHANGED: &str = "models:state_changed";
    pub const DOWNLOAD_PROGRESS: &str = "models:download_progress";
    pub const MESSAGE_UPDATED: &str = "chat:message_updated";
    pub const SUBMISSION_FINISHED: &str = "chat:submission_finished";
}

/// Lifecycle state as seen by subscribers.
///
/// Mirrors the catalog's state enum without depending on the models crate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ModelStateSignal {
    NotDownloaded,
    Downloading,
    Ready,
    Loading,
    Loaded,
}

/// How a chat submission ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubmissionSignal {
    Completed,
    Cancelled,
    Failed,
}

/// A single externally observable signal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AssistantEvent {
    /// A descriptor moved to a new lifecycle state.
    ModelStateChanged {
        model_id: String,
        state: ModelStateSignal,
    },

    /// Download progress in `[0, 1]`, non-decreasing per download.
    DownloadProgress { model_id: String, percent: f64 },

    /// Cumulative assistant content so far. Subscribers overwrite, never append.
    MessageUpdated {
        conversation_id: u64,
        message_id: u64,
        content: String,
    },

    SubmissionFinished {
        conversation_id: u64,
        outcome: SubmissionSignal,
    },
}

impl AssistantEvent {
    pub fn topic(&self) -> &'static str {
        match self {
            Self::ModelStateChanged { .. } => event_names::MODEL_STATE_CHANGED,
            Self::DownloadProgress { .. } => event_names::DOWNLOAD_PROGRESS,
            Self::MessageUpdated { .. } => event_names::MESSAGE_UPDATED,
            Self::SubmissionFinished { .. } => event_names::SUBMISSION_FINISHED,
        }
    }

    /// JSON payload for transports that forward events as plain values.
    pub fn payload(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_change_serialization() {
        let event = AssistantEvent::ModelStateChanged {
            model_id: "qwen".to_string(),
            state: ModelStateSignal::NotDownloaded,
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"model_state_changed\""));
        assert!(json.contains("\"state\":\"NOT_DOWNLOADED\""));
    }

    #[test]
    fn test_topics() {
        let event = AssistantEvent::MessageUpdated {
            conversation_id: 1,
            message_id: 2,
            content: "Hi".to_string(),
        };
        assert_eq!(event.topic(), event_names::MESSAGE_UPDATED);
        assert_eq!(event.payload()["content"], "Hi");
    }
}
