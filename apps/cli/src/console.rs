use ndis_events::{AssistantEvent, EventBus};
use std::io::Write;
use std::sync::Mutex;

/// Streams assistant replies to stdout.
///
/// Message updates carry the whole content so far; only the unseen tail is
/// printed.
#[derive(Default)]
pub struct ConsoleEventBus {
    printed: Mutex<usize>,
}

impl ConsoleEventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Unseen suffix of `content`, given `printed` bytes already shown.
    fn tail(content: &str, printed: usize) -> &str {
        if printed <= content.len() && content.is_char_boundary(printed) {
            &content[printed..]
        } else {
            content
        }
    }
}

impl EventBus for ConsoleEventBus {
    fn emit(&self, event: AssistantEvent) {
        match event {
            AssistantEvent::MessageUpdated { content, .. } => {
                let mut printed = self.printed.lock().expect("console mutex poisoned");
                let tail = Self::tail(&content, *printed);
                if !tail.is_empty() {
                    let mut stdout = std::io::stdout();
                    let _ = stdout.write_all(tail.as_bytes());
                    let _ = stdout.flush();
                }
                *printed = content.len();
            }
            AssistantEvent::SubmissionFinished { .. } => {
                *self.printed.lock().expect("console mutex poisoned") = 0;
                println!();
            }
            other => tracing::debug!(topic = other.topic(), "Event"),
        }
    }
}
