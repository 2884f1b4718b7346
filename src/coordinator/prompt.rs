//! Blocking user interactions
//!
//! Confirmation dialogs, text entry and speech recognition. Each one is a
//! suspension point for the coordinator.

use async_trait::async_trait;

/// Modal dialogs shown by the front-end
#[async_trait]
pub trait Prompter: Send + Sync {
    /// Yes/no question. Dismissal counts as no.
    async fn confirm(&self, question: &str) -> bool;

    /// Free-text question. `None` when dismissed.
    async fn ask_text(&self, question: &str) -> Option<String>;
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RecognitionError {
    #[error("no speech was detected")]
    NoSpeech,

    #[error("speech recognition is not supported")]
    Unavailable,

    #[error("speech recognition failed: {0}")]
    Failed(String),
}

/// Speech-to-text engine
#[async_trait]
pub trait SpeechRecognizer: Send + Sync {
    /// Listen for a single utterance in `lang`
    async fn listen(&self, lang: &str) -> Result<String, RecognitionError>;
}
