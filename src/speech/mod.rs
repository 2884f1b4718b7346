//! Speech output channel
//!
//! A single active utterance at a time: every `speak` call cancels the one in
//! flight. Each call hands back an [`Utterance`] that resolves exactly once.

mod channel;

pub use channel::{SpeechChannel, Utterance};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Text-to-speech engine. Implemented by the client bridge in production.
#[async_trait]
pub trait SpeechEngine: Send + Sync {
    /// Play `text` to completion
    async fn play(&self, text: &str, voice: &VoiceSettings) -> Result<(), SpeechError>;

    /// Stop whatever the engine is currently playing
    fn stop(&self);
}

/// Rate and voice parameters applied to every utterance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VoiceSettings {
    /// Playback rate multiplier, 1..=10
    pub rate: u8,
    /// Engine voice identifier; `None` uses the engine default
    pub voice: Option<String>,
    /// BCP-47 language tag
    pub lang: String,
}

impl Default for VoiceSettings {
    fn default() -> Self {
        Self {
            rate: 3,
            voice: None,
            lang: "en-US".to_string(),
        }
    }
}

/// How an utterance ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SpeechOutcome {
    /// Played to the end
    Completed,
    /// Playback error (already logged)
    Failed(String),
    /// Superseded by a newer utterance or cancelled
    Interrupted,
}

/// Errors reported by a speech engine
#[derive(Debug, Clone, thiserror::Error)]
pub enum SpeechError {
    #[error("speech playback failed: {0}")]
    Playback(String),

    #[error("no speech output available")]
    Unavailable,
}
