//! User intents accepted by the coordinator

use serde::{Deserialize, Serialize};

use crate::autocapture::ChainingPolicy;

/// Something the user asked for, from a button, a key or a client request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Intent {
    /// Start/stop scene narration
    TogglePrimary,
    /// Ask for a destination and start guidance, or stop guidance if running
    Directions,
    /// Start guidance to a known destination
    NavigateTo { destination: String },
    /// Escape: stop guidance or abandon calibration
    Cancel,
    Calibrate,
    /// Spoken speech-rate configuration
    ConfigureSpeech,
    SetVoice { voice: Option<String> },
    SetInterval { secs: u64 },
    SetChainingPolicy { policy: ChainingPolicy },
    SelectModel { model: String },
    RefreshModels,
}
