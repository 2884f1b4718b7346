//! Events module for coordinator transitions
//!
//! Structured events broadcast to subscribed clients whenever the session
//! changes mode, narrates, or finishes a navigation or calibration step.

use serde::{Deserialize, Serialize};

use crate::backend::ModelInfo;
use crate::coordinator::Mode;
use crate::settings::Settings;

/// Events emitted by the coordinator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEvent {
    /// The active mode changed
    ModeChanged {
        from: Mode,
        to: Mode,
        /// Time spent in the previous mode
        duration_ms: u64,
    },

    /// Status line for the front-end
    Status { text: String },

    /// An analysis attempt was refused because a chain is outstanding
    AnalysisBusy,

    /// A scene description arrived and is being narrated
    DescriptionReady {
        text: String,
        model: Option<String>,
        processing_time_secs: Option<f64>,
    },

    NavigationStarted {
        destination: String,
        total_steps: usize,
    },

    /// The current turn-by-turn instruction changed
    InstructionUpdated {
        instruction: String,
        index: usize,
        total: usize,
    },

    /// Navigation stopped by the user
    NavigationStopped,

    /// The route reported arrival
    NavigationCompleted { destination: Option<String> },

    CalibrationStarted,

    CalibrationComplete { factor: f64 },

    CalibrationCancelled,

    /// Persisted settings changed
    SettingsChanged { settings: Settings },

    ModelsAvailable { models: Vec<ModelInfo> },
}

impl std::fmt::Display for SessionEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionEvent::ModeChanged {
                from,
                to,
                duration_ms,
            } => write!(f, "MODE_CHANGED ({} -> {}, {}ms)", from, to, duration_ms),
            SessionEvent::Status { text } => write!(f, "STATUS ({})", text),
            SessionEvent::AnalysisBusy => write!(f, "ANALYSIS_BUSY"),
            SessionEvent::DescriptionReady { text, .. } => {
                write!(f, "DESCRIPTION_READY ({} chars)", text.chars().count())
            }
            SessionEvent::NavigationStarted {
                destination,
                total_steps,
            } => write!(f, "NAVIGATION_STARTED ({}, {} steps)", destination, total_steps),
            SessionEvent::InstructionUpdated { index, total, .. } => {
                write!(f, "INSTRUCTION_UPDATED ({}/{})", index + 1, total)
            }
            SessionEvent::NavigationStopped => write!(f, "NAVIGATION_STOPPED"),
            SessionEvent::NavigationCompleted { .. } => write!(f, "NAVIGATION_COMPLETED"),
            SessionEvent::CalibrationStarted => write!(f, "CALIBRATION_STARTED"),
            SessionEvent::CalibrationComplete { factor } => {
                write!(f, "CALIBRATION_COMPLETE ({:.3})", factor)
            }
            SessionEvent::CalibrationCancelled => write!(f, "CALIBRATION_CANCELLED"),
            SessionEvent::SettingsChanged { .. } => write!(f, "SETTINGS_CHANGED"),
            SessionEvent::ModelsAvailable { models } => {
                write!(f, "MODELS_AVAILABLE ({})", models.len())
            }
        }
    }
}
