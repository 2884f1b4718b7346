//! Session modes and the controls each one enables

use serde::{Deserialize, Serialize};

use crate::navigation::NavState;

/// The five mutually exclusive session modes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    /// Nothing running
    #[default]
    Idle,
    /// Free-running scene narration
    AutoNarrating,
    /// Turn-by-turn guidance only
    Navigating,
    /// Guidance with scene narration on top
    NavigatingAndNarrating,
    /// Distance calibration; the previous mode is suspended
    Calibrating,
}

impl Mode {
    pub fn is_narrating(self) -> bool {
        matches!(self, Mode::AutoNarrating | Mode::NavigatingAndNarrating)
    }

    pub fn is_navigating(self) -> bool {
        matches!(self, Mode::Navigating | Mode::NavigatingAndNarrating)
    }
}

impl std::fmt::Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Mode::Idle => write!(f, "Idle"),
            Mode::AutoNarrating => write!(f, "AutoNarrating"),
            Mode::Navigating => write!(f, "Navigating"),
            Mode::NavigatingAndNarrating => write!(f, "NavigatingAndNarrating"),
            Mode::Calibrating => write!(f, "Calibrating"),
        }
    }
}

/// Which front-end controls are usable in the current mode
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlState {
    pub primary_label: String,
    pub primary_enabled: bool,
    pub directions_label: String,
    pub directions_enabled: bool,
    /// Speech settings panel
    pub settings_enabled: bool,
    /// Model, policy and interval selectors
    pub selectors_enabled: bool,
    pub calibrate_enabled: bool,
}

impl ControlState {
    pub fn derive(mode: Mode, nav: NavState) -> Self {
        let requesting = nav == NavState::Requesting;
        let calibrating = mode == Mode::Calibrating;

        let primary_label = match mode {
            Mode::AutoNarrating => "Stop",
            Mode::NavigatingAndNarrating => "Stop narration",
            _ => "Start",
        };
        let directions_label = if mode.is_navigating() || requesting {
            "Stop guidance"
        } else {
            "Directions"
        };

        Self {
            primary_label: primary_label.to_string(),
            primary_enabled: !calibrating && !requesting,
            directions_label: directions_label.to_string(),
            directions_enabled: !calibrating && mode != Mode::AutoNarrating,
            settings_enabled: mode == Mode::Idle && !requesting,
            selectors_enabled: !mode.is_narrating() && !calibrating,
            calibrate_enabled: !calibrating,
        }
    }
}

impl Default for ControlState {
    fn default() -> Self {
        Self::derive(Mode::Idle, NavState::NotStarted)
    }
}
