//! Distance calibration
//!
//! The user enters their height and holds a palm at arm's length; the depth
//! server turns the reference frame into a calibration factor. The factor is
//! kept for the session and supplied to later depth analyses.

use tokio::sync::watch;
use tracing::info;

use crate::capture::{DeviceState, ImagePayload};
use crate::coordinator::Mode;

/// Plausible adult/child height range, in centimetres
const MIN_HEIGHT_CM: f64 = 80.0;
const MAX_HEIGHT_CM: f64 = 250.0;

/// Factor used before any calibration
pub const DEFAULT_FACTOR: f64 = 1.0;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CalibrationError {
    #[error("height was not entered")]
    NoHeight,

    #[error("'{0}' is not a height in centimetres")]
    InvalidHeight(String),

    #[error("height must be between 80 and 250 cm, got {0}")]
    OutOfRange(f64),

    #[error("calibration factor must be positive, got {0}")]
    InvalidFactor(f64),
}

/// Parse user input such as `"172"`, `"172 cm"` or `"172.5cm"`
pub fn parse_height(input: &str) -> Result<f64, CalibrationError> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err(CalibrationError::NoHeight);
    }
    let number = trimmed
        .trim_end_matches(|c: char| c.is_alphabetic() || c.is_whitespace())
        .trim();
    let height: f64 = number
        .parse()
        .map_err(|_| CalibrationError::InvalidHeight(trimmed.to_string()))?;
    if !(MIN_HEIGHT_CM..=MAX_HEIGHT_CM).contains(&height) {
        return Err(CalibrationError::OutOfRange(height));
    }
    Ok(height)
}

/// Transient calibration input, discarded on cancel
#[derive(Debug, Clone, Default)]
pub struct CalibrationDraft {
    pub height_cm: Option<f64>,
    pub reference: Option<ImagePayload>,
}

impl CalibrationDraft {
    pub fn is_complete(&self) -> bool {
        self.height_cm.is_some() && self.reference.is_some()
    }
}

/// A calibration in progress: what to restore when it ends
#[derive(Debug)]
pub struct CalibrationSession {
    pub generation: u64,
    pub previous_mode: Mode,
    pub device: DeviceState,
    pub draft: CalibrationDraft,
    /// Waiting on the depth server
    pub submitted: bool,
}

/// Session-scoped calibration factor, observable by the obstacle monitor
#[derive(Debug)]
pub struct CalibrationStore {
    tx: watch::Sender<f64>,
}

impl Default for CalibrationStore {
    fn default() -> Self {
        Self::new()
    }
}

impl CalibrationStore {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(DEFAULT_FACTOR);
        Self { tx }
    }

    pub fn factor(&self) -> f64 {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<f64> {
        self.tx.subscribe()
    }

    /// Persist a confirmed factor for the rest of the session
    pub fn confirm(&self, factor: f64) -> Result<(), CalibrationError> {
        if !factor.is_finite() || factor <= 0.0 {
            return Err(CalibrationError::InvalidFactor(factor));
        }
        self.tx.send_replace(factor);
        info!(factor, "calibration factor stored");
        Ok(())
    }
}
