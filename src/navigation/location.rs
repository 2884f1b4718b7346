//! Location samples and the device location provider contract

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// WGS84 position
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinates {
    pub longitude: f64,
    pub latitude: f64,
}

impl Coordinates {
    pub fn new(longitude: f64, latitude: f64) -> Self {
        Self {
            longitude,
            latitude,
        }
    }
}

/// Rendered as `longitude,latitude`, the order the routing backend expects
impl std::fmt::Display for Coordinates {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{},{}", self.longitude, self.latitude)
    }
}

/// A single device location fix
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LocationFix {
    pub coords: Coordinates,
    /// Horizontal accuracy in meters, if reported
    #[serde(default)]
    pub accuracy_m: Option<f64>,
    /// Time the fix was taken, in milliseconds since the Unix epoch
    pub timestamp_ms: u64,
}

impl LocationFix {
    /// Age of the fix relative to `now_ms`. Fixes from the future count as fresh.
    pub fn age_ms(&self, now_ms: u64) -> u64 {
        now_ms.saturating_sub(self.timestamp_ms)
    }
}

/// Current wall-clock time in epoch milliseconds
pub fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Errors from the location provider
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[serde(rename_all = "snake_case")]
pub enum LocationError {
    #[error("location is unavailable")]
    Unavailable,

    #[error("timed out waiting for a location fix")]
    Timeout,

    #[error("location permission denied")]
    PermissionDenied,
}

/// Push stream of fixes. Dropping the receiver ends the subscription.
pub type LocationWatch = mpsc::Receiver<Result<LocationFix, LocationError>>;

/// Device location source. Implemented by the client bridge in production.
#[async_trait]
pub trait LocationProvider: Send + Sync {
    /// One-shot high-accuracy fix
    async fn current_fix(&self) -> Result<LocationFix, LocationError>;

    /// Start a continuous subscription
    fn watch(&self) -> Result<LocationWatch, LocationError>;
}
