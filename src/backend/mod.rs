//! Remote service contracts
//!
//! The description model, routing backend and depth server are consumed
//! through these traits. [`http::HttpBackend`] implements all of them against
//! the JSON/multipart endpoints of the narration server.

pub mod http;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::capture::ImagePayload;
use crate::navigation::{Coordinates, SessionId};

/// Errors returned by remote services
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ServiceError {
    /// The service answered with an error message
    #[error("{0}")]
    Rejected(String),

    #[error("service unreachable: {0}")]
    Transport(String),

    #[error("malformed service response: {0}")]
    Malformed(String),

    #[error("service not configured")]
    Unavailable,
}

/// Navigation context folded into a describe call during combined mode
#[derive(Debug, Clone, PartialEq)]
pub struct NavigationContext {
    pub session_id: SessionId,
    pub location: Option<Coordinates>,
}

/// Timing reported by the description service
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PerformanceStats {
    pub model_name: Option<String>,
    pub processing_time_secs: Option<f64>,
}

/// Instruction state piggybacked on a navigation describe call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NavigationUpdate {
    #[serde(default)]
    pub current_instruction: Option<String>,
    #[serde(default)]
    pub instruction_index: usize,
    #[serde(default)]
    pub total_instructions: usize,
    /// Whether the backend advanced the instruction during this call
    #[serde(default)]
    pub updated: bool,
}

/// Successful describe result
#[derive(Debug, Clone, PartialEq)]
pub struct Description {
    pub text: String,
    pub stats: PerformanceStats,
    pub navigation: Option<NavigationUpdate>,
}

/// A selectable description model
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelInfo {
    pub id: String,
    pub name: String,
}

/// Result of a route request
#[derive(Debug, Clone, PartialEq)]
pub struct RouteStart {
    pub session_id: SessionId,
    pub total_steps: usize,
    pub first_instruction: Option<String>,
}

/// Result of a location update
#[derive(Debug, Clone, PartialEq)]
pub struct LocationUpdate {
    pub current_instruction: Option<String>,
    pub instruction_index: usize,
    pub total_steps: usize,
    pub completed: bool,
}

/// Depth analysis verdict driving the obstacle alert
#[derive(Debug, Clone, PartialEq)]
pub struct ObstacleReport {
    pub should_warn: bool,
    pub message: String,
}

/// Scene description model
#[async_trait]
pub trait DescriptionService: Send + Sync {
    async fn describe(
        &self,
        image: &ImagePayload,
        model: &str,
        context: Option<&NavigationContext>,
    ) -> Result<Description, ServiceError>;

    async fn list_models(&self) -> Result<Vec<ModelInfo>, ServiceError>;

    /// Tell the server auto-narration stopped. Best-effort.
    async fn stop_processing(&self) -> Result<(), ServiceError>;
}

/// Turn-by-turn routing backend
#[async_trait]
pub trait RoutingService: Send + Sync {
    async fn start_navigation(
        &self,
        origin: Coordinates,
        destination: &str,
    ) -> Result<RouteStart, ServiceError>;

    async fn update_location(
        &self,
        session_id: &SessionId,
        coords: Coordinates,
    ) -> Result<LocationUpdate, ServiceError>;

    async fn end_navigation(&self, session_id: &SessionId) -> Result<(), ServiceError>;
}

/// Metric depth server
#[async_trait]
pub trait DepthService: Send + Sync {
    /// Compute a calibration factor from a reference frame and the user's height
    async fn calibrate(&self, image: &ImagePayload, height_cm: f64) -> Result<f64, ServiceError>;

    async fn analyze_depth(
        &self,
        image: &ImagePayload,
        calibration_factor: f64,
    ) -> Result<ObstacleReport, ServiceError>;
}
