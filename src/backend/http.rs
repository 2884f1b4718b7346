//! HTTP implementation of the service traits
//!
//! Scene description and routing live on the narration server; calibration
//! and depth analysis on the (optional) depth server.

use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use reqwest::multipart::{Form, Part};
use reqwest::{Client, Response};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info};

use super::{
    DepthService, Description, DescriptionService, LocationUpdate, ModelInfo, NavigationContext,
    NavigationUpdate, ObstacleReport, PerformanceStats, RouteStart, RoutingService, ServiceError,
};
use crate::capture::ImagePayload;
use crate::navigation::{Coordinates, SessionId};

/// Client for the narration and depth servers
#[derive(Debug, Clone)]
pub struct HttpBackend {
    client: Client,
    base_url: String,
    depth_url: Option<String>,
    warn_distance_m: f64,
}

impl HttpBackend {
    pub fn new(
        base_url: &str,
        depth_url: Option<&str>,
        warn_distance_m: f64,
        timeout: Duration,
    ) -> Result<Self, ServiceError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ServiceError::Transport(e.to_string()))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            depth_url: depth_url.map(|u| u.trim_end_matches('/').to_string()),
            warn_distance_m,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn depth_endpoint(&self, path: &str) -> Result<String, ServiceError> {
        self.depth_url
            .as_ref()
            .map(|base| format!("{base}{path}"))
            .ok_or(ServiceError::Unavailable)
    }

    async fn post_json<T: DeserializeOwned>(
        &self,
        url: String,
        body: serde_json::Value,
    ) -> Result<T, ServiceError> {
        let response = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(transport)?;
        decode(response).await
    }
}

fn transport(e: reqwest::Error) -> ServiceError {
    ServiceError::Transport(e.to_string())
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: String,
}

/// Decode a JSON body, turning non-success statuses into `Rejected`
async fn decode<T: DeserializeOwned>(response: Response) -> Result<T, ServiceError> {
    let status = response.status();
    let bytes = response.bytes().await.map_err(transport)?;

    if !status.is_success() {
        let message = serde_json::from_slice::<ErrorBody>(&bytes)
            .map(|b| b.error)
            .unwrap_or_else(|_| format!("server error: {status}"));
        return Err(ServiceError::Rejected(message));
    }

    serde_json::from_slice(&bytes).map_err(|e| ServiceError::Malformed(e.to_string()))
}

#[derive(Debug, Default, Deserialize)]
struct DescribeBody {
    description: Option<String>,
    error: Option<String>,
    model_name: Option<String>,
    processing_time: Option<f64>,
    navigation: Option<NavigationUpdate>,
}

fn description_from(body: DescribeBody) -> Result<Description, ServiceError> {
    match body.description {
        Some(text) if !text.trim().is_empty() => Ok(Description {
            text,
            stats: PerformanceStats {
                model_name: body.model_name,
                processing_time_secs: body.processing_time,
            },
            navigation: body.navigation,
        }),
        _ => Err(ServiceError::Rejected(
            body.error.unwrap_or_else(|| "no description returned".to_string()),
        )),
    }
}

#[derive(Debug, Deserialize)]
struct ModelsBody {
    #[serde(default)]
    models: Vec<ModelInfo>,
}

#[derive(Debug, Deserialize)]
struct StartBody {
    session_id: Option<String>,
    #[serde(default)]
    total_instructions: usize,
    current_instruction: Option<String>,
}

fn route_start_from(body: StartBody) -> Result<RouteStart, ServiceError> {
    let session_id = body
        .session_id
        .ok_or_else(|| ServiceError::Malformed("navigation session could not be started".into()))?;
    Ok(RouteStart {
        session_id: SessionId::new(session_id),
        total_steps: body.total_instructions,
        first_instruction: body.current_instruction,
    })
}

#[derive(Debug, Deserialize)]
struct UpdateBody {
    current_instruction: Option<String>,
    #[serde(default)]
    instruction_index: usize,
    #[serde(default)]
    total_instructions: usize,
    #[serde(default)]
    status: String,
}

fn location_update_from(body: UpdateBody) -> LocationUpdate {
    LocationUpdate {
        current_instruction: body.current_instruction,
        instruction_index: body.instruction_index,
        total_steps: body.total_instructions,
        completed: body.status == "completed",
    }
}

#[derive(Debug, Deserialize)]
struct CalibrateBody {
    #[serde(rename = "calibrationFactor")]
    calibration_factor: f64,
}

#[derive(Debug, Deserialize)]
struct DepthAnalysis {
    min_total: f64,
    center_depth: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct AnalyzeBody {
    analysis: DepthAnalysis,
}

fn obstacle_report(analysis: &DepthAnalysis, warn_distance_m: f64) -> ObstacleReport {
    let nearest = analysis.min_total;
    if nearest < warn_distance_m {
        ObstacleReport {
            should_warn: true,
            message: format!("Obstacle {nearest:.1} meters ahead"),
        }
    } else {
        let ahead = analysis.center_depth.unwrap_or(nearest);
        ObstacleReport {
            should_warn: false,
            message: format!("Clear for {ahead:.1} meters"),
        }
    }
}

#[async_trait]
impl DescriptionService for HttpBackend {
    async fn describe(
        &self,
        image: &ImagePayload,
        model: &str,
        context: Option<&NavigationContext>,
    ) -> Result<Description, ServiceError> {
        let part = Part::bytes(image.jpeg.clone())
            .file_name("capture.jpg")
            .mime_str("image/jpeg")
            .map_err(transport)?;
        let mut form = Form::new().part("image", part).text("model", model.to_string());

        let endpoint = match context {
            Some(ctx) => {
                form = form.text("session_id", ctx.session_id.as_str().to_string());
                if let Some(location) = ctx.location {
                    form = form.text("location", location.to_string());
                }
                "/navigation_describe"
            }
            None => "/describe",
        };

        debug!(endpoint, model, bytes = image.jpeg.len(), "describe request");
        let response = self
            .client
            .post(self.url(endpoint))
            .multipart(form)
            .send()
            .await
            .map_err(transport)?;

        let body: DescribeBody = decode(response).await?;
        description_from(body)
    }

    async fn list_models(&self) -> Result<Vec<ModelInfo>, ServiceError> {
        let response = self
            .client
            .get(self.url("/get_models"))
            .send()
            .await
            .map_err(transport)?;
        let body: ModelsBody = decode(response).await?;
        Ok(body.models)
    }

    async fn stop_processing(&self) -> Result<(), ServiceError> {
        let _: serde_json::Value = self
            .post_json(self.url("/stop_auto_processing"), json!({}))
            .await?;
        Ok(())
    }
}

#[async_trait]
impl RoutingService for HttpBackend {
    async fn start_navigation(
        &self,
        origin: Coordinates,
        destination: &str,
    ) -> Result<RouteStart, ServiceError> {
        info!(%origin, destination, "route request");
        let body: StartBody = self
            .post_json(
                self.url("/start_navigation"),
                json!({ "start": origin.to_string(), "goal": destination }),
            )
            .await?;
        route_start_from(body)
    }

    async fn update_location(
        &self,
        session_id: &SessionId,
        coords: Coordinates,
    ) -> Result<LocationUpdate, ServiceError> {
        let body: UpdateBody = self
            .post_json(
                self.url("/update_location"),
                json!({ "session_id": session_id.as_str(), "location": coords.to_string() }),
            )
            .await?;
        Ok(location_update_from(body))
    }

    async fn end_navigation(&self, session_id: &SessionId) -> Result<(), ServiceError> {
        let _: serde_json::Value = self
            .post_json(
                self.url("/end_navigation"),
                json!({ "session_id": session_id.as_str() }),
            )
            .await?;
        Ok(())
    }
}

#[async_trait]
impl DepthService for HttpBackend {
    async fn calibrate(&self, image: &ImagePayload, height_cm: f64) -> Result<f64, ServiceError> {
        let url = self.depth_endpoint("/calibrate")?;
        let body: CalibrateBody = self
            .post_json(
                url,
                json!({ "height": height_cm, "image": BASE64.encode(&image.jpeg) }),
            )
            .await?;
        Ok(body.calibration_factor)
    }

    async fn analyze_depth(
        &self,
        image: &ImagePayload,
        calibration_factor: f64,
    ) -> Result<ObstacleReport, ServiceError> {
        let url = self.depth_endpoint("/analyze")?;
        let body: AnalyzeBody = self
            .post_json(
                url,
                json!({
                    "image": BASE64.encode(&image.jpeg),
                    "calibrationFactor": calibration_factor,
                }),
            )
            .await?;
        Ok(obstacle_report(&body.analysis, self.warn_distance_m))
    }
}
