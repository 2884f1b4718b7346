//! Configuration loading and management

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{info, warn};

use crate::bridge::BridgeTimeouts;
use crate::capture::RetryPolicy;
use crate::coordinator::CoordinatorOptions;
use crate::settings::Settings;

const DEFAULT_BACKEND_URL: &str = "http://127.0.0.1:5000";
const DEFAULT_OBSTACLE_DISTANCE_M: f64 = 1.0;
const DEFAULT_SPEECH_LANG: &str = "en-US";

/// Daemon configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Path to the Unix domain socket for IPC
    pub socket_path: PathBuf,

    /// Directory for runtime data
    pub data_dir: PathBuf,

    /// Persisted user settings
    pub settings_path: PathBuf,

    /// Narration server: description, models and routing
    pub backend_url: String,

    /// Depth server. Calibration and obstacle warnings are off without it.
    pub depth_url: Option<String>,

    /// Forces the description model regardless of saved settings
    pub model_override: Option<String>,

    /// Warn when the nearest obstacle is closer than this
    pub obstacle_distance_m: f64,

    /// Language for speech output and recognition
    pub speech_lang: String,

    pub request_timeout: Duration,
    pub capture_retry: RetryPolicy,
    pub location_max_age: Duration,
    pub location_timeout: Duration,
    pub obstacle_period: Duration,
    pub bridge: BridgeTimeouts,
}

impl Config {
    /// Load configuration from environment and defaults
    pub fn load() -> Result<Self> {
        let home = std::env::var("HOME").context("HOME is not set")?;
        Self::from_lookup(&home, |key| std::env::var(key).ok())
    }

    /// Build configuration from a variable lookup
    pub fn from_lookup(home: &str, lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let var = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let data_dir = PathBuf::from(home)
            .join(".local")
            .join("share")
            .join("sightline");

        let socket_path = var("SIGHTLINE_SOCKET")
            .map(PathBuf::from)
            .unwrap_or_else(|| data_dir.join("daemon.sock"));

        let obstacle_distance_m = match var("SIGHTLINE_OBSTACLE_DISTANCE_M") {
            Some(raw) => raw
                .parse::<f64>()
                .ok()
                .filter(|d| d.is_finite() && *d > 0.0)
                .with_context(|| format!("invalid SIGHTLINE_OBSTACLE_DISTANCE_M: '{raw}'"))?,
            None => DEFAULT_OBSTACLE_DISTANCE_M,
        };

        Ok(Self {
            settings_path: data_dir.join("settings.json"),
            socket_path,
            data_dir,
            backend_url: var("SIGHTLINE_BACKEND_URL")
                .unwrap_or_else(|| DEFAULT_BACKEND_URL.to_string()),
            depth_url: var("SIGHTLINE_DEPTH_URL"),
            model_override: var("SIGHTLINE_MODEL"),
            obstacle_distance_m,
            speech_lang: var("SIGHTLINE_SPEECH_LANG")
                .unwrap_or_else(|| DEFAULT_SPEECH_LANG.to_string()),
            request_timeout: Duration::from_secs(30),
            capture_retry: RetryPolicy::default(),
            location_max_age: Duration::from_secs(5),
            location_timeout: Duration::from_secs(15),
            obstacle_period: Duration::from_secs(1),
            bridge: BridgeTimeouts::default(),
        })
    }

    /// Ensure data directory exists
    pub fn ensure_dirs(&self) -> Result<()> {
        std::fs::create_dir_all(&self.data_dir)
            .with_context(|| format!("failed to create {}", self.data_dir.display()))?;
        Ok(())
    }

    /// Saved settings with the environment model override applied
    pub fn load_settings(&self) -> Settings {
        let mut settings = Settings::load(&self.settings_path);
        if let Some(model) = &self.model_override {
            info!(%model, "description model overridden from environment");
            settings.model = model.clone();
        }
        settings
    }

    pub fn coordinator_options(&self) -> CoordinatorOptions {
        if self.depth_url.is_none() {
            warn!("no depth server configured; obstacle warnings and calibration disabled");
        }
        CoordinatorOptions {
            capture_retry: self.capture_retry,
            location_max_age: self.location_max_age,
            location_timeout: self.location_timeout,
            obstacle_period: self.depth_url.as_ref().map(|_| self.obstacle_period),
            speech_lang: self.speech_lang.clone(),
            settings_path: Some(self.settings_path.clone()),
            ..CoordinatorOptions::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(vars: &[(&str, &str)]) -> Result<Config> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup("/home/user", |key| vars.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = config(&[]).unwrap();
        assert!(config.socket_path.to_string_lossy().contains("sightline"));
        assert_eq!(
            config.settings_path,
            PathBuf::from("/home/user/.local/share/sightline/settings.json")
        );
        assert_eq!(config.backend_url, DEFAULT_BACKEND_URL);
        assert_eq!(config.depth_url, None);
        assert_eq!(config.speech_lang, "en-US");
        assert_eq!(config.coordinator_options().obstacle_period, None);
    }

    #[test]
    fn test_environment_overrides() {
        let config = config(&[
            ("SIGHTLINE_BACKEND_URL", "http://10.0.0.2:5000"),
            ("SIGHTLINE_DEPTH_URL", "http://10.0.0.3:8000"),
            ("SIGHTLINE_SOCKET", "/tmp/sightline.sock"),
            ("SIGHTLINE_OBSTACLE_DISTANCE_M", "1.5"),
            ("SIGHTLINE_SPEECH_LANG", "ko-KR"),
            ("SIGHTLINE_MODEL", " "),
        ])
        .unwrap();
        assert_eq!(config.backend_url, "http://10.0.0.2:5000");
        assert_eq!(config.socket_path, PathBuf::from("/tmp/sightline.sock"));
        assert_eq!(config.obstacle_distance_m, 1.5);
        assert_eq!(config.model_override, None);

        let options = config.coordinator_options();
        assert_eq!(options.obstacle_period, Some(Duration::from_secs(1)));
        assert_eq!(options.speech_lang, "ko-KR");
    }

    #[test]
    fn test_invalid_distance_is_an_error() {
        assert!(config(&[("SIGHTLINE_OBSTACLE_DISTANCE_M", "near")]).is_err());
        assert!(config(&[("SIGHTLINE_OBSTACLE_DISTANCE_M", "-2")]).is_err());
    }

    #[test]
    fn test_model_override_applies_to_saved_settings() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config(&[("SIGHTLINE_MODEL", "gpt-4o")]).unwrap();
        config.settings_path = dir.path().join("settings.json");

        assert_eq!(config.load_settings().model, "gpt-4o");
    }
}
