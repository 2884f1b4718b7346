//! Obstacle monitor
//!
//! Runs depth analysis on its own timer and raises alerts through an
//! [`AlertSink`]. It never goes through the speech channel or the analysis
//! gate, so it neither blocks nor is blocked by narration.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backend::DepthService;
use crate::capture::CaptureDevice;

/// Out-of-band alert output (vibration, earcon). Implemented by the client bridge.
#[async_trait]
pub trait AlertSink: Send + Sync {
    async fn alert(&self, message: &str);
}

/// Handle to a running monitor. Stops the monitor when dropped.
#[derive(Debug)]
pub struct ObstacleMonitor {
    cancel: CancellationToken,
}

impl ObstacleMonitor {
    /// Spawn the monitor loop
    pub fn spawn(
        device: Arc<CaptureDevice>,
        depth: Arc<dyn DepthService>,
        alerts: Arc<dyn AlertSink>,
        factor: watch::Receiver<f64>,
        period: Duration,
    ) -> Self {
        let cancel = CancellationToken::new();
        let token = cancel.clone();

        tokio::spawn(async move {
            info!(period_ms = period.as_millis() as u64, "obstacle monitor started");
            let mut timer = tokio::time::interval(period);
            timer.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = timer.tick() => {}
                }

                let image = match device.observe() {
                    Ok(image) => image,
                    Err(e) => {
                        debug!(?e, "obstacle check skipped");
                        continue;
                    }
                };

                let calibration = *factor.borrow();
                let report = tokio::select! {
                    _ = token.cancelled() => break,
                    report = depth.analyze_depth(&image, calibration) => report,
                };

                match report {
                    Ok(report) if report.should_warn => {
                        info!(message = %report.message, "obstacle warning");
                        alerts.alert(&report.message).await;
                    }
                    Ok(report) => debug!(message = %report.message, "path clear"),
                    Err(e) => warn!(?e, "depth analysis failed"),
                }
            }
            info!("obstacle monitor stopped");
        });

        Self { cancel }
    }

    pub fn stop(&self) {
        self.cancel.cancel();
    }
}

impl Drop for ObstacleMonitor {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
