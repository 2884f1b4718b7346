//! sightline-daemon: background daemon for scene narration and walking guidance
//!
//! Wires the HTTP backend and the client bridge into the session coordinator
//! and serves the front-end over a Unix socket until SIGTERM/SIGINT.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use sightline_daemon::backend::http::HttpBackend;
use sightline_daemon::backend::DepthService;
use sightline_daemon::bridge::ClientBridge;
use sightline_daemon::config::Config;
use sightline_daemon::coordinator::{Coordinator, Devices, Services};
use sightline_daemon::ipc::Server;
use sightline_daemon::lifecycle::ShutdownSignal;

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!(
        version = env!("CARGO_PKG_VERSION"),
        "sightline-daemon starting"
    );

    // Load configuration
    let config = Config::load()?;
    config.ensure_dirs()?;
    info!(
        socket = ?config.socket_path,
        backend = %config.backend_url,
        depth = ?config.depth_url,
        "configuration loaded"
    );

    let settings = config.load_settings();
    info!(?settings, "settings loaded");

    let backend = Arc::new(
        HttpBackend::new(
            &config.backend_url,
            config.depth_url.as_deref(),
            config.obstacle_distance_m,
            config.request_timeout,
        )
        .context("failed to create backend client")?,
    );
    let depth = config
        .depth_url
        .as_ref()
        .map(|_| Arc::clone(&backend) as Arc<dyn DepthService>);
    let services = Services {
        describer: backend.clone(),
        routing: backend,
        depth,
    };

    // The connected front-end provides every device
    let bridge = ClientBridge::new(config.bridge);
    let devices = Devices {
        camera: bridge.clone(),
        location: bridge.clone(),
        speech: bridge.clone(),
        recognizer: bridge.clone(),
        prompter: bridge.clone(),
        alerts: bridge.clone(),
    };

    let (coordinator, handle) =
        Coordinator::new(services, devices, settings, config.coordinator_options());
    let events = handle.subscribe();
    let coordinator_task = tokio::spawn(coordinator.run());

    let server = Server::new(&config.socket_path, handle.clone(), Arc::clone(&bridge))?;
    let mut shutdown = ShutdownSignal::install()?;

    info!("daemon initialized, entering main loop");

    tokio::select! {
        // Run the IPC server (accepts client connections)
        result = server.run() => {
            if let Err(e) = result {
                error!(?e, "IPC server error");
            }
        }

        // Relay coordinator events to the front-end
        _ = bridge.forward_events(events) => {
            info!("event forwarder exited");
        }

        // Wait for shutdown signal
        reason = shutdown.wait() => {
            info!(%reason, "shutdown signal received");
        }
    }

    // Cleanup
    info!("shutting down...");

    handle.shutdown();
    if tokio::time::timeout(Duration::from_secs(2), coordinator_task)
        .await
        .is_err()
    {
        warn!("coordinator did not stop in time");
    }
    server.shutdown().await;

    info!("sightline-daemon stopped");

    Ok(())
}
