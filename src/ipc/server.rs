//! Unix domain socket server for IPC
//!
//! Provides request-response communication for intents, status and device
//! input, and pushes bridge notifications to the subscribed client.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use tokio::net::unix::OwnedWriteHalf;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::bridge::{ClientBridge, DeviceClient};
use crate::capture::Frame;
use crate::coordinator::{CoordinatorHandle, Intent};
use crate::input::intent_for_key;

use super::protocol::{read_message, write_message, DaemonStatus, Notification, Request, Response};

/// IPC Server handling client connections
pub struct Server {
    socket_path: PathBuf,
    listener: Option<UnixListener>,
    state: Arc<ServerState>,
    shutdown_tx: broadcast::Sender<()>,
}

/// Shared server state
struct ServerState {
    start_time: std::time::Instant,
    coordinator: CoordinatorHandle,
    bridge: Arc<ClientBridge>,
}

type SharedWriter = Arc<Mutex<OwnedWriteHalf>>;

/// Stops the notification forwarder when the connection handler exits
struct Forwarder(JoinHandle<()>);

impl Drop for Forwarder {
    fn drop(&mut self) {
        self.0.abort();
    }
}

impl Server {
    /// Create a new IPC server
    pub fn new(
        socket_path: &Path,
        coordinator: CoordinatorHandle,
        bridge: Arc<ClientBridge>,
    ) -> Result<Self> {
        // Ensure parent directory exists
        if let Some(parent) = socket_path.parent() {
            std::fs::create_dir_all(parent).context("failed to create socket directory")?;
        }

        // Remove stale socket if it exists
        if socket_path.exists() {
            std::fs::remove_file(socket_path).context("failed to remove stale socket")?;
        }

        let listener = UnixListener::bind(socket_path).context("failed to bind Unix socket")?;

        // Set socket permissions to owner-only (0600)
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(socket_path, std::fs::Permissions::from_mode(0o600))?;
        }

        let (shutdown_tx, _) = broadcast::channel(1);

        let state = Arc::new(ServerState {
            start_time: std::time::Instant::now(),
            coordinator,
            bridge,
        });

        info!(?socket_path, "IPC server listening");

        Ok(Self {
            socket_path: socket_path.to_owned(),
            listener: Some(listener),
            state,
            shutdown_tx,
        })
    }

    /// Run the server, accepting connections
    pub async fn run(&self) -> Result<()> {
        let listener = self.listener.as_ref().context("server not initialized")?;

        loop {
            match listener.accept().await {
                Ok((stream, _addr)) => {
                    debug!("client connected");
                    let state = Arc::clone(&self.state);
                    let mut shutdown_rx = self.shutdown_tx.subscribe();

                    tokio::spawn(async move {
                        tokio::select! {
                            result = Self::handle_client(stream, state) => {
                                if let Err(e) = result {
                                    warn!(?e, "client handler error");
                                }
                            }
                            _ = shutdown_rx.recv() => {
                                debug!("client handler shutting down");
                            }
                        }
                    });
                }
                Err(e) => {
                    error!(?e, "accept error");
                }
            }
        }
    }

    /// Handle a single client connection
    async fn handle_client(stream: UnixStream, state: Arc<ServerState>) -> Result<()> {
        let (mut reader, writer) = stream.into_split();
        let writer: SharedWriter = Arc::new(Mutex::new(writer));
        let mut device: Option<(DeviceClient, Forwarder)> = None;

        loop {
            let request: Request = match read_message(&mut reader).await? {
                Some(request) => request,
                None => {
                    debug!("client disconnected");
                    break;
                }
            };

            debug!(request = request.name(), "received request");

            let (response, subscribe) = Self::process_request(request, &state);
            if subscribe && device.is_none() {
                debug!("client subscribed to notifications");
                let (client, notifications) = state.bridge.attach();
                let forwarder = Self::spawn_forwarder(notifications, Arc::clone(&writer));
                device = Some((client, forwarder));
            }

            write_message(&mut *writer.lock().await, &response).await?;
        }

        // Detaching abandons parked requests if no other client can answer them.
        drop(device);
        Ok(())
    }

    /// Push bridge notifications to a subscribed client
    fn spawn_forwarder(
        mut notifications: broadcast::Receiver<Notification>,
        writer: SharedWriter,
    ) -> Forwarder {
        Forwarder(tokio::spawn(async move {
            loop {
                match notifications.recv().await {
                    Ok(notification) => {
                        let mut writer = writer.lock().await;
                        if let Err(e) = write_message(&mut *writer, &notification).await {
                            warn!(?e, "failed to push notification");
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(skipped = n, "notification forwarder lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }))
    }

    /// Process a request and return a response
    /// Returns (Response, should_subscribe)
    fn process_request(request: Request, state: &ServerState) -> (Response, bool) {
        match request {
            Request::Ping => (Response::Pong, false),

            Request::GetStatus => {
                let status = DaemonStatus {
                    uptime_secs: state.start_time.elapsed().as_secs(),
                    session: state.coordinator.snapshot(),
                    ..DaemonStatus::default()
                };
                (Response::Status(status), false)
            }

            Request::Subscribe => (Response::Subscribed, true),

            Request::Intent { intent } => (Self::dispatch(state, intent), false),

            Request::Key { key } => match intent_for_key(&key) {
                Some(intent) => (Self::dispatch(state, intent), false),
                None => (
                    Response::error("unknown_key", format!("no binding for key '{key}'")),
                    false,
                ),
            },

            Request::Frame {
                width,
                height,
                jpeg,
            } => match STANDARD.decode(jpeg.as_bytes()) {
                Ok(jpeg) => {
                    state.bridge.push_frame(Frame {
                        width,
                        height,
                        jpeg,
                    });
                    (Response::Accepted, false)
                }
                Err(e) => (Response::error("bad_frame", e.to_string()), false),
            },

            Request::Location { fix } => {
                if !state.bridge.push_location(fix) {
                    debug!("location fix with no active subscription");
                }
                (Response::Accepted, false)
            }

            Request::LocationError { error } => {
                state.bridge.push_location_error(error);
                (Response::Accepted, false)
            }

            Request::Reply { id, reply } => {
                if state.bridge.resolve_reply(id, reply) {
                    (Response::Accepted, false)
                } else {
                    (
                        Response::error("unknown_reply", format!("no pending request {id}")),
                        false,
                    )
                }
            }
        }
    }

    fn dispatch(state: &ServerState, intent: Intent) -> Response {
        debug!(?intent, "intent via IPC");
        match state.coordinator.send(intent) {
            Ok(()) => Response::Accepted,
            Err(e) => Response::error("coordinator_gone", e.to_string()),
        }
    }

    /// Gracefully shutdown the server
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());

        // Remove socket file
        if self.socket_path.exists() {
            if let Err(e) = std::fs::remove_file(&self.socket_path) {
                warn!(?e, "failed to remove socket file");
            }
        }

        info!("IPC server shutdown complete");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::BridgeTimeouts;
    use crate::capture::FrameSource;
    use crate::coordinator::{Coordinator, CoordinatorOptions, Devices, Mode, Services};
    use crate::settings::Settings;
    use crate::testing::{
        FakeAlerts, FakeCamera, FakeDepth, FakeDescriber, FakeLocation, FakePrompter,
        FakeRecognizer, FakeRouting, FakeSpeech,
    };
    use std::time::Duration;

    fn coordinator() -> (Coordinator, CoordinatorHandle) {
        let services = Services {
            describer: FakeDescriber::new(Duration::from_millis(100)),
            routing: FakeRouting::new(),
            depth: Some(FakeDepth::warning_below(1.0, 0.5)),
        };
        let devices = Devices {
            camera: FakeCamera::ready(),
            location: FakeLocation::new(),
            speech: FakeSpeech::new(Duration::from_millis(10)),
            recognizer: FakeRecognizer::new(),
            prompter: FakePrompter::new(),
            alerts: FakeAlerts::new(),
        };
        Coordinator::new(services, devices, Settings::default(), CoordinatorOptions::default())
    }

    async fn call(stream: &mut UnixStream, request: &Request) -> Response {
        write_message(stream, request).await.unwrap();
        read_message(stream).await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn test_request_response_over_socket() {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("daemon.sock");
        let (coordinator, handle) = coordinator();
        tokio::spawn(coordinator.run());
        let bridge = ClientBridge::new(BridgeTimeouts::default());
        let server = Arc::new(Server::new(&socket, handle.clone(), Arc::clone(&bridge)).unwrap());
        let running = Arc::clone(&server);
        tokio::spawn(async move { running.run().await });

        let mut stream = UnixStream::connect(&socket).await.unwrap();
        assert!(matches!(call(&mut stream, &Request::Ping).await, Response::Pong));

        match call(&mut stream, &Request::GetStatus).await {
            Response::Status(status) => assert_eq!(status.session.mode, Mode::Idle),
            other => panic!("unexpected response {other:?}"),
        }

        let unknown = call(&mut stream, &Request::Key { key: "F1".into() }).await;
        assert!(matches!(unknown, Response::Error { code, .. } if code == "unknown_key"));

        let frame = Request::Frame {
            width: 320,
            height: 240,
            jpeg: STANDARD.encode([0xFF, 0xD8, 0xFF, 0xD9]),
        };
        assert!(matches!(call(&mut stream, &frame).await, Response::Accepted));
        assert_eq!(bridge.snapshot().unwrap().width, 320);

        let accepted = call(&mut stream, &Request::Key { key: " ".into() }).await;
        assert!(matches!(accepted, Response::Accepted));
        let mut snapshots = handle.watch_snapshot();
        tokio::time::timeout(
            Duration::from_secs(5),
            snapshots.wait_for(|s| s.mode == Mode::AutoNarrating),
        )
        .await
        .unwrap()
        .unwrap();

        server.shutdown().await;
        assert!(!socket.exists());
    }

    #[tokio::test]
    async fn test_subscribed_client_answers_device_requests() {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("daemon.sock");
        let (_coordinator, handle) = coordinator();
        let bridge = ClientBridge::new(BridgeTimeouts::default());
        let server = Arc::new(Server::new(&socket, handle, Arc::clone(&bridge)).unwrap());
        let running = Arc::clone(&server);
        tokio::spawn(async move { running.run().await });

        let mut stream = UnixStream::connect(&socket).await.unwrap();
        assert!(matches!(
            call(&mut stream, &Request::Subscribe).await,
            Response::Subscribed
        ));

        let asking = Arc::clone(&bridge);
        let answer = tokio::spawn(async move {
            use crate::coordinator::Prompter;
            asking.confirm("Stop navigation?").await
        });

        let notification: Notification = read_message(&mut stream).await.unwrap().unwrap();
        let Notification::Confirm { id, question } = notification else {
            panic!("unexpected notification {notification:?}");
        };
        assert_eq!(question, "Stop navigation?");

        let reply = Request::Reply {
            id,
            reply: crate::ipc::ClientReply::Confirmed { answer: true },
        };
        write_message(&mut stream, &reply).await.unwrap();
        assert!(answer.await.unwrap());
        let response: Response = read_message(&mut stream).await.unwrap().unwrap();
        assert!(matches!(response, Response::Accepted));
    }
}
