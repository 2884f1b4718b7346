//! Client bridge
//!
//! The front-end owns the camera, the GPS, the speaker, the microphone and
//! the dialogs. The bridge implements each device contract by pushing a
//! [`Notification`] to the subscribed client and, where an answer is needed,
//! parking a oneshot keyed by request id until the client's reply arrives.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::capture::{CaptureError, Frame, FrameSource};
use crate::coordinator::{Prompter, RecognitionError, SpeechRecognizer};
use crate::events::SessionEvent;
use crate::ipc::{ClientReply, Notification};
use crate::navigation::{LocationError, LocationFix, LocationProvider, LocationWatch};
use crate::obstacle::AlertSink;
use crate::speech::{SpeechEngine, SpeechError, VoiceSettings};

/// Errors from a device round trip
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BridgeError {
    #[error("no front-end client is connected")]
    NoClient,

    #[error("client did not answer in time")]
    Timeout,

    #[error("client went away before answering")]
    Disconnected,

    #[error("unexpected reply from client")]
    UnexpectedReply,
}

/// How long the bridge waits on the client
#[derive(Debug, Clone, Copy)]
pub struct BridgeTimeouts {
    /// Machine answers: one-shot location fix
    pub reply: Duration,
    /// Answers that wait on the user or on playback: dialogs, listening, speech
    pub interactive: Duration,
    /// Frames older than this are treated as missing
    pub frame_max_age: Duration,
}

impl Default for BridgeTimeouts {
    fn default() -> Self {
        Self {
            reply: Duration::from_secs(15),
            interactive: Duration::from_secs(120),
            frame_max_age: Duration::from_secs(2),
        }
    }
}

type WatchSender = mpsc::Sender<Result<LocationFix, LocationError>>;

/// Device collaborators backed by the connected front-end
pub struct ClientBridge {
    notify: broadcast::Sender<Notification>,
    pending: Mutex<HashMap<u64, oneshot::Sender<ClientReply>>>,
    next_id: AtomicU64,
    frame: Mutex<Option<(Instant, Frame)>>,
    suspended: AtomicBool,
    watcher: Mutex<Option<WatchSender>>,
    clients: AtomicUsize,
    timeouts: BridgeTimeouts,
}

/// An attached device client connection.
///
/// Parked requests can be answered by any attached client, so they are only
/// abandoned when the last one detaches.
pub struct DeviceClient {
    bridge: Arc<ClientBridge>,
}

impl Drop for DeviceClient {
    fn drop(&mut self) {
        let remaining = self.bridge.clients.fetch_sub(1, Ordering::AcqRel) - 1;
        info!(remaining, "device client detached");
        if remaining == 0 {
            self.bridge.fail_pending();
        }
    }
}

/// Removes a parked reply slot however the wait ends
struct PendingReply<'a> {
    bridge: &'a ClientBridge,
    id: u64,
}

impl Drop for PendingReply<'_> {
    fn drop(&mut self) {
        lock(&self.bridge.pending).remove(&self.id);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

impl ClientBridge {
    pub fn new(timeouts: BridgeTimeouts) -> Arc<Self> {
        let (notify, _) = broadcast::channel(64);
        Arc::new(Self {
            notify,
            pending: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            frame: Mutex::new(None),
            suspended: AtomicBool::new(false),
            watcher: Mutex::new(None),
            clients: AtomicUsize::new(0),
            timeouts,
        })
    }

    /// Notification stream without attaching as a device client
    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.notify.subscribe()
    }

    /// Attach a connection as a device client. Keep the returned guard for
    /// as long as the connection lives.
    pub fn attach(self: &Arc<Self>) -> (DeviceClient, broadcast::Receiver<Notification>) {
        let clients = self.clients.fetch_add(1, Ordering::AcqRel) + 1;
        info!(clients, "device client attached");
        let client = DeviceClient {
            bridge: Arc::clone(self),
        };
        (client, self.subscribe())
    }

    pub fn has_client(&self) -> bool {
        self.notify.receiver_count() > 0
    }

    fn notify(&self, notification: Notification) {
        if self.notify.send(notification).is_err() {
            debug!("notification dropped: no client");
        }
    }

    /// Send a request and wait for the reply carrying its id
    async fn request(
        &self,
        build: impl FnOnce(u64) -> Notification,
        timeout: Duration,
    ) -> Result<ClientReply, BridgeError> {
        if !self.has_client() {
            return Err(BridgeError::NoClient);
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        lock(&self.pending).insert(id, tx);
        let _slot = PendingReply { bridge: self, id };

        self.notify(build(id));

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(BridgeError::Disconnected),
            Err(_) => {
                warn!(id, timeout_ms = timeout.as_millis() as u64, "client reply timed out");
                Err(BridgeError::Timeout)
            }
        }
    }

    /// Deliver a client reply. False if nothing is waiting on `id`.
    pub fn resolve_reply(&self, id: u64, reply: ClientReply) -> bool {
        match lock(&self.pending).remove(&id) {
            Some(tx) => tx.send(reply).is_ok(),
            None => {
                debug!(id, "reply for unknown or expired request");
                false
            }
        }
    }

    /// Drop every parked request once no client is left to answer
    fn fail_pending(&self) {
        let drained: Vec<_> = lock(&self.pending).drain().collect();
        if !drained.is_empty() {
            info!(count = drained.len(), "abandoning pending client requests");
        }
    }

    /// Store the latest camera frame
    pub fn push_frame(&self, frame: Frame) {
        *lock(&self.frame) = Some((Instant::now(), frame));
    }

    /// Forward a fix to the active subscription. False if nobody is watching.
    pub fn push_location(&self, fix: LocationFix) -> bool {
        self.push_watch(Ok(fix))
    }

    pub fn push_location_error(&self, error: LocationError) -> bool {
        self.push_watch(Err(error))
    }

    fn push_watch(&self, item: Result<LocationFix, LocationError>) -> bool {
        let mut watcher = lock(&self.watcher);
        let Some(tx) = watcher.as_ref() else {
            return false;
        };
        match tx.try_send(item) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                debug!("location subscriber lagging, fix dropped");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                *watcher = None;
                drop(watcher);
                info!("location subscription ended");
                self.notify(Notification::UnwatchLocation);
                false
            }
        }
    }

    /// Relay coordinator events to the client until the coordinator stops
    pub async fn forward_events(&self, mut events: broadcast::Receiver<SessionEvent>) {
        loop {
            match events.recv().await {
                Ok(event) => self.notify(Notification::Event { event }),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(skipped = n, "event forwarder lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }
}

impl FrameSource for ClientBridge {
    fn snapshot(&self) -> Result<Frame, CaptureError> {
        if self.suspended.load(Ordering::Acquire) {
            return Err(CaptureError::Suspended);
        }
        match lock(&self.frame).as_ref() {
            Some((at, frame)) if at.elapsed() <= self.timeouts.frame_max_age => Ok(frame.clone()),
            Some(_) => {
                debug!("latest frame is stale");
                Err(CaptureError::NotReady)
            }
            None => Err(CaptureError::NotReady),
        }
    }

    fn suspend(&self) {
        self.suspended.store(true, Ordering::Release);
        self.notify(Notification::CameraSuspend);
    }

    fn resume(&self) {
        self.suspended.store(false, Ordering::Release);
        self.notify(Notification::CameraResume);
    }

    fn rearm(&self) {
        self.notify(Notification::CameraRearm);
    }
}

#[async_trait]
impl SpeechEngine for ClientBridge {
    async fn play(&self, text: &str, voice: &VoiceSettings) -> Result<(), SpeechError> {
        let reply = self
            .request(
                |id| Notification::Speak {
                    id,
                    text: text.to_string(),
                    voice: voice.clone(),
                },
                self.timeouts.interactive,
            )
            .await;
        match reply {
            Ok(ClientReply::Spoken) => Ok(()),
            Ok(ClientReply::SpeechFailed { message }) => Err(SpeechError::Playback(message)),
            Ok(_) => Err(SpeechError::Playback(BridgeError::UnexpectedReply.to_string())),
            Err(BridgeError::NoClient) => Err(SpeechError::Unavailable),
            Err(e) => Err(SpeechError::Playback(e.to_string())),
        }
    }

    fn stop(&self) {
        self.notify(Notification::StopSpeech);
    }
}

#[async_trait]
impl Prompter for ClientBridge {
    async fn confirm(&self, question: &str) -> bool {
        let reply = self
            .request(
                |id| Notification::Confirm {
                    id,
                    question: question.to_string(),
                },
                self.timeouts.interactive,
            )
            .await;
        match reply {
            Ok(ClientReply::Confirmed { answer }) => answer,
            Ok(other) => {
                warn!(?other, "unexpected reply to confirmation");
                false
            }
            Err(e) => {
                warn!(?e, "confirmation not answered");
                false
            }
        }
    }

    async fn ask_text(&self, question: &str) -> Option<String> {
        let reply = self
            .request(
                |id| Notification::AskText {
                    id,
                    question: question.to_string(),
                },
                self.timeouts.interactive,
            )
            .await;
        match reply {
            Ok(ClientReply::Text { text }) => text,
            Ok(other) => {
                warn!(?other, "unexpected reply to text prompt");
                None
            }
            Err(e) => {
                warn!(?e, "text prompt not answered");
                None
            }
        }
    }
}

#[async_trait]
impl SpeechRecognizer for ClientBridge {
    async fn listen(&self, lang: &str) -> Result<String, RecognitionError> {
        let reply = self
            .request(
                |id| Notification::Listen {
                    id,
                    lang: lang.to_string(),
                },
                self.timeouts.interactive,
            )
            .await;
        match reply {
            Ok(ClientReply::Heard { text }) if text.trim().is_empty() => {
                Err(RecognitionError::NoSpeech)
            }
            Ok(ClientReply::Heard { text }) => Ok(text),
            Ok(ClientReply::ListenFailed { message }) => Err(RecognitionError::Failed(message)),
            Ok(_) => Err(RecognitionError::Failed(
                BridgeError::UnexpectedReply.to_string(),
            )),
            Err(BridgeError::NoClient) => Err(RecognitionError::Unavailable),
            Err(BridgeError::Timeout) => Err(RecognitionError::NoSpeech),
            Err(e) => Err(RecognitionError::Failed(e.to_string())),
        }
    }
}

#[async_trait]
impl LocationProvider for ClientBridge {
    async fn current_fix(&self) -> Result<LocationFix, LocationError> {
        let reply = self
            .request(|id| Notification::LocateOnce { id }, self.timeouts.reply)
            .await;
        match reply {
            Ok(ClientReply::Location { fix }) => Ok(fix),
            Ok(ClientReply::LocationFailed { error }) => Err(error),
            Ok(other) => {
                warn!(?other, "unexpected reply to location request");
                Err(LocationError::Unavailable)
            }
            Err(BridgeError::Timeout) => Err(LocationError::Timeout),
            Err(_) => Err(LocationError::Unavailable),
        }
    }

    fn watch(&self) -> Result<LocationWatch, LocationError> {
        if !self.has_client() {
            return Err(LocationError::Unavailable);
        }
        let (tx, rx) = mpsc::channel(16);
        *lock(&self.watcher) = Some(tx);
        self.notify(Notification::WatchLocation);
        Ok(rx)
    }
}

#[async_trait]
impl AlertSink for ClientBridge {
    async fn alert(&self, message: &str) {
        self.notify(Notification::Alert {
            message: message.to_string(),
        });
    }
}
