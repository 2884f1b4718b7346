//! IPC message protocol definitions
//!
//! All messages are JSON-encoded, prefixed with a 4-byte little-endian length.
//! The daemon writes both [`Response`]s and, once a client has subscribed,
//! [`Notification`]s on the same stream; their `type` tags never overlap.

use anyhow::{bail, Context, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::coordinator::{Intent, SessionSnapshot};
use crate::events::SessionEvent;
use crate::navigation::{LocationError, LocationFix};
use crate::speech::VoiceSettings;

/// Largest accepted message body. Camera frames dominate.
pub const MAX_MESSAGE_LEN: usize = 8 * 1024 * 1024;

/// Requests from the front-end to the daemon
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Request {
    /// Ping to check connectivity
    Ping,

    /// Request current daemon status
    GetStatus,

    /// Become the device client: receive notifications and device requests
    Subscribe,

    /// A user intent from a button or menu
    Intent { intent: Intent },

    /// A raw key press (`" "`, `"Escape"`)
    Key { key: String },

    /// Latest camera frame, JPEG encoded as base64
    Frame { width: u32, height: u32, jpeg: String },

    /// A fix from the active location subscription
    Location { fix: LocationFix },

    /// The location subscription failed
    LocationError { error: LocationError },

    /// Answer to a device request carrying `id`
    Reply { id: u64, reply: ClientReply },
}

impl Request {
    /// Short name for logging; frames are too large to log whole
    pub fn name(&self) -> &'static str {
        match self {
            Request::Ping => "ping",
            Request::GetStatus => "get_status",
            Request::Subscribe => "subscribe",
            Request::Intent { .. } => "intent",
            Request::Key { .. } => "key",
            Request::Frame { .. } => "frame",
            Request::Location { .. } => "location",
            Request::LocationError { .. } => "location_error",
            Request::Reply { .. } => "reply",
        }
    }
}

/// Responses from daemon to front-end
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Response {
    /// Pong response to ping
    Pong,

    /// Current daemon status
    Status(DaemonStatus),

    /// Subscription confirmed
    Subscribed,

    /// Request accepted
    Accepted,

    /// Error response
    Error { code: String, message: String },
}

impl Response {
    pub fn error(code: &str, message: impl Into<String>) -> Self {
        Response::Error {
            code: code.to_string(),
            message: message.into(),
        }
    }
}

/// Push messages from daemon to the subscribed front-end
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Notification {
    /// Play `text`; answer with `spoken` or `speech_failed`
    Speak {
        id: u64,
        text: String,
        voice: VoiceSettings,
    },
    /// Stop current playback
    StopSpeech,
    /// Yes/no dialog; answer with `confirmed`
    Confirm { id: u64, question: String },
    /// Text entry dialog; answer with `text`
    AskText { id: u64, question: String },
    /// Recognise one utterance; answer with `heard` or `listen_failed`
    Listen { id: u64, lang: String },
    /// One high-accuracy fix; answer with `location` or `location_failed`
    LocateOnce { id: u64 },
    /// Start streaming `location` requests
    WatchLocation,
    UnwatchLocation,
    /// Obstacle alert (vibration or earcon)
    Alert { message: String },
    CameraSuspend,
    CameraResume,
    /// Re-arm the video stream after a dialog
    CameraRearm,
    /// Coordinator event
    Event { event: SessionEvent },
}

/// Front-end answer to a device request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ClientReply {
    Spoken,
    SpeechFailed { message: String },
    Confirmed { answer: bool },
    /// `None` when the dialog was dismissed
    Text { text: Option<String> },
    Heard { text: String },
    ListenFailed { message: String },
    Location { fix: LocationFix },
    LocationFailed { error: LocationError },
}

/// Full daemon status snapshot
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonStatus {
    /// Daemon version
    pub version: String,

    /// Uptime in seconds
    pub uptime_secs: u64,

    /// Coordinator state
    pub session: SessionSnapshot,
}

impl Default for DaemonStatus {
    fn default() -> Self {
        Self {
            version: env!("CARGO_PKG_VERSION").to_string(),
            uptime_secs: 0,
            session: SessionSnapshot::default(),
        }
    }
}

/// Read one length-prefixed message. `None` on a clean disconnect.
pub async fn read_message<R, T>(reader: &mut R) -> Result<Option<T>>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let len = u32::from_le_bytes(len_buf) as usize;
    if len > MAX_MESSAGE_LEN {
        bail!("message too large: {len} bytes");
    }

    let mut msg_buf = vec![0u8; len];
    reader
        .read_exact(&mut msg_buf)
        .await
        .context("truncated message body")?;

    let message = serde_json::from_slice(&msg_buf).context("failed to parse message")?;
    Ok(Some(message))
}

/// Send a length-prefixed JSON message
pub async fn write_message<W, T>(writer: &mut W, msg: &T) -> Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let msg_bytes = serde_json::to_vec(msg)?;
    if msg_bytes.len() > MAX_MESSAGE_LEN {
        bail!("message too large: {} bytes", msg_bytes.len());
    }
    let msg_len = (msg_bytes.len() as u32).to_le_bytes();

    writer.write_all(&msg_len).await?;
    writer.write_all(&msg_bytes).await?;
    writer.flush().await?;

    Ok(())
}
