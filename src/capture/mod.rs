//! Capture pipeline
//!
//! Snapshots the current camera frame into an image payload that can be
//! submitted to the description or depth services, and tracks which mode
//! currently owns the capture device.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::{debug, info, warn};

/// A single encoded frame as produced by the camera
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Native width in pixels
    pub width: u32,
    /// Native height in pixels
    pub height: u32,
    /// JPEG-encoded image data
    pub jpeg: Vec<u8>,
}

/// Image payload ready for network submission
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImagePayload {
    pub width: u32,
    pub height: u32,
    pub jpeg: Vec<u8>,
}

impl From<Frame> for ImagePayload {
    fn from(frame: Frame) -> Self {
        Self {
            width: frame.width,
            height: frame.height,
            jpeg: frame.jpeg,
        }
    }
}

/// Live video source. Implemented by the client bridge in production.
pub trait FrameSource: Send + Sync {
    /// Return the most recent frame, or `NotReady` if none has been produced
    fn snapshot(&self) -> Result<Frame, CaptureError>;

    /// Pause frame delivery without releasing the camera
    fn suspend(&self);

    /// Resume frame delivery after `suspend`
    fn resume(&self);

    /// Re-arm the stream after a blocking prompt froze it
    fn rearm(&self);
}

/// Which activity currently holds the capture device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceOwner {
    Narration,
    Calibration,
}

impl std::fmt::Display for DeviceOwner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviceOwner::Narration => write!(f, "narration"),
            DeviceOwner::Calibration => write!(f, "calibration"),
        }
    }
}

/// Errors from the capture pipeline
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CaptureError {
    #[error("capture source has not produced a frame yet")]
    NotReady,

    #[error("capture device is suspended")]
    Suspended,

    #[error("capture device is owned by {0}")]
    Busy(DeviceOwner),

    #[error("capture device is not owned by {0}")]
    NotOwner(DeviceOwner),
}

/// Retry policy applied when the source is not ready yet
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            delay: Duration::from_millis(200),
        }
    }
}

/// Ownership and suspension state of the device, saved while calibrating
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DeviceState {
    pub owner: Option<DeviceOwner>,
    pub suspended: bool,
}

/// Exclusive-ownership wrapper around a [`FrameSource`]
pub struct CaptureDevice {
    source: Arc<dyn FrameSource>,
    state: Mutex<DeviceState>,
    retry: RetryPolicy,
}

impl CaptureDevice {
    pub fn new(source: Arc<dyn FrameSource>, retry: RetryPolicy) -> Self {
        Self {
            source,
            state: Mutex::new(DeviceState::default()),
            retry,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, DeviceState> {
        // State is plain data; a poisoned lock still holds a usable value.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Current ownership state
    pub fn state(&self) -> DeviceState {
        *self.lock()
    }

    /// Take ownership of the device for `owner`
    pub fn acquire(&self, owner: DeviceOwner) -> Result<(), CaptureError> {
        let mut state = self.lock();
        match state.owner {
            Some(current) if current != owner => return Err(CaptureError::Busy(current)),
            Some(_) => return Ok(()),
            None => {}
        }
        state.owner = Some(owner);
        if state.suspended {
            state.suspended = false;
            self.source.resume();
        }
        info!(%owner, "capture device acquired");
        Ok(())
    }

    /// Release ownership held by `owner`. Releasing an unowned device is a no-op.
    pub fn release(&self, owner: DeviceOwner) {
        let mut state = self.lock();
        if state.owner == Some(owner) {
            state.owner = None;
            info!(%owner, "capture device released");
        }
    }

    /// Suspend whoever holds the device and hand it to calibration.
    ///
    /// Returns the prior state so it can be restored exactly.
    pub fn suspend_for_calibration(&self) -> DeviceState {
        let mut state = self.lock();
        let saved = *state;
        if saved.owner.is_some() && !saved.suspended {
            self.source.suspend();
        }
        // Calibration needs live frames regardless of what was running.
        self.source.resume();
        state.owner = Some(DeviceOwner::Calibration);
        state.suspended = false;
        debug!(?saved, "capture device handed to calibration");
        saved
    }

    /// Give the device back after calibration
    pub fn restore(&self, saved: DeviceState) {
        let mut state = self.lock();
        *state = saved;
        if saved.suspended {
            self.source.suspend();
        } else {
            self.source.resume();
        }
        debug!(?saved, "capture device restored");
    }

    /// Re-arm the stream after a blocking prompt
    pub fn rearm(&self) {
        self.source.rearm();
    }

    /// Snapshot a frame on behalf of `owner`
    pub fn snapshot(&self, owner: DeviceOwner) -> Result<ImagePayload, CaptureError> {
        let state = self.state();
        if state.owner != Some(owner) {
            return Err(CaptureError::NotOwner(owner));
        }
        if state.suspended {
            return Err(CaptureError::Suspended);
        }
        self.source.snapshot().map(ImagePayload::from)
    }

    /// Snapshot without ownership, for passive observers such as the
    /// obstacle monitor. Reads the live stream unless calibration holds the
    /// device or it is suspended.
    pub fn observe(&self) -> Result<ImagePayload, CaptureError> {
        let state = self.state();
        if state.suspended {
            return Err(CaptureError::Suspended);
        }
        match state.owner {
            Some(DeviceOwner::Calibration) => Err(CaptureError::Busy(DeviceOwner::Calibration)),
            Some(DeviceOwner::Narration) | None => self.source.snapshot().map(ImagePayload::from),
        }
    }

    /// Snapshot with the bounded not-ready retry
    pub async fn capture(&self, owner: DeviceOwner) -> Result<ImagePayload, CaptureError> {
        let attempts = self.retry.attempts.max(1);
        let mut attempt = 1;
        loop {
            match self.snapshot(owner) {
                Ok(payload) => {
                    debug!(
                        width = payload.width,
                        height = payload.height,
                        bytes = payload.jpeg.len(),
                        "frame captured"
                    );
                    return Ok(payload);
                }
                Err(CaptureError::NotReady) if attempt < attempts => {
                    debug!(attempt, "capture source not ready, retrying");
                    attempt += 1;
                    tokio::time::sleep(self.retry.delay).await;
                }
                Err(e) => {
                    warn!(?e, attempt, "capture failed");
                    return Err(e);
                }
            }
        }
    }
}
