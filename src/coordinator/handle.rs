//! Client-side handle to the running coordinator

use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc, watch};

use super::machine::Message;
use super::{ControlState, Intent, Mode};
use crate::events::SessionEvent;
use crate::navigation::NavState;
use crate::settings::Settings;

/// Observable session state, republished after every message the
/// coordinator handles
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub mode: Mode,
    pub nav_state: NavState,
    pub destination: Option<String>,
    pub instruction: Option<String>,
    pub instruction_index: usize,
    pub total_steps: usize,
    /// Auto-capture loop running
    pub narrating: bool,
    /// An analysis chain is outstanding
    pub busy: bool,
    pub calibration_factor: f64,
    pub status: String,
    pub controls: ControlState,
    pub settings: Settings,
}

impl Default for SessionSnapshot {
    fn default() -> Self {
        Self {
            mode: Mode::Idle,
            nav_state: NavState::NotStarted,
            destination: None,
            instruction: None,
            instruction_index: 0,
            total_steps: 0,
            narrating: false,
            busy: false,
            calibration_factor: crate::calibration::DEFAULT_FACTOR,
            status: String::new(),
            controls: ControlState::default(),
            settings: Settings::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("coordinator is not running")]
pub struct CoordinatorGone;

/// Cheap, cloneable handle used by the IPC server and tests
#[derive(Debug, Clone)]
pub struct CoordinatorHandle {
    pub(super) tx: mpsc::UnboundedSender<Message>,
    pub(super) snapshot: watch::Receiver<SessionSnapshot>,
    pub(super) events: broadcast::Sender<SessionEvent>,
}

impl CoordinatorHandle {
    /// Queue a user intent
    pub fn send(&self, intent: Intent) -> Result<(), CoordinatorGone> {
        self.tx
            .send(Message::User(intent))
            .map_err(|_| CoordinatorGone)
    }

    /// Ask the coordinator to tear everything down and exit
    pub fn shutdown(&self) {
        let _ = self.tx.send(Message::Shutdown);
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.snapshot.borrow().clone()
    }

    pub fn watch_snapshot(&self) -> watch::Receiver<SessionSnapshot> {
        self.snapshot.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }
}
