//! Navigation session state machine
//!
//! `NotStarted → Requesting → Active → Completed`, `Active → Ending →
//! NotStarted` on user cancel and `Requesting → NotStarted` when the route
//! request fails. The coordinator owns the single instance and performs the
//! network calls; this type only decides what each event means.

mod location;

pub use location::{now_ms, Coordinates, LocationError, LocationFix, LocationProvider, LocationWatch};

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::backend::{LocationUpdate, RouteStart, ServiceError};

/// Opaque handle issued by the routing backend
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Lifecycle of the navigation session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NavState {
    #[default]
    NotStarted,
    Requesting,
    Active,
    Ending,
    Completed,
}

impl std::fmt::Display for NavState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NavState::NotStarted => write!(f, "NotStarted"),
            NavState::Requesting => write!(f, "Requesting"),
            NavState::Active => write!(f, "Active"),
            NavState::Ending => write!(f, "Ending"),
            NavState::Completed => write!(f, "Completed"),
        }
    }
}

/// Client-side view of the active route
#[derive(Debug, Clone, PartialEq)]
pub struct ActiveRoute {
    pub session_id: SessionId,
    pub destination: String,
    pub current_instruction: Option<String>,
    pub instruction_index: usize,
    pub total_steps: usize,
}

/// What to do with an incoming fix
#[derive(Debug, Clone, PartialEq)]
pub enum FixDecision {
    /// Send this fix to the backend now
    Send(SessionId, Coordinates),
    /// An update is in flight; the fix replaces any earlier pending one
    Queued,
    /// Ignored
    Dropped(&'static str),
}

/// Effect of a backend location update on the session
#[derive(Debug, Clone, PartialEq, Default)]
pub struct UpdateEffect {
    /// New instruction text to narrate, if it changed
    pub instruction: Option<String>,
    /// The route reported completion
    pub completed: bool,
}

/// Errors from navigation transitions
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NavigationError {
    #[error("navigation is already {0}")]
    AlreadyRunning(NavState),

    #[error(transparent)]
    Location(#[from] LocationError),

    #[error(transparent)]
    Service(#[from] ServiceError),
}

/// The navigation session owned by the coordinator
#[derive(Debug, Default)]
pub struct NavigationSession {
    state: NavState,
    route: Option<ActiveRoute>,
    generation: u64,
    watch_cancel: Option<CancellationToken>,
    last_fix: Option<LocationFix>,
    pending_fix: Option<LocationFix>,
    update_in_flight: bool,
}

impl NavigationSession {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> NavState {
        self.state
    }

    pub fn is_active(&self) -> bool {
        self.state == NavState::Active
    }

    pub fn is_requesting(&self) -> bool {
        self.state == NavState::Requesting
    }

    pub fn route(&self) -> Option<&ActiveRoute> {
        self.route.as_ref()
    }

    pub fn session_id(&self) -> Option<&SessionId> {
        self.route.as_ref().map(|r| &r.session_id)
    }

    /// Coordinates of the last fix applied to the session
    pub fn last_coords(&self) -> Option<Coordinates> {
        self.last_fix.map(|f| f.coords)
    }

    /// Generation of the current session; completions from older ones are stale
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn accepts(&self, generation: u64) -> bool {
        generation == self.generation
    }

    fn transition_to(&mut self, new_state: NavState) {
        if new_state != self.state {
            info!(from = %self.state, to = %new_state, "navigation transition");
            self.state = new_state;
        }
    }

    /// Enter `Requesting`. Returns the generation tagging the request.
    pub fn begin_request(&mut self) -> Result<u64, NavigationError> {
        match self.state {
            NavState::NotStarted | NavState::Completed => {}
            other => return Err(NavigationError::AlreadyRunning(other)),
        }
        self.generation += 1;
        self.route = None;
        self.last_fix = None;
        self.pending_fix = None;
        self.update_in_flight = false;
        self.transition_to(NavState::Requesting);
        Ok(self.generation)
    }

    /// Route request succeeded. Returns false if the request was abandoned.
    pub fn activate(&mut self, generation: u64, start: RouteStart, destination: &str) -> bool {
        if !self.accepts(generation) || self.state != NavState::Requesting {
            debug!(generation, "route result for abandoned request");
            return false;
        }
        self.route = Some(ActiveRoute {
            session_id: start.session_id,
            destination: destination.to_string(),
            current_instruction: start.first_instruction,
            instruction_index: 0,
            total_steps: start.total_steps,
        });
        self.transition_to(NavState::Active);
        true
    }

    /// Route request failed
    pub fn request_failed(&mut self, generation: u64) -> bool {
        if !self.accepts(generation) || self.state != NavState::Requesting {
            return false;
        }
        self.transition_to(NavState::NotStarted);
        true
    }

    /// Remember the token cancelling the location subscription
    pub fn attach_watch(&mut self, token: CancellationToken) {
        if let Some(previous) = self.watch_cancel.replace(token) {
            previous.cancel();
        }
    }

    pub fn is_watching(&self) -> bool {
        self.watch_cancel.is_some()
    }

    fn stop_watch(&mut self) {
        if let Some(token) = self.watch_cancel.take() {
            token.cancel();
            info!("location tracking stopped");
        }
    }

    /// Decide whether a pushed fix should be sent to the backend
    pub fn offer_fix(&mut self, fix: LocationFix, now_ms: u64, max_age_ms: u64) -> FixDecision {
        if self.state != NavState::Active {
            return FixDecision::Dropped("navigation not active");
        }
        let Some(session_id) = self.session_id().cloned() else {
            return FixDecision::Dropped("navigation not active");
        };
        if fix.age_ms(now_ms) > max_age_ms {
            return FixDecision::Dropped("stale fix");
        }
        let newest = self
            .pending_fix
            .or(self.last_fix)
            .map(|f| f.timestamp_ms);
        if newest.is_some_and(|ts| fix.timestamp_ms <= ts) {
            return FixDecision::Dropped("fix not newer than last applied");
        }
        if self.update_in_flight {
            self.pending_fix = Some(fix);
            return FixDecision::Queued;
        }
        self.update_in_flight = true;
        self.last_fix = Some(fix);
        FixDecision::Send(session_id, fix.coords)
    }

    /// The in-flight update returned. Yields the coalesced pending fix, if any.
    pub fn finish_update(&mut self) -> Option<(SessionId, Coordinates)> {
        self.update_in_flight = false;
        let fix = self.pending_fix.take()?;
        let session_id = self.session_id()?.clone();
        if self.state != NavState::Active {
            return None;
        }
        self.update_in_flight = true;
        self.last_fix = Some(fix);
        Some((session_id, fix.coords))
    }

    /// Adopt an instruction if it differs from the cached one.
    ///
    /// Returns the text when it changed, so the caller can narrate it.
    pub fn adopt_instruction(
        &mut self,
        instruction: Option<&str>,
        index: usize,
        total: usize,
    ) -> Option<String> {
        let route = self.route.as_mut()?;
        route.instruction_index = index;
        if total > 0 {
            route.total_steps = total;
        }
        let text = instruction.filter(|t| !t.trim().is_empty())?;
        if route.current_instruction.as_deref() == Some(text) {
            return None;
        }
        route.current_instruction = Some(text.to_string());
        info!(index, total, instruction = text, "instruction updated");
        Some(text.to_string())
    }

    /// Apply a backend location update
    pub fn apply_update(&mut self, update: &LocationUpdate) -> UpdateEffect {
        if self.state != NavState::Active {
            return UpdateEffect::default();
        }
        let instruction = self.adopt_instruction(
            update.current_instruction.as_deref(),
            update.instruction_index,
            update.total_steps,
        );
        UpdateEffect {
            instruction,
            completed: update.completed,
        }
    }

    /// The route finished. Returns the session to release on the backend.
    pub fn complete(&mut self) -> Option<SessionId> {
        self.stop_watch();
        self.generation += 1;
        self.pending_fix = None;
        self.update_in_flight = false;
        self.transition_to(NavState::Completed);
        self.route.take().map(|r| r.session_id)
    }

    /// User cancel. Legal from `Active` and `Requesting`; returns the session
    /// to release on the backend.
    pub fn end(&mut self) -> Option<SessionId> {
        if !matches!(self.state, NavState::Active | NavState::Requesting) {
            return None;
        }
        self.transition_to(NavState::Ending);
        self.stop_watch();
        self.generation += 1;
        self.pending_fix = None;
        self.update_in_flight = false;
        self.last_fix = None;
        let session = self.route.take().map(|r| r.session_id);
        self.transition_to(NavState::NotStarted);
        session
    }
}
