//! Core coordinator actor
//!
//! Decides which mode is active, starts and stops the auto-capture loop and
//! the navigation session, and reconciles every asynchronous completion
//! against the generation that issued it so stale results are dropped.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{broadcast, mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::handle::{CoordinatorHandle, SessionSnapshot};
use super::{ControlState, Intent, Mode, Prompter, SpeechRecognizer};
use crate::analysis::{self, AnalysisError, AnalysisGate, AnalysisPermit};
use crate::autocapture::{AutoCaptureLoop, ChainingPolicy, LoopTick};
use crate::backend::{
    DepthService, Description, DescriptionService, LocationUpdate, ModelInfo, NavigationContext,
    NavigationUpdate, RouteStart, RoutingService, ServiceError,
};
use crate::calibration::{
    parse_height, CalibrationDraft, CalibrationSession, CalibrationStore,
};
use crate::capture::{CaptureDevice, CaptureError, DeviceOwner, DeviceState, FrameSource, RetryPolicy};
use crate::events::SessionEvent;
use crate::navigation::{
    now_ms, Coordinates, FixDecision, LocationError, LocationFix, LocationProvider,
    NavigationError, NavigationSession, SessionId,
};
use crate::obstacle::{AlertSink, ObstacleMonitor};
use crate::settings::{parse_spoken_speed, Settings};
use crate::speech::{SpeechChannel, SpeechEngine, VoiceSettings};

const MAX_HEIGHT_ATTEMPTS: usize = 3;

/// Remote services used by the coordinator
#[derive(Clone)]
pub struct Services {
    pub describer: Arc<dyn DescriptionService>,
    pub routing: Arc<dyn RoutingService>,
    /// Depth server; calibration and obstacle warnings are off without it
    pub depth: Option<Arc<dyn DepthService>>,
}

/// Device-side collaborators
#[derive(Clone)]
pub struct Devices {
    pub camera: Arc<dyn FrameSource>,
    pub location: Arc<dyn LocationProvider>,
    pub speech: Arc<dyn SpeechEngine>,
    pub recognizer: Arc<dyn SpeechRecognizer>,
    pub prompter: Arc<dyn Prompter>,
    pub alerts: Arc<dyn AlertSink>,
}

/// Timing and persistence knobs
#[derive(Debug, Clone)]
pub struct CoordinatorOptions {
    pub capture_retry: RetryPolicy,
    /// Fixes older than this are dropped
    pub location_max_age: Duration,
    /// Deadline for the one-shot fix taken before a route request
    pub location_timeout: Duration,
    /// Delay before narration starts when offered alongside navigation
    pub narration_start_delay: Duration,
    /// Pause between the speech-rate question and listening
    pub listen_pause: Duration,
    /// Obstacle check period; `None` disables the monitor
    pub obstacle_period: Option<Duration>,
    pub speech_lang: String,
    /// Where settings are persisted; `None` keeps them in memory
    pub settings_path: Option<PathBuf>,
}

impl Default for CoordinatorOptions {
    fn default() -> Self {
        Self {
            capture_retry: RetryPolicy::default(),
            location_max_age: Duration::from_secs(5),
            location_timeout: Duration::from_secs(15),
            narration_start_delay: Duration::from_secs(3),
            listen_pause: Duration::from_millis(500),
            obstacle_period: Some(Duration::from_secs(1)),
            speech_lang: "en-US".to_string(),
            settings_path: None,
        }
    }
}

/// Everything that can land in the coordinator inbox
#[derive(Debug)]
pub(super) enum Message {
    User(Intent),
    Shutdown,
    Tick(LoopTick),
    /// Capture + describe finished. `None` when the chain was aborted.
    ChainDescribed {
        permit: AnalysisPermit,
        generation: u64,
        result: Option<Result<Description, AnalysisError>>,
    },
    /// The chain's narration resolved
    ChainNarrated {
        permit: AnalysisPermit,
        generation: u64,
    },
    RouteResult {
        generation: u64,
        destination: String,
        result: Result<(RouteStart, LocationFix), NavigationError>,
    },
    Fix {
        generation: u64,
        fix: Result<LocationFix, LocationError>,
    },
    LocationUpdated {
        generation: u64,
        result: Result<LocationUpdate, ServiceError>,
    },
    Calibrated {
        generation: u64,
        result: Result<f64, ServiceError>,
    },
    ModelsListed {
        requested: Option<String>,
        result: Result<Vec<ModelInfo>, ServiceError>,
    },
}

impl From<LoopTick> for Message {
    fn from(tick: LoopTick) -> Self {
        Message::Tick(tick)
    }
}

/// The analysis chain currently holding the gate
struct ChainInFlight {
    id: u64,
    cancel: CancellationToken,
}

/// The session coordinator
pub struct Coordinator {
    mode: Mode,
    mode_entered_at: Instant,
    status: String,
    settings: Settings,
    options: CoordinatorOptions,
    services: Services,
    devices: Devices,
    device: Arc<CaptureDevice>,
    speech: SpeechChannel,
    gate: AnalysisGate,
    autoloop: AutoCaptureLoop,
    chain: Option<ChainInFlight>,
    /// A completion-chained tick was refused while a stale chain still held the gate
    pending_tick: bool,
    navigation: NavigationSession,
    calibration: Option<CalibrationSession>,
    calibration_generation: u64,
    calibration_store: CalibrationStore,
    obstacle: Option<ObstacleMonitor>,
    tx: mpsc::UnboundedSender<Message>,
    inbox: mpsc::UnboundedReceiver<Message>,
    events: broadcast::Sender<SessionEvent>,
    snapshot: watch::Sender<SessionSnapshot>,
}

impl Coordinator {
    /// Create the coordinator and a handle to drive it
    pub fn new(
        services: Services,
        devices: Devices,
        settings: Settings,
        options: CoordinatorOptions,
    ) -> (Self, CoordinatorHandle) {
        let (tx, inbox) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(256);
        let (snapshot_tx, snapshot_rx) = watch::channel(SessionSnapshot::default());

        let device = Arc::new(CaptureDevice::new(
            Arc::clone(&devices.camera),
            options.capture_retry,
        ));
        let voice = VoiceSettings {
            rate: settings.speech_rate,
            voice: settings.voice.clone(),
            lang: options.speech_lang.clone(),
        };
        let speech = SpeechChannel::new(Arc::clone(&devices.speech), voice);
        let autoloop =
            AutoCaptureLoop::new(settings.policy, Duration::from_secs(settings.interval_secs));

        let handle = CoordinatorHandle {
            tx: tx.clone(),
            snapshot: snapshot_rx,
            events: events.clone(),
        };

        let coordinator = Self {
            mode: Mode::Idle,
            mode_entered_at: Instant::now(),
            status: "Ready (Space: start narration)".to_string(),
            settings,
            options,
            services,
            devices,
            device,
            speech,
            gate: AnalysisGate::new(),
            autoloop,
            chain: None,
            pending_tick: false,
            navigation: NavigationSession::new(),
            calibration: None,
            calibration_generation: 0,
            calibration_store: CalibrationStore::new(),
            obstacle: None,
            tx,
            inbox,
            events,
            snapshot: snapshot_tx,
        };
        (coordinator, handle)
    }

    /// Run the actor until shutdown
    pub async fn run(mut self) {
        info!(mode = %self.mode, "coordinator started");
        self.publish();

        while let Some(message) = self.inbox.recv().await {
            match message {
                Message::Shutdown => {
                    self.shutdown();
                    self.publish();
                    break;
                }
                Message::User(intent) => self.handle_intent(intent).await,
                Message::Tick(tick) => self.on_tick(tick),
                Message::ChainDescribed {
                    permit,
                    generation,
                    result,
                } => self.on_chain_described(permit, generation, result),
                Message::ChainNarrated { permit, generation } => {
                    self.on_chain_narrated(permit, generation)
                }
                Message::RouteResult {
                    generation,
                    destination,
                    result,
                } => self.on_route_result(generation, destination, result).await,
                Message::Fix { generation, fix } => self.on_fix(generation, fix),
                Message::LocationUpdated { generation, result } => {
                    self.on_location_updated(generation, result)
                }
                Message::Calibrated { generation, result } => {
                    self.on_calibrated(generation, result)
                }
                Message::ModelsListed { requested, result } => {
                    self.on_models_listed(requested, result)
                }
            }
            self.publish();
        }

        info!("coordinator stopped");
    }

    async fn handle_intent(&mut self, intent: Intent) {
        debug!(?intent, mode = %self.mode, "intent received");
        match intent {
            Intent::TogglePrimary => self.toggle_primary().await,
            Intent::Directions => self.directions().await,
            Intent::NavigateTo { destination } => self.navigate_to(destination),
            Intent::Cancel => self.cancel().await,
            Intent::Calibrate => self.calibrate().await,
            Intent::ConfigureSpeech => self.configure_speech().await,
            Intent::SetVoice { voice } => self.set_voice(voice),
            Intent::SetInterval { secs } => self.set_interval(secs),
            Intent::SetChainingPolicy { policy } => self.set_policy(policy),
            Intent::SelectModel { model } => self.request_models(Some(model)),
            Intent::RefreshModels => self.request_models(None),
        }
    }

    // ---- mode bookkeeping ----

    /// Perform a mode transition
    fn transition_to(&mut self, new_mode: Mode) {
        let old_mode = self.mode;
        if new_mode == old_mode {
            return;
        }
        let duration_ms = self.mode_entered_at.elapsed().as_millis() as u64;

        info!(
            from = %old_mode,
            to = %new_mode,
            duration_ms,
            "mode transition"
        );

        self.mode = new_mode;
        self.mode_entered_at = Instant::now();
        self.emit(SessionEvent::ModeChanged {
            from: old_mode,
            to: new_mode,
            duration_ms,
        });
        self.sync_obstacle_monitor();
    }

    /// The mode that is active, or suspended underneath a calibration
    fn base_mode(&self) -> Mode {
        self.calibration
            .as_ref()
            .map_or(self.mode, |session| session.previous_mode)
    }

    fn set_base_mode(&mut self, mode: Mode) {
        match self.calibration.as_mut() {
            Some(session) => {
                debug!(from = %session.previous_mode, to = %mode, "suspended mode changed");
                session.previous_mode = mode;
            }
            None => self.transition_to(mode),
        }
    }

    fn sync_obstacle_monitor(&mut self) {
        let wanted = self.mode != Mode::Idle;
        if !wanted {
            self.obstacle = None;
            return;
        }
        if self.obstacle.is_some() {
            return;
        }
        if let (Some(depth), Some(period)) = (&self.services.depth, self.options.obstacle_period) {
            self.obstacle = Some(ObstacleMonitor::spawn(
                Arc::clone(&self.device),
                Arc::clone(depth),
                Arc::clone(&self.devices.alerts),
                self.calibration_store.subscribe(),
                period,
            ));
        }
    }

    fn emit(&self, event: SessionEvent) {
        debug!(%event, "emitting event");
        let _ = self.events.send(event);
    }

    fn publish(&self) {
        let route = self.navigation.route();
        self.snapshot.send_replace(SessionSnapshot {
            mode: self.mode,
            nav_state: self.navigation.state(),
            destination: route.map(|r| r.destination.clone()),
            instruction: route.and_then(|r| r.current_instruction.clone()),
            instruction_index: route.map_or(0, |r| r.instruction_index),
            total_steps: route.map_or(0, |r| r.total_steps),
            narrating: self.autoloop.is_running(),
            busy: self.gate.is_busy(),
            calibration_factor: self.calibration_store.factor(),
            status: self.status.clone(),
            controls: ControlState::derive(self.mode, self.navigation.state()),
            settings: self.settings.clone(),
        });
    }

    fn set_status(&mut self, text: impl Into<String>) {
        let text = text.into();
        if text != self.status {
            self.status = text.clone();
            self.emit(SessionEvent::Status { text });
        }
    }

    /// Narrate without waiting for completion
    fn say(&self, text: impl Into<String>) {
        let _ = self.speech.speak(text);
    }

    fn refuse(&mut self, reason: &str) {
        info!(reason, mode = %self.mode, "request refused");
        self.set_status(reason);
        self.say(reason);
    }

    async fn confirm(&self, question: &str) -> bool {
        self.publish();
        let answer = self.devices.prompter.confirm(question).await;
        self.device.rearm();
        debug!(question, answer, "confirmation answered");
        answer
    }

    async fn ask_text(&self, question: &str) -> Option<String> {
        self.publish();
        let answer = self.devices.prompter.ask_text(question).await;
        self.device.rearm();
        answer
            .map(|text| text.trim().to_string())
            .filter(|text| !text.is_empty())
    }

    // ---- primary toggle ----

    async fn toggle_primary(&mut self) {
        if self.mode == Mode::Calibrating {
            self.refuse("Finish or cancel calibration first.");
            return;
        }
        if self.navigation.is_requesting() {
            self.refuse("Still searching for a route. Please wait.");
            return;
        }

        match self.mode {
            Mode::Idle => {
                if self.start_narration(None) {
                    self.transition_to(Mode::AutoNarrating);
                    self.set_status("Auto scene narration running (Space: stop)");
                    self.say("Starting automatic scene narration.");
                }
            }
            Mode::Navigating => {
                if self.start_narration(None) {
                    self.transition_to(Mode::NavigatingAndNarrating);
                    self.set_status("Guidance and scene narration running (Escape: stop guidance)");
                    self.say("Starting scene narration during guidance.");
                }
            }
            Mode::AutoNarrating => {
                self.stop_narration();
                self.transition_to(Mode::Idle);
                self.set_status("Auto narration stopped (Space: start)");
            }
            Mode::NavigatingAndNarrating => {
                let stop_all = self
                    .confirm("Scene narration will stop. Stop navigation as well?")
                    .await;
                if stop_all {
                    self.stop_navigation();
                } else {
                    self.stop_narration();
                    self.transition_to(Mode::Navigating);
                    self.set_status("Guidance running, scene narration stopped (Space: restart narration)");
                    self.say("Scene narration stopped. Guidance continues.");
                }
            }
            Mode::Calibrating => {}
        }
    }

    // ---- auto-capture ----

    fn start_narration(&mut self, delay: Option<Duration>) -> bool {
        if let Err(e) = self.device.acquire(DeviceOwner::Narration) {
            warn!(?e, "cannot start scene narration");
            self.refuse("The camera is busy.");
            return false;
        }
        self.pending_tick = false;
        self.autoloop.start(&self.tx, delay);
        true
    }

    fn stop_narration(&mut self) {
        let was_running = self.autoloop.stop();
        if let Some(chain) = self.chain.take() {
            debug!(chain = chain.id, "aborting analysis chain");
            chain.cancel.cancel();
        }
        self.pending_tick = false;
        if !was_running {
            return;
        }

        self.speech.cancel();
        self.release_narration_device();

        let describer = Arc::clone(&self.services.describer);
        tokio::spawn(async move {
            if let Err(e) = describer.stop_processing().await {
                warn!(?e, "stop processing notification failed");
            }
        });
    }

    fn release_narration_device(&mut self) {
        match self.calibration.as_mut() {
            Some(session) => {
                if session.device.owner == Some(DeviceOwner::Narration) {
                    session.device = DeviceState::default();
                }
            }
            None => self.device.release(DeviceOwner::Narration),
        }
    }

    fn navigation_context(&self) -> Option<NavigationContext> {
        if self.base_mode() != Mode::NavigatingAndNarrating || !self.navigation.is_active() {
            return None;
        }
        Some(NavigationContext {
            session_id: self.navigation.session_id()?.clone(),
            location: self.navigation.last_coords(),
        })
    }

    fn on_tick(&mut self, tick: LoopTick) {
        if self.mode == Mode::Calibrating {
            debug!(generation = tick.generation, "tick deferred during calibration");
            self.autoloop.defer();
            return;
        }
        if !self.autoloop.accepts(tick.generation) {
            debug!(generation = tick.generation, "stale tick dropped");
            return;
        }

        let permit = match self.gate.try_begin() {
            Ok(permit) => permit,
            Err(_) => {
                if self.autoloop.policy() == ChainingPolicy::CompletionChained {
                    self.pending_tick = true;
                }
                self.emit(SessionEvent::AnalysisBusy);
                return;
            }
        };

        let cancel = CancellationToken::new();
        self.chain = Some(ChainInFlight {
            id: permit.id(),
            cancel: cancel.clone(),
        });

        let generation = tick.generation;
        let device = Arc::clone(&self.device);
        let describer = Arc::clone(&self.services.describer);
        let model = self.settings.model.clone();
        let context = self.navigation_context();
        let tx = self.tx.clone();
        debug!(
            chain = permit.id(),
            generation,
            navigation = context.is_some(),
            "analysis chain started"
        );

        tokio::spawn(async move {
            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                result = async {
                    let image = device.capture(DeviceOwner::Narration).await?;
                    analysis::describe(
                        describer.as_ref(),
                        &permit,
                        &image,
                        &model,
                        context.as_ref(),
                    )
                    .await
                } => Some(result),
            };
            let _ = tx.send(Message::ChainDescribed {
                permit,
                generation,
                result,
            });
        });
    }

    fn is_current_chain(&self, permit: &AnalysisPermit, generation: u64) -> bool {
        self.autoloop.accepts(generation)
            && self.chain.as_ref().is_some_and(|c| c.id == permit.id())
    }

    /// Drop a permit that no longer belongs to the running loop
    fn release_stale(&mut self, permit: AnalysisPermit) {
        debug!(chain = permit.id(), "stale analysis chain released");
        if self.chain.as_ref().is_some_and(|c| c.id == permit.id()) {
            self.chain = None;
        }
        drop(permit);

        if std::mem::take(&mut self.pending_tick) && self.chain.is_none() {
            if self.mode == Mode::Calibrating {
                self.autoloop.defer();
            } else {
                let generation = self.autoloop.generation();
                self.autoloop.chain_finished(&self.tx, generation);
            }
        }
    }

    fn on_chain_described(
        &mut self,
        permit: AnalysisPermit,
        generation: u64,
        result: Option<Result<Description, AnalysisError>>,
    ) {
        let result = match result {
            Some(result) if self.is_current_chain(&permit, generation) => result,
            _ => {
                self.release_stale(permit);
                return;
            }
        };

        if self.mode == Mode::Calibrating {
            debug!(chain = permit.id(), "chain result discarded during calibration");
            self.chain = None;
            drop(permit);
            self.autoloop.defer();
            return;
        }

        match result {
            Ok(description) => {
                if let Some(update) = &description.navigation {
                    self.adopt_navigation_update(update);
                }
                self.emit(SessionEvent::DescriptionReady {
                    text: description.text.clone(),
                    model: description.stats.model_name.clone(),
                    processing_time_secs: description.stats.processing_time_secs,
                });
                self.narrate_chain(permit, generation, description.text);
            }
            Err(AnalysisError::Capture(e)) => {
                self.chain = None;
                drop(permit);
                self.capture_failed(e);
            }
            Err(e) => {
                warn!(?e, "scene description failed");
                self.set_status(format!("Error: {e}"));
                self.narrate_chain(permit, generation, "An error occurred while describing the scene.");
            }
        }
    }

    /// Narrate a chain result; the permit is held until narration resolves
    fn narrate_chain(&mut self, permit: AnalysisPermit, generation: u64, text: impl Into<String>) {
        let utterance = self.speech.speak(text);
        let tx = self.tx.clone();
        tokio::spawn(async move {
            let outcome = utterance.await;
            debug!(chain = permit.id(), ?outcome, "chain narration finished");
            let _ = tx.send(Message::ChainNarrated { permit, generation });
        });
    }

    fn on_chain_narrated(&mut self, permit: AnalysisPermit, generation: u64) {
        if !self.is_current_chain(&permit, generation) {
            self.release_stale(permit);
            return;
        }
        self.chain = None;
        drop(permit);
        self.pending_tick = false;

        if self.mode == Mode::Calibrating {
            self.autoloop.defer();
            return;
        }
        self.autoloop.chain_finished(&self.tx, generation);
    }

    fn capture_failed(&mut self, error: CaptureError) {
        warn!(?error, "capture failed, stopping scene narration");
        self.stop_narration();
        let next = match self.base_mode() {
            Mode::NavigatingAndNarrating => Mode::Navigating,
            Mode::AutoNarrating => Mode::Idle,
            other => other,
        };
        self.set_base_mode(next);
        self.set_status(format!("Camera unavailable: {error}"));
        self.say("The camera is not available. Scene narration has stopped.");
    }

    // ---- navigation ----

    async fn directions(&mut self) {
        if self.mode == Mode::Calibrating {
            self.refuse("Finish or cancel calibration first.");
            return;
        }
        if self.navigation.is_active() || self.navigation.is_requesting() {
            self.stop_navigation();
            return;
        }
        if self.autoloop.is_running() {
            self.refuse("Stop scene narration before requesting directions.");
            return;
        }

        match self
            .ask_text("Enter your destination (for example: Seoul Station)")
            .await
        {
            Some(destination) => self.request_route(destination),
            None => debug!("destination entry cancelled"),
        }
    }

    fn navigate_to(&mut self, destination: String) {
        let destination = destination.trim().to_string();
        if self.mode == Mode::Calibrating {
            self.refuse("Finish or cancel calibration first.");
        } else if self.navigation.is_active() || self.navigation.is_requesting() {
            self.refuse("Navigation is already running.");
        } else if self.autoloop.is_running() {
            self.refuse("Stop scene narration before requesting directions.");
        } else if destination.is_empty() {
            self.refuse("Please enter a destination.");
        } else {
            self.request_route(destination);
        }
    }

    fn request_route(&mut self, destination: String) {
        let generation = match self.navigation.begin_request() {
            Ok(generation) => generation,
            Err(e) => {
                self.refuse(&e.to_string());
                return;
            }
        };

        info!(%destination, "route requested");
        self.set_status("Checking your location and searching for the destination...");
        self.say("Checking your current location and searching for the destination. Please wait.");

        let location = Arc::clone(&self.devices.location);
        let routing = Arc::clone(&self.services.routing);
        let timeout = self.options.location_timeout;
        let tx = self.tx.clone();
        tokio::spawn(async move {
            let result = async {
                let fix = tokio::time::timeout(timeout, location.current_fix())
                    .await
                    .map_err(|_| LocationError::Timeout)??;
                let start = routing.start_navigation(fix.coords, &destination).await?;
                Ok::<_, NavigationError>((start, fix))
            }
            .await;
            let _ = tx.send(Message::RouteResult {
                generation,
                destination,
                result,
            });
        });
    }

    async fn on_route_result(
        &mut self,
        generation: u64,
        destination: String,
        result: Result<(RouteStart, LocationFix), NavigationError>,
    ) {
        let (start, fix) = match result {
            Ok(ok) => ok,
            Err(e) => {
                if self.navigation.request_failed(generation) {
                    warn!(?e, %destination, "route request failed");
                    self.set_status(format!("Error: {e}"));
                    self.say(format!("Could not start navigation. {e}"));
                }
                return;
            }
        };

        let session_id = start.session_id.clone();
        let total_steps = start.total_steps;
        if !self.navigation.activate(generation, start, &destination) {
            self.release_route(Some(session_id));
            return;
        }
        debug!(origin = %fix.coords, session = %session_id, "route session opened");

        self.start_location_watch();
        self.set_base_mode(Mode::Navigating);
        self.emit(SessionEvent::NavigationStarted {
            destination: destination.clone(),
            total_steps,
        });

        let mut with_narration = false;
        if self.mode == Mode::Navigating && !self.autoloop.is_running() {
            let wanted = self
                .confirm("Start scene narration together with navigation?")
                .await;
            if wanted && self.start_narration(Some(self.options.narration_start_delay)) {
                self.transition_to(Mode::NavigatingAndNarrating);
                with_narration = true;
            }
        }

        let first = self
            .navigation
            .route()
            .and_then(|r| r.current_instruction.clone());
        if let Some(first) = first {
            self.emit(SessionEvent::InstructionUpdated {
                instruction: first.clone(),
                index: 0,
                total: total_steps,
            });
            if with_narration {
                self.set_status(format!("Guidance and scene narration: {first} (Escape: stop guidance)"));
                self.say(format!(
                    "Starting route guidance together with scene narration. {first}"
                ));
            } else {
                self.set_status(format!("Guidance: {first} (Escape: stop guidance, Space: start narration)"));
                self.say(format!(
                    "Starting route guidance. Press space to start scene narration separately. {first}"
                ));
            }
        }
    }

    fn start_location_watch(&mut self) {
        let mut fixes = match self.devices.location.watch() {
            Ok(fixes) => fixes,
            Err(e) => {
                warn!(?e, "location tracking unavailable");
                self.set_status(format!("Location tracking unavailable: {e}"));
                return;
            }
        };

        let token = CancellationToken::new();
        self.navigation.attach_watch(token.clone());
        let generation = self.navigation.generation();
        let tx = self.tx.clone();
        info!("location tracking started");

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    fix = fixes.recv() => match fix {
                        Some(fix) => {
                            if tx.send(Message::Fix { generation, fix }).is_err() {
                                break;
                            }
                        }
                        None => {
                            debug!("location stream closed");
                            break;
                        }
                    },
                }
            }
        });
    }

    fn on_fix(&mut self, generation: u64, fix: Result<LocationFix, LocationError>) {
        if !self.navigation.accepts(generation) {
            return;
        }
        let fix = match fix {
            Ok(fix) => fix,
            Err(e) => {
                warn!(?e, "location tracking error");
                self.set_status(format!("Location error: {e}"));
                self.say("There was an error tracking your location.");
                return;
            }
        };

        let max_age_ms = self.options.location_max_age.as_millis() as u64;
        match self.navigation.offer_fix(fix, now_ms(), max_age_ms) {
            FixDecision::Send(session_id, coords) => self.send_location_update(session_id, coords),
            FixDecision::Queued => debug!("location update in flight, fix queued"),
            FixDecision::Dropped(reason) => debug!(reason, "location fix dropped"),
        }
    }

    fn send_location_update(&self, session_id: SessionId, coords: Coordinates) {
        let routing = Arc::clone(&self.services.routing);
        let generation = self.navigation.generation();
        let tx = self.tx.clone();
        debug!(%coords, "sending location update");
        tokio::spawn(async move {
            let result = routing.update_location(&session_id, coords).await;
            let _ = tx.send(Message::LocationUpdated { generation, result });
        });
    }

    fn on_location_updated(&mut self, generation: u64, result: Result<LocationUpdate, ServiceError>) {
        if !self.navigation.accepts(generation) {
            debug!(generation, "stale location update dropped");
            return;
        }

        match result {
            Ok(update) => {
                let effect = self.navigation.apply_update(&update);
                if effect.completed {
                    self.navigation_completed();
                    return;
                }
                if let Some(instruction) = effect.instruction {
                    self.emit(SessionEvent::InstructionUpdated {
                        instruction: instruction.clone(),
                        index: update.instruction_index,
                        total: update.total_steps,
                    });
                    self.set_status(format!("Guidance: {instruction}"));
                    self.say(instruction);
                }
            }
            Err(e) => warn!(?e, "location update failed"),
        }

        if let Some((session_id, coords)) = self.navigation.finish_update() {
            self.send_location_update(session_id, coords);
        }
    }

    /// Fold an instruction carried by a navigation describe call
    fn adopt_navigation_update(&mut self, update: &NavigationUpdate) {
        if !self.navigation.is_active() {
            return;
        }
        if let Some(instruction) = self.navigation.adopt_instruction(
            update.current_instruction.as_deref(),
            update.instruction_index,
            update.total_instructions,
        ) {
            self.emit(SessionEvent::InstructionUpdated {
                instruction: instruction.clone(),
                index: update.instruction_index,
                total: update.total_instructions,
            });
            self.set_status(format!("Guidance: {instruction}"));
        }
    }

    fn navigation_completed(&mut self) {
        let destination = self.navigation.route().map(|r| r.destination.clone());
        let session = self.navigation.complete();
        self.release_route(session);

        let was_narrating = self.autoloop.is_running();
        self.stop_narration();
        self.set_base_mode(Mode::Idle);
        info!(?destination, "destination reached");
        self.emit(SessionEvent::NavigationCompleted { destination });

        if was_narrating {
            self.set_status("Arrived! Guidance and scene narration ended (Space: start narration)");
            self.say("Congratulations! You have arrived safely. Guidance and scene narration have ended.");
        } else {
            self.set_status("Arrived! Guidance ended (Space: start narration)");
            self.say("Congratulations! You have arrived safely. Guidance has ended.");
        }
    }

    fn stop_navigation(&mut self) {
        let was_narrating = self.autoloop.is_running();
        let session = self.navigation.end();
        self.release_route(session);
        self.stop_narration();
        self.set_base_mode(Mode::Idle);
        self.emit(SessionEvent::NavigationStopped);

        if was_narrating {
            self.set_status("Guidance and scene narration stopped (Space: start narration)");
            self.say("Guidance and scene narration have both stopped.");
        } else {
            self.set_status("Guidance stopped");
            self.say("Guidance stopped.");
        }
    }

    /// Best-effort release of a backend route session
    fn release_route(&self, session: Option<SessionId>) {
        let Some(session_id) = session else {
            return;
        };
        let routing = Arc::clone(&self.services.routing);
        tokio::spawn(async move {
            match routing.end_navigation(&session_id).await {
                Ok(()) => debug!(session = %session_id, "route session released"),
                Err(e) => warn!(?e, session = %session_id, "failed to release route session"),
            }
        });
    }

    async fn cancel(&mut self) {
        if self.mode == Mode::Calibrating {
            self.cancel_calibration();
        } else if self.navigation.is_active() || self.navigation.is_requesting() {
            if self.confirm("Stop navigation?").await {
                self.stop_navigation();
            }
        } else {
            debug!("nothing to cancel");
        }
    }

    // ---- calibration ----

    async fn calibrate(&mut self) {
        if self.mode == Mode::Calibrating {
            self.refuse("Calibration is already in progress.");
            return;
        }
        let Some(depth) = self.services.depth.clone() else {
            self.refuse("Distance calibration is not available.");
            return;
        };

        self.calibration_generation += 1;
        let generation = self.calibration_generation;
        let saved = self.device.suspend_for_calibration();
        self.calibration = Some(CalibrationSession {
            generation,
            previous_mode: self.mode,
            device: saved,
            draft: CalibrationDraft::default(),
            submitted: false,
        });
        self.transition_to(Mode::Calibrating);
        self.emit(SessionEvent::CalibrationStarted);
        self.set_status("Calibration: enter your height");
        self.say("Distance calibration. Please enter your height.");

        let mut height = None;
        for _ in 0..MAX_HEIGHT_ATTEMPTS {
            let Some(input) = self
                .ask_text("Enter your height in centimetres (for example: 170)")
                .await
            else {
                break;
            };
            match parse_height(&input) {
                Ok(value) => {
                    height = Some(value);
                    break;
                }
                Err(e) => {
                    debug!(?e, "height rejected");
                    self.say(format!("{e}. Please try again."));
                }
            }
        }
        let Some(height) = height else {
            self.cancel_calibration();
            return;
        };

        let ready = self
            .confirm("Hold your palm at arm's length in front of the camera, then confirm to capture.")
            .await;
        if !ready {
            self.cancel_calibration();
            return;
        }

        let image = match self.device.capture(DeviceOwner::Calibration).await {
            Ok(image) => image,
            Err(e) => {
                warn!(?e, "calibration capture failed");
                self.finish_calibration();
                self.set_status(format!("Calibration failed: {e}"));
                self.say("Could not capture the reference image. Calibration cancelled.");
                return;
            }
        };

        if let Some(session) = self.calibration.as_mut() {
            session.draft.height_cm = Some(height);
            session.draft.reference = Some(image.clone());
            session.submitted = session.draft.is_complete();
        }
        self.set_status("Calculating distance calibration...");
        info!(height_cm = height, "calibration submitted");

        let tx = self.tx.clone();
        tokio::spawn(async move {
            let result = depth.calibrate(&image, height).await;
            let _ = tx.send(Message::Calibrated { generation, result });
        });
    }

    /// Leave calibration, restoring the suspended mode and device exactly
    fn finish_calibration(&mut self) -> bool {
        let Some(session) = self.calibration.take() else {
            return false;
        };
        self.device.restore(session.device);
        self.transition_to(session.previous_mode);
        self.autoloop.resume_deferred(&self.tx);
        true
    }

    fn cancel_calibration(&mut self) {
        if self.finish_calibration() {
            self.emit(SessionEvent::CalibrationCancelled);
            self.set_status("Calibration cancelled");
            self.say("Calibration cancelled.");
        }
    }

    fn on_calibrated(&mut self, generation: u64, result: Result<f64, ServiceError>) {
        let current = self
            .calibration
            .as_ref()
            .is_some_and(|s| s.generation == generation && s.submitted);
        if !current {
            debug!(generation, "stale calibration result dropped");
            return;
        }

        let outcome = result.map_err(|e| e.to_string()).and_then(|factor| {
            self.calibration_store
                .confirm(factor)
                .map(|()| factor)
                .map_err(|e| e.to_string())
        });
        self.finish_calibration();

        match outcome {
            Ok(factor) => {
                self.emit(SessionEvent::CalibrationComplete { factor });
                self.set_status(format!("Calibration complete (factor {factor:.3})"));
                self.say("Calibration complete.");
            }
            Err(message) => {
                warn!(%message, "calibration failed");
                self.set_status(format!("Calibration failed: {message}"));
                self.say("Calibration failed. Please try again.");
            }
        }
    }

    // ---- settings ----

    async fn configure_speech(&mut self) {
        if self.mode != Mode::Idle || self.navigation.is_requesting() {
            self.refuse("Speech settings are only available while idle.");
            return;
        }

        self.set_status("Listening for a speech speed...");
        self.publish();
        let _ = self
            .speech
            .speak("What speed would you like? Say a number from 1 to 10.")
            .await;
        tokio::time::sleep(self.options.listen_pause).await;

        let heard = self
            .devices
            .recognizer
            .listen(&self.options.speech_lang)
            .await;
        self.device.rearm();

        let text = match heard {
            Ok(text) => text,
            Err(e) => {
                warn!(?e, "speech recognition failed");
                self.set_status(format!("Speech recognition failed: {e}"));
                self.say("Speech recognition failed. Please try again.");
                return;
            }
        };

        match parse_spoken_speed(&text) {
            Some(rate) => {
                self.settings.speech_rate = rate;
                self.apply_voice();
                self.settings_changed();
                self.set_status(format!("Speech speed set to {rate}"));
                self.say(format!("Speech speed set to {rate}."));
            }
            None => {
                self.set_status(format!("No speed recognised in \"{text}\""));
                self.say("No speed was recognised. Please say a number from 1 to 10.");
            }
        }
    }

    fn apply_voice(&self) {
        self.speech.set_voice(VoiceSettings {
            rate: self.settings.speech_rate,
            voice: self.settings.voice.clone(),
            lang: self.options.speech_lang.clone(),
        });
    }

    /// Persist settings and notify clients
    fn settings_changed(&self) {
        if let Some(path) = &self.options.settings_path {
            if let Err(e) = self.settings.save(path) {
                warn!(?e, "failed to persist settings");
            }
        }
        self.emit(SessionEvent::SettingsChanged {
            settings: self.settings.clone(),
        });
    }

    fn set_voice(&mut self, voice: Option<String>) {
        info!(?voice, "voice selected");
        self.settings.voice = voice;
        self.apply_voice();
        self.settings_changed();
    }

    fn set_interval(&mut self, secs: u64) {
        match self.autoloop.set_interval(secs) {
            Ok(()) => {
                self.settings.interval_secs = secs;
                self.settings_changed();
                self.set_status(format!("Interval set to {secs} s"));
            }
            Err(e) => self.refuse(&format!("Cannot change the interval: {e}.")),
        }
    }

    fn set_policy(&mut self, policy: ChainingPolicy) {
        match self.autoloop.set_policy(policy) {
            Ok(()) => {
                self.settings.policy = policy;
                self.settings_changed();
                self.set_status(format!("Narration mode set to {policy}"));
            }
            Err(e) => self.refuse(&format!("Cannot change the narration mode: {e}.")),
        }
    }

    fn request_models(&mut self, requested: Option<String>) {
        if requested.is_some() && self.autoloop.is_running() {
            self.refuse("Stop scene narration before changing the model.");
            return;
        }
        let describer = Arc::clone(&self.services.describer);
        let tx = self.tx.clone();
        tokio::spawn(async move {
            let result = describer.list_models().await;
            let _ = tx.send(Message::ModelsListed { requested, result });
        });
    }

    fn on_models_listed(&mut self, requested: Option<String>, result: Result<Vec<ModelInfo>, ServiceError>) {
        let models = match result {
            Ok(models) => models,
            Err(e) => {
                warn!(?e, "failed to load model list");
                if requested.is_some() {
                    self.refuse("Could not load the model list.");
                }
                return;
            }
        };
        debug!(count = models.len(), "model list loaded");
        self.emit(SessionEvent::ModelsAvailable {
            models: models.clone(),
        });

        let Some(id) = requested else {
            return;
        };
        if self.autoloop.is_running() {
            self.refuse("Stop scene narration before changing the model.");
        } else if let Some(model) = models.iter().find(|m| m.id == id) {
            info!(model = %model.id, "description model selected");
            self.settings.model = model.id.clone();
            self.settings_changed();
            self.set_status(format!("Model: {}", model.name));
        } else {
            self.refuse(&format!("Unknown model '{id}'."));
        }
    }

    // ---- teardown ----

    fn shutdown(&mut self) {
        info!(mode = %self.mode, "coordinator shutting down");
        self.finish_calibration();
        self.stop_narration();
        let session = self.navigation.end();
        self.release_route(session);
        self.speech.cancel();
        self.transition_to(Mode::Idle);
        self.obstacle = None;
    }
}
