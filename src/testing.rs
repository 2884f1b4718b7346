//! In-memory fakes for the device and service seams

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::backend::{
    DepthService, Description, DescriptionService, LocationUpdate, ModelInfo, NavigationContext,
    NavigationUpdate, ObstacleReport, PerformanceStats, RouteStart, RoutingService, ServiceError,
};
use crate::capture::{CaptureError, Frame, FrameSource, ImagePayload};
use crate::coordinator::{Prompter, RecognitionError, SpeechRecognizer};
use crate::navigation::{
    now_ms, Coordinates, LocationError, LocationFix, LocationProvider, LocationWatch, SessionId,
};
use crate::obstacle::AlertSink;
use crate::speech::{SpeechEngine, SpeechError, VoiceSettings};

fn test_frame() -> Frame {
    Frame {
        width: 640,
        height: 480,
        jpeg: vec![0xFF, 0xD8, 0xFF, 0xE0, 0x00, 0x10, 0xFF, 0xD9],
    }
}

// ---- camera ----

#[derive(Default)]
pub struct FakeCamera {
    ready: AtomicBool,
    snapshots: AtomicUsize,
    suspends: AtomicUsize,
    rearms: AtomicUsize,
}

impl FakeCamera {
    pub fn ready() -> Arc<Self> {
        let camera = Self::default();
        camera.ready.store(true, Ordering::SeqCst);
        Arc::new(camera)
    }

    pub fn not_ready() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::SeqCst);
    }

    pub fn snapshot_count(&self) -> usize {
        self.snapshots.load(Ordering::SeqCst)
    }

    pub fn suspend_count(&self) -> usize {
        self.suspends.load(Ordering::SeqCst)
    }

    pub fn rearm_count(&self) -> usize {
        self.rearms.load(Ordering::SeqCst)
    }
}

impl FrameSource for FakeCamera {
    fn snapshot(&self) -> Result<Frame, CaptureError> {
        self.snapshots.fetch_add(1, Ordering::SeqCst);
        if self.ready.load(Ordering::SeqCst) {
            Ok(test_frame())
        } else {
            Err(CaptureError::NotReady)
        }
    }

    fn suspend(&self) {
        self.suspends.fetch_add(1, Ordering::SeqCst);
    }

    fn resume(&self) {}

    fn rearm(&self) {
        self.rearms.fetch_add(1, Ordering::SeqCst);
    }
}

// ---- speech ----

pub struct FakeSpeech {
    duration: Duration,
    fail: bool,
    spoken: Mutex<Vec<String>>,
    stops: AtomicUsize,
}

impl FakeSpeech {
    /// Every utterance takes `duration` to play
    pub fn new(duration: Duration) -> Arc<Self> {
        Arc::new(Self {
            duration,
            fail: false,
            spoken: Mutex::new(Vec::new()),
            stops: AtomicUsize::new(0),
        })
    }

    pub fn failing() -> Arc<Self> {
        Arc::new(Self {
            duration: Duration::ZERO,
            fail: true,
            spoken: Mutex::new(Vec::new()),
            stops: AtomicUsize::new(0),
        })
    }

    /// Texts in the order playback started
    pub fn spoken(&self) -> Vec<String> {
        self.spoken.lock().unwrap().clone()
    }

    pub fn stop_count(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SpeechEngine for FakeSpeech {
    async fn play(&self, text: &str, _voice: &VoiceSettings) -> Result<(), SpeechError> {
        self.spoken.lock().unwrap().push(text.to_string());
        if self.fail {
            return Err(SpeechError::Playback("device error".into()));
        }
        tokio::time::sleep(self.duration).await;
        Ok(())
    }

    fn stop(&self) {
        self.stops.fetch_add(1, Ordering::SeqCst);
    }
}

// ---- description ----

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

pub struct FakeDescriber {
    delay: Mutex<Duration>,
    calls: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    stops: AtomicUsize,
    contexts: Mutex<Vec<Option<NavigationContext>>>,
    models_used: Mutex<Vec<String>>,
    models: Mutex<Vec<ModelInfo>>,
    navigation: Mutex<Option<NavigationUpdate>>,
    failure: Mutex<Option<ServiceError>>,
}

impl FakeDescriber {
    pub fn new(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            delay: Mutex::new(delay),
            calls: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            stops: AtomicUsize::new(0),
            contexts: Mutex::new(Vec::new()),
            models_used: Mutex::new(Vec::new()),
            models: Mutex::new(vec![ModelInfo {
                id: "gemini-2.0-flash".into(),
                name: "Gemini 2.0 Flash".into(),
            }]),
            navigation: Mutex::new(None),
            failure: Mutex::new(None),
        })
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = delay;
    }

    pub fn set_models(&self, models: Vec<ModelInfo>) {
        *self.models.lock().unwrap() = models;
    }

    /// Instruction state returned with every describe call
    pub fn set_navigation(&self, update: Option<NavigationUpdate>) {
        *self.navigation.lock().unwrap() = update;
    }

    pub fn set_failing(&self, error: Option<ServiceError>) {
        *self.failure.lock().unwrap() = error;
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn stop_calls(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }

    pub fn contexts(&self) -> Vec<Option<NavigationContext>> {
        self.contexts.lock().unwrap().clone()
    }

    pub fn models_used(&self) -> Vec<String> {
        self.models_used.lock().unwrap().clone()
    }
}

#[async_trait]
impl DescriptionService for FakeDescriber {
    async fn describe(
        &self,
        _image: &ImagePayload,
        model: &str,
        context: Option<&NavigationContext>,
    ) -> Result<Description, ServiceError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        let _guard = InFlight(&self.in_flight);
        self.contexts.lock().unwrap().push(context.cloned());
        self.models_used.lock().unwrap().push(model.to_string());

        let delay = *self.delay.lock().unwrap();
        tokio::time::sleep(delay).await;

        if let Some(error) = self.failure.lock().unwrap().clone() {
            return Err(error);
        }
        Ok(Description {
            text: format!("Scene {n}: a crosswalk ahead."),
            stats: PerformanceStats {
                model_name: Some(model.to_string()),
                processing_time_secs: Some(delay.as_secs_f64()),
            },
            navigation: self.navigation.lock().unwrap().clone(),
        })
    }

    async fn list_models(&self) -> Result<Vec<ModelInfo>, ServiceError> {
        Ok(self.models.lock().unwrap().clone())
    }

    async fn stop_processing(&self) -> Result<(), ServiceError> {
        self.stops.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

// ---- routing ----

pub struct FakeRouting {
    failure: Option<String>,
    destinations: Mutex<Vec<String>>,
    updates: Mutex<VecDeque<LocationUpdate>>,
    update_calls: AtomicUsize,
    update_delay: Mutex<Duration>,
    failing_updates: AtomicUsize,
    end_failing: AtomicBool,
    ended: Mutex<Vec<SessionId>>,
}

impl FakeRouting {
    /// Three-step route, session `nav-1`
    pub fn new() -> Arc<Self> {
        Arc::new(Self::with_failure(None))
    }

    pub fn failing(message: &str) -> Arc<Self> {
        Arc::new(Self::with_failure(Some(message.to_string())))
    }

    fn with_failure(failure: Option<String>) -> Self {
        Self {
            failure,
            destinations: Mutex::new(Vec::new()),
            updates: Mutex::new(VecDeque::new()),
            update_calls: AtomicUsize::new(0),
            update_delay: Mutex::new(Duration::ZERO),
            failing_updates: AtomicUsize::new(0),
            end_failing: AtomicBool::new(false),
            ended: Mutex::new(Vec::new()),
        }
    }

    /// How long each location update takes to answer
    pub fn set_update_delay(&self, delay: Duration) {
        *self.update_delay.lock().unwrap() = delay;
    }

    /// Reject the next `count` location updates
    pub fn fail_next_updates(&self, count: usize) {
        self.failing_updates.store(count, Ordering::SeqCst);
    }

    pub fn set_end_failing(&self, failing: bool) {
        self.end_failing.store(failing, Ordering::SeqCst);
    }

    /// Queue the answer to the next location update
    pub fn push_update(&self, update: LocationUpdate) {
        self.updates.lock().unwrap().push_back(update);
    }

    pub fn destinations(&self) -> Vec<String> {
        self.destinations.lock().unwrap().clone()
    }

    pub fn update_calls(&self) -> usize {
        self.update_calls.load(Ordering::SeqCst)
    }

    pub fn ended(&self) -> Vec<SessionId> {
        self.ended.lock().unwrap().clone()
    }
}

#[async_trait]
impl RoutingService for FakeRouting {
    async fn start_navigation(
        &self,
        _origin: Coordinates,
        destination: &str,
    ) -> Result<RouteStart, ServiceError> {
        self.destinations.lock().unwrap().push(destination.to_string());
        if let Some(message) = &self.failure {
            return Err(ServiceError::Rejected(message.clone()));
        }
        Ok(RouteStart {
            session_id: SessionId::new("nav-1"),
            total_steps: 3,
            first_instruction: Some("Go straight 30 meters".into()),
        })
    }

    async fn update_location(
        &self,
        _session_id: &SessionId,
        _coords: Coordinates,
    ) -> Result<LocationUpdate, ServiceError> {
        self.update_calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.update_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let rejected = self
            .failing_updates
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if rejected {
            return Err(ServiceError::Rejected("session not found".into()));
        }
        let queued = self.updates.lock().unwrap().pop_front();
        Ok(queued.unwrap_or(LocationUpdate {
            current_instruction: Some("Go straight 30 meters".into()),
            instruction_index: 0,
            total_steps: 3,
            completed: false,
        }))
    }

    async fn end_navigation(&self, session_id: &SessionId) -> Result<(), ServiceError> {
        self.ended.lock().unwrap().push(session_id.clone());
        if self.end_failing.load(Ordering::SeqCst) {
            return Err(ServiceError::Rejected("unknown session".into()));
        }
        Ok(())
    }
}

// ---- depth ----

pub struct FakeDepth {
    threshold_m: f64,
    distance_m: f64,
    factors: Mutex<Vec<f64>>,
    heights: Mutex<Vec<f64>>,
}

impl FakeDepth {
    /// Reports an obstacle at `distance_m`, warning when it is under `threshold_m`
    pub fn warning_below(threshold_m: f64, distance_m: f64) -> Arc<Self> {
        Arc::new(Self {
            threshold_m,
            distance_m,
            factors: Mutex::new(Vec::new()),
            heights: Mutex::new(Vec::new()),
        })
    }

    /// Calibration factors passed to each depth analysis
    pub fn factors(&self) -> Vec<f64> {
        self.factors.lock().unwrap().clone()
    }

    pub fn heights(&self) -> Vec<f64> {
        self.heights.lock().unwrap().clone()
    }
}

#[async_trait]
impl DepthService for FakeDepth {
    async fn calibrate(&self, _image: &ImagePayload, height_cm: f64) -> Result<f64, ServiceError> {
        self.heights.lock().unwrap().push(height_cm);
        tokio::time::sleep(Duration::from_secs(1)).await;
        Ok(0.9)
    }

    async fn analyze_depth(
        &self,
        _image: &ImagePayload,
        calibration_factor: f64,
    ) -> Result<ObstacleReport, ServiceError> {
        self.factors.lock().unwrap().push(calibration_factor);
        let distance = self.distance_m * calibration_factor;
        Ok(ObstacleReport {
            should_warn: distance < self.threshold_m,
            message: format!("Obstacle {distance:.1} m ahead"),
        })
    }
}

// ---- alerts ----

#[derive(Default)]
pub struct FakeAlerts {
    messages: Mutex<Vec<String>>,
}

impl FakeAlerts {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn messages(&self) -> Vec<String> {
        self.messages.lock().unwrap().clone()
    }
}

#[async_trait]
impl AlertSink for FakeAlerts {
    async fn alert(&self, message: &str) {
        self.messages.lock().unwrap().push(message.to_string());
    }
}

// ---- location ----

pub struct FakeLocation {
    available: bool,
    watcher: Mutex<Option<mpsc::Sender<Result<LocationFix, LocationError>>>>,
    last_timestamp: AtomicU64,
}

impl FakeLocation {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            available: true,
            watcher: Mutex::new(None),
            last_timestamp: AtomicU64::new(0),
        })
    }

    pub fn unavailable() -> Arc<Self> {
        Arc::new(Self {
            available: false,
            watcher: Mutex::new(None),
            last_timestamp: AtomicU64::new(0),
        })
    }

    /// Fresh fix with a strictly increasing timestamp; wall time does not
    /// advance under a paused test clock.
    fn fix(&self, coords: Coordinates) -> LocationFix {
        let previous = self.last_timestamp.load(Ordering::SeqCst);
        let timestamp_ms = now_ms().max(previous + 1);
        self.last_timestamp.store(timestamp_ms, Ordering::SeqCst);
        LocationFix {
            coords,
            accuracy_m: Some(5.0),
            timestamp_ms,
        }
    }

    /// Deliver a fix to the active subscription. False if nobody is watching.
    pub fn push(&self, coords: Coordinates) -> bool {
        let fix = self.fix(coords);
        match self.watcher.lock().unwrap().as_ref() {
            Some(tx) => tx.try_send(Ok(fix)).is_ok(),
            None => false,
        }
    }

    pub fn is_watched(&self) -> bool {
        self.watcher
            .lock()
            .unwrap()
            .as_ref()
            .is_some_and(|tx| !tx.is_closed())
    }
}

#[async_trait]
impl LocationProvider for FakeLocation {
    async fn current_fix(&self) -> Result<LocationFix, LocationError> {
        if !self.available {
            return Err(LocationError::Unavailable);
        }
        Ok(self.fix(Coordinates::new(126.9706, 37.5547)))
    }

    fn watch(&self) -> Result<LocationWatch, LocationError> {
        if !self.available {
            return Err(LocationError::Unavailable);
        }
        let (tx, rx) = mpsc::channel(16);
        *self.watcher.lock().unwrap() = Some(tx);
        Ok(rx)
    }
}

// ---- prompts ----

#[derive(Default)]
pub struct FakePrompter {
    confirms: Mutex<VecDeque<bool>>,
    texts: Mutex<VecDeque<Option<String>>>,
    default_confirm: AtomicBool,
    questions: Mutex<Vec<String>>,
}

impl FakePrompter {
    /// Unqueued confirmations answer no, unqueued text prompts are dismissed
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn answer_confirm(&self, answer: bool) {
        self.confirms.lock().unwrap().push_back(answer);
    }

    pub fn answer_text(&self, answer: Option<&str>) {
        self.texts
            .lock()
            .unwrap()
            .push_back(answer.map(str::to_string));
    }

    pub fn set_default_confirm(&self, answer: bool) {
        self.default_confirm.store(answer, Ordering::SeqCst);
    }

    pub fn questions(&self) -> Vec<String> {
        self.questions.lock().unwrap().clone()
    }
}

#[async_trait]
impl Prompter for FakePrompter {
    async fn confirm(&self, question: &str) -> bool {
        self.questions.lock().unwrap().push(question.to_string());
        self.confirms
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| self.default_confirm.load(Ordering::SeqCst))
    }

    async fn ask_text(&self, question: &str) -> Option<String> {
        self.questions.lock().unwrap().push(question.to_string());
        self.texts.lock().unwrap().pop_front().flatten()
    }
}

#[derive(Default)]
pub struct FakeRecognizer {
    heard: Mutex<Option<String>>,
    langs: Mutex<Vec<String>>,
}

impl FakeRecognizer {
    /// Hears nothing until [`FakeRecognizer::hears`] is called
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn hears(&self, text: &str) {
        *self.heard.lock().unwrap() = Some(text.to_string());
    }

    pub fn langs(&self) -> Vec<String> {
        self.langs.lock().unwrap().clone()
    }
}

#[async_trait]
impl SpeechRecognizer for FakeRecognizer {
    async fn listen(&self, lang: &str) -> Result<String, RecognitionError> {
        self.langs.lock().unwrap().push(lang.to_string());
        self.heard.lock().unwrap().clone().ok_or(RecognitionError::NoSpeech)
    }
}
