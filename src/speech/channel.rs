//! Latest-wins utterance channel over a [`SpeechEngine`]

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Instant;

use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{SpeechEngine, SpeechOutcome, VoiceSettings};

/// Completion of one `speak` call. Resolves exactly once.
#[derive(Debug)]
pub struct Utterance {
    id: u64,
    rx: oneshot::Receiver<SpeechOutcome>,
}

impl Utterance {
    /// Sequence number of this utterance
    pub fn id(&self) -> u64 {
        self.id
    }
}

impl Future for Utterance {
    type Output = SpeechOutcome;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        // A dropped sender means the playback task was torn down with the runtime.
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|r| r.unwrap_or(SpeechOutcome::Interrupted))
    }
}

struct Current {
    id: u64,
    cancel: CancellationToken,
}

struct Inner {
    current: Option<Current>,
    next_id: u64,
    voice: VoiceSettings,
}

/// Serializes narration into a single active utterance
pub struct SpeechChannel {
    engine: Arc<dyn SpeechEngine>,
    inner: Arc<Mutex<Inner>>,
}

impl SpeechChannel {
    pub fn new(engine: Arc<dyn SpeechEngine>, voice: VoiceSettings) -> Self {
        Self {
            engine,
            inner: Arc::new(Mutex::new(Inner {
                current: None,
                next_id: 1,
                voice,
            })),
        }
    }

    fn lock(inner: &Mutex<Inner>) -> std::sync::MutexGuard<'_, Inner> {
        inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Replace the rate/voice used for subsequent utterances
    pub fn set_voice(&self, voice: VoiceSettings) {
        Self::lock(&self.inner).voice = voice;
    }

    pub fn voice(&self) -> VoiceSettings {
        Self::lock(&self.inner).voice.clone()
    }

    /// Whether an utterance is currently playing
    pub fn is_speaking(&self) -> bool {
        Self::lock(&self.inner).current.is_some()
    }

    /// Speak `text`, cancelling whatever is playing.
    ///
    /// Must be called from within a tokio runtime.
    pub fn speak(&self, text: impl Into<String>) -> Utterance {
        let text = text.into();
        let (tx, rx) = oneshot::channel();
        let cancel = CancellationToken::new();

        let (id, voice) = {
            let mut inner = Self::lock(&self.inner);
            if let Some(prev) = inner.current.take() {
                debug!(id = prev.id, "superseding utterance");
                prev.cancel.cancel();
                self.engine.stop();
            }
            let id = inner.next_id;
            inner.next_id += 1;
            inner.current = Some(Current {
                id,
                cancel: cancel.clone(),
            });
            (id, inner.voice.clone())
        };

        debug!(id, rate = voice.rate, %text, "speech started");

        let engine = Arc::clone(&self.engine);
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            let started = Instant::now();
            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => SpeechOutcome::Interrupted,
                result = engine.play(&text, &voice) => match result {
                    Ok(()) => SpeechOutcome::Completed,
                    Err(e) => {
                        warn!(id, ?e, "speech playback error");
                        SpeechOutcome::Failed(e.to_string())
                    }
                },
            };

            {
                let mut inner = Self::lock(&inner);
                if inner.current.as_ref().map(|c| c.id) == Some(id) {
                    inner.current = None;
                }
            }

            debug!(
                id,
                ?outcome,
                duration_ms = started.elapsed().as_millis() as u64,
                "speech finished"
            );
            let _ = tx.send(outcome);
        });

        Utterance { id, rx }
    }

    /// Stop the current utterance, if any
    pub fn cancel(&self) {
        let prev = Self::lock(&self.inner).current.take();
        if let Some(prev) = prev {
            debug!(id = prev.id, "speech cancelled");
            prev.cancel.cancel();
            self.engine.stop();
        }
    }
}
