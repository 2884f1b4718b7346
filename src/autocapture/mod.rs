//! Auto-capture loop
//!
//! Produces ticks that ask the coordinator to run one analysis chain. Under
//! the completion-chained policy the next tick is issued when the previous
//! chain's narration finishes; under the interval-chained policy a fixed timer
//! ticks regardless, and ticks that find a chain outstanding are rejected as
//! busy by the coordinator.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// How the loop advances
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChainingPolicy {
    /// Next iteration after the previous narration completes
    #[default]
    CompletionChained,
    /// Next iteration on a fixed timer
    IntervalChained,
}

impl std::fmt::Display for ChainingPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChainingPolicy::CompletionChained => write!(f, "completion-chained"),
            ChainingPolicy::IntervalChained => write!(f, "interval-chained"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Stopped,
    Running,
}

/// Request to run one iteration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoopTick {
    pub generation: u64,
}

/// Errors from loop configuration
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LoopError {
    #[error("cannot change the loop while it is running")]
    Running,

    #[error("interval must be between 1 and 60 seconds")]
    InvalidInterval,
}

/// The auto-capture loop owned by the coordinator
#[derive(Debug)]
pub struct AutoCaptureLoop {
    state: LoopState,
    policy: ChainingPolicy,
    interval: Duration,
    generation: u64,
    timer: Option<CancellationToken>,
    deferred: bool,
}

impl AutoCaptureLoop {
    pub fn new(policy: ChainingPolicy, interval: Duration) -> Self {
        Self {
            state: LoopState::Stopped,
            policy,
            interval,
            generation: 0,
            timer: None,
            deferred: false,
        }
    }

    pub fn state(&self) -> LoopState {
        self.state
    }

    pub fn is_running(&self) -> bool {
        self.state == LoopState::Running
    }

    pub fn policy(&self) -> ChainingPolicy {
        self.policy
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn set_policy(&mut self, policy: ChainingPolicy) -> Result<(), LoopError> {
        if self.is_running() {
            return Err(LoopError::Running);
        }
        self.policy = policy;
        Ok(())
    }

    pub fn set_interval(&mut self, secs: u64) -> Result<(), LoopError> {
        if self.is_running() {
            return Err(LoopError::Running);
        }
        if !(1..=60).contains(&secs) {
            return Err(LoopError::InvalidInterval);
        }
        self.interval = Duration::from_secs(secs);
        Ok(())
    }

    /// Start the loop. Returns false if it was already running.
    pub fn start<M>(&mut self, tx: &mpsc::UnboundedSender<M>, start_delay: Option<Duration>) -> bool
    where
        M: From<LoopTick> + Send + 'static,
    {
        if self.is_running() {
            debug!("auto-capture already running");
            return false;
        }
        self.cancel_timer();
        self.generation += 1;
        self.state = LoopState::Running;
        self.deferred = false;
        info!(
            generation = self.generation,
            policy = %self.policy,
            interval_ms = self.interval.as_millis() as u64,
            "auto-capture started"
        );

        match self.policy {
            ChainingPolicy::CompletionChained => match start_delay {
                Some(delay) if !delay.is_zero() => self.schedule_once(tx, delay),
                _ => self.tick_now(tx),
            },
            ChainingPolicy::IntervalChained => {
                let first = start_delay.unwrap_or(self.interval);
                self.schedule_repeating(tx, first);
            }
        }
        true
    }

    /// Stop the loop and invalidate every pending tick. Returns false if it
    /// was not running.
    pub fn stop(&mut self) -> bool {
        self.cancel_timer();
        self.deferred = false;
        if !self.is_running() {
            return false;
        }
        self.generation += 1;
        self.state = LoopState::Stopped;
        info!(generation = self.generation, "auto-capture stopped");
        true
    }

    /// Whether a tick belongs to the running loop
    pub fn accepts(&self, generation: u64) -> bool {
        self.is_running() && generation == self.generation
    }

    /// A chain started by this loop finished its narration
    pub fn chain_finished<M>(&mut self, tx: &mpsc::UnboundedSender<M>, generation: u64)
    where
        M: From<LoopTick> + Send + 'static,
    {
        if self.policy == ChainingPolicy::CompletionChained && self.accepts(generation) {
            self.tick_now(tx);
        }
    }

    /// A tick arrived while the device was lent to calibration
    pub fn defer(&mut self) {
        if self.is_running() {
            self.deferred = true;
        }
    }

    /// Replay a deferred tick, once
    pub fn resume_deferred<M>(&mut self, tx: &mpsc::UnboundedSender<M>)
    where
        M: From<LoopTick> + Send + 'static,
    {
        if std::mem::take(&mut self.deferred) && self.is_running() {
            debug!(generation = self.generation, "replaying deferred tick");
            self.tick_now(tx);
        }
    }

    fn cancel_timer(&mut self) {
        if let Some(token) = self.timer.take() {
            token.cancel();
        }
    }

    fn tick_now<M>(&self, tx: &mpsc::UnboundedSender<M>)
    where
        M: From<LoopTick> + Send + 'static,
    {
        let _ = tx.send(M::from(LoopTick {
            generation: self.generation,
        }));
    }

    fn schedule_once<M>(&mut self, tx: &mpsc::UnboundedSender<M>, delay: Duration)
    where
        M: From<LoopTick> + Send + 'static,
    {
        let token = CancellationToken::new();
        self.timer = Some(token.clone());
        let tx = tx.clone();
        let tick = LoopTick {
            generation: self.generation,
        };
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    let _ = tx.send(M::from(tick));
                }
            }
        });
    }

    fn schedule_repeating<M>(&mut self, tx: &mpsc::UnboundedSender<M>, first: Duration)
    where
        M: From<LoopTick> + Send + 'static,
    {
        let token = CancellationToken::new();
        self.timer = Some(token.clone());
        let tx = tx.clone();
        let tick = LoopTick {
            generation: self.generation,
        };
        let period = self.interval;
        tokio::spawn(async move {
            let mut timer = interval_at(Instant::now() + first, period);
            timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = timer.tick() => {
                        if tx.send(M::from(tick)).is_err() {
                            break;
                        }
                    }
                }
            }
        });
    }
}

impl Drop for AutoCaptureLoop {
    fn drop(&mut self) {
        self.cancel_timer();
    }
}
