//! Busy gate for the capture → describe → narrate chain
//!
//! Only one analysis chain may be outstanding. A second attempt is refused
//! locally, without touching the network.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, info};

use crate::backend::{Description, DescriptionService, NavigationContext, ServiceError};
use crate::capture::{CaptureError, ImagePayload};

/// Errors ending an analysis chain
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AnalysisError {
    #[error("an analysis is already in progress")]
    Busy,

    #[error(transparent)]
    Capture(#[from] CaptureError),

    #[error(transparent)]
    Service(#[from] ServiceError),
}

/// Admits at most one analysis chain at a time
#[derive(Debug, Clone, Default)]
pub struct AnalysisGate {
    busy: Arc<AtomicBool>,
    next_id: Arc<AtomicU64>,
}

impl AnalysisGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim the gate, or `Busy` if a chain is outstanding
    pub fn try_begin(&self) -> Result<AnalysisPermit, AnalysisError> {
        if self
            .busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("analysis request rejected: busy");
            return Err(AnalysisError::Busy);
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        Ok(AnalysisPermit {
            id,
            busy: Arc::clone(&self.busy),
            started: Instant::now(),
        })
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }
}

/// Proof that the holder owns the single analysis slot. Released on drop.
#[derive(Debug)]
pub struct AnalysisPermit {
    id: u64,
    busy: Arc<AtomicBool>,
    started: Instant,
}

impl AnalysisPermit {
    pub fn id(&self) -> u64 {
        self.id
    }
}

impl Drop for AnalysisPermit {
    fn drop(&mut self) {
        self.busy.store(false, Ordering::Release);
        debug!(
            chain = self.id,
            duration_ms = self.started.elapsed().as_millis() as u64,
            "analysis slot released"
        );
    }
}

/// Remote description call. Requires the analysis permit.
pub async fn describe(
    service: &dyn DescriptionService,
    permit: &AnalysisPermit,
    image: &ImagePayload,
    model: &str,
    context: Option<&NavigationContext>,
) -> Result<Description, AnalysisError> {
    let started = Instant::now();
    let result = service.describe(image, model, context).await;
    info!(
        chain = permit.id(),
        model,
        navigation = context.is_some(),
        ok = result.is_ok(),
        duration_ms = started.elapsed().as_millis() as u64,
        "description call finished"
    );
    Ok(result?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_chain_is_busy() {
        let gate = AnalysisGate::new();
        let permit = gate.try_begin().unwrap();
        assert!(gate.is_busy());
        assert_eq!(gate.try_begin().unwrap_err(), AnalysisError::Busy);

        drop(permit);
        assert!(!gate.is_busy());
        assert_eq!(gate.try_begin().unwrap().id(), 2);
    }

    #[test]
    fn test_clones_share_the_slot() {
        let gate = AnalysisGate::new();
        let other = gate.clone();
        let _permit = gate.try_begin().unwrap();
        assert!(other.try_begin().is_err());
    }
}
