//! Single-job admission slot and the guard that releases it.
//!
//! ```text
//! try_claim() ──► OwnedSemaphorePermit ──► JobGuard::new ──► moved into production task
//!                                                               │
//!                         completion / abort / panic ──► Drop ──┘
//!                                                        ├─ clear start coils
//!                                                        ├─ clear abort coil
//!                                                        └─ release permit
//! ```
//!
//! # Invariants
//!
//! - At most one permit exists at any time.
//! - Coils are cleared before the permit is released, so a start request
//!   that races the release can never see the previous job's trigger.

use std::sync::Arc;

use otb_surface::ControlSurface;
use tokio::sync::{watch, OwnedSemaphorePermit, Semaphore};

use crate::ExecutorState;

#[derive(Debug, Clone)]
pub struct JobSlot {
    sem: Arc<Semaphore>,
}

impl Default for JobSlot {
    fn default() -> Self {
        Self::new()
    }
}

impl JobSlot {
    pub fn new() -> Self {
        Self {
            sem: Arc::new(Semaphore::new(1)),
        }
    }

    /// `None` while a job holds the slot.
    pub fn try_claim(&self) -> Option<OwnedSemaphorePermit> {
        Arc::clone(&self.sem).try_acquire_owned().ok()
    }

    pub fn is_busy(&self) -> bool {
        self.sem.available_permits() == 0
    }
}

/// Owns the slot for one job. Dropping it runs cleanup.
pub struct JobGuard {
    surface: Arc<ControlSurface>,
    state: Arc<watch::Sender<ExecutorState>>,
    permit: Option<OwnedSemaphorePermit>,
}

impl JobGuard {
    pub fn new(
        surface: Arc<ControlSurface>,
        state: Arc<watch::Sender<ExecutorState>>,
        permit: OwnedSemaphorePermit,
    ) -> Self {
        Self {
            surface,
            state,
            permit: Some(permit),
        }
    }

    pub(crate) fn surface(&self) -> &ControlSurface {
        &self.surface
    }

    pub(crate) fn set_state(&self, next: ExecutorState) {
        self.state.send_replace(next);
    }
}

impl Drop for JobGuard {
    fn drop(&mut self) {
        self.surface.clear_start_coils();
        self.surface.clear_abort();
        // A job that never reached Done was aborted or refused.
        self.state.send_if_modified(|s| {
            if *s == ExecutorState::Running {
                *s = ExecutorState::Idle;
                true
            } else {
                false
            }
        });
        drop(self.permit.take());
    }
}
