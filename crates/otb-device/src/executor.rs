//! Production of one admitted job.
//!
//! `Idle → Running → Done`. Running publishes one unit per tick to both
//! produced-count mirrors; Done sets both completion bits. Cleanup is owned
//! by the [`JobGuard`] the executor carries, so an aborted task cleans up
//! exactly like a finished one.

use std::time::Duration;

use tracing::{debug, info};

use crate::JobGuard;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutorState {
    Idle,
    Running,
    Done,
}

impl ExecutorState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutorState::Idle => "IDLE",
            ExecutorState::Running => "RUNNING",
            ExecutorState::Done => "DONE",
        }
    }
}

/// Parameters of an admitted job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Job {
    pub order_id: i16,
    /// Already clamped to non-negative.
    pub quantity: u32,
}

pub struct ProductionExecutor {
    job: Job,
    tick: Duration,
    guard: JobGuard,
}

impl ProductionExecutor {
    pub fn new(job: Job, tick: Duration, guard: JobGuard) -> Self {
        Self { job, tick, guard }
    }

    /// Produce `quantity` units, then mark the job done.
    ///
    /// Quantity 0 goes straight to Done without waiting a tick.
    pub async fn run(self) {
        let Self { job, tick, guard } = self;
        guard.set_state(ExecutorState::Running);
        info!(order_id = job.order_id, quantity = job.quantity, "production started");

        for produced in 1..=job.quantity {
            tokio::time::sleep(tick).await;
            guard.surface().publish_produced(produced);
            debug!(order_id = job.order_id, produced, "unit produced");
        }

        guard.surface().mark_done();
        guard.set_state(ExecutorState::Done);
        info!(order_id = job.order_id, quantity = job.quantity, "production done");
        // `guard` drops here: coils cleared, slot released.
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use otb_surface::map::COIL_START;
    use otb_surface::ControlSurface;
    use tokio::sync::watch;

    use super::*;
    use crate::JobSlot;

    fn setup() -> (
        Arc<ControlSurface>,
        JobSlot,
        Arc<watch::Sender<ExecutorState>>,
    ) {
        (
            Arc::new(ControlSurface::new()),
            JobSlot::new(),
            Arc::new(watch::channel(ExecutorState::Idle).0),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn produces_one_unit_per_tick_then_done() {
        let (surface, slot, state) = setup();
        surface.set_coil(COIL_START, true);
        let guard = JobGuard::new(Arc::clone(&surface), Arc::clone(&state), slot.try_claim().unwrap());
        let exec = ProductionExecutor::new(
            Job {
                order_id: 4,
                quantity: 3,
            },
            Duration::from_secs(1),
            guard,
        );
        let task = tokio::spawn(exec.run());

        tokio::time::sleep(Duration::from_millis(1_500)).await;
        assert_eq!(surface.produced(), 1);
        assert_eq!(*state.borrow(), ExecutorState::Running);
        assert!(slot.is_busy());
        assert!(!surface.done());

        task.await.unwrap();
        assert_eq!(surface.produced(), 3);
        assert!(surface.done());
        assert!(!surface.start_requested());
        assert!(!slot.is_busy());
        assert_eq!(*state.borrow(), ExecutorState::Done);
    }

    #[tokio::test(start_paused = true)]
    async fn zero_quantity_is_done_without_ticking() {
        let (surface, slot, state) = setup();
        let guard = JobGuard::new(Arc::clone(&surface), state, slot.try_claim().unwrap());
        let start = tokio::time::Instant::now();
        ProductionExecutor::new(
            Job {
                order_id: 1,
                quantity: 0,
            },
            Duration::from_secs(1),
            guard,
        )
        .run()
        .await;
        assert_eq!(start.elapsed(), Duration::ZERO);
        assert!(surface.done());
        assert_eq!(surface.produced(), 0);
        assert!(!slot.is_busy());
    }

    #[tokio::test(start_paused = true)]
    async fn abort_runs_guard_cleanup() {
        let (surface, slot, state) = setup();
        surface.set_coil(COIL_START, true);
        let guard = JobGuard::new(Arc::clone(&surface), Arc::clone(&state), slot.try_claim().unwrap());
        let task = tokio::spawn(
            ProductionExecutor::new(
                Job {
                    order_id: 2,
                    quantity: 100,
                },
                Duration::from_secs(1),
                guard,
            )
            .run(),
        );
        tokio::time::sleep(Duration::from_millis(2_500)).await;
        task.abort();
        assert!(task.await.unwrap_err().is_cancelled());

        assert_eq!(surface.produced(), 2);
        assert!(!surface.done());
        assert!(!surface.start_requested());
        assert!(!slot.is_busy());
        assert_eq!(*state.borrow(), ExecutorState::Idle);
    }
}
