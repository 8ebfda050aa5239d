//! Device-side coordinator.
//!
//! One task consumes [`SurfaceEvent`]s in order. Admission runs inline on
//! that task, production runs on its own task, so event handling never
//! waits for a job.
//!
//! ```text
//! SurfaceEvent ──► handle()
//!                    ├─ holding write  ─► log only
//!                    ├─ abort coil     ─► abort running task if holding[14]
//!                    │                     names its nonce, await it
//!                    └─ start coil set ─► claim slot ─► AuthGuard ─► read params
//!                                                          │
//!                                     reset progress, echo order id + nonce
//!                                                          │
//!                                            spawn ProductionExecutor(JobGuard)
//! ```

use std::sync::Arc;
use std::time::Duration;

use otb_surface::map::{COIL_ABORT, COIL_START, COIL_START_ALT, HR_ABORT_NONCE};
use otb_surface::{AddressingMode, ControlSurface, StartParameters, SurfaceEvent};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::{AuthGuard, ExecutorState, Job, JobGuard, JobSlot, ProductionExecutor, Rejection};

/// Device behaviour knobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceSettings {
    pub key: i16,
    pub tick: Duration,
    pub addressing: AddressingMode,
    pub replay_window: usize,
}

/// What one event did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventOutcome {
    Ignored,
    Admitted(Job),
    Rejected(Rejection),
    Aborted { order_id: i16 },
}

struct RunningJob {
    order_id: i16,
    nonce: i16,
    handle: JoinHandle<()>,
}

pub struct DeviceController {
    surface: Arc<ControlSurface>,
    settings: DeviceSettings,
    auth: AuthGuard,
    slot: JobSlot,
    state: Arc<watch::Sender<ExecutorState>>,
    current: Option<RunningJob>,
}

impl DeviceController {
    pub fn new(surface: Arc<ControlSurface>, settings: DeviceSettings) -> Self {
        Self {
            auth: AuthGuard::new(settings.key, settings.replay_window),
            surface,
            settings,
            slot: JobSlot::new(),
            state: Arc::new(watch::channel(ExecutorState::Idle).0),
            current: None,
        }
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ExecutorState> {
        self.state.subscribe()
    }

    pub fn is_busy(&self) -> bool {
        self.slot.is_busy()
    }

    /// Consume events until every sender is gone. A job still running at
    /// that point is aborted.
    pub async fn run(mut self, mut events: mpsc::UnboundedReceiver<SurfaceEvent>) {
        info!(
            addressing = ?self.settings.addressing,
            tick_ms = self.settings.tick.as_millis() as u64,
            replay_window = self.settings.replay_window,
            "device controller started"
        );
        while let Some(event) = events.recv().await {
            self.handle(event).await;
        }
        if let Some(job) = self.current.take() {
            job.handle.abort();
            let _ = job.handle.await;
        }
        info!("device controller stopped");
    }

    /// Apply one event.
    pub async fn handle(&mut self, event: SurfaceEvent) -> EventOutcome {
        self.reap();

        match event {
            SurfaceEvent::HoldingChanged { start, count } => {
                debug!(start, count, "holding registers written");
                EventOutcome::Ignored
            }
            SurfaceEvent::CoilsChanged { .. } => {
                // Admission clears the coil, so the target register decides.
                if event.touches(COIL_ABORT) {
                    if let Some(outcome) = self.abort().await {
                        return outcome;
                    }
                }
                let touches_start = event.touches(COIL_START) || event.touches(COIL_START_ALT);
                if touches_start && self.surface.start_requested() {
                    return match self.admit() {
                        Ok(job) => EventOutcome::Admitted(job),
                        Err(r) => EventOutcome::Rejected(r),
                    };
                }
                EventOutcome::Ignored
            }
        }
    }

    fn reap(&mut self) {
        if self.current.as_ref().is_some_and(|j| j.handle.is_finished()) {
            self.current = None;
        }
    }

    /// Abort the running job if `holding[HR_ABORT_NONCE]` names it. `None`
    /// when the request targets nothing that runs here.
    async fn abort(&mut self) -> Option<EventOutcome> {
        let target = self.surface.holding(HR_ABORT_NONCE);
        if self.current.as_ref().map(|j| j.nonce) != Some(target) {
            if self.surface.abort_requested() {
                debug!(target, "abort ignored: no running job with that nonce");
                self.surface.clear_abort();
            }
            return None;
        }
        let job = self.current.take()?;
        job.handle.abort();
        // Guard cleanup has run once the task is joined.
        let _ = job.handle.await;
        warn!(order_id = job.order_id, nonce = job.nonce, "production aborted by request");
        Some(EventOutcome::Aborted {
            order_id: job.order_id,
        })
    }

    fn admit(&mut self) -> Result<Job, Rejection> {
        let Some(permit) = self.slot.try_claim() else {
            warn!("start rejected: a job is already running");
            return Err(Rejection::Busy);
        };
        // From here on every exit path drops the guard, which clears the
        // start coils and frees the slot.
        let guard = JobGuard::new(Arc::clone(&self.surface), Arc::clone(&self.state), permit);

        let (key, nonce) = StartParameters::read_credentials(&self.surface, self.settings.addressing)
            .map_err(|m| reject(Rejection::MissingParameter(m.0)))?;
        self.auth.admit(key, nonce).map_err(reject)?;

        let params = StartParameters::read(&self.surface, self.settings.addressing)
            .map_err(|m| reject(Rejection::MissingParameter(m.0)))?;
        let job = Job {
            order_id: params.order_id,
            quantity: params.quantity.max(0) as u32,
        };

        self.surface.clear_abort();
        self.surface.reset_progress();
        self.surface.set_active_job(job.order_id, nonce);

        let exec = ProductionExecutor::new(job, self.settings.tick, guard);
        self.current = Some(RunningJob {
            order_id: job.order_id,
            nonce,
            handle: tokio::spawn(exec.run()),
        });
        info!(order_id = job.order_id, quantity = job.quantity, nonce, "job admitted");
        Ok(job)
    }
}

fn reject(r: Rejection) -> Rejection {
    warn!(reason = %r, "start rejected");
    r
}

#[cfg(test)]
mod tests {
    use super::*;
    use otb_surface::map::{HR_AUTH_KEY, HR_PRESENCE, IR_ACTIVE_NONCE, IR_ACTIVE_ORDER};
    use otb_surface::StartTransaction;

    const KEY: i16 = 0xBEEFu16 as i16;
    const START: SurfaceEvent = SurfaceEvent::CoilsChanged {
        start: COIL_START,
        count: 1,
    };
    const ABORT: SurfaceEvent = SurfaceEvent::CoilsChanged {
        start: COIL_ABORT,
        count: 1,
    };

    fn controller() -> (DeviceController, Arc<ControlSurface>) {
        let surface = Arc::new(ControlSurface::new());
        let settings = DeviceSettings {
            key: KEY,
            tick: Duration::from_secs(1),
            addressing: AddressingMode::Explicit,
            replay_window: 1,
        };
        (DeviceController::new(Arc::clone(&surface), settings), surface)
    }

    fn request(surface: &ControlSurface, order_id: i64, qty: i32, key: i16, nonce: i16) {
        let tx = StartTransaction::new(order_id, qty, key, nonce).unwrap();
        for (addr, v) in tx.register_writes() {
            surface.set_holding(addr, v);
        }
        surface.set_coil(COIL_START, true);
    }

    #[tokio::test(start_paused = true)]
    async fn admitted_job_echoes_order_and_resets_progress() {
        let (mut c, s) = controller();
        s.publish_produced(9);
        s.mark_done();
        request(&s, 12, 3, KEY, 41);

        assert_eq!(
            c.handle(START).await,
            EventOutcome::Admitted(Job {
                order_id: 12,
                quantity: 3
            })
        );
        assert_eq!(s.input(IR_ACTIVE_ORDER), 12);
        assert_eq!(s.input(IR_ACTIVE_NONCE), 41);
        assert_eq!(s.produced(), 0);
        assert!(!s.done());
        assert!(c.is_busy());
    }

    #[tokio::test(start_paused = true)]
    async fn busy_start_is_rejected_without_touching_anything() {
        let (mut c, s) = controller();
        request(&s, 1, 5, KEY, 1);
        c.handle(START).await;
        tokio::time::sleep(Duration::from_millis(2_500)).await;

        request(&s, 2, 5, KEY, 2);
        assert_eq!(c.handle(START).await, EventOutcome::Rejected(Rejection::Busy));
        assert_eq!(s.active_order(), 1);
        assert_eq!(s.produced(), 2, "first job unaffected");
        assert!(s.start_requested(), "busy path leaves coils alone");
    }

    #[tokio::test(start_paused = true)]
    async fn wrong_key_clears_coils_and_frees_slot() {
        let (mut c, s) = controller();
        request(&s, 1, 1, 0x1234, 1);
        assert_eq!(c.handle(START).await, EventOutcome::Rejected(Rejection::WrongKey));
        assert!(!s.start_requested());
        assert!(!c.is_busy());
    }

    #[tokio::test(start_paused = true)]
    async fn replayed_nonce_is_rejected_after_completion() {
        let (mut c, s) = controller();
        request(&s, 1, 1, KEY, 44);
        c.handle(START).await;
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(s.done());
        assert!(!c.is_busy());

        request(&s, 1, 1, KEY, 44);
        assert_eq!(
            c.handle(START).await,
            EventOutcome::Rejected(Rejection::ReplayedNonce(44))
        );
        assert!(!s.start_requested());
    }

    #[tokio::test(start_paused = true)]
    async fn missing_presence_bit_is_rejected() {
        let (mut c, s) = controller();
        request(&s, 1, 1, KEY, 3);
        s.set_holding(HR_PRESENCE, 0);
        assert_eq!(
            c.handle(START).await,
            EventOutcome::Rejected(Rejection::MissingParameter("key"))
        );
        assert!(!c.is_busy());
    }

    #[tokio::test(start_paused = true)]
    async fn abort_stops_job_and_cleans_up() {
        let (mut c, s) = controller();
        request(&s, 7, 50, KEY, 1);
        c.handle(START).await;
        tokio::time::sleep(Duration::from_millis(3_500)).await;

        s.set_holding(HR_ABORT_NONCE, 1);
        s.set_coil(COIL_ABORT, true);
        assert_eq!(c.handle(ABORT).await, EventOutcome::Aborted { order_id: 7 });
        assert!(!c.is_busy());
        assert!(!s.start_requested());
        assert!(!s.abort_requested());

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(s.produced(), 3, "nothing produced after abort");
        assert!(!s.done());
    }

    #[tokio::test(start_paused = true)]
    async fn abort_for_another_nonce_leaves_running_job_alone() {
        let (mut c, s) = controller();
        request(&s, 7, 5, KEY, 1);
        c.handle(START).await;
        tokio::time::sleep(Duration::from_millis(1_500)).await;

        s.set_holding(HR_ABORT_NONCE, 99);
        s.set_coil(COIL_ABORT, true);
        assert_eq!(c.handle(ABORT).await, EventOutcome::Ignored);
        assert!(c.is_busy());
        assert!(!s.abort_requested());

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(s.done(), "job ran to completion");
        assert_eq!(s.produced(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn abort_queued_behind_its_start_still_lands() {
        let (mut c, s) = controller();
        // Both writes hit the surface before the device sees either event.
        request(&s, 8, 5, KEY, 6);
        s.set_holding(HR_ABORT_NONCE, 6);
        s.set_coil(COIL_ABORT, true);

        assert!(matches!(c.handle(START).await, EventOutcome::Admitted(_)));
        assert!(!s.abort_requested(), "admission clears the abort coil");
        assert_eq!(c.handle(ABORT).await, EventOutcome::Aborted { order_id: 8 });
        assert!(!c.is_busy());
    }

    #[tokio::test(start_paused = true)]
    async fn holding_writes_and_cleared_coils_are_ignored() {
        let (mut c, s) = controller();
        s.set_holding(HR_AUTH_KEY, KEY);
        assert_eq!(
            c.handle(SurfaceEvent::HoldingChanged {
                start: HR_AUTH_KEY,
                count: 1
            })
            .await,
            EventOutcome::Ignored
        );
        // Coil event with no start coil set.
        assert_eq!(c.handle(START).await, EventOutcome::Ignored);
        assert_eq!(c.handle(ABORT).await, EventOutcome::Ignored);
    }

    #[tokio::test(start_paused = true)]
    async fn negative_quantity_is_clamped_in_legacy_mode() {
        let surface = Arc::new(ControlSurface::new());
        let mut c = DeviceController::new(
            Arc::clone(&surface),
            DeviceSettings {
                key: KEY,
                tick: Duration::from_secs(1),
                addressing: AddressingMode::Legacy,
                replay_window: 1,
            },
        );
        surface.set_holding(otb_surface::map::HR_ORDER_ID, 3);
        surface.set_holding(otb_surface::map::HR_QUANTITY, -5);
        surface.set_holding(HR_AUTH_KEY, KEY);
        surface.set_holding(otb_surface::map::HR_NONCE, 9);
        surface.set_coil(COIL_START, true);
        assert_eq!(
            c.handle(START).await,
            EventOutcome::Admitted(Job {
                order_id: 3,
                quantity: 0
            })
        );
    }
}
