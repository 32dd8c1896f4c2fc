//! Lifecycle controller: drives workers through their state machine.
//!
//! Owns the cloud and inference collaborators and the two background loops
//! (idle-eviction and reservation-expiry). Request handlers call `resume`,
//! `pause` and `ensure_model_loaded`; the loops run independently and only
//! touch the registry through its operations.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::cloud::{CloudControl, WorkspaceStatus};
use crate::config::TimingConfig;
use crate::error::AppError;
use crate::ollama::InferenceBackend;
use crate::registry::{ModelInfo, WorkerRegistry, WorkerState};

/// How often the idle-eviction loop scans the fleet.
const IDLE_EVICTION_INTERVAL: Duration = Duration::from_secs(60);

/// How often expired reservations are swept.
const RESERVATION_EXPIRY_INTERVAL: Duration = Duration::from_secs(30);

/// Poll interval while waiting for the cloud to report a status change.
const CLOUD_POLL_INTERVAL_SECONDS: u64 = 10;

/// Drives worker state transitions via the cloud and inference collaborators.
pub struct LifecycleController {
    registry: WorkerRegistry,
    cloud: Arc<dyn CloudControl>,
    inference: Arc<dyn InferenceBackend>,
    timing: TimingConfig,
}

impl std::fmt::Debug for LifecycleController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LifecycleController")
            .field("timing", &self.timing)
            .finish_non_exhaustive()
    }
}

impl LifecycleController {
    /// Creates a controller over the given registry and collaborators.
    pub fn new(
        registry: WorkerRegistry,
        cloud: Arc<dyn CloudControl>,
        inference: Arc<dyn InferenceBackend>,
        timing: TimingConfig,
    ) -> Self {
        Self {
            registry,
            cloud,
            inference,
            timing,
        }
    }

    /// Resumes a paused worker and waits for it to come up.
    ///
    /// A worker that is already active (or mid-start under another request's
    /// control) is a no-op success; the caller polls the registry for
    /// readiness. Failure paths park the worker in `Error`.
    pub async fn resume(&self, worker_id: &str) -> Result<(), AppError> {
        let worker = self
            .registry
            .get(worker_id)
            .ok_or_else(|| AppError::NotFound(worker_id.to_string()))?;

        match worker.state {
            WorkerState::Paused => {}
            WorkerState::Starting => return Ok(()),
            state if state.is_active() => return Ok(()),
            state => {
                return Err(AppError::BadState(format!(
                    "GPU {worker_id} cannot be resumed from state {state:?}"
                )))
            }
        }

        self.registry.set_state(worker_id, WorkerState::Starting)?;
        info!(worker_id = %worker_id, "Starting GPU");

        if let Err(err) = self.cloud.resume_workspace(worker_id).await {
            error!(worker_id = %worker_id, error = %err, "Cloud resume call failed");
            self.registry.set_state(worker_id, WorkerState::Error)?;
            return Err(AppError::ResumeFailed(err.to_string()));
        }

        let running = self
            .cloud
            .wait_for_workspace_status(
                worker_id,
                WorkspaceStatus::Running,
                self.timing.startup_timeout_seconds,
                CLOUD_POLL_INTERVAL_SECONDS,
            )
            .await
            .map_err(|err| {
                let _ = self.registry.set_state(worker_id, WorkerState::Error);
                AppError::ResumeFailed(err.to_string())
            })?;

        if !running {
            error!(worker_id = %worker_id, "GPU failed to start within timeout");
            self.registry.set_state(worker_id, WorkerState::Error)?;
            return Err(AppError::ResumeFailed(format!(
                "GPU {worker_id} did not reach running within {}s",
                self.timing.startup_timeout_seconds
            )));
        }

        // The workspace is up, but the inference server needs a moment.
        if self.timing.ollama_readiness_wait_seconds > 0 {
            tokio::time::sleep(Duration::from_secs(self.timing.ollama_readiness_wait_seconds))
                .await;
        }

        self.registry.set_state(worker_id, WorkerState::Idle)?;
        info!(worker_id = %worker_id, "GPU started");
        Ok(())
    }

    /// Whether a worker in `state` may be paused.
    pub fn can_pause(state: WorkerState) -> bool {
        matches!(state, WorkerState::Idle | WorkerState::ModelReady)
    }

    /// Pauses a worker via the cloud control plane.
    ///
    /// Refused while requests are in flight or outside `Idle`/`ModelReady`.
    pub async fn pause(&self, worker_id: &str) -> Result<(), AppError> {
        let worker = self
            .registry
            .get(worker_id)
            .ok_or_else(|| AppError::NotFound(worker_id.to_string()))?;

        if worker.active_requests > 0 {
            return Err(AppError::BadState(format!(
                "GPU {worker_id} has active requests, cannot pause"
            )));
        }

        if !Self::can_pause(worker.state) {
            return Err(AppError::BadState(format!(
                "GPU {worker_id} cannot be paused from state {:?}",
                worker.state
            )));
        }

        self.registry.set_state(worker_id, WorkerState::Pausing)?;
        self.registry.set_model(worker_id, None)?;
        info!(worker_id = %worker_id, "Pausing GPU");

        if let Err(err) = self.cloud.pause_workspace(worker_id).await {
            error!(worker_id = %worker_id, error = %err, "Cloud pause call failed");
            self.registry.set_state(worker_id, WorkerState::Error)?;
            return Err(AppError::Cloud(err));
        }

        self.registry.set_state(worker_id, WorkerState::Paused)?;
        info!(worker_id = %worker_id, "GPU paused");
        Ok(())
    }

    /// Loads `model` on the worker and records it in the registry.
    ///
    /// On failure the worker goes to `Error` and its reservation is dropped;
    /// the current request fails rather than retrying the same worker.
    pub async fn ensure_model_loaded(
        &self,
        worker_id: &str,
        model: &str,
        context_length: Option<u32>,
    ) -> Result<(), AppError> {
        let worker = self
            .registry
            .get(worker_id)
            .ok_or_else(|| AppError::NotFound(worker_id.to_string()))?;

        if !matches!(worker.state, WorkerState::Idle | WorkerState::ModelReady) {
            return Err(AppError::BadState(format!(
                "GPU {worker_id} cannot load a model in state {:?}",
                worker.state
            )));
        }

        self.registry.set_state(worker_id, WorkerState::LoadingModel)?;
        info!(worker_id = %worker_id, model = %model, "Loading model");

        match self
            .inference
            .preload_model(&worker.ip, model, context_length)
            .await
        {
            Ok(()) => {
                self.registry
                    .set_model(worker_id, Some(ModelInfo::new(model, context_length)))?;
                self.registry.set_state(worker_id, WorkerState::ModelReady)?;
                Ok(())
            }
            Err(err) => {
                error!(worker_id = %worker_id, model = %model, error = %err, "Model load failed");
                self.registry.set_state(worker_id, WorkerState::Error)?;
                self.registry.clear_reservation(worker_id)?;
                Err(err)
            }
        }
    }

    /// One idle-eviction pass: pause workers idle past the threshold.
    pub async fn run_idle_eviction_once(&self) {
        for worker_id in self
            .registry
            .idle_eviction_candidates(self.timing.reservation_minutes)
        {
            info!(worker_id = %worker_id, "GPU idle too long, pausing");
            if let Err(err) = self.pause(&worker_id).await {
                // A request may have slipped in between the scan and here.
                warn!(worker_id = %worker_id, error = %err, "Idle eviction pause failed");
            }
        }
    }

    /// One reservation-expiry pass.
    pub fn run_reservation_expiry_once(&self) {
        let cleared = self.registry.expire_reservations();
        if cleared > 0 {
            debug!(cleared, "Cleared expired reservations");
        }
    }

    /// Spawns the two background loops.
    ///
    /// Each loop stops within one tick of the shutdown signal flipping to
    /// true, and logs-and-continues on transient errors.
    pub fn spawn_background_loops(
        self: Arc<Self>,
        shutdown: watch::Receiver<bool>,
    ) -> Vec<JoinHandle<()>> {
        let idle_controller = Arc::clone(&self);
        let mut idle_shutdown = shutdown.clone();
        let idle_loop = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(IDLE_EVICTION_INTERVAL);
            loop {
                tokio::select! {
                    _ = ticker.tick() => idle_controller.run_idle_eviction_once().await,
                    _ = idle_shutdown.changed() => {
                        if *idle_shutdown.borrow() {
                            debug!("Idle eviction loop stopping");
                            break;
                        }
                    }
                }
            }
        });

        let expiry_controller = Arc::clone(&self);
        let mut expiry_shutdown = shutdown.clone();
        let expiry_loop = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(RESERVATION_EXPIRY_INTERVAL);
            loop {
                tokio::select! {
                    _ = ticker.tick() => expiry_controller.run_reservation_expiry_once(),
                    _ = expiry_shutdown.changed() => {
                        if *expiry_shutdown.borrow() {
                            debug!("Reservation expiry loop stopping");
                            break;
                        }
                    }
                }
            }
        });

        info!("Started background monitoring loops");
        vec![idle_loop, expiry_loop]
    }
}
