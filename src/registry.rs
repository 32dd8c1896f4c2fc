//! Worker state registry: the single source of truth for fleet state.
//!
//! Every mutation of a worker record goes through the coarse-grained
//! operations on [`WorkerRegistry`] so the state invariants are enforced in
//! one place. The lock is never held across an await; async work (cloud
//! calls, preloads) happens outside and re-enters with a fresh lock.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::cloud::{CloudControl, WorkspaceStatus};
use crate::error::AppError;

/// Scheduler-level state of a worker and its resident model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    /// Workspace is de-provisioned; no model, no cost.
    Paused,
    /// Workspace is being re-provisioned.
    Starting,
    /// Workspace is up with no model resident.
    Idle,
    /// A model preload is in flight.
    LoadingModel,
    /// A model is resident and the worker can serve immediately.
    ModelReady,
    /// At least one request is in flight.
    Busy,
    /// Workspace is being de-provisioned.
    Pausing,
    /// Unrecoverable without operator action.
    Error,
}

impl WorkerState {
    /// States in which the inference server is reachable.
    pub fn is_active(self) -> bool {
        matches!(
            self,
            WorkerState::Idle
                | WorkerState::LoadingModel
                | WorkerState::ModelReady
                | WorkerState::Busy
        )
    }
}

/// Information about the model resident on a worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelInfo {
    /// Model name, e.g. `llama3:70b`.
    pub name: String,
    /// Reported size, e.g. `42 GB`.
    pub size: Option<String>,
    /// When the model was loaded.
    pub loaded_at: DateTime<Utc>,
    /// Last time a request used the model.
    pub last_used: DateTime<Utc>,
    /// Context length the model was loaded with (`num_ctx`).
    pub context_length: Option<u32>,
}

impl ModelInfo {
    /// Creates a record for a model loaded right now.
    pub fn new(name: impl Into<String>, context_length: Option<u32>) -> Self {
        let now = Utc::now();
        Self {
            name: name.into(),
            size: None,
            loaded_at: now,
            last_used: now,
            context_length,
        }
    }
}

/// A short-lived exclusive claim on a worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reservation {
    /// User holding the claim.
    pub user_id: String,
    /// When the claim was made.
    pub reserved_at: DateTime<Utc>,
    /// When the claim lapses.
    pub expires_at: DateTime<Utc>,
    /// Model the user intends to run, if known.
    pub model_name: Option<String>,
}

impl Reservation {
    /// Whether the claim has lapsed.
    pub fn is_expired(&self) -> bool {
        Utc::now() > self.expires_at
    }
}

/// Complete record for one GPU worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Worker {
    /// Opaque workspace identifier.
    pub id: String,
    /// Workspace name from the cloud provider.
    pub name: String,
    /// Reachable IP address.
    pub ip: String,
    /// Machine flavor string.
    pub flavor: String,
    /// Current scheduler state.
    pub state: WorkerState,
    /// Model resident on the worker, if any.
    pub loaded_model: Option<ModelInfo>,
    /// Active reservation, if any.
    pub reservation: Option<Reservation>,
    /// Requests currently in flight.
    pub active_requests: u32,
    /// Concurrent requests the inference server supports.
    pub max_slots: u32,
    /// Timestamp of the last state transition.
    pub last_state_change: DateTime<Utc>,
    /// Timestamp of the most recent request start.
    pub last_request: Option<DateTime<Utc>>,
    /// Set while the worker sits in `ModelReady` with no traffic.
    pub idle_since: Option<DateTime<Utc>>,
    /// Requests served over the process lifetime.
    pub total_requests: u64,
    /// Requests served today (operator-reset, never automatic).
    pub requests_today: u64,
}

impl Worker {
    fn new(id: String, name: String, ip: String, flavor: String, state: WorkerState) -> Self {
        Self {
            id,
            name,
            ip,
            flavor,
            state,
            loaded_model: None,
            reservation: None,
            active_requests: 0,
            max_slots: 1,
            last_state_change: Utc::now(),
            last_request: None,
            idle_since: None,
            total_requests: 0,
            requests_today: 0,
        }
    }

    /// Whether the worker can take a new request right now.
    ///
    /// Pure read: an expired reservation counts as absent but is not cleared
    /// here. Registry operations clear it under the write lock.
    pub fn is_available(&self) -> bool {
        let reserved = self
            .reservation
            .as_ref()
            .is_some_and(|res| !res.is_expired());

        !reserved
            && matches!(self.state, WorkerState::Idle | WorkerState::ModelReady)
            && self.active_requests < self.max_slots
    }

    /// Whether `model` is resident and ready to serve.
    pub fn has_model_loaded(&self, model: &str) -> bool {
        self.loaded_model
            .as_ref()
            .is_some_and(|info| info.name == model)
            && self.state == WorkerState::ModelReady
    }

    fn clear_expired_reservation(&mut self) {
        if self.reservation.as_ref().is_some_and(Reservation::is_expired) {
            debug!(worker_id = %self.id, "Clearing expired reservation");
            self.reservation = None;
        }
    }

    fn transition(&mut self, new_state: WorkerState) {
        if new_state != self.state {
            self.state = new_state;
            self.last_state_change = Utc::now();
        }

        // idle_since tracks exactly the ModelReady-with-no-traffic window.
        if self.state == WorkerState::ModelReady && self.active_requests == 0 {
            if self.idle_since.is_none() {
                self.idle_since = Some(Utc::now());
            }
        } else {
            self.idle_since = None;
        }
    }
}

/// Aggregated fleet statistics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FleetStats {
    /// Number of workers under management.
    pub total_gpus: usize,
    /// Workers not paused and not errored.
    pub active_gpus: usize,
    /// Workers currently serving requests.
    pub busy_gpus: usize,
    /// Workers currently paused.
    pub paused_gpus: usize,
    /// Resident-model occupancy across the fleet.
    pub models_loaded: HashMap<String, usize>,
    /// Sum of per-worker `requests_today`.
    pub total_requests_today: u64,
}

/// Authoritative in-memory map of worker records.
#[derive(Debug, Clone, Default)]
pub struct WorkerRegistry {
    workers: Arc<RwLock<HashMap<String, Worker>>>,
}

impl WorkerRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Discovers the fleet from the cloud control plane and seeds records.
    ///
    /// Called once at startup. Cloud statuses map onto scheduler states;
    /// anything unrecognized lands in `Error` so it is visible but unused.
    pub async fn discover_and_seed(&self, cloud: &dyn CloudControl) -> Result<usize, AppError> {
        let workspaces = cloud.discover_gpu_workspaces().await?;

        let mut workers = self.workers.write();
        let mut seeded = 0;
        for workspace in workspaces {
            let state = match workspace.status {
                WorkspaceStatus::Running => WorkerState::Idle,
                WorkspaceStatus::Paused => WorkerState::Paused,
                WorkspaceStatus::Resuming => WorkerState::Starting,
                WorkspaceStatus::Pausing => WorkerState::Pausing,
                _ => WorkerState::Error,
            };

            let worker = Worker::new(
                workspace.id.clone(),
                workspace.name.clone(),
                workspace.resource_meta.ip.clone(),
                workspace.resource_meta.flavor_name.clone(),
                state,
            );

            info!(
                worker_id = %worker.id,
                name = %worker.name,
                state = ?worker.state,
                "Discovered GPU worker"
            );

            if workers.insert(workspace.id, worker).is_none() {
                seeded += 1;
            }
        }

        Ok(seeded)
    }

    /// Seeds records directly; used by tests and embedded setups.
    pub fn seed(&self, seeded: Vec<Worker>) {
        let mut workers = self.workers.write();
        for worker in seeded {
            drop(workers.insert(worker.id.clone(), worker));
        }
    }

    /// Builds a worker record for seeding.
    pub fn make_worker(
        id: &str,
        name: &str,
        ip: &str,
        flavor: &str,
        state: WorkerState,
        max_slots: u32,
    ) -> Worker {
        let mut worker = Worker::new(
            id.to_string(),
            name.to_string(),
            ip.to_string(),
            flavor.to_string(),
            state,
        );
        worker.max_slots = max_slots;
        if state == WorkerState::ModelReady {
            worker.idle_since = Some(Utc::now());
        }
        worker
    }

    /// Returns a point-in-time copy of one record.
    pub fn get(&self, worker_id: &str) -> Option<Worker> {
        self.workers.read().get(worker_id).cloned()
    }

    /// Returns a point-in-time copy of the whole fleet, ordered by id.
    pub fn snapshot(&self) -> Vec<Worker> {
        let mut all: Vec<Worker> = self.workers.read().values().cloned().collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        all
    }

    /// Finds an available worker with `model` resident.
    ///
    /// Ties break on fewest active requests, then id, so selection is
    /// deterministic for a given fleet state.
    pub fn find_with_model(&self, model: &str) -> Option<Worker> {
        let mut workers = self.workers.write();
        for worker in workers.values_mut() {
            worker.clear_expired_reservation();
        }

        let mut candidates: Vec<&Worker> = workers
            .values()
            .filter(|worker| worker.has_model_loaded(model) && worker.is_available())
            .collect();
        candidates.sort_by(|a, b| {
            (a.active_requests, &a.id).cmp(&(b.active_requests, &b.id))
        });
        candidates.first().map(|worker| (*worker).clone())
    }

    /// Finds an available worker, preferring `Idle` over `ModelReady`.
    ///
    /// Reusing a `ModelReady` worker unloads someone else's model, but it is
    /// still cheaper than waking a paused workspace.
    pub fn find_idle(&self) -> Option<Worker> {
        let mut workers = self.workers.write();
        for worker in workers.values_mut() {
            worker.clear_expired_reservation();
        }

        for wanted in [WorkerState::Idle, WorkerState::ModelReady] {
            let mut candidates: Vec<&Worker> = workers
                .values()
                .filter(|worker| worker.state == wanted && worker.is_available())
                .collect();
            candidates.sort_by(|a, b| a.id.cmp(&b.id));
            if let Some(found) = candidates.first() {
                return Some((*found).clone());
            }
        }

        None
    }

    /// Finds any paused worker.
    pub fn find_paused(&self) -> Option<Worker> {
        let workers = self.workers.read();
        let mut candidates: Vec<&Worker> = workers
            .values()
            .filter(|worker| worker.state == WorkerState::Paused && worker.reservation.is_none())
            .collect();
        candidates.sort_by(|a, b| a.id.cmp(&b.id));
        candidates.first().map(|worker| (*worker).clone())
    }

    /// Attempts to claim a worker for `user`.
    ///
    /// Succeeds only when no live reservation exists and the worker is either
    /// on the wake path (`Paused`/`Starting`) or active with a free slot.
    /// This is the single atomic claim point that resolves selection races.
    pub fn try_reserve(
        &self,
        worker_id: &str,
        user_id: &str,
        model_name: Option<&str>,
        ttl_minutes: i64,
    ) -> Result<bool, AppError> {
        let mut workers = self.workers.write();
        let worker = workers
            .get_mut(worker_id)
            .ok_or_else(|| AppError::NotFound(worker_id.to_string()))?;

        worker.clear_expired_reservation();

        if worker.reservation.is_some() {
            return Ok(false);
        }

        let reservable = match worker.state {
            WorkerState::Paused | WorkerState::Starting => true,
            WorkerState::Idle | WorkerState::ModelReady | WorkerState::Busy => {
                worker.active_requests < worker.max_slots
            }
            WorkerState::LoadingModel | WorkerState::Pausing | WorkerState::Error => false,
        };

        if !reservable {
            return Ok(false);
        }

        let now = Utc::now();
        worker.reservation = Some(Reservation {
            user_id: user_id.to_string(),
            reserved_at: now,
            expires_at: now + Duration::minutes(ttl_minutes.max(1)),
            model_name: model_name.map(str::to_string),
        });

        debug!(worker_id = %worker_id, user = %user_id, "Reserved worker");
        Ok(true)
    }

    /// Marks the start of a request: transitions to `Busy`, bumps counters,
    /// clears the reservation.
    pub fn start_request(&self, worker_id: &str, user_id: &str) -> Result<(), AppError> {
        let mut workers = self.workers.write();
        let worker = workers
            .get_mut(worker_id)
            .ok_or_else(|| AppError::NotFound(worker_id.to_string()))?;

        if !matches!(
            worker.state,
            WorkerState::Idle | WorkerState::ModelReady | WorkerState::Busy
        ) {
            return Err(AppError::BadState(format!(
                "GPU {worker_id} cannot accept requests in state {:?}",
                worker.state
            )));
        }

        if worker.active_requests >= worker.max_slots {
            return Err(AppError::BadState(format!(
                "GPU {worker_id} has no free slots ({}/{})",
                worker.active_requests, worker.max_slots
            )));
        }

        worker.active_requests += 1;
        worker.total_requests += 1;
        worker.requests_today += 1;
        worker.last_request = Some(Utc::now());
        worker.reservation = None;
        if let Some(model) = worker.loaded_model.as_mut() {
            model.last_used = Utc::now();
        }
        worker.transition(WorkerState::Busy);

        debug!(
            worker_id = %worker_id,
            user = %user_id,
            active = worker.active_requests,
            "Request started"
        );
        Ok(())
    }

    /// Marks the end of a request: decrements the slot count and, when the
    /// last slot frees, transitions back to `ModelReady` or `Idle`.
    pub fn finish_request(&self, worker_id: &str) -> Result<(), AppError> {
        let mut workers = self.workers.write();
        let worker = workers
            .get_mut(worker_id)
            .ok_or_else(|| AppError::NotFound(worker_id.to_string()))?;

        if worker.active_requests == 0 {
            warn!(worker_id = %worker_id, "finish_request with no active requests");
            return Ok(());
        }

        worker.active_requests -= 1;
        if worker.active_requests == 0 {
            let next = if worker.loaded_model.is_some() {
                WorkerState::ModelReady
            } else {
                WorkerState::Idle
            };
            worker.transition(next);
        }

        debug!(worker_id = %worker_id, active = worker.active_requests, "Request finished");
        Ok(())
    }

    /// Low-level state mutator used by the lifecycle controller.
    pub fn set_state(&self, worker_id: &str, state: WorkerState) -> Result<(), AppError> {
        let mut workers = self.workers.write();
        let worker = workers
            .get_mut(worker_id)
            .ok_or_else(|| AppError::NotFound(worker_id.to_string()))?;

        if worker.active_requests > 0
            && matches!(
                state,
                WorkerState::Paused
                    | WorkerState::Starting
                    | WorkerState::Pausing
                    | WorkerState::Error
            )
        {
            return Err(AppError::BadState(format!(
                "GPU {worker_id} has {} active request(s)",
                worker.active_requests
            )));
        }

        worker.transition(state);
        Ok(())
    }

    /// Records (or clears) the model resident on a worker.
    pub fn set_model(&self, worker_id: &str, model: Option<ModelInfo>) -> Result<(), AppError> {
        let mut workers = self.workers.write();
        let worker = workers
            .get_mut(worker_id)
            .ok_or_else(|| AppError::NotFound(worker_id.to_string()))?;
        worker.loaded_model = model;
        Ok(())
    }

    /// Drops the reservation on a worker, if any.
    pub fn clear_reservation(&self, worker_id: &str) -> Result<(), AppError> {
        let mut workers = self.workers.write();
        let worker = workers
            .get_mut(worker_id)
            .ok_or_else(|| AppError::NotFound(worker_id.to_string()))?;
        worker.reservation = None;
        Ok(())
    }

    /// Clears every expired reservation; returns how many were cleared.
    pub fn expire_reservations(&self) -> usize {
        let mut workers = self.workers.write();
        let mut cleared = 0;
        for worker in workers.values_mut() {
            if worker.reservation.as_ref().is_some_and(Reservation::is_expired) {
                debug!(worker_id = %worker.id, "Clearing expired reservation");
                worker.reservation = None;
                cleared += 1;
            }
        }
        cleared
    }

    /// Workers that have sat in `ModelReady` with no traffic for longer than
    /// `idle_timeout_minutes`.
    pub fn idle_eviction_candidates(&self, idle_timeout_minutes: i64) -> Vec<String> {
        let cutoff = Utc::now() - Duration::minutes(idle_timeout_minutes);
        self.workers
            .read()
            .values()
            .filter(|worker| {
                worker.state == WorkerState::ModelReady
                    && worker.active_requests == 0
                    && worker.idle_since.is_some_and(|since| since < cutoff)
            })
            .map(|worker| worker.id.clone())
            .collect()
    }

    /// Aggregated fleet statistics.
    pub fn stats(&self) -> FleetStats {
        let workers = self.workers.read();

        let mut models_loaded: HashMap<String, usize> = HashMap::new();
        for worker in workers.values() {
            if let Some(model) = &worker.loaded_model {
                *models_loaded.entry(model.name.clone()).or_insert(0) += 1;
            }
        }

        FleetStats {
            total_gpus: workers.len(),
            active_gpus: workers
                .values()
                .filter(|w| !matches!(w.state, WorkerState::Paused | WorkerState::Error))
                .count(),
            busy_gpus: workers
                .values()
                .filter(|w| w.state == WorkerState::Busy)
                .count(),
            paused_gpus: workers
                .values()
                .filter(|w| w.state == WorkerState::Paused)
                .count(),
            models_loaded,
            total_requests_today: workers.values().map(|w| w.requests_today).sum(),
        }
    }
}
