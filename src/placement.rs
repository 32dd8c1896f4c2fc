//! Placement policy: pure selection logic over the registry.
//!
//! Model affinity beats a warm slot, a warm slot beats waking a paused
//! workspace. Preparation steps (resume, preload) are returned as flags for
//! the router to drive; nothing here mutates worker state.

use serde::Serialize;

use crate::config::TimingConfig;
use crate::registry::{Worker, WorkerRegistry};

/// What a request needs from placement.
#[derive(Debug, Clone)]
pub struct PlacementRequest {
    /// User making the request.
    pub user_id: String,
    /// Requested model name.
    pub model_name: String,
    /// Required context length, when the client asked for one.
    pub context_length: Option<u32>,
}

/// Outcome of one placement pass.
#[derive(Debug, Clone, Serialize)]
pub struct PlacementDecision {
    /// Selected worker; `None` when the fleet has no capacity.
    pub worker: Option<Worker>,
    /// The worker must be resumed before use.
    pub needs_resume: bool,
    /// The model must be preloaded before dispatch.
    pub needs_model_load: bool,
    /// Rough wait estimate surfaced to operators; `-1` when unplaceable.
    pub estimated_wait_seconds: i64,
    /// Human-readable selection rationale.
    pub message: String,
}

/// Estimated seconds for a model preload on a running worker.
const MODEL_LOAD_ESTIMATE_SECONDS: i64 = 30;

/// Selects the best worker for a request.
pub fn plan(
    registry: &WorkerRegistry,
    request: &PlacementRequest,
    timing: &TimingConfig,
) -> PlacementDecision {
    // 1. Worker with the model already resident and a free slot.
    if let Some(worker) = registry.find_with_model(&request.model_name) {
        tracing::debug!(worker_id = %worker.id, model = %request.model_name, "Affinity hit");
        return PlacementDecision {
            message: format!("GPU ready with {} loaded", request.model_name),
            worker: Some(worker),
            needs_resume: false,
            needs_model_load: false,
            estimated_wait_seconds: 0,
        };
    }

    // 2. Running worker without the model; load replaces whatever is resident.
    if let Some(worker) = registry.find_idle() {
        tracing::debug!(worker_id = %worker.id, "Warm worker, model load required");
        return PlacementDecision {
            message: format!("GPU available, will load {}", request.model_name),
            worker: Some(worker),
            needs_resume: false,
            needs_model_load: true,
            estimated_wait_seconds: MODEL_LOAD_ESTIMATE_SECONDS,
        };
    }

    // 3. Paused worker; resume then load.
    if let Some(worker) = registry.find_paused() {
        tracing::debug!(worker_id = %worker.id, "Paused worker selected for wake-up");
        return PlacementDecision {
            message: format!("Will start GPU and load {}", request.model_name),
            worker: Some(worker),
            needs_resume: true,
            needs_model_load: true,
            estimated_wait_seconds: timing.startup_timeout_seconds as i64
                + MODEL_LOAD_ESTIMATE_SECONDS,
        };
    }

    // 4. Nothing to give.
    tracing::warn!(model = %request.model_name, user = %request.user_id, "No GPUs available");
    PlacementDecision {
        worker: None,
        needs_resume: false,
        needs_model_load: false,
        estimated_wait_seconds: -1,
        message: "All GPUs are busy, please try again later".to_string(),
    }
}
