//! Request router: the public inference pipeline.
//!
//! Drives selection, preparation, reservation, dispatch and streaming for
//! every inference request, and guarantees that the worker slot and the
//! per-user lock are released exactly once on every exit path — success,
//! upstream failure, or the client walking away mid-stream.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use axum::body::{Body, Bytes};
use axum::http::{header, StatusCode};
use axum::response::Response;
use futures::stream::BoxStream;
use futures::Stream;
use tracing::{debug, info, warn};

use crate::auth::AuthenticatedUser;
use crate::config::TimingConfig;
use crate::error::AppError;
use crate::lifecycle::LifecycleController;
use crate::ollama::{InferenceBackend, UpstreamResponse};
use crate::placement::{self, PlacementRequest};
use crate::protocol::{self, InferenceEnvelope, OpenAiChatRequest};
use crate::registry::{Worker, WorkerRegistry, WorkerState};
use crate::serializer::{UserPermit, UserSerializer};

/// Bounded wait for the per-user lock.
const USER_LOCK_TIMEOUT: Duration = Duration::from_secs(120);

/// Selection retries when a reservation race is lost.
const RESERVE_ATTEMPTS: u32 = 3;

/// Backoff between reservation attempts.
const RESERVE_BACKOFF: Duration = Duration::from_millis(500);

/// Poll cadence while another request's resume is in flight.
const STARTING_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Sentinel model name for passthrough requests; never hits affinity.
const PASSTHROUGH_MODEL: &str = "unknown";

/// Scoped slot ownership for one in-flight request.
///
/// Holds the per-user permit alongside the worker slot so that dropping the
/// guard — explicitly, at end of scope, or when a streaming body is torn
/// down by a disconnecting client — releases both exactly once.
pub struct SlotGuard {
    registry: WorkerRegistry,
    worker_id: String,
    released: bool,
    permit: Option<UserPermit>,
}

impl std::fmt::Debug for SlotGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlotGuard")
            .field("worker_id", &self.worker_id)
            .field("released", &self.released)
            .finish_non_exhaustive()
    }
}

impl SlotGuard {
    fn new(registry: WorkerRegistry, worker_id: String, permit: UserPermit) -> Self {
        Self {
            registry,
            worker_id,
            released: false,
            permit: Some(permit),
        }
    }

    /// Releases the slot and the user permit. Idempotent.
    fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;

        if let Err(err) = self.registry.finish_request(&self.worker_id) {
            warn!(worker_id = %self.worker_id, error = %err, "Slot release failed");
        }
        self.permit = None;
    }
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        self.release();
    }
}

/// A byte stream that releases its [`SlotGuard`] when it completes.
///
/// Drop covers the disconnect path; completion is handled eagerly so the
/// slot frees as soon as the last chunk is forwarded rather than when the
/// response machinery gets around to dropping the body.
struct GuardedStream {
    inner: BoxStream<'static, Result<Bytes, AppError>>,
    guard: SlotGuard,
}

impl Stream for GuardedStream {
    type Item = Result<Bytes, AppError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        match Pin::new(&mut this.inner).poll_next(cx) {
            Poll::Ready(None) => {
                this.guard.release();
                Poll::Ready(None)
            }
            other => other,
        }
    }
}

/// How a request's response should be relayed.
enum Dispatch {
    /// Inference endpoint: 2xx required, stream per the client's flag.
    Inference {
        /// Whether the client asked for a streamed response.
        stream: bool,
    },
    /// Management passthrough: status and body forwarded verbatim.
    Passthrough,
}

/// The public request pipeline.
pub struct RequestRouter {
    registry: WorkerRegistry,
    lifecycle: Arc<LifecycleController>,
    inference: Arc<dyn InferenceBackend>,
    serializer: UserSerializer,
    timing: TimingConfig,
}

impl std::fmt::Debug for RequestRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestRouter")
            .field("timing", &self.timing)
            .finish_non_exhaustive()
    }
}

impl RequestRouter {
    /// Creates a router over the shared scheduler components.
    pub fn new(
        registry: WorkerRegistry,
        lifecycle: Arc<LifecycleController>,
        inference: Arc<dyn InferenceBackend>,
        timing: TimingConfig,
    ) -> Self {
        Self {
            registry,
            lifecycle,
            inference,
            serializer: UserSerializer::new(),
            timing,
        }
    }

    /// Handles `/api/generate` and `/api/chat`: the body is parsed only for
    /// routing and forwarded to the worker verbatim.
    pub async fn handle_ollama(
        &self,
        user: &AuthenticatedUser,
        path: &str,
        body: Bytes,
    ) -> Result<Response, AppError> {
        let envelope: InferenceEnvelope = serde_json::from_slice(&body)
            .map_err(|err| AppError::BadState(format!("Invalid request body: {err}")))?;

        info!(
            user = %user.name(),
            model = %envelope.model,
            stream = envelope.stream,
            path = %path,
            "Inference request"
        );

        self.route(
            user.name(),
            &envelope.model,
            envelope.context_length(),
            "POST",
            path,
            body,
            Dispatch::Inference {
                stream: envelope.stream,
            },
            self.timing.reservation_minutes,
        )
        .await
    }

    /// Handles `/v1/chat/completions` by re-shaping into the Ollama chat
    /// dialect and dispatching through the normal pipeline.
    pub async fn handle_openai_chat(
        &self,
        user: &AuthenticatedUser,
        request: OpenAiChatRequest,
    ) -> Result<Response, AppError> {
        let ollama = protocol::openai_to_ollama_chat(&request);
        let context_length = protocol::context_length(ollama.options.as_ref());
        let body = serde_json::to_vec(&ollama).map_err(|err| AppError::Internal(err.to_string()))?;

        info!(
            user = %user.name(),
            model = %ollama.model,
            stream = ollama.stream,
            "OpenAI-compatible chat request"
        );

        self.route(
            user.name(),
            &ollama.model,
            context_length,
            "POST",
            "/api/chat",
            Bytes::from(body),
            Dispatch::Inference {
                stream: ollama.stream,
            },
            self.timing.reservation_minutes,
        )
        .await
    }

    /// Handles arbitrary `/api/*` management paths (tags, ps, show, ...).
    ///
    /// The sentinel model name never hits affinity, so placement degrades to
    /// "any free slot". No preload happens and the upstream status is
    /// forwarded verbatim.
    pub async fn handle_passthrough(
        &self,
        user: &AuthenticatedUser,
        method: &str,
        path: &str,
        body: Bytes,
    ) -> Result<Response, AppError> {
        info!(user = %user.name(), method = %method, path = %path, "Passthrough request");

        self.route(
            user.name(),
            PASSTHROUGH_MODEL,
            None,
            method,
            path,
            body,
            Dispatch::Passthrough,
            self.timing.fallback_reservation_minutes,
        )
        .await
    }

    #[allow(clippy::too_many_arguments)]
    async fn route(
        &self,
        user_id: &str,
        model: &str,
        context_length: Option<u32>,
        method: &str,
        path: &str,
        body: Bytes,
        dispatch: Dispatch,
        reservation_minutes: i64,
    ) -> Result<Response, AppError> {
        // One in-flight request per user; everything below runs under the
        // permit, which travels inside the slot guard once a slot is taken.
        let permit = self.serializer.acquire(user_id, USER_LOCK_TIMEOUT).await?;

        let load_model = matches!(dispatch, Dispatch::Inference { .. });
        let worker = self
            .prepare_worker(user_id, model, context_length, load_model, reservation_minutes)
            .await?;

        if let Err(err) = self.registry.start_request(&worker.id, user_id) {
            let _ = self.registry.clear_reservation(&worker.id);
            return Err(err);
        }
        let guard = SlotGuard::new(self.registry.clone(), worker.id.clone(), permit);

        let upstream = match self.inference.dispatch(&worker.ip, method, path, body).await {
            Ok(upstream) => upstream,
            Err(err) => {
                warn!(worker_id = %worker.id, error = %err, "Dispatch failed");
                drop(guard);
                return Err(err);
            }
        };

        match dispatch {
            Dispatch::Inference { stream } => {
                if !(200..300).contains(&upstream.status) {
                    warn!(
                        worker_id = %worker.id,
                        status = upstream.status,
                        "Worker rejected inference request"
                    );
                    drop(guard);
                    return Err(AppError::UpstreamFailed(format!(
                        "worker returned status {}",
                        upstream.status
                    )));
                }

                if stream {
                    Self::streaming_response(upstream, guard)
                } else {
                    let content_type = upstream.content_type.clone();
                    let status = upstream.status;
                    let collected = upstream.collect_bytes().await;
                    drop(guard);
                    let bytes = collected?;
                    Self::buffered_response(status, content_type, bytes)
                }
            }
            Dispatch::Passthrough => Self::streaming_response(upstream, guard),
        }
    }

    /// Selection with bounded retry: three attempts, 500ms apart.
    async fn prepare_worker(
        &self,
        user_id: &str,
        model: &str,
        context_length: Option<u32>,
        load_model: bool,
        reservation_minutes: i64,
    ) -> Result<Worker, AppError> {
        let request = PlacementRequest {
            user_id: user_id.to_string(),
            model_name: model.to_string(),
            context_length,
        };

        for attempt in 1..=RESERVE_ATTEMPTS {
            let decision = placement::plan(&self.registry, &request, &self.timing);
            let Some(worker) = decision.worker else {
                return Err(AppError::CapacityUnavailable(decision.message));
            };

            debug!(
                worker_id = %worker.id,
                attempt,
                needs_resume = decision.needs_resume,
                needs_model_load = decision.needs_model_load,
                "Placement decision"
            );

            if decision.needs_resume {
                self.lifecycle.resume(&worker.id).await.map_err(|err| match err {
                    AppError::ResumeFailed(_) => err,
                    other => AppError::ResumeFailed(other.to_string()),
                })?;
            }

            // Another request may have triggered the resume; wait it out.
            self.wait_for_startup(&worker.id).await?;

            if !self
                .registry
                .try_reserve(&worker.id, user_id, Some(model), reservation_minutes)?
            {
                debug!(worker_id = %worker.id, attempt, "Lost reservation race");
                tokio::time::sleep(RESERVE_BACKOFF).await;
                continue;
            }

            if load_model && decision.needs_model_load {
                // Re-check: the model may have landed while we raced for the
                // reservation.
                let fresh = self
                    .registry
                    .get(&worker.id)
                    .ok_or_else(|| AppError::NotFound(worker.id.clone()))?;
                if !fresh.has_model_loaded(model) {
                    self.lifecycle
                        .ensure_model_loaded(&worker.id, model, context_length)
                        .await?;
                }
            }

            return self
                .registry
                .get(&worker.id)
                .ok_or_else(|| AppError::NotFound(worker.id));
        }

        Err(AppError::CapacityUnavailable(
            "All GPUs are busy, please try again later".to_string(),
        ))
    }

    /// Polls a `Starting` worker until it is usable or the startup window
    /// closes.
    async fn wait_for_startup(&self, worker_id: &str) -> Result<(), AppError> {
        let deadline =
            tokio::time::Instant::now() + Duration::from_secs(self.timing.startup_timeout_seconds);

        loop {
            let worker = self
                .registry
                .get(worker_id)
                .ok_or_else(|| AppError::NotFound(worker_id.to_string()))?;

            match worker.state {
                WorkerState::Starting => {}
                WorkerState::Error => {
                    return Err(AppError::ResumeFailed(format!(
                        "GPU {worker_id} failed while starting"
                    )))
                }
                _ => return Ok(()),
            }

            if tokio::time::Instant::now() >= deadline {
                return Err(AppError::ResumeFailed(format!(
                    "GPU {worker_id} still starting after {}s",
                    self.timing.startup_timeout_seconds
                )));
            }

            debug!(worker_id = %worker_id, "Waiting for GPU startup in progress elsewhere");
            tokio::time::sleep(STARTING_POLL_INTERVAL).await;
        }
    }

    fn streaming_response(upstream: UpstreamResponse, guard: SlotGuard) -> Result<Response, AppError> {
        let status = StatusCode::from_u16(upstream.status)
            .map_err(|err| AppError::Internal(err.to_string()))?;
        let content_type = upstream
            .content_type
            .unwrap_or_else(|| "application/json".to_string());

        let stream = GuardedStream {
            inner: upstream.body,
            guard,
        };

        Response::builder()
            .status(status)
            .header(header::CONTENT_TYPE, content_type)
            .body(Body::from_stream(stream))
            .map_err(|err| AppError::Internal(err.to_string()))
    }

    fn buffered_response(
        status: u16,
        content_type: Option<String>,
        bytes: Bytes,
    ) -> Result<Response, AppError> {
        let status =
            StatusCode::from_u16(status).map_err(|err| AppError::Internal(err.to_string()))?;

        Response::builder()
            .status(status)
            .header(
                header::CONTENT_TYPE,
                content_type.unwrap_or_else(|| "application/json".to_string()),
            )
            .body(Body::from(bytes))
            .map_err(|err| AppError::Internal(err.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloud::{ActionResponse, CloudControl, CloudError, Workspace, WorkspaceStatus};
    use crate::registry::ModelInfo;
    use async_trait::async_trait;
    use futures::StreamExt;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct NoopCloud;

    #[async_trait]
    impl CloudControl for NoopCloud {
        async fn discover_gpu_workspaces(&self) -> Result<Vec<Workspace>, CloudError> {
            Ok(Vec::new())
        }
        async fn get_workspace(&self, id: &str) -> Result<Workspace, CloudError> {
            Err(CloudError::Network(format!("no workspace {id}")))
        }
        async fn resume_workspace(&self, id: &str) -> Result<ActionResponse, CloudError> {
            Ok(ActionResponse {
                id: id.to_string(),
                status: WorkspaceStatus::Resuming,
            })
        }
        async fn pause_workspace(&self, id: &str) -> Result<ActionResponse, CloudError> {
            Ok(ActionResponse {
                id: id.to_string(),
                status: WorkspaceStatus::Pausing,
            })
        }
        async fn wait_for_workspace_status(
            &self,
            _id: &str,
            _target: WorkspaceStatus,
            _timeout_seconds: u64,
            _poll_interval_seconds: u64,
        ) -> Result<bool, CloudError> {
            Ok(true)
        }
    }

    struct ChunkBackend {
        chunks: Vec<&'static [u8]>,
        preloads: AtomicUsize,
    }

    #[async_trait]
    impl InferenceBackend for ChunkBackend {
        async fn preload_model(
            &self,
            _ip: &str,
            _model: &str,
            _context_length: Option<u32>,
        ) -> Result<(), AppError> {
            let _ = self.preloads.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn dispatch(
            &self,
            _ip: &str,
            _method: &str,
            _path: &str,
            _body: Bytes,
        ) -> Result<UpstreamResponse, AppError> {
            let chunks: Vec<Result<Bytes, AppError>> = self
                .chunks
                .iter()
                .map(|chunk| Ok(Bytes::from_static(chunk)))
                .collect();
            Ok(UpstreamResponse {
                status: 200,
                content_type: Some("application/json".to_string()),
                body: futures::stream::iter(chunks).boxed(),
            })
        }
    }

    fn timing() -> TimingConfig {
        TimingConfig {
            reservation_minutes: 10,
            fallback_reservation_minutes: 3,
            startup_timeout_seconds: 1,
            ollama_readiness_wait_seconds: 0,
        }
    }

    fn router_with_fleet(workers: Vec<Worker>) -> (WorkerRegistry, Arc<RequestRouter>) {
        let registry = WorkerRegistry::new();
        registry.seed(workers);
        let inference: Arc<dyn InferenceBackend> = Arc::new(ChunkBackend {
            chunks: vec![b"{\"response\":\"hi\"}\n", b"{\"done\":true}\n"],
            preloads: AtomicUsize::new(0),
        });
        let lifecycle = Arc::new(LifecycleController::new(
            registry.clone(),
            Arc::new(NoopCloud),
            Arc::clone(&inference),
            timing(),
        ));
        let router = Arc::new(RequestRouter::new(
            registry.clone(),
            lifecycle,
            inference,
            timing(),
        ));
        (registry, router)
    }

    fn ready_worker(id: &str, model: &str) -> Worker {
        let mut worker =
            WorkerRegistry::make_worker(id, id, "10.0.0.1", "gpu-a10", WorkerState::ModelReady, 1);
        worker.loaded_model = Some(ModelInfo::new(model, None));
        worker
    }

    fn user(name: &str) -> AuthenticatedUser {
        AuthenticatedUser {
            api_key: format!("sk-{name}"),
            user: crate::auth::UserInfo {
                name: name.to_string(),
                email: format!("{name}@example.org"),
                created: "2025-01-01".to_string(),
                requests_today: 0,
                total_requests: 0,
                last_request: None,
            },
        }
    }

    #[tokio::test]
    async fn dropping_the_stream_mid_flight_releases_the_slot_once() {
        let (registry, router) = router_with_fleet(vec![ready_worker("gpu1", "llama3")]);
        let caller = user("u1");

        let body = Bytes::from(r#"{"model":"llama3","prompt":"hi","stream":true}"#);
        let response = router
            .handle_ollama(&caller, "/api/generate", body)
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);

        // Simulate a client disconnect: drop the body without reading it.
        drop(response);

        let worker = registry.get("gpu1").expect("worker");
        assert_eq!(worker.active_requests, 0);
        assert_eq!(worker.state, WorkerState::ModelReady);

        // The user can immediately issue the next request.
        let body = Bytes::from(r#"{"model":"llama3","prompt":"hi","stream":false}"#);
        let response = router
            .handle_ollama(&caller, "/api/generate", body)
            .await
            .expect("second response");
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn consuming_the_stream_releases_on_completion() {
        let (registry, router) = router_with_fleet(vec![ready_worker("gpu1", "llama3")]);

        let body = Bytes::from(r#"{"model":"llama3","prompt":"hi"}"#);
        let response = router
            .handle_ollama(&user("u1"), "/api/generate", body)
            .await
            .expect("response");

        let mid_stream = registry.get("gpu1").expect("worker");
        assert_eq!(mid_stream.active_requests, 1);
        assert_eq!(mid_stream.state, WorkerState::Busy);

        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body");
        assert!(bytes.ends_with(b"{\"done\":true}\n"));

        let worker = registry.get("gpu1").expect("worker");
        assert_eq!(worker.active_requests, 0);
        assert_eq!(worker.state, WorkerState::ModelReady);
    }

    #[tokio::test]
    async fn capacity_exhaustion_is_a_503_after_retries() {
        let (_registry, router) = router_with_fleet(vec![WorkerRegistry::make_worker(
            "gpu1",
            "gpu1",
            "10.0.0.1",
            "gpu-a10",
            WorkerState::Error,
            1,
        )]);

        let body = Bytes::from(r#"{"model":"llama3","prompt":"hi"}"#);
        let err = router
            .handle_ollama(&user("u1"), "/api/generate", body)
            .await
            .expect_err("no capacity");
        assert!(matches!(err, AppError::CapacityUnavailable(_)));
    }

    #[tokio::test]
    async fn passthrough_uses_any_free_slot_without_preload() {
        let (registry, router) = router_with_fleet(vec![WorkerRegistry::make_worker(
            "gpu1",
            "gpu1",
            "10.0.0.1",
            "gpu-a10",
            WorkerState::Idle,
            1,
        )]);

        let response = router
            .handle_passthrough(&user("u1"), "GET", "/api/tags", Bytes::new())
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);

        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body");
        assert!(!bytes.is_empty());

        // No model was loaded, so the worker returns to Idle.
        let worker = registry.get("gpu1").expect("worker");
        assert_eq!(worker.state, WorkerState::Idle);
        assert!(worker.loaded_model.is_none());
    }

    #[tokio::test]
    async fn malformed_bodies_are_rejected_before_selection() {
        let (_registry, router) = router_with_fleet(vec![ready_worker("gpu1", "llama3")]);

        let err = router
            .handle_ollama(&user("u1"), "/api/generate", Bytes::from("not json"))
            .await
            .expect_err("bad body");
        assert!(matches!(err, AppError::BadState(_)));
    }
}
