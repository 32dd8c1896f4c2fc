//! Inference-worker client.
//!
//! Workers expose an Ollama-compatible HTTP server on a fixed port. The
//! gateway needs exactly two things from it: a way to force a model into
//! memory, and a way to forward a request and hand the byte stream back
//! untouched. Both sit behind [`InferenceBackend`] so the router and the
//! lifecycle controller can be exercised without a live worker.

use std::time::Duration;

use async_trait::async_trait;
use axum::body::Bytes;
use futures::stream::{BoxStream, StreamExt, TryStreamExt};
use reqwest::Client;
use serde_json::json;
use tracing::{debug, info, warn};

use crate::error::AppError;

/// Port every worker's inference server listens on.
pub const OLLAMA_PORT: u16 = 11434;

/// Timeout for the preload generate call. Large models take a while to map.
const PRELOAD_TIMEOUT: Duration = Duration::from_secs(120);

/// End-to-end timeout for a proxied request, including streaming.
const PROXY_TIMEOUT: Duration = Duration::from_secs(300);

/// A response from a worker, body left as a raw byte stream.
pub struct UpstreamResponse {
    /// HTTP status returned by the worker.
    pub status: u16,
    /// Upstream `Content-Type`, when present.
    pub content_type: Option<String>,
    /// Response body chunks, forwarded byte-for-byte.
    pub body: BoxStream<'static, Result<Bytes, AppError>>,
}

impl std::fmt::Debug for UpstreamResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpstreamResponse")
            .field("status", &self.status)
            .field("content_type", &self.content_type)
            .finish_non_exhaustive()
    }
}

impl UpstreamResponse {
    /// Drains the stream into one buffer (non-streaming responses).
    pub async fn collect_bytes(self) -> Result<Bytes, AppError> {
        let mut body = self.body;
        let mut buffer = Vec::new();
        while let Some(chunk) = body.try_next().await? {
            buffer.extend_from_slice(&chunk);
        }
        Ok(Bytes::from(buffer))
    }
}

/// Operations the scheduler needs from an inference worker.
#[async_trait]
pub trait InferenceBackend: Send + Sync {
    /// Forces `model` into memory on the worker at `ip`.
    async fn preload_model(
        &self,
        ip: &str,
        model: &str,
        context_length: Option<u32>,
    ) -> Result<(), AppError>;

    /// Forwards a request verbatim and returns the raw response.
    async fn dispatch(
        &self,
        ip: &str,
        method: &str,
        path: &str,
        body: Bytes,
    ) -> Result<UpstreamResponse, AppError>;
}

/// HTTP client for Ollama-compatible workers.
#[derive(Debug, Clone)]
pub struct OllamaClient {
    http_client: Client,
    port: u16,
}

impl Default for OllamaClient {
    fn default() -> Self {
        Self::new()
    }
}

impl OllamaClient {
    /// Creates a client against the standard worker port.
    pub fn new() -> Self {
        Self {
            http_client: Client::new(),
            port: OLLAMA_PORT,
        }
    }

    /// Creates a client against a non-standard port (tests, tunnels).
    pub fn with_port(port: u16) -> Self {
        Self {
            http_client: Client::new(),
            port,
        }
    }

    fn worker_url(&self, ip: &str, path: &str) -> String {
        format!("http://{ip}:{port}{path}", port = self.port)
    }
}

#[async_trait]
impl InferenceBackend for OllamaClient {
    /// Triggers a model load by issuing a minimal generate request.
    ///
    /// The worker loads a model on first use, so a one-token prompt with
    /// `stream=false` is enough to get it resident before the real request.
    async fn preload_model(
        &self,
        ip: &str,
        model: &str,
        context_length: Option<u32>,
    ) -> Result<(), AppError> {
        let mut options = serde_json::Map::new();
        if let Some(num_ctx) = context_length {
            drop(options.insert("num_ctx".to_string(), num_ctx.into()));
        }

        let body = json!({
            "model": model,
            "prompt": "test",
            "stream": false,
            "options": options,
        });

        info!(ip = %ip, model = %model, "Preloading model");

        let response = self
            .http_client
            .post(self.worker_url(ip, "/api/generate"))
            .timeout(PRELOAD_TIMEOUT)
            .json(&body)
            .send()
            .await
            .map_err(|err| AppError::ModelLoadFailed(err.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            warn!(ip = %ip, model = %model, status = status.as_u16(), "Model preload rejected");
            return Err(AppError::ModelLoadFailed(format!(
                "worker returned status {}",
                status.as_u16()
            )));
        }

        info!(ip = %ip, model = %model, "Model loaded");
        Ok(())
    }

    async fn dispatch(
        &self,
        ip: &str,
        method: &str,
        path: &str,
        body: Bytes,
    ) -> Result<UpstreamResponse, AppError> {
        let method = reqwest::Method::from_bytes(method.as_bytes())
            .map_err(|err| AppError::Internal(format!("invalid method: {err}")))?;
        let url = self.worker_url(ip, path);

        debug!(url = %url, "Proxying request to worker");

        let mut builder = self
            .http_client
            .request(method, &url)
            .timeout(PROXY_TIMEOUT);
        if !body.is_empty() {
            builder = builder
                .header("Content-Type", "application/json")
                .body(body);
        }

        let response = builder
            .send()
            .await
            .map_err(|err| AppError::UpstreamFailed(err.to_string()))?;

        let status = response.status().as_u16();
        let content_type = response
            .headers()
            .get("content-type")
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);

        let stream = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(|err| AppError::UpstreamFailed(err.to_string())))
            .boxed();

        Ok(UpstreamResponse {
            status,
            content_type,
            body: stream,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;

    #[test]
    fn worker_urls_use_the_fixed_port() {
        let client = OllamaClient::new();
        assert_eq!(
            client.worker_url("10.0.0.7", "/api/generate"),
            "http://10.0.0.7:11434/api/generate"
        );

        let client = OllamaClient::with_port(8081);
        assert_eq!(
            client.worker_url("10.0.0.7", "/api/tags"),
            "http://10.0.0.7:8081/api/tags"
        );
    }

    #[tokio::test]
    async fn collect_bytes_concatenates_chunks() {
        let response = UpstreamResponse {
            status: 200,
            content_type: None,
            body: stream::iter(vec![
                Ok(Bytes::from_static(b"{\"a\":")),
                Ok(Bytes::from_static(b"1}")),
            ])
            .boxed(),
        };

        let collected = response.collect_bytes().await.expect("collect");
        assert_eq!(&collected[..], b"{\"a\":1}");
    }
}
