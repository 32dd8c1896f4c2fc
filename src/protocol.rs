//! Wire types for the Ollama and OpenAI request dialects.
//!
//! Inference bodies are forwarded to workers verbatim, so the gateway only
//! parses what routing needs (model name, stream flag, options). The OpenAI
//! surface is the exception: those requests are re-shaped into the Ollama
//! chat dialect before dispatch.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// The routing-relevant subset of an Ollama generate/chat body.
///
/// Everything else in the body passes through untouched.
#[derive(Debug, Clone, Deserialize)]
pub struct InferenceEnvelope {
    /// Requested model name.
    pub model: String,
    /// Whether the client asked for a streamed response.
    #[serde(default = "default_stream")]
    pub stream: bool,
    /// Model options; only `num_ctx` matters for routing.
    #[serde(default)]
    pub options: Option<Map<String, Value>>,
}

fn default_stream() -> bool {
    // Ollama streams unless told otherwise.
    true
}

impl InferenceEnvelope {
    /// Context length requested via `options.num_ctx`, if any.
    pub fn context_length(&self) -> Option<u32> {
        context_length(self.options.as_ref())
    }
}

/// Extracts `num_ctx` from an Ollama options object.
pub fn context_length(options: Option<&Map<String, Value>>) -> Option<u32> {
    options
        .and_then(|opts| opts.get("num_ctx"))
        .and_then(Value::as_u64)
        .and_then(|n| u32::try_from(n).ok())
}

/// A message in the Ollama chat dialect.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Message role (system, user, assistant).
    pub role: String,
    /// Message content.
    pub content: String,
    /// Base64-encoded images, when the model is multimodal.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub images: Option<Vec<String>>,
}

/// An Ollama `/api/chat` request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OllamaChatRequest {
    /// Model name to use.
    pub model: String,
    /// Conversation history.
    pub messages: Vec<ChatMessage>,
    /// Response format hint.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
    /// Model options.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub options: Option<Map<String, Value>>,
    /// Whether to stream the response.
    pub stream: bool,
    /// How long the worker should keep the model resident.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub keep_alive: Option<Value>,
}

/// A message in the OpenAI chat dialect.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenAiMessage {
    /// Message role.
    pub role: String,
    /// Message content.
    pub content: String,
}

/// An OpenAI-compatible `/v1/chat/completions` request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenAiChatRequest {
    /// Model name.
    pub model: String,
    /// Chat messages.
    pub messages: Vec<OpenAiMessage>,
    /// Sampling temperature.
    #[serde(default)]
    pub temperature: Option<f64>,
    /// Top-p sampling.
    #[serde(default)]
    pub top_p: Option<f64>,
    /// Number of completions; the gateway honors only 1.
    #[serde(default)]
    pub n: Option<u32>,
    /// Whether to stream the response. OpenAI defaults to false.
    #[serde(default)]
    pub stream: bool,
    /// Stop sequences.
    #[serde(default)]
    pub stop: Option<Value>,
    /// Maximum tokens to generate.
    #[serde(default)]
    pub max_tokens: Option<u64>,
    /// Presence penalty.
    #[serde(default)]
    pub presence_penalty: Option<f64>,
    /// Frequency penalty.
    #[serde(default)]
    pub frequency_penalty: Option<f64>,
    /// Caller-supplied user identifier.
    #[serde(default)]
    pub user: Option<String>,
}

/// Re-shapes an OpenAI chat request into the Ollama chat dialect.
///
/// `max_tokens` maps onto `options.num_ctx`, which is a context budget rather
/// than an output cap. The approximation is lossy but keeps OpenAI clients
/// working against Ollama workers.
pub fn openai_to_ollama_chat(request: &OpenAiChatRequest) -> OllamaChatRequest {
    let messages = request
        .messages
        .iter()
        .map(|msg| ChatMessage {
            role: msg.role.clone(),
            content: msg.content.clone(),
            images: None,
        })
        .collect();

    let mut options = Map::new();
    if let Some(temperature) = request.temperature {
        drop(options.insert("temperature".to_string(), temperature.into()));
    }
    if let Some(top_p) = request.top_p {
        drop(options.insert("top_p".to_string(), top_p.into()));
    }
    if let Some(max_tokens) = request.max_tokens {
        drop(options.insert("num_ctx".to_string(), max_tokens.into()));
    }

    OllamaChatRequest {
        model: request.model.clone(),
        messages,
        format: None,
        options: if options.is_empty() {
            None
        } else {
            Some(options)
        },
        stream: request.stream,
        keep_alive: None,
    }
}
