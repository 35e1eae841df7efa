//! OpenAI-compatible inference client.
//!
//! Sends streaming chat completion requests to the configured endpoint and
//! yields typed units. Handles the fallback chain when the primary model is
//! unavailable.

use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use reqwest::Client as HttpClient;

use super::config::{ModelConfig, ModelsConfig};
use super::errors::InferenceError;
use super::streaming::parse_sse_stream;
use super::types::{ChatCompletionRequest, ChatMessage, ModelRequest, StreamUnit};

// ─── Constants ───────────────────────────────────────────────────────────────

/// TCP connection timeout.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Total request timeout for streaming calls.
///
/// Large contexts can take a long time to prefill before the first token,
/// and long file writes take a long time to generate.
const STREAM_REQUEST_TIMEOUT: Duration = Duration::from_secs(180);

// ─── ModelClient ─────────────────────────────────────────────────────────────

/// A boxed stream of model output units.
pub type UnitStream = Pin<Box<dyn Stream<Item = Result<StreamUnit, InferenceError>> + Send>>;

/// Anything that can turn a [`ModelRequest`] into a stream of units.
///
/// Aborting an invocation is done by dropping the returned stream.
#[async_trait]
pub trait ModelClient: Send + Sync {
    async fn stream_chat(&self, request: ModelRequest) -> Result<UnitStream, InferenceError>;
}

// ─── InferenceClient ─────────────────────────────────────────────────────────

/// Client for an OpenAI-compatible chat completions endpoint.
///
/// Stateless between requests: every call walks the candidate list (active
/// model, then fallback chain) from the start.
pub struct InferenceClient {
    http_stream: HttpClient,
    /// `(model_key, config)` in the order they are tried.
    candidates: Vec<(String, ModelConfig)>,
}

impl InferenceClient {
    /// Create a new inference client from the models configuration.
    ///
    /// Does NOT check connectivity; that happens on the first request.
    pub fn from_config(config: &ModelsConfig) -> Result<Self, InferenceError> {
        let candidates = config.candidates();
        if candidates.is_empty() {
            return Err(InferenceError::ConfigError {
                reason: format!("active model '{}' not found in config", config.active_model),
            });
        }

        let http_stream = HttpClient::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(STREAM_REQUEST_TIMEOUT)
            .build()
            .map_err(|e| InferenceError::ConnectionFailed {
                endpoint: candidates[0].1.base_url.clone(),
                reason: format!("failed to build streaming HTTP client: {e}"),
            })?;

        Ok(Self {
            http_stream,
            candidates,
        })
    }

    /// Display name of the primary model.
    pub fn primary_model_name(&self) -> &str {
        self.candidates
            .first()
            .map(|(_, m)| m.display_name.as_str())
            .unwrap_or("")
    }

    /// Attempt a single streaming request against one model.
    async fn try_stream_request(
        &self,
        key: &str,
        model: &ModelConfig,
        request: &ModelRequest,
    ) -> Result<UnitStream, InferenceError> {
        let url = format!("{}/chat/completions", model.base_url.trim_end_matches('/'));

        let mut messages = Vec::with_capacity(request.messages.len() + 1);
        messages.push(ChatMessage::system(request.system_prompt.clone()));
        messages.extend(request.messages.iter().cloned());

        let body = ChatCompletionRequest {
            model: model.model_name.clone().unwrap_or_else(|| key.to_string()),
            messages,
            tools: request.tools.clone(),
            tool_choice: request.tools.as_ref().map(|_| "auto".to_string()),
            temperature: model.temperature,
            max_tokens: model.max_tokens,
            stream: true,
        };

        // Metadata only; the body can be huge.
        tracing::info!(
            url = %url,
            model = %body.model,
            message_count = body.messages.len(),
            tool_count = body.tools.as_ref().map(|t| t.len()).unwrap_or(0),
            max_tokens = body.max_tokens,
            "=== LLM REQUEST ==="
        );

        let mut builder = self
            .http_stream
            .post(&url)
            .json(&body)
            .header("Accept", "text/event-stream");
        if let Some(key) = model.api_key.as_deref().filter(|k| !k.is_empty()) {
            builder = builder.bearer_auth(key);
        }

        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                InferenceError::Timeout {
                    duration_secs: STREAM_REQUEST_TIMEOUT.as_secs(),
                }
            } else {
                InferenceError::ConnectionFailed {
                    endpoint: url.clone(),
                    reason: e.to_string(),
                }
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            return Err(InferenceError::HttpError {
                status: status.as_u16(),
                body: body_text,
            });
        }

        Ok(parse_sse_stream(response.bytes_stream()).boxed())
    }
}

#[async_trait]
impl ModelClient for InferenceClient {
    /// Stream a chat completion, walking the fallback chain on retriable
    /// failures. Non-retriable errors are returned immediately.
    async fn stream_chat(&self, request: ModelRequest) -> Result<UnitStream, InferenceError> {
        let mut attempted = Vec::new();

        for (key, model) in &self.candidates {
            match self.try_stream_request(key, model, &request).await {
                Ok(stream) => {
                    if !attempted.is_empty() {
                        tracing::info!(model = %key, ?attempted, "using fallback model");
                    }
                    return Ok(stream);
                }
                Err(e) if e.is_retriable() => {
                    tracing::warn!(model = %key, error = %e, "model unavailable, trying next");
                    attempted.push(key.clone());
                }
                Err(e) => return Err(e),
            }
        }

        Err(InferenceError::AllModelsUnavailable { attempted })
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inference::config::parse_models_config;

    #[test]
    fn test_from_config_orders_candidates() {
        let config = parse_models_config(
            r#"
active_model: b
models:
  a: { display_name: "A", base_url: "http://127.0.0.1:1/v1" }
  b: { display_name: "B", base_url: "http://127.0.0.1:1/v1" }
fallback_chain: [a]
"#,
        )
        .unwrap();
        let client = InferenceClient::from_config(&config).unwrap();
        assert_eq!(client.primary_model_name(), "B");
        let keys: Vec<&str> = client.candidates.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(keys, vec!["b", "a"]);
    }

    #[tokio::test]
    async fn test_unreachable_endpoints_exhaust_chain() {
        // Port 1 on loopback refuses connections.
        let config = parse_models_config(
            r#"
active_model: a
models:
  a: { display_name: "A", base_url: "http://127.0.0.1:1/v1" }
  b: { display_name: "B", base_url: "http://127.0.0.1:1/v1" }
fallback_chain: [b]
"#,
        )
        .unwrap();
        let client = InferenceClient::from_config(&config).unwrap();
        let request = ModelRequest {
            system_prompt: "sys".into(),
            messages: vec![ChatMessage::user("hi")],
            tools: None,
        };
        match client.stream_chat(request).await {
            Err(InferenceError::AllModelsUnavailable { attempted }) => {
                assert_eq!(attempted, vec!["a".to_string(), "b".to_string()]);
            }
            Err(other) => panic!("unexpected error: {other}"),
            Ok(_) => panic!("expected failure"),
        }
    }
}
