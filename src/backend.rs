//! Inference backend abstraction and implementations.
//!
//! Provides the [`InferenceBackend`] trait and two implementations:
//! - [`EchoBackend`]: testing/demo backend with a simulated delay
//! - [`OllamaBackend`]: local Ollama HTTP server
//!
//! The governor treats a backend as an opaque request/response collaborator:
//! `infer` may take milliseconds to seconds and may fail; `reconfigure`
//! switches the active quantization tier; `probe` is a cheap reachability
//! check used by the health monitor.

use crate::tier::QuantizationTier;
use crate::{GenerationParams, GovernorError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info};

/// Trait for inference backends.
///
/// Implementations must be thread-safe (Send + Sync) for use across tasks.
/// The trait is object-safe to allow dynamic dispatch via
/// `Arc<dyn InferenceBackend>`.
#[async_trait]
pub trait InferenceBackend: Send + Sync {
    /// Generate a response for the prompt at the currently configured tier.
    async fn infer(&self, prompt: &str, params: &GenerationParams)
        -> Result<String, GovernorError>;

    /// Switch the backend to the given quantization tier.
    async fn reconfigure(&self, tier: QuantizationTier) -> Result<(), GovernorError>;

    /// Cheap reachability check. Must not perform real inference.
    async fn probe(&self) -> Result<(), GovernorError>;
}

// ============================================================================
// Echo Backend (Testing)
// ============================================================================

/// Dummy echo backend for testing.
///
/// Returns the prompt prefixed with the active tier tag, so tests can
/// observe which tier served a response. Useful for control-loop tests
/// without a real model runtime.
pub struct EchoBackend {
    /// Simulated inference delay.
    pub delay_ms: u64,
    tier: RwLock<QuantizationTier>,
}

impl EchoBackend {
    /// Create an instant echo backend starting at the cheapest tier.
    pub fn new() -> Self {
        Self {
            delay_ms: 0,
            tier: RwLock::new(QuantizationTier::cheapest()),
        }
    }

    /// Create an echo backend with a simulated per-call delay.
    pub fn with_delay(delay_ms: u64) -> Self {
        Self {
            delay_ms,
            tier: RwLock::new(QuantizationTier::cheapest()),
        }
    }

    /// The tier the backend is currently configured for.
    pub async fn current_tier(&self) -> QuantizationTier {
        *self.tier.read().await
    }
}

impl Default for EchoBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl InferenceBackend for EchoBackend {
    async fn infer(
        &self,
        prompt: &str,
        _params: &GenerationParams,
    ) -> Result<String, GovernorError> {
        if self.delay_ms > 0 {
            tokio::time::sleep(Duration::from_millis(self.delay_ms)).await;
        }
        let tier = *self.tier.read().await;
        Ok(format!("[{tier}] {prompt}"))
    }

    async fn reconfigure(&self, tier: QuantizationTier) -> Result<(), GovernorError> {
        *self.tier.write().await = tier;
        Ok(())
    }

    async fn probe(&self) -> Result<(), GovernorError> {
        Ok(())
    }
}

// ============================================================================
// Ollama Backend
// ============================================================================

/// Ollama `/api/generate` request payload.
#[derive(Debug, Serialize)]
struct OllamaGenerateRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    stream: bool,
    options: OllamaOptions,
}

/// Generation options forwarded to Ollama.
#[derive(Debug, Serialize)]
struct OllamaOptions {
    temperature: f32,
    top_p: f32,
    num_predict: u32,
}

/// Ollama `/api/generate` response payload.
#[derive(Debug, Deserialize)]
struct OllamaGenerateResponse {
    response: String,
}

/// Ollama `/api/tags` response payload.
#[derive(Debug, Deserialize)]
struct OllamaTagsResponse {
    models: Vec<OllamaModelTag>,
}

#[derive(Debug, Deserialize)]
struct OllamaModelTag {
    name: String,
}

/// Backend for a local Ollama server.
///
/// Tier switches rewrite the active model tag to `{base}:{tier}` after
/// verifying the tag exists on the server — a missing tag rejects the
/// switch and the previous model stays active.
///
/// ## Example
///
/// ```no_run
/// use std::time::Duration;
/// use tokio_inference_governor::OllamaBackend;
///
/// # fn example() -> Result<(), tokio_inference_governor::GovernorError> {
/// let backend = OllamaBackend::new(
///     "http://localhost:11434",
///     "llama3",
///     Duration::from_secs(30),
/// )?;
/// # Ok(()) }
/// ```
pub struct OllamaBackend {
    client: reqwest::Client,
    base_url: String,
    model_base: String,
    model: RwLock<String>,
    timeout_ms: u64,
}

impl std::fmt::Debug for OllamaBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OllamaBackend")
            .field("base_url", &self.base_url)
            .field("model_base", &self.model_base)
            .field("timeout_ms", &self.timeout_ms)
            .finish_non_exhaustive()
    }
}

impl OllamaBackend {
    /// Create a backend for the server at `base_url`.
    ///
    /// `model` may carry a tag (`llama3:q4_0`); the part before the colon
    /// becomes the base used when rewriting tags on tier switches.
    ///
    /// # Errors
    ///
    /// Returns [`GovernorError::Config`] if the HTTP client cannot be
    /// built, so misconfiguration surfaces at construction time.
    pub fn new(
        base_url: impl Into<String>,
        model: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, GovernorError> {
        let model = model.into();
        let model_base = model
            .split(':')
            .next()
            .unwrap_or(model.as_str())
            .to_string();
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| GovernorError::Config(format!("http client build failed: {e}")))?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            model_base,
            model: RwLock::new(model),
            timeout_ms: timeout.as_millis() as u64,
        })
    }

    /// The model tag currently in use.
    pub async fn current_model(&self) -> String {
        self.model.read().await.clone()
    }

    fn map_send_error(&self, e: reqwest::Error) -> GovernorError {
        if e.is_timeout() {
            GovernorError::Timeout(self.timeout_ms)
        } else {
            GovernorError::Backend(format!("transport error: {e}"))
        }
    }

    async fn list_tags(&self) -> Result<Vec<String>, GovernorError> {
        let resp = self
            .client
            .get(format!("{}/api/tags", self.base_url))
            .send()
            .await
            .map_err(|e| self.map_send_error(e))?;
        if !resp.status().is_success() {
            return Err(GovernorError::Backend(format!(
                "tag listing returned {}",
                resp.status()
            )));
        }
        let tags: OllamaTagsResponse = resp
            .json()
            .await
            .map_err(|e| GovernorError::Backend(format!("malformed tag listing: {e}")))?;
        Ok(tags.models.into_iter().map(|m| m.name).collect())
    }
}

#[async_trait]
impl InferenceBackend for OllamaBackend {
    async fn infer(
        &self,
        prompt: &str,
        params: &GenerationParams,
    ) -> Result<String, GovernorError> {
        let model = self.model.read().await.clone();
        let body = OllamaGenerateRequest {
            model: &model,
            prompt,
            stream: false,
            options: OllamaOptions {
                temperature: params.temperature,
                top_p: params.top_p,
                num_predict: params.max_tokens,
            },
        };

        debug!(model = %model, "sending generate request");
        let resp = self
            .client
            .post(format!("{}/api/generate", self.base_url))
            .json(&body)
            .send()
            .await
            .map_err(|e| self.map_send_error(e))?;

        let status = resp.status();
        if status.is_client_error() {
            let detail = resp.text().await.unwrap_or_default();
            return Err(GovernorError::InvalidRequest(format!(
                "backend rejected request ({status}): {detail}"
            )));
        }
        if !status.is_success() {
            return Err(GovernorError::Backend(format!(
                "backend returned {status}"
            )));
        }

        let parsed: OllamaGenerateResponse = resp
            .json()
            .await
            .map_err(|e| GovernorError::Backend(format!("malformed response: {e}")))?;
        Ok(parsed.response)
    }

    async fn reconfigure(&self, tier: QuantizationTier) -> Result<(), GovernorError> {
        let tag = format!("{}:{}", self.model_base, tier.as_str());
        let available = self
            .list_tags()
            .await
            .map_err(|e| GovernorError::Reconfigure(e.to_string()))?;

        if !available.iter().any(|name| name == &tag) {
            return Err(GovernorError::Reconfigure(format!(
                "model tag {tag} not available on the server"
            )));
        }

        *self.model.write().await = tag.clone();
        info!(model = %tag, "backend reconfigured");
        Ok(())
    }

    async fn probe(&self) -> Result<(), GovernorError> {
        self.list_tags().await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_echo_returns_prompt_with_tier_tag() {
        let backend = EchoBackend::new();
        let out = backend
            .infer("hello", &GenerationParams::default())
            .await
            .unwrap();
        assert_eq!(out, "[q4_0] hello");
    }

    #[tokio::test]
    async fn test_echo_reconfigure_changes_tag() {
        let backend = EchoBackend::new();
        backend.reconfigure(QuantizationTier::F16).await.unwrap();
        assert_eq!(backend.current_tier().await, QuantizationTier::F16);

        let out = backend
            .infer("hello", &GenerationParams::default())
            .await
            .unwrap();
        assert_eq!(out, "[f16] hello");
    }

    #[tokio::test]
    async fn test_echo_probe_succeeds() {
        assert!(EchoBackend::new().probe().await.is_ok());
    }

    #[test]
    fn test_ollama_model_base_strips_tag() {
        let backend = OllamaBackend::new(
            "http://localhost:11434",
            "llama3:latest",
            Duration::from_secs(5),
        )
        .unwrap();
        assert_eq!(backend.model_base, "llama3");
    }

    #[test]
    fn test_ollama_base_url_trailing_slash_normalized() {
        let backend =
            OllamaBackend::new("http://localhost:11434/", "llama3", Duration::from_secs(5))
                .unwrap();
        assert_eq!(backend.base_url, "http://localhost:11434");
    }

    #[test]
    fn test_generate_request_serializes_expected_shape() {
        let body = OllamaGenerateRequest {
            model: "llama3:q4_0",
            prompt: "hi",
            stream: false,
            options: OllamaOptions {
                temperature: 0.7,
                top_p: 0.9,
                num_predict: 256,
            },
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["model"], "llama3:q4_0");
        assert_eq!(json["stream"], false);
        assert_eq!(json["options"]["num_predict"], 256);
    }

    #[test]
    fn test_tags_response_deserializes() {
        let json = r#"{"models":[{"name":"llama3:q4_0"},{"name":"llama3:f16"}]}"#;
        let tags: OllamaTagsResponse = serde_json::from_str(json).unwrap();
        assert_eq!(tags.models.len(), 2);
        assert_eq!(tags.models[0].name, "llama3:q4_0");
    }
}
