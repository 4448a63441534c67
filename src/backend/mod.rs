//! Text-generation backends.
//!
//! Every provider implements [`GenerationBackend::complete`], one attempt per
//! call. Retry, backoff, timeout, and cancellation are layered on top by
//! [`BackendAdapter`](retry::BackendAdapter), so callers never talk to a
//! provider directly.
//!
//! | Config Value | Provider |
//! |-------------|----------|
//! | `"ollama"` | [`OllamaBackend`](ollama::OllamaBackend) (`/api/generate`) |
//! | `"openai"` | [`OpenAICompatBackend`](openai::OpenAICompatBackend) (`/chat/completions`) |
//! | `"groq"` | same, with Groq's base URL and `GROQ_API_KEY` |

pub mod ollama;
pub mod openai;
pub mod retry;
pub mod scripted;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde::Serialize;

use crate::config::GenerationConfig;
use crate::error::BackendError;

pub use retry::{Backoff, BackendAdapter, RetryPolicy};
pub use scripted::ScriptedBackend;

/// A system/user prompt pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Prompt {
    pub system: String,
    pub user: String,
}

/// Per-call generation options.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletionOptions {
    pub model: String,
    pub temperature: f32,
    pub max_tokens: u32,
    /// Wall-clock limit for one attempt. Always enforced.
    pub timeout: Duration,
}

impl CompletionOptions {
    pub fn from_config(config: &GenerationConfig, temperature: f32) -> Self {
        Self {
            model: config.model_name(),
            temperature,
            max_tokens: config.max_tokens,
            timeout: config.timeout(),
        }
    }
}

/// Uniform call contract over text-generation providers.
#[async_trait]
pub trait GenerationBackend: Send + Sync {
    /// Provider name for logs (e.g. `"ollama"`).
    fn name(&self) -> &str;

    /// Run a single completion attempt.
    async fn complete(
        &self,
        prompt: &Prompt,
        options: &CompletionOptions,
    ) -> Result<String, BackendError>;
}

/// Map a reqwest transport error onto the backend taxonomy.
pub(crate) fn classify_transport(err: reqwest::Error, timeout: Duration) -> BackendError {
    if err.is_timeout() {
        BackendError::Timeout(timeout)
    } else if err.is_builder() || err.is_decode() {
        BackendError::Fatal(err.to_string())
    } else {
        BackendError::Transient(err.to_string())
    }
}

/// Parse a successful response body. A body that is not JSON is a
/// protocol error and is not retried.
pub(crate) fn decode_body(provider: &str, body: &str) -> Result<serde_json::Value, BackendError> {
    serde_json::from_str(body).map_err(|e| {
        let excerpt: String = body.chars().take(200).collect();
        BackendError::Fatal(format!("{} returned a non-JSON body ({}): {}", provider, e, excerpt))
    })
}

/// Build the provider named by `generation.provider`.
///
/// # Errors
///
/// Fails for unknown providers or when the API key variable is unset.
pub fn create_backend(config: &GenerationConfig) -> Result<Arc<dyn GenerationBackend>> {
    match config.provider.as_str() {
        "ollama" => Ok(Arc::new(ollama::OllamaBackend::new(
            config.base_url.as_deref(),
        )?)),
        "openai" | "groq" => Ok(Arc::new(openai::OpenAICompatBackend::from_config(config)?)),
        other => bail!("Unknown generation provider: {}", other),
    }
}
