//! Ollama `/api/generate` backend (non-streaming).

use anyhow::Result;
use async_trait::async_trait;
use serde_json::json;

use super::{classify_transport, decode_body, CompletionOptions, GenerationBackend, Prompt};
use crate::error::BackendError;

const DEFAULT_URL: &str = "http://localhost:11434";

pub struct OllamaBackend {
    base_url: String,
    client: reqwest::Client,
}

impl OllamaBackend {
    pub fn new(base_url: Option<&str>) -> Result<Self> {
        Ok(Self {
            base_url: base_url
                .unwrap_or(DEFAULT_URL)
                .trim_end_matches('/')
                .to_string(),
            client: reqwest::Client::builder().build()?,
        })
    }
}

#[async_trait]
impl GenerationBackend for OllamaBackend {
    fn name(&self) -> &str {
        "ollama"
    }

    async fn complete(
        &self,
        prompt: &Prompt,
        options: &CompletionOptions,
    ) -> Result<String, BackendError> {
        let body = json!({
            "model": options.model,
            "prompt": prompt.user,
            "system": prompt.system,
            "stream": false,
            "options": {
                "temperature": options.temperature,
                "num_predict": options.max_tokens,
            },
        });

        let response = self
            .client
            .post(format!("{}/api/generate", self.base_url))
            .timeout(options.timeout)
            .json(&body)
            .send()
            .await
            .map_err(|e| classify_transport(e, options.timeout))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(BackendError::from_status(status, &text));
        }

        let body = response
            .text()
            .await
            .map_err(|e| classify_transport(e, options.timeout))?;
        let json = decode_body("ollama", &body)?;
        parse_generate_response(&json)
    }
}

fn parse_generate_response(json: &serde_json::Value) -> Result<String, BackendError> {
    json["response"]
        .as_str()
        .map(|s| s.to_string())
        .ok_or_else(|| BackendError::Fatal("Ollama response missing 'response' field".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_response_field() {
        let json = json!({"model": "llama3.2", "response": "[]", "done": true});
        assert_eq!(parse_generate_response(&json).unwrap(), "[]");
        assert!(matches!(
            parse_generate_response(&json!({"error": "model not found"})),
            Err(BackendError::Fatal(_))
        ));
    }

    #[test]
    fn trims_trailing_slash() {
        let b = OllamaBackend::new(Some("http://gpu-box:11434/")).unwrap();
        assert_eq!(b.base_url, "http://gpu-box:11434");
    }
}
