//! OpenAI-compatible chat-completions backend, used for OpenAI and Groq.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::json;

use super::{classify_transport, decode_body, CompletionOptions, GenerationBackend, Prompt};
use crate::config::GenerationConfig;
use crate::error::BackendError;

const OPENAI_BASE_URL: &str = "https://api.openai.com/v1";
const GROQ_BASE_URL: &str = "https://api.groq.com/openai/v1";

pub struct OpenAICompatBackend {
    name: String,
    base_url: String,
    api_key: String,
    client: reqwest::Client,
}

impl OpenAICompatBackend {
    pub fn new(name: &str, base_url: &str, api_key: String) -> Result<Self> {
        Ok(Self {
            name: name.to_string(),
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            client: reqwest::Client::builder().build()?,
        })
    }

    /// Read the base URL and key variable for `openai` or `groq`.
    pub fn from_config(config: &GenerationConfig) -> Result<Self> {
        let (default_url, default_env) = match config.provider.as_str() {
            "groq" => (GROQ_BASE_URL, "GROQ_API_KEY"),
            _ => (OPENAI_BASE_URL, "OPENAI_API_KEY"),
        };
        let env_name = config.api_key_env.as_deref().unwrap_or(default_env);
        let api_key = std::env::var(env_name)
            .with_context(|| format!("{} environment variable not set", env_name))?;
        Self::new(
            &config.provider,
            config.base_url.as_deref().unwrap_or(default_url),
            api_key,
        )
    }
}

#[async_trait]
impl GenerationBackend for OpenAICompatBackend {
    fn name(&self) -> &str {
        &self.name
    }

    async fn complete(
        &self,
        prompt: &Prompt,
        options: &CompletionOptions,
    ) -> Result<String, BackendError> {
        let body = json!({
            "model": options.model,
            "messages": [
                {"role": "system", "content": prompt.system},
                {"role": "user", "content": prompt.user},
            ],
            "max_tokens": options.max_tokens,
            "temperature": options.temperature,
        });

        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
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
        let json = decode_body(self.name(), &body)?;
        parse_chat_response(&json)
    }
}

fn parse_chat_response(json: &serde_json::Value) -> Result<String, BackendError> {
    json["choices"][0]["message"]["content"]
        .as_str()
        .map(|s| s.to_string())
        .ok_or_else(|| BackendError::Fatal("Invalid chat completion response format".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_first_choice() {
        let json = json!({
            "choices": [{"index": 0, "message": {"role": "assistant", "content": "hello"}}]
        });
        assert_eq!(parse_chat_response(&json).unwrap(), "hello");
        assert!(parse_chat_response(&json!({"choices": []})).is_err());
    }

    #[test]
    fn explicit_key_and_url() {
        let b = OpenAICompatBackend::new("groq", "https://example.test/v1/", "k".into()).unwrap();
        assert_eq!(b.name(), "groq");
        assert_eq!(b.base_url, "https://example.test/v1");
    }

    #[test]
    fn missing_key_variable_is_an_error() {
        let config = GenerationConfig {
            provider: "openai".into(),
            api_key_env: Some("TB_TEST_KEY_THAT_IS_NEVER_SET".into()),
            ..Default::default()
        };
        let err = OpenAICompatBackend::from_config(&config).err().unwrap();
        assert!(err.to_string().contains("TB_TEST_KEY_THAT_IS_NEVER_SET"));
    }
}
