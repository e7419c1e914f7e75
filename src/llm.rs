//! LLM client abstraction.
//!
//! - **[`DisabledClient`]**: returns a configuration error; used when no
//!   provider is configured or its API key is missing.
//! - **[`GeminiClient`]**: `models/{model}:generateContent`.
//! - **[`OpenAiClient`]**: chat completions.
//!
//! Both remote clients retry through [`crate::http::post_json`].

use anyhow::Result;
use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;

use crate::config::LlmConfig;
use crate::error::ShelfError;
use crate::http;

#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Provider/model label recorded alongside each history entry.
    fn name(&self) -> &str;

    /// Send one prompt and return the model's text.
    async fn complete(&self, prompt: &str) -> Result<String>;
}

pub struct DisabledClient {
    reason: String,
}

impl DisabledClient {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

#[async_trait]
impl LlmClient for DisabledClient {
    fn name(&self) -> &str {
        "disabled"
    }

    async fn complete(&self, _prompt: &str) -> Result<String> {
        Err(ShelfError::config(self.reason.clone()).into())
    }
}

pub struct GeminiClient {
    client: reqwest::Client,
    label: String,
    endpoint: String,
    api_key: String,
    temperature: Option<f32>,
    max_retries: u32,
}

impl GeminiClient {
    pub fn new(config: &LlmConfig) -> Result<Self> {
        let api_key = http::api_key(&config.key_var())?;
        let model = config
            .model
            .clone()
            .unwrap_or_else(|| "gemini-2.5-flash".to_string());
        let base = config
            .url
            .clone()
            .unwrap_or_else(|| "https://generativelanguage.googleapis.com".to_string());

        Ok(Self {
            client: http::client(config.timeout_secs)?,
            label: format!("gemini/{}", model),
            endpoint: format!(
                "{}/v1beta/models/{}:generateContent",
                base.trim_end_matches('/'),
                model
            ),
            api_key,
            temperature: config.temperature,
            max_retries: config.max_retries,
        })
    }
}

#[async_trait]
impl LlmClient for GeminiClient {
    fn name(&self) -> &str {
        &self.label
    }

    async fn complete(&self, prompt: &str) -> Result<String> {
        let mut body = json!({
            "contents": [{"role": "user", "parts": [{"text": prompt}]}],
        });
        if let Some(t) = self.temperature {
            body["generationConfig"] = json!({ "temperature": t });
        }

        let json = http::post_json(
            &self.client,
            "gemini",
            &self.endpoint,
            &[("x-goog-api-key", self.api_key.clone())],
            &body,
            self.max_retries,
        )
        .await?;

        non_empty("gemini", parse_gemini_response(&json))
    }
}

/// Concatenate the text parts of the first candidate.
fn parse_gemini_response(json: &Value) -> String {
    json.get("candidates")
        .and_then(Value::as_array)
        .and_then(|c| c.first())
        .and_then(|c| c.pointer("/content/parts"))
        .and_then(Value::as_array)
        .map(|parts| {
            parts
                .iter()
                .filter_map(|p| p.get("text").and_then(Value::as_str))
                .collect::<Vec<_>>()
                .join("")
        })
        .unwrap_or_default()
}

pub struct OpenAiClient {
    client: reqwest::Client,
    label: String,
    model: String,
    endpoint: String,
    api_key: String,
    temperature: Option<f32>,
    max_retries: u32,
}

impl OpenAiClient {
    pub fn new(config: &LlmConfig) -> Result<Self> {
        let api_key = http::api_key(&config.key_var())?;
        let model = config
            .model
            .clone()
            .unwrap_or_else(|| "gpt-4o-mini".to_string());
        let base = config
            .url
            .clone()
            .unwrap_or_else(|| "https://api.openai.com".to_string());

        Ok(Self {
            client: http::client(config.timeout_secs)?,
            label: format!("openai/{}", model),
            model,
            endpoint: format!("{}/v1/chat/completions", base.trim_end_matches('/')),
            api_key,
            temperature: config.temperature,
            max_retries: config.max_retries,
        })
    }
}

#[async_trait]
impl LlmClient for OpenAiClient {
    fn name(&self) -> &str {
        &self.label
    }

    async fn complete(&self, prompt: &str) -> Result<String> {
        let mut body = json!({
            "model": self.model,
            "messages": [{"role": "user", "content": prompt}],
        });
        if let Some(t) = self.temperature {
            body["temperature"] = json!(t);
        }

        let json = http::post_json(
            &self.client,
            "openai",
            &self.endpoint,
            &[("Authorization", format!("Bearer {}", self.api_key))],
            &body,
            self.max_retries,
        )
        .await?;

        let text = json
            .pointer("/choices/0/message/content")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        non_empty("openai", text)
    }
}

fn non_empty(service: &str, text: String) -> Result<String> {
    if text.trim().is_empty() {
        Err(ShelfError::external(service, "empty response from model").into())
    } else {
        Ok(text)
    }
}

/// Build the configured client. Construction failures (typically a missing
/// API key) fall back to a [`DisabledClient`] carrying the reason, so the
/// rest of the tool keeps working.
pub fn create_client(config: &LlmConfig) -> Arc<dyn LlmClient> {
    let built: Result<Arc<dyn LlmClient>> = match config.provider.as_str() {
        "disabled" => {
            return Arc::new(DisabledClient::new(
                "LLM provider is disabled; set [llm] provider in config",
            ))
        }
        "gemini" => GeminiClient::new(config).map(|c| Arc::new(c) as Arc<dyn LlmClient>),
        "openai" => OpenAiClient::new(config).map(|c| Arc::new(c) as Arc<dyn LlmClient>),
        other => Err(ShelfError::config(format!("unknown llm provider: {}", other)).into()),
    };

    built.unwrap_or_else(|e| {
        tracing::warn!(provider = %config.provider, error = %e, "LLM client unavailable");
        let reason = match e.downcast_ref::<ShelfError>() {
            Some(ShelfError::Config(msg)) => msg.clone(),
            _ => e.to_string(),
        };
        Arc::new(DisabledClient::new(reason))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gemini_parts_are_joined() {
        let json = json!({"candidates": [{"content": {"parts": [
            {"text": "Hello, "}, {"text": "reader."}
        ]}}]});
        assert_eq!(parse_gemini_response(&json), "Hello, reader.");
        assert_eq!(parse_gemini_response(&json!({"candidates": []})), "");
    }

    #[test]
    fn blank_response_is_external_error() {
        let err = non_empty("gemini", "  \n".to_string()).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ShelfError>(),
            Some(ShelfError::ExternalService { .. })
        ));
    }

    #[tokio::test]
    async fn missing_key_falls_back_to_disabled() {
        let cfg = LlmConfig {
            provider: "gemini".to_string(),
            api_key_env: Some("SHELF_TEST_KEY_THAT_IS_NOT_SET".to_string()),
            ..LlmConfig::default()
        };
        let client = create_client(&cfg);
        assert_eq!(client.name(), "disabled");
        let err = client.complete("hi").await.unwrap_err();
        assert!(err.to_string().contains("SHELF_TEST_KEY_THAT_IS_NOT_SET"));
    }
}
