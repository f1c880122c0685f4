//! Chat-completion client abstraction.
//!
//! [`ChatClient`] is the only way the orchestrator reaches a language
//! model. [`OpenAIChatClient`] speaks the OpenAI `/chat/completions`
//! protocol, so it also works against compatible local servers by
//! pointing `[chat].base_url` at them.

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;

use crate::config::ChatConfig;
use crate::models::ConversationTurn;

/// Token counters as reported by the provider. Any of them may be absent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
pub struct RawUsage {
    #[serde(default)]
    pub prompt_tokens: Option<i64>,
    #[serde(default)]
    pub completion_tokens: Option<i64>,
    #[serde(default)]
    pub total_tokens: Option<i64>,
}

/// A successful completion.
#[derive(Debug, Clone, PartialEq)]
pub struct ChatCompletion {
    pub content: String,
    pub usage: Option<RawUsage>,
}

#[async_trait]
pub trait ChatClient: Send + Sync {
    /// Generate a reply to `messages`. Failures are returned as errors,
    /// never as an empty completion.
    async fn chat(
        &self,
        model: &str,
        messages: &[ConversationTurn],
        temperature: f32,
    ) -> Result<ChatCompletion>;
}

pub struct OpenAIChatClient {
    endpoint: String,
    api_key: String,
    client: reqwest::Client,
}

impl OpenAIChatClient {
    /// # Errors
    ///
    /// Returns an error if the configured API key variable is not set.
    pub fn new(config: &ChatConfig) -> Result<Self> {
        let api_key = std::env::var(&config.api_key_env)
            .map_err(|_| anyhow!("{} environment variable not set", config.api_key_env))?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            endpoint: format!("{}/chat/completions", config.base_url.trim_end_matches('/')),
            api_key,
            client,
        })
    }
}

#[async_trait]
impl ChatClient for OpenAIChatClient {
    async fn chat(
        &self,
        model: &str,
        messages: &[ConversationTurn],
        temperature: f32,
    ) -> Result<ChatCompletion> {
        let body = serde_json::json!({
            "model": model,
            "messages": messages,
            "temperature": temperature,
        });

        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            bail!("Chat completion API error {}: {}", status, body_text);
        }

        let json: serde_json::Value = response.json().await?;
        parse_chat_response(&json)
    }
}

/// Extract `choices[0].message.content` and `usage` from a response body.
pub fn parse_chat_response(json: &serde_json::Value) -> Result<ChatCompletion> {
    let message = json
        .get("choices")
        .and_then(|c| c.as_array())
        .and_then(|c| c.first())
        .and_then(|c| c.get("message"))
        .ok_or_else(|| anyhow!("Invalid chat completion response: missing choices[0].message"))?;

    let content = message
        .get("content")
        .and_then(|c| c.as_str())
        .unwrap_or_default()
        .to_string();

    let usage = match json.get("usage") {
        Some(u) if !u.is_null() => Some(serde_json::from_value::<RawUsage>(u.clone())?),
        _ => None,
    };

    Ok(ChatCompletion { content, usage })
}
