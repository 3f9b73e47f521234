use async_trait::async_trait;
use reqwest::Client;
use serde_json::{Value, json};
use tracing::{debug, warn};

use super::{Oracle, OracleRequest};
use crate::config::OracleConfig;
use crate::error::OracleError;

/// Chat-completions client for OpenAI-compatible endpoints.
pub struct OpenAiOracle {
    client: Client,
    api_key: String,
    endpoint: String,
    model: String,
    temperature: f32,
}

impl OpenAiOracle {
    pub fn new(config: &OracleConfig, api_key: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            api_key: api_key.into(),
            endpoint: format!("{}/chat/completions", config.api_base.trim_end_matches('/')),
            model: config.model.clone(),
            temperature: config.temperature,
        }
    }

    /// Reads the key from the variable named in `config.api_key_env`.
    pub fn from_env(config: &OracleConfig) -> Result<Self, OracleError> {
        let api_key = std::env::var(&config.api_key_env).map_err(|_| {
            OracleError::NotConfigured(format!("{} not set in environment", config.api_key_env))
        })?;
        Ok(Self::new(config, api_key))
    }

    fn body(&self, request: &OracleRequest) -> Value {
        let last_user = request.messages.iter().rposition(|m| m.role == "user");
        let messages: Vec<Value> = request
            .messages
            .iter()
            .enumerate()
            .map(|(i, m)| match (&request.image, Some(i) == last_user) {
                (Some(image), true) => json!({
                    "role": m.role,
                    "content": [
                        {"type": "text", "text": m.content},
                        {"type": "image_url", "image_url": {"url": image.data_url()}},
                    ],
                }),
                _ => json!({"role": m.role, "content": m.content}),
            })
            .collect();

        json!({
            "model": self.model,
            "messages": messages,
            "temperature": self.temperature,
        })
    }
}

#[async_trait]
impl Oracle for OpenAiOracle {
    async fn complete(&self, request: OracleRequest) -> Result<String, OracleError> {
        debug!(
            purpose = ?request.purpose,
            messages = request.messages.len(),
            image = request.image.is_some(),
            "oracle request"
        );

        let response = self
            .client
            .post(&self.endpoint)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&self.body(&request))
            .send()
            .await
            .map_err(|e| OracleError::Transport(e.to_string()))?;

        let status = response.status();
        let json_resp: Value = response
            .json()
            .await
            .map_err(|e| OracleError::Transport(format!("unreadable response: {e}")))?;

        if !status.is_success() {
            let message = json_resp["error"]["message"]
                .as_str()
                .unwrap_or("Unknown API error")
                .to_string();
            warn!(%status, %message, "oracle API error");
            return Err(OracleError::Api {
                status: status.as_u16(),
                message,
            });
        }

        let content = json_resp["choices"][0]["message"]["content"]
            .as_str()
            .ok_or(OracleError::EmptyResponse)?;
        debug!(reply = %content, "oracle reply");
        Ok(content.to_string())
    }
}
