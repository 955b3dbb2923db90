//! Language-model port and the Cohere chat adapter.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;

use marquee_core::config::LlmConfig;

use crate::error::ChatError;

/// One chat completion call.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GenerationRequest {
    /// System instruction, including the retrieved context.
    pub system: String,
    /// User-facing message.
    pub message: String,
    pub temperature: f32,
    pub max_tokens: u32,
}

/// A text generation provider.
#[async_trait]
pub trait LanguageModel: Send + Sync {
    async fn generate(&self, request: &GenerationRequest) -> Result<String, ChatError>;

    fn model_id(&self) -> &str;
}

/// Client for the Cohere chat endpoint (`POST {endpoint}/v1/chat`).
pub struct CohereClient {
    endpoint: String,
    model: String,
    api_key: String,
    http: Client,
}

impl std::fmt::Debug for CohereClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CohereClient")
            .field("endpoint", &self.endpoint)
            .field("model", &self.model)
            .finish()
    }
}

#[derive(Serialize)]
struct ChatBody<'a> {
    message: &'a str,
    preamble: &'a str,
    model: &'a str,
    temperature: f32,
    max_tokens: u32,
}

#[derive(Deserialize)]
struct ChatReply {
    text: String,
}

impl CohereClient {
    pub fn new(
        endpoint: &str,
        model: &str,
        api_key: &str,
        timeout: Duration,
    ) -> Result<Self, ChatError> {
        if api_key.trim().is_empty() {
            return Err(ChatError::Config("Cohere API key is empty".to_string()));
        }
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ChatError::Config(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            endpoint: endpoint.trim_end_matches('/').to_string(),
            model: model.to_string(),
            api_key: api_key.to_string(),
            http,
        })
    }

    /// Build from config, reading the key from `config.api_key_env`.
    ///
    /// Fails immediately when the variable is unset or blank.
    pub fn from_config(config: &LlmConfig) -> Result<Self, ChatError> {
        let api_key = std::env::var(&config.api_key_env).map_err(|_| {
            ChatError::Config(format!(
                "Environment variable {} is not set",
                config.api_key_env
            ))
        })?;
        Self::new(
            &config.endpoint,
            &config.model,
            &api_key,
            Duration::from_secs(config.timeout_secs),
        )
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl LanguageModel for CohereClient {
    async fn generate(&self, request: &GenerationRequest) -> Result<String, ChatError> {
        let url = format!("{}/v1/chat", self.endpoint);
        debug!(model = %self.model, "Calling Cohere chat");

        let response = self
            .http
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&ChatBody {
                message: &request.message,
                preamble: &request.system,
                model: &self.model,
                temperature: request.temperature,
                max_tokens: request.max_tokens,
            })
            .send()
            .await
            .map_err(|e| ChatError::Llm(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ChatError::Llm(format!(
                "Cohere returned {}: {}",
                status,
                body.trim()
            )));
        }

        let reply: ChatReply = response
            .json()
            .await
            .map_err(|e| ChatError::Llm(format!("Invalid Cohere response: {}", e)))?;
        Ok(reply.text)
    }

    fn model_id(&self) -> &str {
        &self.model
    }
}

/// Stand-in used when no provider is configured. Every call fails, so
/// answers degrade to the retrieved context.
#[derive(Debug, Clone)]
pub struct OfflineModel {
    reason: String,
}

impl OfflineModel {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

#[async_trait]
impl LanguageModel for OfflineModel {
    async fn generate(&self, _request: &GenerationRequest) -> Result<String, ChatError> {
        Err(ChatError::Llm(self.reason.clone()))
    }

    fn model_id(&self) -> &str {
        "offline"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_config_requires_key() {
        let config = LlmConfig {
            api_key_env: "MARQUEE_TEST_UNSET_COHERE_KEY".to_string(),
            ..LlmConfig::default()
        };
        let err = CohereClient::from_config(&config).unwrap_err();
        assert!(matches!(err, ChatError::Config(_)));
        assert!(err.to_string().contains("MARQUEE_TEST_UNSET_COHERE_KEY"));
    }

    #[test]
    fn test_rejects_blank_key() {
        let err = CohereClient::new("https://api.cohere.ai", "command-r", "  ", Duration::from_secs(1))
            .unwrap_err();
        assert!(matches!(err, ChatError::Config(_)));
    }

    #[test]
    fn test_endpoint_is_trimmed() {
        let client =
            CohereClient::new("https://api.cohere.ai/", "command-r", "k", Duration::from_secs(1))
                .unwrap();
        assert_eq!(client.endpoint(), "https://api.cohere.ai");
        assert_eq!(client.model_id(), "command-r");
    }

    #[test]
    fn test_request_body_shape() {
        let body = ChatBody {
            message: "hi",
            preamble: "be nice",
            model: "command-r",
            temperature: 0.5,
            max_tokens: 10,
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["message"], "hi");
        assert_eq!(json["preamble"], "be nice");
        assert_eq!(json["max_tokens"], 10);
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_is_llm_error() {
        let client =
            CohereClient::new("http://127.0.0.1:9", "command-r", "k", Duration::from_secs(2))
                .unwrap();
        let request = GenerationRequest {
            system: "s".to_string(),
            message: "m".to_string(),
            temperature: 0.8,
            max_tokens: 16,
        };
        let err = client.generate(&request).await.unwrap_err();
        assert!(matches!(err, ChatError::Llm(_)));
    }

    #[tokio::test]
    async fn test_offline_model_always_fails() {
        let model = OfflineModel::new("COHERE_API_KEY is not set");
        let request = GenerationRequest {
            system: String::new(),
            message: "hello".to_string(),
            temperature: 0.8,
            max_tokens: 16,
        };
        let err = model.generate(&request).await.unwrap_err();
        assert!(err.to_string().contains("COHERE_API_KEY"));
        assert_eq!(model.model_id(), "offline");
    }
}
