//! Client side of the hosted multimodal generation endpoint.

use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

pub const DEFAULT_GEMINI_BASE_URL: &str = "https://generativelanguage.googleapis.com";
pub const DEFAULT_GEMINI_MODEL: &str = "gemini-2.5-flash";

/// Failure of a single generation attempt
#[derive(Error, Debug, Clone, PartialEq)]
pub enum GenerationError {
    /// The endpoint is at capacity; worth retrying after a pause
    #[error("Model overloaded (status {status}): {message}")]
    Overloaded { status: u16, message: String },

    #[error("Attempt timed out after {0:?}")]
    Timeout(Duration),

    #[error("Generation request failed (status {status}): {message}")]
    Http { status: u16, message: String },

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Invalid response from generation endpoint: {0}")]
    InvalidResponse(String),
}

impl GenerationError {
    /// Classify a non-2xx response. 503 and any "overloaded" message count as transient overload.
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        let overloaded =
            status == 503 || message.contains("503") || message.to_lowercase().contains("overloaded");

        if overloaded {
            GenerationError::Overloaded { status, message }
        } else {
            GenerationError::Http { status, message }
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            GenerationError::Overloaded { .. } | GenerationError::Timeout(_)
        )
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            GenerationError::Overloaded { status, .. } | GenerationError::Http { status, .. } => {
                Some(*status)
            }
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationRequest {
    pub contents: Vec<Content>,
    pub generation_config: GenerationConfig,
}

#[derive(Debug, Clone, Serialize)]
pub struct Content {
    pub parts: Vec<Part>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum Part {
    Text {
        text: String,
    },
    InlineData {
        #[serde(rename = "inlineData")]
        inline_data: InlineData,
    },
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InlineData {
    pub mime_type: String,
    /// Base64 encoded payload
    pub data: String,
}

/// Sampling parameters sent with every request
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationConfig {
    pub temperature: f64,
    pub top_k: u32,
    pub top_p: f64,
    pub max_output_tokens: u32,
}

impl GenerationConfig {
    /// Low-temperature settings for structured document extraction
    pub fn extraction() -> Self {
        Self {
            temperature: 0.4,
            top_k: 32,
            top_p: 1.0,
            max_output_tokens: 2048,
        }
    }

    /// Settings for the factual patient-data assistant
    pub fn chat() -> Self {
        Self {
            temperature: 0.3,
            top_k: 40,
            top_p: 0.8,
            max_output_tokens: 1024,
        }
    }
}

impl GenerationRequest {
    /// Prompt text followed by one inline document
    pub fn multimodal(
        prompt: impl Into<String>,
        mime_type: impl Into<String>,
        encoded_payload: String,
        generation_config: GenerationConfig,
    ) -> Self {
        Self {
            contents: vec![Content {
                parts: vec![
                    Part::Text {
                        text: prompt.into(),
                    },
                    Part::InlineData {
                        inline_data: InlineData {
                            mime_type: mime_type.into(),
                            data: encoded_payload,
                        },
                    },
                ],
            }],
            generation_config,
        }
    }

    pub fn text(prompt: impl Into<String>, generation_config: GenerationConfig) -> Self {
        Self {
            contents: vec![Content {
                parts: vec![Part::Text {
                    text: prompt.into(),
                }],
            }],
            generation_config,
        }
    }
}

/// Read the generated text from a response envelope (`candidates[0].content.parts[0].text`)
pub fn generated_text(envelope: &Value) -> Option<&str> {
    envelope["candidates"][0]["content"]["parts"][0]["text"].as_str()
}

/// One request/response exchange with a generation endpoint
#[async_trait]
pub trait GenerationClient: Send + Sync {
    /// Submit `request` once and return the raw response envelope
    async fn generate(&self, request: &GenerationRequest) -> Result<Value, GenerationError>;
}

/// HTTP client for the Gemini `generateContent` API, authenticated with a query-string key
#[derive(Clone)]
pub struct GeminiClient {
    http: Client,
    base_url: String,
    model: String,
    api_key: String,
}

impl GeminiClient {
    pub fn new(api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            http: Client::new(),
            base_url: DEFAULT_GEMINI_BASE_URL.to_string(),
            model: model.into(),
            api_key: api_key.into(),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    fn endpoint(&self) -> String {
        format!(
            "{}/v1/models/{}:generateContent",
            self.base_url.trim_end_matches('/'),
            self.model
        )
    }
}

#[async_trait]
impl GenerationClient for GeminiClient {
    async fn generate(&self, request: &GenerationRequest) -> Result<Value, GenerationError> {
        info!(model = %self.model, "Sending generation request");

        let response = self
            .http
            .post(self.endpoint())
            .query(&[("key", self.api_key.as_str())])
            .json(request)
            .send()
            .await
            .map_err(|e| GenerationError::Transport(e.to_string()))?;

        let status = response.status();
        info!(status = status.as_u16(), "Generation response received");

        if !status.is_success() {
            let body: Value = response.json().await.unwrap_or(Value::Null);
            let message = body["error"]["message"]
                .as_str()
                .map(str::to_string)
                .unwrap_or_else(|| format!("Gemini request failed ({})", status.as_u16()));
            warn!(status = status.as_u16(), message = %message, "Generation request rejected");
            return Err(GenerationError::from_status(status.as_u16(), message));
        }

        response
            .json::<Value>()
            .await
            .map_err(|e| GenerationError::InvalidResponse(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const GENERATE_PATH: &str = "/v1/models/gemini-2.5-flash:generateContent";

    fn client(server: &MockServer) -> GeminiClient {
        GeminiClient::new("test-key", DEFAULT_GEMINI_MODEL).with_base_url(server.uri())
    }

    fn request() -> GenerationRequest {
        GenerationRequest::text("hello", GenerationConfig::extraction())
    }

    #[test]
    fn test_classification() {
        assert!(GenerationError::from_status(503, "Service Unavailable").is_retryable());
        assert!(GenerationError::from_status(500, "The model is overloaded.").is_retryable());
        assert!(GenerationError::from_status(429, "upstream said 503").is_retryable());
        assert!(!GenerationError::from_status(400, "API key not valid").is_retryable());
        assert!(GenerationError::Timeout(Duration::from_secs(60)).is_retryable());
        assert!(!GenerationError::Transport("connection reset".into()).is_retryable());
    }

    #[test]
    fn test_multimodal_wire_shape() {
        let request = GenerationRequest::multimodal(
            "extract",
            "image/png",
            "QUJD".to_string(),
            GenerationConfig::extraction(),
        );
        let body = serde_json::to_value(&request).unwrap();

        assert_eq!(body["contents"][0]["parts"][0]["text"], "extract");
        assert_eq!(
            body["contents"][0]["parts"][1]["inlineData"],
            json!({ "mimeType": "image/png", "data": "QUJD" })
        );
        assert_eq!(body["generationConfig"]["topK"], 32);
        assert_eq!(body["generationConfig"]["maxOutputTokens"], 2048);
    }

    #[test]
    fn test_generated_text_path() {
        let envelope = json!({
            "candidates": [{ "content": { "parts": [{ "text": "{\"a\":\"b\"}" }] } }]
        });
        assert_eq!(generated_text(&envelope), Some("{\"a\":\"b\"}"));
        assert_eq!(generated_text(&json!({ "candidates": [] })), None);
    }

    #[tokio::test]
    async fn test_success_returns_envelope() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(GENERATE_PATH))
            .and(query_param("key", "test-key"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "candidates": [{ "content": { "parts": [{ "text": "ok" }] } }]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let envelope = client(&server).generate(&request()).await.unwrap();
        assert_eq!(generated_text(&envelope), Some("ok"));
    }

    #[tokio::test]
    async fn test_unavailable_is_overloaded() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(GENERATE_PATH))
            .respond_with(ResponseTemplate::new(503).set_body_json(json!({
                "error": { "code": 503, "message": "The model is overloaded. Please try again later." }
            })))
            .mount(&server)
            .await;

        let err = client(&server).generate(&request()).await.unwrap_err();
        assert_eq!(
            err,
            GenerationError::Overloaded {
                status: 503,
                message: "The model is overloaded. Please try again later.".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_client_error_message_is_verbatim() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(GENERATE_PATH))
            .respond_with(ResponseTemplate::new(400).set_body_json(json!({
                "error": { "code": 400, "message": "API key not valid. Please pass a valid API key." }
            })))
            .mount(&server)
            .await;

        let err = client(&server).generate(&request()).await.unwrap_err();
        assert!(!err.is_retryable());
        assert_eq!(err.status(), Some(400));
        assert!(err.to_string().contains("API key not valid. Please pass a valid API key."));
    }

    #[tokio::test]
    async fn test_error_without_body_gets_status_message() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(GENERATE_PATH))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let err = client(&server).generate(&request()).await.unwrap_err();
        assert_eq!(
            err,
            GenerationError::Http {
                status: 500,
                message: "Gemini request failed (500)".to_string()
            }
        );
    }
}
