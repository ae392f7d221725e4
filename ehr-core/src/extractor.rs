use base64::{Engine as _, engine::general_purpose::STANDARD};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use crate::document::{DocumentKind, ExtractionRequest};
use crate::error::{EhrError, Result};
use crate::extraction::ExtractionResult;
use crate::generation::{
    GenerationClient, GenerationConfig, GenerationError, GenerationRequest, generated_text,
};
use crate::retry::RetryPolicy;
use crate::sanitize::sanitize;

/// Upper bound for a single generation attempt
pub const ATTEMPT_TIMEOUT: Duration = Duration::from_secs(60);

/// 5 attempts, 1200 ms first backoff growing 1.8x, retrying only overload and timeouts
pub fn overload_retry_policy() -> RetryPolicy<GenerationError> {
    RetryPolicy::new(
        5,
        Duration::from_millis(1200),
        1.8,
        GenerationError::is_retryable,
    )
}

#[derive(Debug, Clone, Copy)]
pub struct ExtractorConfig {
    pub retry: RetryPolicy<GenerationError>,
    pub attempt_timeout: Duration,
    pub generation: GenerationConfig,
}

impl Default for ExtractorConfig {
    fn default() -> Self {
        Self {
            retry: overload_retry_policy(),
            attempt_timeout: ATTEMPT_TIMEOUT,
            generation: GenerationConfig::extraction(),
        }
    }
}

/// Turns an uploaded document into a typed record through the generation endpoint
#[derive(Clone)]
pub struct DocumentExtractor {
    client: Arc<dyn GenerationClient>,
    config: ExtractorConfig,
}

impl DocumentExtractor {
    pub fn new(client: Arc<dyn GenerationClient>) -> Self {
        Self::with_config(client, ExtractorConfig::default())
    }

    pub fn with_config(client: Arc<dyn GenerationClient>, config: ExtractorConfig) -> Self {
        Self { client, config }
    }

    /// Validate the inputs, then run the extraction. Nothing is sent when validation fails.
    pub async fn extract(
        &self,
        payload: Vec<u8>,
        mime_type: &str,
        document_kind: &str,
    ) -> Result<ExtractionResult> {
        let kind: DocumentKind = document_kind.parse()?;
        let request = ExtractionRequest::new(payload, mime_type, kind)?;
        self.extract_request(&request).await
    }

    pub async fn extract_request(&self, request: &ExtractionRequest) -> Result<ExtractionResult> {
        let kind = request.document_kind;
        let prompt = request.prompt();
        let encoded = STANDARD.encode(&request.payload);

        info!(
            document_kind = %kind,
            mime_type = %request.mime_type,
            payload_bytes = request.payload.len(),
            encoded_bytes = encoded.len(),
            "Starting document extraction"
        );

        let generation_request = GenerationRequest::multimodal(
            prompt.text,
            request.mime_type.clone(),
            encoded,
            self.config.generation,
        );

        let envelope = self
            .config
            .retry
            .run(|attempt| {
                let client = &self.client;
                let generation_request = &generation_request;
                let timeout = self.config.attempt_timeout;
                async move {
                    info!(attempt, "Calling generation endpoint");
                    match tokio::time::timeout(timeout, client.generate(generation_request)).await {
                        Ok(result) => result,
                        Err(_) => {
                            warn!(attempt, "Generation attempt timed out after {:?}", timeout);
                            Err(GenerationError::Timeout(timeout))
                        }
                    }
                }
            })
            .await
            .map_err(|e| {
                let (attempts, source) = e.into_parts();
                error!(attempts, error = %source, "Document extraction failed");
                EhrError::ExternalService { attempts, source }
            })?;

        let text = generated_text(&envelope).unwrap_or_default();
        if text.trim().is_empty() {
            warn!(document_kind = %kind, "No text generated for document");
            return Ok(ExtractionResult::empty(kind));
        }

        let fields = sanitize(text)?;
        info!(
            document_kind = %kind,
            fields = fields.len(),
            "Document extraction completed"
        );

        Ok(ExtractionResult::from_fields(kind, &fields))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::Severity;
    use async_trait::async_trait;
    use serde_json::{Value, json};
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use tokio::time::Instant;

    enum Step {
        Reply(std::result::Result<Value, GenerationError>),
        Hang,
    }

    /// Replays scripted outcomes and records when each attempt arrived
    struct ScriptedClient {
        steps: Mutex<VecDeque<Step>>,
        calls: Mutex<Vec<Instant>>,
        last_request: Mutex<Option<Value>>,
    }

    impl ScriptedClient {
        fn new(steps: Vec<Step>) -> Arc<Self> {
            Arc::new(Self {
                steps: Mutex::new(steps.into()),
                calls: Mutex::new(Vec::new()),
                last_request: Mutex::new(None),
            })
        }

        fn call_times(&self) -> Vec<Instant> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl GenerationClient for ScriptedClient {
        async fn generate(
            &self,
            request: &GenerationRequest,
        ) -> std::result::Result<Value, GenerationError> {
            self.calls.lock().unwrap().push(Instant::now());
            *self.last_request.lock().unwrap() = Some(serde_json::to_value(request).unwrap());

            let step = self.steps.lock().unwrap().pop_front();
            match step {
                Some(Step::Reply(reply)) => reply,
                Some(Step::Hang) => {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    Err(GenerationError::Transport("unreachable".into()))
                }
                None => Err(GenerationError::Transport("script exhausted".into())),
            }
        }
    }

    fn envelope(text: &str) -> Value {
        json!({ "candidates": [{ "content": { "parts": [{ "text": text }] } }] })
    }

    fn overloaded() -> Step {
        Step::Reply(Err(GenerationError::from_status(
            503,
            "The model is overloaded. Please try again later.",
        )))
    }

    fn reply(text: &str) -> Step {
        Step::Reply(Ok(envelope(text)))
    }

    fn extractor(client: &Arc<ScriptedClient>) -> DocumentExtractor {
        DocumentExtractor::new(client.clone())
    }

    fn assert_gap(later: Instant, earlier: Instant, expected_ms: u64) {
        let gap = later - earlier;
        let expected = Duration::from_millis(expected_ms);
        let diff = if gap > expected {
            gap - expected
        } else {
            expected - gap
        };
        assert!(diff <= Duration::from_millis(5), "gap {gap:?}, expected {expected:?}");
    }

    #[tokio::test]
    async fn test_unsupported_kind_makes_no_call() {
        let client = ScriptedClient::new(vec![reply("{}")]);

        for kind in ["vitals", "", "Diagnosis", "lab report"] {
            let err = extractor(&client)
                .extract(b"scan".to_vec(), "image/png", kind)
                .await
                .unwrap_err();
            assert!(matches!(err, EhrError::Validation(_)), "{kind}");
        }
        assert!(client.call_times().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_overload_is_retried_with_backoff() {
        let client = ScriptedClient::new(vec![
            overloaded(),
            overloaded(),
            overloaded(),
            reply(r#"{"testType": "CBC", "remarks": "Normal"}"#),
        ]);

        let result = extractor(&client)
            .extract(b"%PDF-1.7".to_vec(), "application/pdf", "lab-report")
            .await
            .unwrap();

        let ExtractionResult::LabReport(lab) = result else {
            panic!("wrong variant");
        };
        assert_eq!(lab.test_type.as_deref(), Some("CBC"));

        let calls = client.call_times();
        assert_eq!(calls.len(), 4);
        assert_gap(calls[1], calls[0], 1200);
        assert_gap(calls[2], calls[1], 2160);
        assert_gap(calls[3], calls[2], 3888);
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_overload_error_fails_after_one_call() {
        let client = ScriptedClient::new(vec![
            Step::Reply(Err(GenerationError::from_status(400, "API key not valid"))),
            reply("{}"),
        ]);

        let err = extractor(&client)
            .extract(b"scan".to_vec(), "image/jpeg", "diagnosis")
            .await
            .unwrap_err();

        match err {
            EhrError::ExternalService { attempts, source } => {
                assert_eq!(attempts, 1);
                assert_eq!(source.status(), Some(400));
                assert!(source.to_string().contains("API key not valid"));
            }
            other => panic!("unexpected error {other:?}"),
        }
        assert_eq!(client.call_times().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_budget_is_exhausted() {
        let client = ScriptedClient::new((0..6).map(|_| overloaded()).collect());

        let err = extractor(&client)
            .extract(b"scan".to_vec(), "image/png", "surgery")
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            EhrError::ExternalService {
                attempts: 5,
                source: GenerationError::Overloaded { status: 503, .. }
            }
        ));
        assert_eq!(client.call_times().len(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timed_out_attempt_is_retried() {
        let client = ScriptedClient::new(vec![Step::Hang, reply(r#"{"procedure": "Biopsy"}"#)]);

        let result = extractor(&client)
            .extract(b"scan".to_vec(), "image/png", "surgery")
            .await
            .unwrap();

        assert!(matches!(
            result,
            ExtractionResult::Surgery(ref s) if s.procedure.as_deref() == Some("Biopsy")
        ));
        let calls = client.call_times();
        assert_eq!(calls.len(), 2);
        assert_gap(calls[1], calls[0], 60_000 + 1200);
    }

    #[tokio::test]
    async fn test_empty_text_is_no_data() {
        let client = ScriptedClient::new(vec![reply("   ")]);
        let result = extractor(&client)
            .extract(b"scan".to_vec(), "image/png", "prescription")
            .await
            .unwrap();
        assert_eq!(result, ExtractionResult::empty(DocumentKind::Prescription));

        let client = ScriptedClient::new(vec![Step::Reply(Ok(json!({ "candidates": [] })))]);
        let result = extractor(&client)
            .extract(b"scan".to_vec(), "image/png", "diagnosis")
            .await
            .unwrap();
        assert!(result.is_empty());
    }

    #[tokio::test]
    async fn test_unparseable_text_is_parse_error_without_retry() {
        let client = ScriptedClient::new(vec![reply("I could not read this document."), reply("{}")]);

        let err = extractor(&client)
            .extract(b"scan".to_vec(), "image/png", "diagnosis")
            .await
            .unwrap_err();

        assert!(matches!(err, EhrError::Parse(_)));
        assert_eq!(client.call_times().len(), 1);
    }

    #[tokio::test]
    async fn test_request_carries_prompt_and_encoded_document() {
        let client = ScriptedClient::new(vec![reply(
            "```json\n{\"diagnosis\": \"Asthma\", \"severity\": \"Mild\"}\n```",
        )]);

        let result = extractor(&client)
            .extract(b"ABC".to_vec(), "image/png", "diagnosis")
            .await
            .unwrap();

        let ExtractionResult::Diagnosis(diagnosis) = result else {
            panic!("wrong variant");
        };
        assert_eq!(diagnosis.diagnosis.as_deref(), Some("Asthma"));
        assert_eq!(diagnosis.severity, Some(Severity::Mild));

        let sent = client.last_request.lock().unwrap().clone().unwrap();
        let parts = &sent["contents"][0]["parts"];
        assert!(parts[0]["text"].as_str().unwrap().contains("diagnosis information"));
        assert_eq!(parts[1]["inlineData"]["mimeType"], "image/png");
        assert_eq!(parts[1]["inlineData"]["data"], "QUJD");
        assert_eq!(sent["generationConfig"]["temperature"], 0.4);
    }
}
