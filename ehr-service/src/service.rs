use axum::{
    Router,
    extract::{DefaultBodyLimit, Path, State},
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Json},
    routing::{get, post},
};
use base64::{Engine as _, engine::general_purpose::STANDARD};
use ehr_core::blob::attachment_owner;
use ehr_core::extractor::overload_retry_policy;
use ehr_core::recording::MAX_LAB_REPORT_BYTES;
use ehr_core::{
    BlobStore, Caller, ChatAssistant, Diagnosis, DocumentExtractor, EhrError, ExtractorConfig,
    GeminiClient, GenerationClient, LabReport, NewDiagnosis, NewLabReport, NewPrescription,
    NewSurgery, PatientData, PostgresRecordStore, Prescription, RecordAggregator, RecordService,
    RecordStore, RetryPolicy, Subject, SupabaseBlobStore, Surgery,
};
use serde_json::{Value, json};
use std::sync::Arc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{error, info, warn};

use crate::{
    config::{GenerationLimits, ServiceConfig},
    models::{
        ChatRequest, ChatResponse, CreateRecordRequest, DiagnosisForm, ExtractRequest,
        ExtractResponse, HistoryResponse,
    },
};

/// Header carrying the authenticated user's id, set by the auth gateway
pub const USER_ID_HEADER: &str = "x-user-id";

/// Largest accepted request body: a base64-encoded maximum-size lab report plus its form fields
pub const MAX_BODY_BYTES: usize = MAX_LAB_REPORT_BYTES.div_ceil(3) * 4 + 1024 * 1024;

type ApiResult<T> = Result<Json<T>, ApiError>;
type ApiError = (StatusCode, Json<Value>);

fn bad_request_error(message: &str) -> ApiError {
    (StatusCode::BAD_REQUEST, Json(json!({ "error": message })))
}

fn unauthorized_error(message: &str) -> ApiError {
    (StatusCode::UNAUTHORIZED, Json(json!({ "error": message })))
}

fn error_response(status: StatusCode, message: &str, details: &str) -> ApiError {
    (
        status,
        Json(json!({
            "error": message,
            "details": details
        })),
    )
}

/// Map a core error onto a status code and `{ error, details }` body
fn api_error(err: EhrError) -> ApiError {
    let details = err.to_string();
    match &err {
        EhrError::Validation(message) => error_response(StatusCode::BAD_REQUEST, message, &details),
        EhrError::Lookup(message) => error_response(StatusCode::NOT_FOUND, message, &details),
        EhrError::Forbidden(message) => error_response(StatusCode::FORBIDDEN, message, &details),
        EhrError::NotFound(message) => error_response(StatusCode::NOT_FOUND, message, &details),
        EhrError::Parse(_) => error_response(
            StatusCode::UNPROCESSABLE_ENTITY,
            "Could not read structured data from the document",
            &details,
        ),
        EhrError::ExternalService { .. } => {
            warn!("Generation service failure: {}", details);
            error_response(
                StatusCode::BAD_GATEWAY,
                "Generation service unavailable, please try again",
                &details,
            )
        }
        EhrError::Database(_) | EhrError::Storage(_) => {
            error!("Internal failure: {}", details);
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "Internal error", &details)
        }
    }
}

fn session_user(headers: &HeaderMap) -> Result<String, ApiError> {
    headers
        .get(USER_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .ok_or_else(|| unauthorized_error("Not authenticated"))
}

/// Signed-in caller allowed to read `patient_id`'s records
async fn patient_access(
    state: &AppState,
    headers: &HeaderMap,
    patient_id: &str,
) -> Result<Caller, ApiError> {
    let user_id = session_user(headers)?;
    state
        .aggregator
        .authorize(&user_id, patient_id)
        .await
        .map_err(api_error)
}

async fn doctor_access(state: &AppState, headers: &HeaderMap) -> Result<String, ApiError> {
    let user_id = session_user(headers)?;
    match state
        .aggregator
        .resolve_caller(&user_id)
        .await
        .map_err(api_error)?
    {
        Caller::Doctor(doctor_id) => Ok(doctor_id),
        Caller::Patient(_) => Err(api_error(EhrError::Forbidden(
            "Only doctors can scan documents".to_string(),
        ))),
    }
}

#[derive(Clone)]
pub struct AppState {
    pub extractor: DocumentExtractor,
    pub aggregator: RecordAggregator,
    pub records: RecordService,
    pub chat: ChatAssistant,
    pub blobs: Arc<dyn BlobStore>,
}

impl AppState {
    pub fn new(
        generation: Arc<dyn GenerationClient>,
        store: Arc<dyn RecordStore>,
        blobs: Arc<dyn BlobStore>,
        limits: GenerationLimits,
    ) -> Self {
        let aggregator = RecordAggregator::new(store.clone());
        let extractor_config = ExtractorConfig {
            retry: RetryPolicy {
                max_attempts: limits.extraction_attempts,
                ..overload_retry_policy()
            },
            attempt_timeout: limits.attempt_timeout,
            ..ExtractorConfig::default()
        };
        Self {
            extractor: DocumentExtractor::with_config(generation.clone(), extractor_config),
            chat: ChatAssistant::new(generation, aggregator.clone())
                .with_timeout(limits.chat_timeout),
            records: RecordService::new(store, blobs.clone()),
            aggregator,
            blobs,
        }
    }
}

pub async fn create_app(config: &ServiceConfig) -> anyhow::Result<Router> {
    let app_state = create_app_state(config).await?;
    Ok(build_router(app_state))
}

async fn create_app_state(config: &ServiceConfig) -> anyhow::Result<AppState> {
    let generation = GeminiClient::new(&config.gemini_api_key, &config.gemini_model)
        .with_base_url(&config.gemini_base_url);
    let store = PostgresRecordStore::connect(&config.database_url).await?;
    let blobs = SupabaseBlobStore::new(
        &config.storage_url,
        &config.storage_key,
        &config.storage_bucket,
    );

    info!(
        model = %config.gemini_model,
        bucket = %config.storage_bucket,
        attempt_timeout_secs = config.limits.attempt_timeout.as_secs(),
        extraction_attempts = config.limits.extraction_attempts,
        "Service clients initialised"
    );

    Ok(AppState::new(
        Arc::new(generation),
        Arc::new(store),
        Arc::new(blobs),
        config.limits,
    ))
}

pub fn build_router(app_state: AppState) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/health", get(health_check))
        .route("/extract", post(extract_document))
        .route("/patients/{patient_id}/history", get(patient_history))
        .route("/patients/{patient_id}/records", get(patient_records))
        .route("/me/history", get(my_history))
        .route("/chat", post(chat_with_records))
        .route("/records/diagnoses", post(create_diagnosis))
        .route("/records/lab-reports", post(create_lab_report))
        .route("/records/prescriptions", post(create_prescription))
        .route("/records/surgeries", post(create_surgery))
        .route("/attachments/{*path}", get(download_attachment))
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(app_state)
}

async fn root() -> Json<Value> {
    Json(json!({
        "service": "EHR Service",
        "version": "1.0.0",
        "description": "Clinical records, AI-assisted document scanning and a patient-data assistant",
        "endpoints": {
            "POST /extract": "Extract structured fields from a scanned document",
            "GET /patients/{patient_id}/history": "Unified medical history, newest first",
            "GET /patients/{patient_id}/records": "Diagnoses, prescriptions and lab reports",
            "GET /me/history": "Medical history of the signed-in patient",
            "POST /chat": "Ask a question about a patient's records",
            "POST /records/{diagnoses|lab-reports|prescriptions|surgeries}": "Add a clinical record",
            "GET /attachments/{path}": "Download a record attachment",
            "GET /health": "Health check"
        }
    }))
}

async fn health_check() -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339()
    }))
}

async fn extract_document(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<ExtractRequest>,
) -> ApiResult<ExtractResponse> {
    doctor_access(&state, &headers).await?;
    let payload = STANDARD
        .decode(request.data.trim())
        .map_err(|_| bad_request_error("data must be base64 encoded"))?;

    info!(
        document_kind = %request.document_kind,
        mime_type = %request.mime_type,
        payload_bytes = payload.len(),
        "Extraction requested"
    );

    let result = state
        .extractor
        .extract(payload, &request.mime_type, &request.document_kind)
        .await
        .map_err(api_error)?;

    Ok(Json(ExtractResponse {
        document_kind: result.kind().to_string(),
        empty: result.is_empty(),
        result,
    }))
}

async fn history_for(state: &AppState, subject: Subject) -> ApiResult<HistoryResponse> {
    let patient_id = match &subject {
        Subject::Patient(id) => Some(id.clone()),
        Subject::SessionUser(_) => None,
    };
    let records = state.aggregator.aggregate(&subject).await.map_err(api_error)?;

    Ok(Json(HistoryResponse {
        patient_id,
        count: records.len(),
        records,
    }))
}

async fn patient_history(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(patient_id): Path<String>,
) -> ApiResult<HistoryResponse> {
    patient_access(&state, &headers, &patient_id).await?;
    history_for(&state, Subject::Patient(patient_id)).await
}

async fn my_history(State(state): State<AppState>, headers: HeaderMap) -> ApiResult<HistoryResponse> {
    let user_id = session_user(&headers)?;
    history_for(&state, Subject::SessionUser(user_id)).await
}

async fn patient_records(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(patient_id): Path<String>,
) -> ApiResult<PatientData> {
    patient_access(&state, &headers, &patient_id).await?;
    let data = state
        .aggregator
        .patient_data(&patient_id)
        .await
        .map_err(api_error)?;
    Ok(Json(data))
}

async fn chat_with_records(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<ChatRequest>,
) -> ApiResult<ChatResponse> {
    patient_access(&state, &headers, &request.patient_id).await?;
    let response = state
        .chat
        .ask(&request.patient_id, &request.message)
        .await
        .map_err(api_error)?;

    Ok(Json(ChatResponse {
        success: true,
        response,
    }))
}

async fn create_diagnosis(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<CreateRecordRequest<DiagnosisForm>>,
) -> Result<(StatusCode, Json<Diagnosis>), ApiError> {
    let user_id = session_user(&headers)?;
    let (form, attachment) = request.into_parts().map_err(api_error)?;
    let draft = NewDiagnosis::try_from(form).map_err(api_error)?;

    let created = state
        .records
        .add_diagnosis(&user_id, draft, attachment)
        .await
        .map_err(api_error)?;
    Ok((StatusCode::CREATED, Json(created)))
}

async fn create_lab_report(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<CreateRecordRequest<NewLabReport>>,
) -> Result<(StatusCode, Json<LabReport>), ApiError> {
    let user_id = session_user(&headers)?;
    let (draft, attachment) = request.into_parts().map_err(api_error)?;

    let created = state
        .records
        .add_lab_report(&user_id, draft, attachment)
        .await
        .map_err(api_error)?;
    Ok((StatusCode::CREATED, Json(created)))
}

async fn create_prescription(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(draft): Json<NewPrescription>,
) -> Result<(StatusCode, Json<Prescription>), ApiError> {
    let user_id = session_user(&headers)?;

    let created = state
        .records
        .add_prescription(&user_id, draft)
        .await
        .map_err(api_error)?;
    Ok((StatusCode::CREATED, Json(created)))
}

async fn create_surgery(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<CreateRecordRequest<NewSurgery>>,
) -> Result<(StatusCode, Json<Surgery>), ApiError> {
    let user_id = session_user(&headers)?;
    let (draft, attachment) = request.into_parts().map_err(api_error)?;

    let created = state
        .records
        .add_surgery(&user_id, draft, attachment)
        .await
        .map_err(api_error)?;
    Ok((StatusCode::CREATED, Json(created)))
}

async fn download_attachment(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(path): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let user_id = session_user(&headers)?;
    let owner = attachment_owner(&path).map_err(api_error)?;
    state
        .aggregator
        .authorize(&user_id, owner)
        .await
        .map_err(api_error)?;
    let bytes = state.blobs.download(&path).await.map_err(api_error)?;
    Ok((
        [(header::CONTENT_TYPE, "application/octet-stream")],
        bytes,
    ))
}
