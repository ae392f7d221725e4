use base64::{Engine as _, engine::general_purpose::STANDARD};
use ehr_core::{
    Attachment, EhrError, ExtractionResult, NewDiagnosis, RecordEntry, Severity,
};
use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize, Deserialize)]
pub struct ExtractRequest {
    pub document_kind: String,
    pub mime_type: String,
    /// Base64 encoded document
    pub data: String,
}

#[derive(Debug, Serialize)]
pub struct ExtractResponse {
    pub document_kind: String,
    pub empty: bool,
    pub result: ExtractionResult,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HistoryResponse {
    pub patient_id: Option<String>,
    pub count: usize,
    pub records: Vec<RecordEntry>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ChatRequest {
    #[serde(default)]
    pub patient_id: String,
    #[serde(default)]
    pub message: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ChatResponse {
    pub success: bool,
    pub response: String,
}

/// File sent inline with a record, base64 encoded
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttachmentUpload {
    pub file_name: String,
    pub content_type: String,
    pub data: String,
}

impl AttachmentUpload {
    pub fn decode(self) -> Result<Attachment, EhrError> {
        let bytes = STANDARD
            .decode(self.data.trim())
            .map_err(|e| EhrError::validation(format!("Attachment is not valid base64: {}", e)))?;
        Ok(Attachment::new(self.file_name, self.content_type, bytes))
    }
}

/// Record fields plus an optional attachment
#[derive(Debug, Deserialize)]
pub struct CreateRecordRequest<T> {
    #[serde(flatten)]
    pub record: T,
    pub attachment: Option<AttachmentUpload>,
}

impl<T> CreateRecordRequest<T> {
    pub fn into_parts(self) -> Result<(T, Option<Attachment>), EhrError> {
        let attachment = self.attachment.map(AttachmentUpload::decode).transpose()?;
        Ok((self.record, attachment))
    }
}

/// Diagnosis form as submitted; severity arrives as free text
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct DiagnosisForm {
    pub patient_id: String,
    pub date: String,
    pub condition: String,
    pub clinical_notes: String,
    pub severity: String,
}

impl TryFrom<DiagnosisForm> for NewDiagnosis {
    type Error = EhrError;

    fn try_from(form: DiagnosisForm) -> Result<Self, Self::Error> {
        let severity = if form.severity.trim().is_empty() {
            None
        } else {
            Some(form.severity.parse::<Severity>()?)
        };
        Ok(NewDiagnosis {
            patient_id: form.patient_id,
            date: form.date,
            condition: form.condition,
            clinical_notes: form.clinical_notes,
            severity,
        })
    }
}
