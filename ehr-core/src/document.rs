use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use std::fmt;
use std::str::FromStr;

use crate::error::{EhrError, Result};

/// MIME types the document scanner accepts
pub const ACCEPTED_MIME_TYPES: &[&str] = &[
    "image/png",
    "image/jpeg",
    "image/jpg",
    "image/webp",
    "application/pdf",
    "application/msword",
    "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
];

/// Clinical category of a scanned document; selects the extraction schema
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DocumentKind {
    Diagnosis,
    Prescription,
    LabReport,
    Surgery,
}

impl DocumentKind {
    pub const ALL: [DocumentKind; 4] = [
        DocumentKind::Diagnosis,
        DocumentKind::Prescription,
        DocumentKind::LabReport,
        DocumentKind::Surgery,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentKind::Diagnosis => "diagnosis",
            DocumentKind::Prescription => "prescription",
            DocumentKind::LabReport => "lab-report",
            DocumentKind::Surgery => "surgery",
        }
    }
}

impl fmt::Display for DocumentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DocumentKind {
    type Err = EhrError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            "diagnosis" => Ok(DocumentKind::Diagnosis),
            "prescription" => Ok(DocumentKind::Prescription),
            "lab-report" | "lab_report" => Ok(DocumentKind::LabReport),
            "surgery" => Ok(DocumentKind::Surgery),
            other => Err(EhrError::validation(format!(
                "Unsupported document kind '{}'",
                other
            ))),
        }
    }
}

/// Fixed extraction prompt for one document kind
#[derive(Debug, Clone, Copy)]
pub struct PromptTemplate {
    pub kind: DocumentKind,
    pub text: &'static str,
}

impl PromptTemplate {
    pub fn for_kind(kind: DocumentKind) -> Self {
        let text = match kind {
            DocumentKind::Diagnosis => DIAGNOSIS_PROMPT,
            DocumentKind::Prescription => PRESCRIPTION_PROMPT,
            DocumentKind::LabReport => LAB_REPORT_PROMPT,
            DocumentKind::Surgery => SURGERY_PROMPT,
        };
        Self { kind, text }
    }

    /// Top-level keys the model is asked to return
    pub fn fields(&self) -> &'static [&'static str] {
        match self.kind {
            DocumentKind::Diagnosis => &["patientId", "date", "diagnosis", "details", "severity"],
            DocumentKind::Prescription => {
                &["patientId", "startDate", "expiryDate", "remarks", "medications"]
            }
            DocumentKind::LabReport => &["patientId", "date", "testType", "remarks"],
            DocumentKind::Surgery => &[
                "patientId",
                "date",
                "procedure",
                "outcome",
                "complications",
                "icdPcsCode",
                "remarks",
            ],
        }
    }

    /// The contract with every field present and empty, as returned for a blank document
    pub fn empty_contract(&self) -> Map<String, Value> {
        self.fields()
            .iter()
            .map(|field| {
                let value = if *field == "medications" {
                    json!([])
                } else {
                    json!("")
                };
                (field.to_string(), value)
            })
            .collect()
    }
}

/// One scan-and-extract action: the uploaded bytes plus what they are expected to contain
#[derive(Debug, Clone)]
pub struct ExtractionRequest {
    pub payload: Vec<u8>,
    pub mime_type: String,
    pub document_kind: DocumentKind,
}

impl ExtractionRequest {
    pub fn new(
        payload: Vec<u8>,
        mime_type: impl Into<String>,
        document_kind: DocumentKind,
    ) -> Result<Self> {
        let mime_type = mime_type.into().trim().to_ascii_lowercase();

        if payload.is_empty() {
            return Err(EhrError::validation("Document payload is empty"));
        }
        if !ACCEPTED_MIME_TYPES.contains(&mime_type.as_str()) {
            return Err(EhrError::validation(format!(
                "Unsupported document type '{}'",
                mime_type
            )));
        }

        Ok(Self {
            payload,
            mime_type,
            document_kind,
        })
    }

    pub fn prompt(&self) -> PromptTemplate {
        PromptTemplate::for_kind(self.document_kind)
    }
}

const DIAGNOSIS_PROMPT: &str = r#"You are a medical AI assistant. Analyze this medical document and extract diagnosis information.
Extract the following fields and return ONLY a valid JSON object (no markdown, no code blocks, no explanations):
{
  "patientId": "patient ID or medical record number",
  "date": "date of diagnosis in YYYY-MM-DD format",
  "diagnosis": "primary diagnosis or condition",
  "details": "detailed clinical notes including symptoms, treatment plan, medications, observations",
  "severity": "mild|moderate|severe|critical"
}
If any field cannot be determined, use an empty string. Return ONLY the JSON object, nothing else."#;

const PRESCRIPTION_PROMPT: &str = r#"You are a medical AI assistant. Analyze this prescription document and extract medication information.
Extract the following fields and return ONLY a valid JSON object (no markdown, no code blocks, no explanations):
{
  "patientId": "patient ID or medical record number",
  "startDate": "prescription start date in YYYY-MM-DD format",
  "expiryDate": "prescription expiry date in YYYY-MM-DD format",
  "remarks": "general prescription notes or instructions",
  "medications": [
    {
      "name": "medication name",
      "dosage": "dosage amount",
      "frequency": "how often to take",
      "duration": "duration of treatment",
      "instructions": "special instructions for this medication"
    }
  ]
}
If multiple medications are listed, include them all in the medications array. If any field cannot be determined, use an empty string, or an empty array for medications. Return ONLY the JSON object, nothing else."#;

const LAB_REPORT_PROMPT: &str = r#"You are a medical AI assistant. Analyze this lab report and extract test information.
Extract the following fields and return ONLY a valid JSON object (no markdown, no code blocks, no explanations):
{
  "patientId": "patient ID or medical record number",
  "date": "date of the test in YYYY-MM-DD format",
  "testType": "type or name of the test performed",
  "remarks": "test results, findings, observations, and any additional notes"
}
If any field cannot be determined, use an empty string. Return ONLY the JSON object, nothing else."#;

const SURGERY_PROMPT: &str = r#"You are a medical AI assistant. Analyze this surgery document and extract surgical procedure information.
Extract the following fields and return ONLY a valid JSON object (no markdown, no code blocks, no explanations):
{
  "patientId": "patient ID or medical record number",
  "date": "date of surgery in YYYY-MM-DD format",
  "procedure": "name of the surgical procedure",
  "outcome": "outcome or result of surgery",
  "complications": "any complications that occurred",
  "icdPcsCode": "ICD-PCS code if available",
  "remarks": "additional notes, findings, or observations"
}
If any field cannot be determined, use an empty string. Return ONLY the JSON object, nothing else."#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_parsing() {
        assert_eq!(
            "lab-report".parse::<DocumentKind>().unwrap(),
            DocumentKind::LabReport
        );
        assert_eq!(
            "lab_report".parse::<DocumentKind>().unwrap(),
            DocumentKind::LabReport
        );
        for kind in DocumentKind::ALL {
            assert_eq!(kind.as_str().parse::<DocumentKind>().unwrap(), kind);
        }

        let err = "vitals".parse::<DocumentKind>().unwrap_err();
        assert!(matches!(err, EhrError::Validation(_)));
    }

    #[test]
    fn test_every_prompt_declares_its_fields() {
        for kind in DocumentKind::ALL {
            let template = PromptTemplate::for_kind(kind);
            for field in template.fields() {
                assert!(
                    template.text.contains(&format!("\"{}\"", field)),
                    "{} prompt is missing {}",
                    kind,
                    field
                );
            }
        }
    }

    #[test]
    fn test_empty_contract_shape() {
        let contract = PromptTemplate::for_kind(DocumentKind::Prescription).empty_contract();
        assert_eq!(contract.len(), 5);
        assert_eq!(contract["medications"], json!([]));
        assert_eq!(contract["remarks"], json!(""));
    }

    #[test]
    fn test_request_validation() {
        let request =
            ExtractionRequest::new(vec![1, 2, 3], " Image/PNG ", DocumentKind::Surgery).unwrap();
        assert_eq!(request.mime_type, "image/png");
        assert_eq!(request.prompt().kind, DocumentKind::Surgery);

        let empty = ExtractionRequest::new(Vec::new(), "image/png", DocumentKind::Surgery);
        assert!(matches!(empty, Err(EhrError::Validation(_))));

        let zip = ExtractionRequest::new(vec![1], "application/zip", DocumentKind::Surgery);
        assert!(matches!(zip, Err(EhrError::Validation(_))));
    }
}
