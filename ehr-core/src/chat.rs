use std::fmt::Write as _;
use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info};

use crate::aggregator::{PatientData, RecordAggregator};
use crate::error::{EhrError, Result};
use crate::generation::{
    GenerationClient, GenerationConfig, GenerationError, GenerationRequest, generated_text,
};

pub const CHAT_TIMEOUT: Duration = Duration::from_secs(60);

const NOT_AVAILABLE: &str = "N/A";

/// Answers questions about one patient's records using the generation endpoint
#[derive(Clone)]
pub struct ChatAssistant {
    client: Arc<dyn GenerationClient>,
    aggregator: RecordAggregator,
    timeout: Duration,
}

impl ChatAssistant {
    pub fn new(client: Arc<dyn GenerationClient>, aggregator: RecordAggregator) -> Self {
        Self {
            client,
            aggregator,
            timeout: CHAT_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Single attempt, no retry
    pub async fn ask(&self, patient_id: &str, question: &str) -> Result<String> {
        let patient_id = patient_id.trim();
        let question = question.trim();
        if patient_id.is_empty() || question.is_empty() {
            return Err(EhrError::validation("patient_id and message are required"));
        }

        let data = self.aggregator.patient_data(patient_id).await?;
        let prompt = build_prompt(patient_id, question, &data);
        let request = GenerationRequest::text(prompt, GenerationConfig::chat());

        info!(
            patient_id = %patient_id,
            question_chars = question.len(),
            "Asking assistant about patient records"
        );

        let outcome = match tokio::time::timeout(self.timeout, self.client.generate(&request)).await
        {
            Ok(result) => result,
            Err(_) => Err(GenerationError::Timeout(self.timeout)),
        };
        let envelope = outcome.map_err(|source| {
            error!(error = %source, "Assistant request failed");
            EhrError::ExternalService {
                attempts: 1,
                source,
            }
        })?;

        match generated_text(&envelope).map(str::trim) {
            Some(answer) if !answer.is_empty() => Ok(answer.to_string()),
            _ => Err(EhrError::ExternalService {
                attempts: 1,
                source: GenerationError::InvalidResponse("no answer text generated".to_string()),
            }),
        }
    }
}

fn or_na(value: Option<&str>) -> &str {
    value.filter(|v| !v.trim().is_empty()).unwrap_or(NOT_AVAILABLE)
}

fn diagnoses_section(data: &PatientData) -> String {
    if data.diagnoses.is_empty() {
        return "No diagnosis records found.".to_string();
    }
    let mut out = String::new();
    for d in &data.diagnoses {
        let _ = writeln!(
            out,
            "- Date: {}, Condition: {}, Severity: {}, Notes: {}",
            or_na(d.date.as_deref()),
            or_na(Some(d.condition.as_str())),
            or_na(d.severity.as_deref()),
            or_na(d.clinical_notes.as_deref()),
        );
    }
    out.trim_end().to_string()
}

fn prescriptions_section(data: &PatientData) -> String {
    let lines: Vec<String> = data
        .prescriptions
        .iter()
        .flat_map(|p| {
            p.items.iter().map(move |item| {
                let duration = item
                    .duration_days
                    .map(|days| format!("{} days", days))
                    .unwrap_or_else(|| NOT_AVAILABLE.to_string());
                format!(
                    "- Medication: {}, Dosage: {}, Frequency: {}, Duration: {}, Instructions: {}, Issued: {}",
                    or_na(Some(item.medication.as_str())),
                    or_na(item.dosage.as_deref()),
                    or_na(item.frequency.as_deref()),
                    duration,
                    or_na(item.instructions.as_deref().or(p.instructions.as_deref())),
                    or_na(p.issue_date.as_deref()),
                )
            })
        })
        .collect();

    if lines.is_empty() {
        "No prescription records found.".to_string()
    } else {
        lines.join("\n")
    }
}

fn lab_reports_section(data: &PatientData) -> String {
    if data.lab_reports.is_empty() {
        return "No lab report records found.".to_string();
    }
    data.lab_reports
        .iter()
        .map(|r| {
            format!(
                "- Test: {}, Date: {}, Remarks: {}",
                or_na(Some(r.report_type.as_str())),
                or_na(r.date.as_deref()),
                or_na(r.remarks.as_deref()),
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Prompt grounding the assistant in the patient's diagnoses, prescriptions and lab reports
pub fn build_prompt(patient_id: &str, question: &str, data: &PatientData) -> String {
    format!(
        r#"You are a helpful Medical Data Assistant. Your role is to help doctors and healthcare professionals understand patient medical records.

IMPORTANT INSTRUCTIONS:
1. Answer questions based only on the provided patient data below
2. Be concise, clear, and professional
3. If the data doesn't contain the answer, politely say so
4. Provide medical insights when relevant
5. Use proper medical terminology
6. Summarize information when asked
7. Highlight important findings or patterns

Patient ID: {patient_id}

User Question: {question}

DIAGNOSES:
{diagnoses}

PRESCRIPTIONS:
{prescriptions}

LAB REPORTS:
{lab_reports}

Please provide a helpful, accurate response based on this data:"#,
        patient_id = patient_id,
        question = question,
        diagnoses = diagnoses_section(data),
        prescriptions = prescriptions_section(data),
        lab_reports = lab_reports_section(data),
    )
}
