//! Typed view of what the model extracted from a scanned document.
//!
//! The sanitizer hands back an arbitrary JSON object. Here it is narrowed to the fields the
//! prompt for that document kind asked for: non-string junk is dropped, empty strings become
//! `None` ("leave the form field unchanged"), and the diagnosis severity is constrained to the
//! known grades.

use serde::Serialize;
use serde_json::{Map, Value};

use crate::document::DocumentKind;
use crate::records::{
    MedicationDraft, NewDiagnosis, NewLabReport, NewPrescription, NewSurgery, Severity,
};

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DiagnosisFields {
    pub patient_id: Option<String>,
    pub date: Option<String>,
    pub diagnosis: Option<String>,
    pub details: Option<String>,
    pub severity: Option<Severity>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PrescriptionFields {
    pub patient_id: Option<String>,
    pub start_date: Option<String>,
    pub expiry_date: Option<String>,
    pub remarks: Option<String>,
    pub medications: Vec<MedicationDraft>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LabReportFields {
    pub patient_id: Option<String>,
    pub date: Option<String>,
    pub test_type: Option<String>,
    pub remarks: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SurgeryFields {
    pub patient_id: Option<String>,
    pub date: Option<String>,
    pub procedure: Option<String>,
    pub outcome: Option<String>,
    pub complications: Option<String>,
    pub icd_pcs_code: Option<String>,
    pub remarks: Option<String>,
}

/// Extraction outcome, one variant per document kind. Every field is optional.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "documentKind", rename_all = "kebab-case")]
pub enum ExtractionResult {
    Diagnosis(DiagnosisFields),
    Prescription(PrescriptionFields),
    LabReport(LabReportFields),
    Surgery(SurgeryFields),
}

impl ExtractionResult {
    /// "No data found" outcome for `kind`
    pub fn empty(kind: DocumentKind) -> Self {
        match kind {
            DocumentKind::Diagnosis => ExtractionResult::Diagnosis(DiagnosisFields::default()),
            DocumentKind::Prescription => {
                ExtractionResult::Prescription(PrescriptionFields::default())
            }
            DocumentKind::LabReport => ExtractionResult::LabReport(LabReportFields::default()),
            DocumentKind::Surgery => ExtractionResult::Surgery(SurgeryFields::default()),
        }
    }

    /// Narrow a sanitized JSON object to the schema of `kind`
    pub fn from_fields(kind: DocumentKind, fields: &Map<String, Value>) -> Self {
        match kind {
            DocumentKind::Diagnosis => ExtractionResult::Diagnosis(DiagnosisFields {
                patient_id: text(fields, "patientId"),
                date: text(fields, "date"),
                diagnosis: text(fields, "diagnosis"),
                details: text(fields, "details"),
                severity: text(fields, "severity").and_then(|s| s.parse().ok()),
            }),
            DocumentKind::Prescription => ExtractionResult::Prescription(PrescriptionFields {
                patient_id: text(fields, "patientId"),
                start_date: text(fields, "startDate"),
                expiry_date: text(fields, "expiryDate"),
                remarks: text(fields, "remarks"),
                medications: medications(fields),
            }),
            DocumentKind::LabReport => ExtractionResult::LabReport(LabReportFields {
                patient_id: text(fields, "patientId"),
                date: text(fields, "date"),
                test_type: text(fields, "testType"),
                remarks: text(fields, "remarks"),
            }),
            DocumentKind::Surgery => ExtractionResult::Surgery(SurgeryFields {
                patient_id: text(fields, "patientId"),
                date: text(fields, "date"),
                procedure: text(fields, "procedure"),
                outcome: text(fields, "outcome"),
                complications: text(fields, "complications"),
                icd_pcs_code: text(fields, "icdPcsCode"),
                remarks: text(fields, "remarks"),
            }),
        }
    }

    pub fn kind(&self) -> DocumentKind {
        match self {
            ExtractionResult::Diagnosis(_) => DocumentKind::Diagnosis,
            ExtractionResult::Prescription(_) => DocumentKind::Prescription,
            ExtractionResult::LabReport(_) => DocumentKind::LabReport,
            ExtractionResult::Surgery(_) => DocumentKind::Surgery,
        }
    }

    pub fn is_empty(&self) -> bool {
        *self == ExtractionResult::empty(self.kind())
    }
}

impl DiagnosisFields {
    /// Overwrite the draft fields this extraction found a value for
    pub fn fill(&self, draft: &mut NewDiagnosis) {
        fill_text(&mut draft.patient_id, &self.patient_id);
        fill_text(&mut draft.date, &self.date);
        fill_text(&mut draft.condition, &self.diagnosis);
        fill_text(&mut draft.clinical_notes, &self.details);
        if self.severity.is_some() {
            draft.severity = self.severity;
        }
    }
}

impl PrescriptionFields {
    pub fn fill(&self, draft: &mut NewPrescription) {
        fill_text(&mut draft.patient_id, &self.patient_id);
        fill_text(&mut draft.start_date, &self.start_date);
        fill_text(&mut draft.expiry_date, &self.expiry_date);
        fill_text(&mut draft.remarks, &self.remarks);
        if !self.medications.is_empty() {
            draft.medications = self.medications.clone();
        }
    }
}

impl LabReportFields {
    pub fn fill(&self, draft: &mut NewLabReport) {
        fill_text(&mut draft.patient_id, &self.patient_id);
        fill_text(&mut draft.date, &self.date);
        fill_text(&mut draft.report_type, &self.test_type);
        fill_text(&mut draft.remarks, &self.remarks);
    }
}

impl SurgeryFields {
    pub fn fill(&self, draft: &mut NewSurgery) {
        fill_text(&mut draft.patient_id, &self.patient_id);
        fill_text(&mut draft.date, &self.date);
        fill_text(&mut draft.procedure, &self.procedure);
        fill_text(&mut draft.outcome, &self.outcome);
        fill_text(&mut draft.complications, &self.complications);
        fill_text(&mut draft.icd_pcs_code, &self.icd_pcs_code);
        fill_text(&mut draft.remarks, &self.remarks);
    }
}

fn fill_text(target: &mut String, value: &Option<String>) {
    if let Some(value) = value {
        *target = value.clone();
    }
}

/// Non-empty string value of `key`; numbers are accepted and rendered as text
fn text(fields: &Map<String, Value>, key: &str) -> Option<String> {
    let value = match fields.get(key)? {
        Value::String(s) => s.trim().to_string(),
        Value::Number(n) => n.to_string(),
        _ => return None,
    };
    if value.is_empty() { None } else { Some(value) }
}

fn medications(fields: &Map<String, Value>) -> Vec<MedicationDraft> {
    let Some(Value::Array(items)) = fields.get("medications") else {
        return Vec::new();
    };

    items
        .iter()
        .filter_map(Value::as_object)
        .map(|item| MedicationDraft {
            name: text(item, "name").unwrap_or_default(),
            dosage: text(item, "dosage").unwrap_or_default(),
            frequency: text(item, "frequency").unwrap_or_default(),
            duration: text(item, "duration").unwrap_or_default(),
            instructions: text(item, "instructions").unwrap_or_default(),
        })
        .filter(|medication| !medication.is_blank())
        .collect()
}
