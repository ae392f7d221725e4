use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

use crate::error::EhrError;

/// Clinical severity grade recorded with a diagnosis
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Mild,
    Moderate,
    Severe,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Mild => "mild",
            Severity::Moderate => "moderate",
            Severity::Severe => "severe",
            Severity::Critical => "critical",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Severity {
    type Err = EhrError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "mild" => Ok(Severity::Mild),
            "moderate" => Ok(Severity::Moderate),
            "severe" => Ok(Severity::Severe),
            "critical" => Ok(Severity::Critical),
            other => Err(EhrError::validation(format!("Invalid severity '{}'", other))),
        }
    }
}

/// Source collection of a clinical record
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    Diagnosis,
    LabReport,
    Prescription,
    Surgery,
}

impl RecordKind {
    /// Top-level folder for this kind's attachments in the object store
    pub fn storage_folder(&self) -> &'static str {
        match self {
            RecordKind::Diagnosis => "diagnoses",
            RecordKind::LabReport => "lab-reports",
            RecordKind::Prescription => "prescriptions",
            RecordKind::Surgery => "surgeries",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Diagnosis {
    pub id: String,
    pub patient_id: String,
    pub doctor_id: Option<String>,
    pub date: Option<String>,
    pub condition: String,
    pub clinical_notes: Option<String>,
    pub severity: Option<String>,
    pub file_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct LabReport {
    pub id: String,
    pub patient_id: String,
    pub doctor_id: Option<String>,
    pub date: Option<String>,
    pub report_type: String,
    pub remarks: Option<String>,
    pub tags: Option<Value>,
    pub file_path: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrescriptionItem {
    pub medication: String,
    pub dosage: Option<String>,
    pub frequency: Option<String>,
    pub duration_days: Option<i32>,
    pub instructions: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Prescription {
    pub id: String,
    pub patient_id: String,
    pub doctor_id: Option<String>,
    pub issue_date: Option<String>,
    pub valid_until: Option<String>,
    pub instructions: Option<String>,
    #[sqlx(json)]
    pub items: Vec<PrescriptionItem>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Surgery {
    pub id: String,
    pub patient_id: String,
    pub surgeon_id: Option<String>,
    pub date: Option<String>,
    pub procedure: String,
    pub outcome: Option<String>,
    pub complications: Option<String>,
    pub icd_pcs_code: Option<String>,
    pub remarks: Option<String>,
    pub file_url: Option<String>,
}

/// Author display record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Doctor {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NewDiagnosis {
    pub patient_id: String,
    pub date: String,
    pub condition: String,
    pub clinical_notes: String,
    pub severity: Option<Severity>,
}

impl NewDiagnosis {
    /// Trim every field and check the date, so both stores see the same values
    pub fn normalized(mut self) -> Result<Self, EhrError> {
        trim(&mut [
            &mut self.patient_id,
            &mut self.date,
            &mut self.condition,
            &mut self.clinical_notes,
        ]);
        check_date("Date", &self.date)?;
        Ok(self)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NewLabReport {
    pub patient_id: String,
    pub date: String,
    pub report_type: String,
    pub remarks: String,
    pub tags: Vec<String>,
}

impl NewLabReport {
    pub fn normalized(mut self) -> Result<Self, EhrError> {
        trim(&mut [
            &mut self.patient_id,
            &mut self.date,
            &mut self.report_type,
            &mut self.remarks,
        ]);
        self.tags = self
            .tags
            .iter()
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .collect();
        check_date("Date", &self.date)?;
        Ok(self)
    }

    /// Tags are persisted as `{"tags": [...]}`, or not at all when there are none
    pub fn tags_document(&self) -> Option<Value> {
        let tags: Vec<&str> = self
            .tags
            .iter()
            .map(|t| t.trim())
            .filter(|t| !t.is_empty())
            .collect();
        if tags.is_empty() {
            None
        } else {
            Some(serde_json::json!({ "tags": tags }))
        }
    }
}

/// One medication line as entered on the prescription form
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MedicationDraft {
    pub name: String,
    pub dosage: String,
    pub frequency: String,
    pub duration: String,
    pub instructions: String,
}

impl MedicationDraft {
    pub fn is_blank(&self) -> bool {
        [
            &self.name,
            &self.dosage,
            &self.frequency,
            &self.duration,
            &self.instructions,
        ]
        .iter()
        .all(|field| field.trim().is_empty())
    }

    /// Leading integer of the free-text duration ("10 days" -> 10)
    pub fn duration_days(&self) -> Option<i32> {
        let digits: String = self
            .duration
            .trim()
            .chars()
            .take_while(|c| c.is_ascii_digit())
            .collect();
        digits.parse().ok()
    }

    pub fn to_item(&self) -> PrescriptionItem {
        PrescriptionItem {
            medication: self.name.trim().to_string(),
            dosage: non_empty(&self.dosage),
            frequency: non_empty(&self.frequency),
            duration_days: self.duration_days(),
            instructions: non_empty(&self.instructions),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NewPrescription {
    pub patient_id: String,
    pub start_date: String,
    pub expiry_date: String,
    pub remarks: String,
    pub tags: String,
    pub medications: Vec<MedicationDraft>,
}

impl NewPrescription {
    /// Trims every field, drops blank medication lines and checks both dates
    pub fn normalized(mut self) -> Result<Self, EhrError> {
        trim(&mut [
            &mut self.patient_id,
            &mut self.start_date,
            &mut self.expiry_date,
            &mut self.remarks,
            &mut self.tags,
        ]);
        self.medications.retain(|m| !m.is_blank());
        for medication in &mut self.medications {
            trim(&mut [
                &mut medication.name,
                &mut medication.dosage,
                &mut medication.frequency,
                &mut medication.duration,
                &mut medication.instructions,
            ]);
        }
        check_date("Start date", &self.start_date)?;
        check_date("Expiry date", &self.expiry_date)?;
        Ok(self)
    }

    /// Remarks with the comma-separated tags appended
    pub fn instructions(&self) -> String {
        if self.tags.trim().is_empty() {
            self.remarks.clone()
        } else {
            format!("{}\n\nTags: {}", self.remarks, self.tags.trim())
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NewSurgery {
    pub patient_id: String,
    pub date: String,
    pub procedure: String,
    pub outcome: String,
    pub complications: String,
    pub icd_pcs_code: String,
    pub remarks: String,
}

impl NewSurgery {
    pub fn normalized(mut self) -> Result<Self, EhrError> {
        trim(&mut [
            &mut self.patient_id,
            &mut self.date,
            &mut self.procedure,
            &mut self.outcome,
            &mut self.complications,
            &mut self.icd_pcs_code,
            &mut self.remarks,
        ]);
        check_date("Date", &self.date)?;
        Ok(self)
    }
}

fn trim(fields: &mut [&mut String]) {
    for field in fields.iter_mut() {
        let trimmed = field.trim();
        if trimmed.len() != field.len() {
            **field = trimmed.to_string();
        }
    }
}

/// Empty dates are allowed; anything else must be `YYYY-MM-DD`
fn check_date(label: &str, value: &str) -> Result<(), EhrError> {
    if value.is_empty() || NaiveDate::parse_from_str(value, "%Y-%m-%d").is_ok() {
        Ok(())
    } else {
        Err(EhrError::validation(format!(
            "{} must be a date in YYYY-MM-DD format, got '{}'",
            label, value
        )))
    }
}

pub(crate) fn non_empty(value: &str) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}
