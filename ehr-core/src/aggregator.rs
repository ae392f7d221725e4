use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, NaiveDate};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{EhrError, Result};
use crate::records::{Diagnosis, LabReport, Prescription, RecordKind, Surgery};
use crate::store::RecordStore;

pub const UNKNOWN_AUTHOR: &str = "Unknown";

/// Whose records to aggregate
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Subject {
    /// A patient id supplied directly
    Patient(String),
    /// The signed-in user, resolved to their own patient profile
    SessionUser(String),
}

/// Role of a signed-in user, resolved from their profiles
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Caller {
    Doctor(String),
    Patient(String),
}

/// One kind-tagged row of the unified medical history
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordEntry {
    pub id: String,
    pub kind: RecordKind,
    pub date: Option<NaiveDate>,
    pub author_name: String,
    pub title: String,
    pub details: String,
    pub attachment_ref: Option<String>,
}

/// Raw collections for one patient, as consumed by the chat assistant
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PatientData {
    pub diagnoses: Vec<Diagnosis>,
    pub prescriptions: Vec<Prescription>,
    pub lab_reports: Vec<LabReport>,
}

impl PatientData {
    pub fn is_empty(&self) -> bool {
        self.diagnoses.is_empty() && self.prescriptions.is_empty() && self.lab_reports.is_empty()
    }
}

/// Merges a patient's four record collections into one newest-first history
#[derive(Clone)]
pub struct RecordAggregator {
    store: Arc<dyn RecordStore>,
}

impl RecordAggregator {
    pub fn new(store: Arc<dyn RecordStore>) -> Self {
        Self { store }
    }

    /// Resolve a session user to a role. A doctor profile takes precedence over a patient one.
    pub async fn resolve_caller(&self, user_id: &str) -> Result<Caller> {
        let user_id = user_id.trim();
        if user_id.is_empty() {
            return Err(EhrError::lookup("Not authenticated"));
        }
        if let Some(doctor_id) = self.store.doctor_id_for_user(user_id).await? {
            return Ok(Caller::Doctor(doctor_id));
        }
        match self.store.patient_id_for_user(user_id).await? {
            Some(patient_id) => Ok(Caller::Patient(patient_id)),
            None => Err(EhrError::Forbidden(
                "No doctor or patient profile for this account".to_string(),
            )),
        }
    }

    /// Doctors may read any patient's records, patients only their own
    pub async fn authorize(&self, user_id: &str, patient_id: &str) -> Result<Caller> {
        let caller = self.resolve_caller(user_id).await?;
        match &caller {
            Caller::Doctor(_) => Ok(caller),
            Caller::Patient(own) if own == patient_id.trim() => Ok(caller),
            Caller::Patient(_) => {
                warn!(user_id = %user_id, patient_id = %patient_id, "Refused cross-patient access");
                Err(EhrError::Forbidden(
                    "Patients may only access their own records".to_string(),
                ))
            }
        }
    }

    pub async fn resolve_subject(&self, subject: &Subject) -> Result<String> {
        match subject {
            Subject::Patient(id) if id.trim().is_empty() => {
                Err(EhrError::lookup("Patient id is required"))
            }
            Subject::Patient(id) => Ok(id.trim().to_string()),
            Subject::SessionUser(user_id) if user_id.trim().is_empty() => {
                Err(EhrError::lookup("Not authenticated"))
            }
            Subject::SessionUser(user_id) => self
                .store
                .patient_id_for_user(user_id.trim())
                .await?
                .ok_or_else(|| EhrError::lookup("Patient profile not found")),
        }
    }

    pub async fn aggregate(&self, subject: &Subject) -> Result<Vec<RecordEntry>> {
        let patient_id = self.resolve_subject(subject).await?;

        let (diagnoses, lab_reports, prescriptions, surgeries, doctors) = tokio::try_join!(
            self.store.diagnoses(&patient_id),
            self.store.lab_reports(&patient_id),
            self.store.prescriptions(&patient_id),
            self.store.surgeries(&patient_id),
            self.store.doctors(),
        )?;

        let authors: HashMap<String, String> =
            doctors.into_iter().map(|d| (d.id, d.name)).collect();
        let author = |id: &Option<String>| -> String {
            id.as_ref()
                .and_then(|id| authors.get(id))
                .cloned()
                .unwrap_or_else(|| UNKNOWN_AUTHOR.to_string())
        };

        let mut entries = Vec::with_capacity(
            diagnoses.len() + lab_reports.len() + prescriptions.len() + surgeries.len(),
        );

        entries.extend(diagnoses.into_iter().map(|d| RecordEntry {
            kind: RecordKind::Diagnosis,
            date: parse_date(d.date.as_deref()),
            author_name: author(&d.doctor_id),
            title: d.condition,
            details: or_placeholder(d.clinical_notes, "No notes"),
            attachment_ref: d.file_url,
            id: d.id,
        }));

        entries.extend(lab_reports.into_iter().map(|r| RecordEntry {
            kind: RecordKind::LabReport,
            date: parse_date(r.date.as_deref()),
            author_name: author(&r.doctor_id),
            title: r.report_type,
            details: or_placeholder(r.remarks, "No remarks"),
            attachment_ref: r.file_path,
            id: r.id,
        }));

        entries.extend(prescriptions.into_iter().map(|p| RecordEntry {
            kind: RecordKind::Prescription,
            date: parse_date(p.issue_date.as_deref()),
            author_name: author(&p.doctor_id),
            title: "Prescription".to_string(),
            details: or_placeholder(p.instructions, "No instructions"),
            attachment_ref: None,
            id: p.id,
        }));

        entries.extend(surgeries.into_iter().map(|s| {
            let details = surgery_details(&s);
            RecordEntry {
                kind: RecordKind::Surgery,
                date: parse_date(s.date.as_deref()),
                author_name: author(&s.surgeon_id),
                title: s.procedure,
                details,
                attachment_ref: s.file_url,
                id: s.id,
            }
        }));

        entries.sort_by(newest_first);

        info!(patient_id = %patient_id, records = entries.len(), "Aggregated medical history");
        Ok(entries)
    }

    /// Diagnoses, prescriptions and lab reports for one patient, newest first
    pub async fn patient_data(&self, patient_id: &str) -> Result<PatientData> {
        let patient_id = self
            .resolve_subject(&Subject::Patient(patient_id.to_string()))
            .await?;

        let (diagnoses, prescriptions, lab_reports) = tokio::try_join!(
            self.store.diagnoses(&patient_id),
            self.store.prescriptions(&patient_id),
            self.store.lab_reports(&patient_id),
        )?;

        debug!(
            patient_id = %patient_id,
            diagnoses = diagnoses.len(),
            prescriptions = prescriptions.len(),
            lab_reports = lab_reports.len(),
            "Fetched patient data"
        );

        Ok(PatientData {
            diagnoses,
            prescriptions,
            lab_reports,
        })
    }
}

fn or_placeholder(value: Option<String>, placeholder: &str) -> String {
    value
        .filter(|v| !v.trim().is_empty())
        .unwrap_or_else(|| placeholder.to_string())
}

fn surgery_details(surgery: &Surgery) -> String {
    let outcome = surgery.outcome.as_deref().unwrap_or_default();
    match surgery.complications.as_deref().map(str::trim) {
        Some(complications) if !complications.is_empty() => {
            format!("Outcome: {}, Complications: {}", outcome, complications)
        }
        _ => format!("Outcome: {}", outcome),
    }
}

/// Accepts `YYYY-MM-DD`, RFC 3339 timestamps, or anything starting with a calendar date
pub fn parse_date(raw: Option<&str>) -> Option<NaiveDate> {
    let raw = raw?.trim();
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .or_else(|| DateTime::parse_from_rfc3339(raw).ok().map(|dt| dt.date_naive()))
        .or_else(|| {
            raw.get(..10)
                .and_then(|prefix| NaiveDate::parse_from_str(prefix, "%Y-%m-%d").ok())
        })
}

/// Date descending with undated entries last, then kind, then id
fn newest_first(a: &RecordEntry, b: &RecordEntry) -> Ordering {
    let by_date = match (a.date, b.date) {
        (Some(x), Some(y)) => y.cmp(&x),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    };
    by_date
        .then(a.kind.cmp(&b.kind))
        .then_with(|| a.id.cmp(&b.id))
}
