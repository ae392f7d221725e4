use async_trait::async_trait;
use dashmap::DashMap;
use std::cmp::Reverse;
use std::sync::Arc;
use uuid::Uuid;

use crate::error::Result;
use crate::records::{
    Diagnosis, Doctor, LabReport, NewDiagnosis, NewLabReport, NewPrescription, NewSurgery,
    Prescription, Surgery, non_empty,
};

/// Access to the relational record collections.
///
/// Collection queries are scoped to one patient and return rows newest first. Inserts take the
/// author id resolved from the caller's session.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Patient profile owned by an authenticated user
    async fn patient_id_for_user(&self, user_id: &str) -> Result<Option<String>>;
    /// Doctor profile owned by an authenticated user
    async fn doctor_id_for_user(&self, user_id: &str) -> Result<Option<String>>;
    /// Every author with a display name
    async fn doctors(&self) -> Result<Vec<Doctor>>;

    async fn diagnoses(&self, patient_id: &str) -> Result<Vec<Diagnosis>>;
    async fn lab_reports(&self, patient_id: &str) -> Result<Vec<LabReport>>;
    async fn prescriptions(&self, patient_id: &str) -> Result<Vec<Prescription>>;
    async fn surgeries(&self, patient_id: &str) -> Result<Vec<Surgery>>;

    async fn insert_diagnosis(
        &self,
        doctor_id: &str,
        draft: &NewDiagnosis,
        file_url: Option<String>,
    ) -> Result<Diagnosis>;
    async fn insert_lab_report(
        &self,
        doctor_id: &str,
        draft: &NewLabReport,
        file_path: String,
    ) -> Result<LabReport>;
    async fn insert_prescription(
        &self,
        doctor_id: &str,
        draft: &NewPrescription,
    ) -> Result<Prescription>;
    async fn insert_surgery(
        &self,
        surgeon_id: &str,
        draft: &NewSurgery,
        file_url: Option<String>,
    ) -> Result<Surgery>;
}

/// In-memory implementation of RecordStore
#[derive(Default)]
pub struct InMemoryRecordStore {
    patients_by_user: Arc<DashMap<String, String>>,
    doctors_by_user: Arc<DashMap<String, String>>,
    doctors: Arc<DashMap<String, Doctor>>,
    diagnoses: Arc<DashMap<String, Diagnosis>>,
    lab_reports: Arc<DashMap<String, LabReport>>,
    prescriptions: Arc<DashMap<String, Prescription>>,
    surgeries: Arc<DashMap<String, Surgery>>,
}

impl InMemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_patient(&self, user_id: impl Into<String>, patient_id: impl Into<String>) {
        self.patients_by_user
            .insert(user_id.into(), patient_id.into());
    }

    /// Register a doctor, optionally linked to the user account that signs in as them
    pub fn add_doctor(&self, doctor: Doctor, user_id: Option<&str>) {
        if let Some(user_id) = user_id {
            self.doctors_by_user
                .insert(user_id.to_string(), doctor.id.clone());
        }
        self.doctors.insert(doctor.id.clone(), doctor);
    }

    pub fn add_diagnosis(&self, diagnosis: Diagnosis) {
        self.diagnoses.insert(diagnosis.id.clone(), diagnosis);
    }

    pub fn add_lab_report(&self, report: LabReport) {
        self.lab_reports.insert(report.id.clone(), report);
    }

    pub fn add_prescription(&self, prescription: Prescription) {
        self.prescriptions
            .insert(prescription.id.clone(), prescription);
    }

    pub fn add_surgery(&self, surgery: Surgery) {
        self.surgeries.insert(surgery.id.clone(), surgery);
    }
}

/// Rows of `table` owned by `patient_id`, sorted on `date` descending
fn scoped<T: Clone>(
    table: &DashMap<String, T>,
    patient_id: &str,
    owner: impl Fn(&T) -> &str,
    date: impl Fn(&T) -> Option<String>,
) -> Vec<T> {
    let mut rows: Vec<T> = table
        .iter()
        .filter(|entry| owner(entry.value()) == patient_id)
        .map(|entry| entry.value().clone())
        .collect();
    rows.sort_by_key(|row| Reverse(date(row)));
    rows
}

#[async_trait]
impl RecordStore for InMemoryRecordStore {
    async fn patient_id_for_user(&self, user_id: &str) -> Result<Option<String>> {
        Ok(self
            .patients_by_user
            .get(user_id)
            .map(|entry| entry.clone()))
    }

    async fn doctor_id_for_user(&self, user_id: &str) -> Result<Option<String>> {
        Ok(self.doctors_by_user.get(user_id).map(|entry| entry.clone()))
    }

    async fn doctors(&self) -> Result<Vec<Doctor>> {
        Ok(self
            .doctors
            .iter()
            .map(|entry| entry.value().clone())
            .collect())
    }

    async fn diagnoses(&self, patient_id: &str) -> Result<Vec<Diagnosis>> {
        Ok(scoped(
            &self.diagnoses,
            patient_id,
            |d| d.patient_id.as_str(),
            |d| d.date.clone(),
        ))
    }

    async fn lab_reports(&self, patient_id: &str) -> Result<Vec<LabReport>> {
        Ok(scoped(
            &self.lab_reports,
            patient_id,
            |r| r.patient_id.as_str(),
            |r| r.date.clone(),
        ))
    }

    async fn prescriptions(&self, patient_id: &str) -> Result<Vec<Prescription>> {
        Ok(scoped(
            &self.prescriptions,
            patient_id,
            |p| p.patient_id.as_str(),
            |p| p.issue_date.clone(),
        ))
    }

    async fn surgeries(&self, patient_id: &str) -> Result<Vec<Surgery>> {
        Ok(scoped(
            &self.surgeries,
            patient_id,
            |s| s.patient_id.as_str(),
            |s| s.date.clone(),
        ))
    }

    async fn insert_diagnosis(
        &self,
        doctor_id: &str,
        draft: &NewDiagnosis,
        file_url: Option<String>,
    ) -> Result<Diagnosis> {
        let diagnosis = Diagnosis {
            id: Uuid::new_v4().to_string(),
            patient_id: draft.patient_id.clone(),
            doctor_id: Some(doctor_id.to_string()),
            date: non_empty(&draft.date),
            condition: draft.condition.clone(),
            clinical_notes: non_empty(&draft.clinical_notes),
            severity: draft.severity.map(|s| s.to_string()),
            file_url,
        };
        self.add_diagnosis(diagnosis.clone());
        Ok(diagnosis)
    }

    async fn insert_lab_report(
        &self,
        doctor_id: &str,
        draft: &NewLabReport,
        file_path: String,
    ) -> Result<LabReport> {
        let report = LabReport {
            id: Uuid::new_v4().to_string(),
            patient_id: draft.patient_id.clone(),
            doctor_id: Some(doctor_id.to_string()),
            date: non_empty(&draft.date),
            report_type: draft.report_type.clone(),
            remarks: non_empty(&draft.remarks),
            tags: draft.tags_document(),
            file_path: Some(file_path),
        };
        self.add_lab_report(report.clone());
        Ok(report)
    }

    async fn insert_prescription(
        &self,
        doctor_id: &str,
        draft: &NewPrescription,
    ) -> Result<Prescription> {
        let prescription = Prescription {
            id: Uuid::new_v4().to_string(),
            patient_id: draft.patient_id.clone(),
            doctor_id: Some(doctor_id.to_string()),
            issue_date: non_empty(&draft.start_date),
            valid_until: non_empty(&draft.expiry_date),
            instructions: non_empty(&draft.instructions()),
            items: draft.medications.iter().map(|m| m.to_item()).collect(),
        };
        self.add_prescription(prescription.clone());
        Ok(prescription)
    }

    async fn insert_surgery(
        &self,
        surgeon_id: &str,
        draft: &NewSurgery,
        file_url: Option<String>,
    ) -> Result<Surgery> {
        let surgery = Surgery {
            id: Uuid::new_v4().to_string(),
            patient_id: draft.patient_id.clone(),
            surgeon_id: Some(surgeon_id.to_string()),
            date: non_empty(&draft.date),
            procedure: draft.procedure.clone(),
            outcome: non_empty(&draft.outcome),
            complications: non_empty(&draft.complications),
            icd_pcs_code: non_empty(&draft.icd_pcs_code),
            remarks: non_empty(&draft.remarks),
            file_url,
        };
        self.add_surgery(surgery.clone());
        Ok(surgery)
    }
}
