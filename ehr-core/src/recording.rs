use std::sync::Arc;

use chrono::Utc;
use tracing::{info, warn};

use crate::blob::{Attachment, BlobStore, attachment_path};
use crate::error::{EhrError, Result};
use crate::records::{
    Diagnosis, LabReport, NewDiagnosis, NewLabReport, NewPrescription, NewSurgery, Prescription,
    RecordKind, Surgery,
};
use crate::store::RecordStore;

pub const MAX_LAB_REPORT_BYTES: usize = 10 * 1024 * 1024;

pub const LAB_REPORT_MIME_TYPES: [&str; 4] =
    ["application/pdf", "image/jpeg", "image/png", "image/jpg"];

const DOCTOR_PROFILE_MISSING: &str =
    "Doctor profile not found. Please complete your profile setup.";

/// Creates clinical records on behalf of a signed-in doctor
#[derive(Clone)]
pub struct RecordService {
    store: Arc<dyn RecordStore>,
    blobs: Arc<dyn BlobStore>,
}

impl RecordService {
    pub fn new(store: Arc<dyn RecordStore>, blobs: Arc<dyn BlobStore>) -> Self {
        Self { store, blobs }
    }

    pub async fn add_diagnosis(
        &self,
        user_id: &str,
        draft: NewDiagnosis,
        attachment: Option<Attachment>,
    ) -> Result<Diagnosis> {
        let draft = draft.normalized()?;
        require(&draft.patient_id, "Patient is required")?;
        require(&draft.condition, "Diagnosis is required")?;

        let doctor_id = self.author_for(user_id).await?;
        let file_url = match attachment {
            Some(file) => Some(self.upload(RecordKind::Diagnosis, &draft.patient_id, file).await?),
            None => None,
        };

        let inserted = self
            .store
            .insert_diagnosis(&doctor_id, &draft, file_url.clone())
            .await;
        let created = self.discard_on_error(inserted, file_url.as_deref()).await?;
        info!(id = %created.id, patient_id = %created.patient_id, "Diagnosis added");
        Ok(created)
    }

    pub async fn add_lab_report(
        &self,
        user_id: &str,
        draft: NewLabReport,
        attachment: Option<Attachment>,
    ) -> Result<LabReport> {
        let draft = draft.normalized()?;
        require(&draft.patient_id, "Patient is required")?;
        let file = attachment
            .ok_or_else(|| EhrError::validation("Please upload a lab report file."))?;
        let content_type = file.content_type.trim().to_lowercase();
        if !LAB_REPORT_MIME_TYPES.contains(&content_type.as_str()) {
            return Err(EhrError::validation("Please upload a PDF, JPG, or PNG file."));
        }
        if file.size() > MAX_LAB_REPORT_BYTES {
            return Err(EhrError::validation(
                "Please upload a file smaller than 10MB.",
            ));
        }

        let doctor_id = self.author_for(user_id).await?;
        let file_path = self
            .upload(RecordKind::LabReport, &draft.patient_id, file)
            .await?;

        let inserted = self
            .store
            .insert_lab_report(&doctor_id, &draft, file_path.clone())
            .await;
        let created = self.discard_on_error(inserted, Some(file_path.as_str())).await?;
        info!(id = %created.id, patient_id = %created.patient_id, "Lab report added");
        Ok(created)
    }

    pub async fn add_prescription(
        &self,
        user_id: &str,
        draft: NewPrescription,
    ) -> Result<Prescription> {
        let draft = draft.normalized()?;
        require(&draft.patient_id, "Patient is required")?;
        if draft.medications.is_empty() {
            return Err(EhrError::validation("At least one medication is required"));
        }
        if draft.medications.iter().any(|m| m.name.trim().is_empty()) {
            return Err(EhrError::validation("Every medication needs a name"));
        }

        let doctor_id = self.author_for(user_id).await?;
        let created = self.store.insert_prescription(&doctor_id, &draft).await?;
        info!(
            id = %created.id,
            patient_id = %created.patient_id,
            items = created.items.len(),
            "Prescription added"
        );
        Ok(created)
    }

    pub async fn add_surgery(
        &self,
        user_id: &str,
        draft: NewSurgery,
        attachment: Option<Attachment>,
    ) -> Result<Surgery> {
        let draft = draft.normalized()?;
        require(&draft.patient_id, "Please fill in all required fields.")?;
        require(&draft.procedure, "Please fill in all required fields.")?;
        require(&draft.outcome, "Please fill in all required fields.")?;

        let surgeon_id = self.author_for(user_id).await?;
        let file_url = match attachment {
            Some(file) => Some(self.upload(RecordKind::Surgery, &draft.patient_id, file).await?),
            None => None,
        };

        let inserted = self
            .store
            .insert_surgery(&surgeon_id, &draft, file_url.clone())
            .await;
        let created = self.discard_on_error(inserted, file_url.as_deref()).await?;
        info!(id = %created.id, patient_id = %created.patient_id, "Surgery added");
        Ok(created)
    }

    async fn author_for(&self, user_id: &str) -> Result<String> {
        if user_id.trim().is_empty() {
            return Err(EhrError::lookup("Not authenticated"));
        }
        match self.store.doctor_id_for_user(user_id.trim()).await? {
            Some(doctor_id) => Ok(doctor_id),
            None => {
                warn!(user_id = %user_id, "No doctor profile for user");
                Err(EhrError::lookup(DOCTOR_PROFILE_MISSING))
            }
        }
    }

    async fn upload(&self, kind: RecordKind, patient_id: &str, file: Attachment) -> Result<String> {
        let path = attachment_path(
            kind.storage_folder(),
            patient_id.trim(),
            &file.file_name,
            Utc::now(),
        );
        self.blobs
            .upload(&path, file.bytes, &file.content_type)
            .await
    }

    /// Removes an uploaded attachment whose record was never written, keeping the insert error
    async fn discard_on_error<T>(&self, inserted: Result<T>, uploaded: Option<&str>) -> Result<T> {
        if let (Err(error), Some(path)) = (&inserted, uploaded) {
            warn!(path = %path, error = %error, "Record insert failed, removing its attachment");
            if let Err(cleanup) = self.blobs.remove(path).await {
                warn!(path = %path, error = %cleanup, "Orphaned attachment left in storage");
            }
        }
        inserted
    }
}

fn require(value: &str, message: &str) -> Result<()> {
    if value.trim().is_empty() {
        Err(EhrError::validation(message))
    } else {
        Ok(())
    }
}
