use async_trait::async_trait;
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use tracing::info;

use crate::error::Result;
use crate::records::{
    Diagnosis, Doctor, LabReport, NewDiagnosis, NewLabReport, NewPrescription, NewSurgery,
    Prescription, Surgery,
};
use crate::store::RecordStore;

const DIAGNOSIS_COLUMNS: &str = "id::text AS id, patient_id::text AS patient_id, \
     doctor_id::text AS doctor_id, date::text AS date, COALESCE(condition, '') AS condition, \
     clinical_notes, severity, file_url";

const LAB_REPORT_COLUMNS: &str = "id::text AS id, patient_id::text AS patient_id, \
     doctor_id::text AS doctor_id, date::text AS date, COALESCE(report_type, '') AS report_type, \
     remarks, tags::jsonb AS tags, file_path";

const SURGERY_COLUMNS: &str = "id::text AS id, patient_id::text AS patient_id, \
     surgeon_id::text AS surgeon_id, date::text AS date, COALESCE(procedure, '') AS procedure, \
     outcome, complications, icd_pcs_code, remarks, file_url";

const PRESCRIPTIONS_FOR_PATIENT: &str = r#"
    SELECT p.id::text AS id,
           p.patient_id::text AS patient_id,
           p.doctor_id::text AS doctor_id,
           p.issue_date::text AS issue_date,
           p.valid_until::text AS valid_until,
           p.instructions,
           COALESCE(
               json_agg(json_build_object(
                   'medication', COALESCE(i.medication, ''),
                   'dosage', i.dosage,
                   'frequency', i.frequency,
                   'duration_days', i.duration_days,
                   'instructions', i.instructions
               )) FILTER (WHERE i.id IS NOT NULL),
               '[]'::json
           ) AS items
    FROM prescriptions p
    LEFT JOIN prescription_items i ON i.prescription_id = p.id
    WHERE p.patient_id::text = $1
    GROUP BY p.id
    ORDER BY p.issue_date DESC NULLS LAST
"#;

/// PostgreSQL implementation of RecordStore over the hosted project's tables
#[derive(Clone)]
pub struct PostgresRecordStore {
    pool: PgPool,
}

impl PostgresRecordStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await?;
        info!("Connected to record database");
        Ok(Self::new(pool))
    }
}

#[async_trait]
impl RecordStore for PostgresRecordStore {
    async fn patient_id_for_user(&self, user_id: &str) -> Result<Option<String>> {
        let id = sqlx::query_scalar::<_, String>(
            "SELECT id::text FROM patients WHERE user_id::text = $1 LIMIT 1",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(id)
    }

    async fn doctor_id_for_user(&self, user_id: &str) -> Result<Option<String>> {
        let id = sqlx::query_scalar::<_, String>(
            "SELECT id::text FROM doctors WHERE user_id::text = $1 LIMIT 1",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(id)
    }

    async fn doctors(&self) -> Result<Vec<Doctor>> {
        let doctors = sqlx::query_as::<_, Doctor>(
            "SELECT id::text AS id, COALESCE(name, '') AS name FROM doctors",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(doctors)
    }

    async fn diagnoses(&self, patient_id: &str) -> Result<Vec<Diagnosis>> {
        let sql = format!(
            "SELECT {DIAGNOSIS_COLUMNS} FROM diagnoses WHERE patient_id::text = $1 \
             ORDER BY date DESC NULLS LAST"
        );
        let rows = sqlx::query_as::<_, Diagnosis>(&sql)
            .bind(patient_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows)
    }

    async fn lab_reports(&self, patient_id: &str) -> Result<Vec<LabReport>> {
        let sql = format!(
            "SELECT {LAB_REPORT_COLUMNS} FROM lab_reports WHERE patient_id::text = $1 \
             ORDER BY date DESC NULLS LAST"
        );
        let rows = sqlx::query_as::<_, LabReport>(&sql)
            .bind(patient_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows)
    }

    async fn prescriptions(&self, patient_id: &str) -> Result<Vec<Prescription>> {
        let rows = sqlx::query_as::<_, Prescription>(PRESCRIPTIONS_FOR_PATIENT)
            .bind(patient_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows)
    }

    async fn surgeries(&self, patient_id: &str) -> Result<Vec<Surgery>> {
        let sql = format!(
            "SELECT {SURGERY_COLUMNS} FROM surgeries WHERE patient_id::text = $1 \
             ORDER BY date DESC NULLS LAST"
        );
        let rows = sqlx::query_as::<_, Surgery>(&sql)
            .bind(patient_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows)
    }

    async fn insert_diagnosis(
        &self,
        doctor_id: &str,
        draft: &NewDiagnosis,
        file_url: Option<String>,
    ) -> Result<Diagnosis> {
        let sql = format!(
            "INSERT INTO diagnoses \
                 (patient_id, doctor_id, date, condition, clinical_notes, severity, file_url) \
             VALUES ($1::uuid, $2::uuid, NULLIF($3, '')::date, $4, NULLIF($5, ''), $6, $7) \
             RETURNING {DIAGNOSIS_COLUMNS}"
        );
        let row = sqlx::query_as::<_, Diagnosis>(&sql)
            .bind(&draft.patient_id)
            .bind(doctor_id)
            .bind(&draft.date)
            .bind(&draft.condition)
            .bind(&draft.clinical_notes)
            .bind(draft.severity.map(|s| s.to_string()))
            .bind(file_url)
            .fetch_one(&self.pool)
            .await?;
        Ok(row)
    }

    async fn insert_lab_report(
        &self,
        doctor_id: &str,
        draft: &NewLabReport,
        file_path: String,
    ) -> Result<LabReport> {
        let sql = format!(
            "INSERT INTO lab_reports \
                 (patient_id, doctor_id, date, report_type, remarks, tags, file_path, file_url) \
             VALUES ($1::uuid, $2::uuid, NULLIF($3, '')::date, $4, NULLIF($5, ''), $6, $7, $7) \
             RETURNING {LAB_REPORT_COLUMNS}"
        );
        let row = sqlx::query_as::<_, LabReport>(&sql)
            .bind(&draft.patient_id)
            .bind(doctor_id)
            .bind(&draft.date)
            .bind(&draft.report_type)
            .bind(&draft.remarks)
            .bind(draft.tags_document())
            .bind(file_path)
            .fetch_one(&self.pool)
            .await?;
        Ok(row)
    }

    async fn insert_prescription(
        &self,
        doctor_id: &str,
        draft: &NewPrescription,
    ) -> Result<Prescription> {
        let mut tx = self.pool.begin().await?;

        let prescription_id = sqlx::query_scalar::<_, String>(
            "INSERT INTO prescriptions (patient_id, doctor_id, issue_date, valid_until, instructions) \
             VALUES ($1::uuid, $2::uuid, NULLIF($3, '')::date, NULLIF($4, '')::date, NULLIF($5, '')) \
             RETURNING id::text",
        )
        .bind(&draft.patient_id)
        .bind(doctor_id)
        .bind(&draft.start_date)
        .bind(&draft.expiry_date)
        .bind(draft.instructions())
        .fetch_one(&mut *tx)
        .await?;

        let items: Vec<_> = draft.medications.iter().map(|m| m.to_item()).collect();
        for item in &items {
            sqlx::query(
                "INSERT INTO prescription_items \
                     (prescription_id, medication, dosage, frequency, duration_days, instructions) \
                 VALUES ($1::uuid, $2, $3, $4, $5, $6)",
            )
            .bind(&prescription_id)
            .bind(&item.medication)
            .bind(&item.dosage)
            .bind(&item.frequency)
            .bind(item.duration_days)
            .bind(&item.instructions)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;

        let instructions = draft.instructions();
        Ok(Prescription {
            id: prescription_id,
            patient_id: draft.patient_id.clone(),
            doctor_id: Some(doctor_id.to_string()),
            issue_date: Some(draft.start_date.clone()).filter(|d| !d.is_empty()),
            valid_until: Some(draft.expiry_date.clone()).filter(|d| !d.is_empty()),
            instructions: Some(instructions).filter(|i| !i.is_empty()),
            items,
        })
    }

    async fn insert_surgery(
        &self,
        surgeon_id: &str,
        draft: &NewSurgery,
        file_url: Option<String>,
    ) -> Result<Surgery> {
        let sql = format!(
            "INSERT INTO surgeries \
                 (patient_id, surgeon_id, date, procedure, outcome, complications, \
                  icd_pcs_code, remarks, file_url) \
             VALUES ($1::uuid, $2::uuid, NULLIF($3, '')::date, $4, $5, NULLIF($6, ''), \
                     NULLIF($7, ''), NULLIF($8, ''), $9) \
             RETURNING {SURGERY_COLUMNS}"
        );
        let row = sqlx::query_as::<_, Surgery>(&sql)
            .bind(&draft.patient_id)
            .bind(surgeon_id)
            .bind(&draft.date)
            .bind(&draft.procedure)
            .bind(&draft.outcome)
            .bind(&draft.complications)
            .bind(&draft.icd_pcs_code)
            .bind(&draft.remarks)
            .bind(file_url)
            .fetch_one(&self.pool)
            .await?;
        Ok(row)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::{MedicationDraft, PrescriptionItem, Severity};
    use serde_json::json;

    const DOCTOR_USER: &str = "00000000-0000-0000-0000-0000000000d1";
    const PATIENT_USER: &str = "00000000-0000-0000-0000-0000000000a1";

    async fn seed(pool: &PgPool) -> (String, String) {
        let doctor_id: String = sqlx::query_scalar(
            "INSERT INTO doctors (user_id, name) VALUES ($1::uuid, 'Dr. Ines Duarte') \
             RETURNING id::text",
        )
        .bind(DOCTOR_USER)
        .fetch_one(pool)
        .await
        .unwrap();
        let patient_id: String = sqlx::query_scalar(
            "INSERT INTO patients (user_id, name) VALUES ($1::uuid, 'Tomas Varga') \
             RETURNING id::text",
        )
        .bind(PATIENT_USER)
        .fetch_one(pool)
        .await
        .unwrap();
        (doctor_id, patient_id)
    }

    #[test]
    fn test_aggregated_items_decode() {
        let aggregated = json!([
            {
                "medication": "Amoxicillin",
                "dosage": "500mg",
                "frequency": null,
                "duration_days": 7,
                "instructions": null
            },
            {
                "medication": "",
                "dosage": null,
                "frequency": null,
                "duration_days": null,
                "instructions": null
            }
        ]);
        let items: Vec<PrescriptionItem> = serde_json::from_value(aggregated).unwrap();
        assert_eq!(items[0].duration_days, Some(7));
        assert_eq!(items[0].frequency, None);
        assert_eq!(items[1].medication, "");
    }

    #[sqlx::test(migrations = "./migrations")]
    #[ignore = "needs DATABASE_URL for a disposable Postgres server"]
    async fn test_profile_lookups(pool: PgPool) {
        let (doctor_id, patient_id) = seed(&pool).await;
        let store = PostgresRecordStore::new(pool);

        assert_eq!(
            store.doctor_id_for_user(DOCTOR_USER).await.unwrap(),
            Some(doctor_id.clone())
        );
        assert_eq!(
            store.patient_id_for_user(PATIENT_USER).await.unwrap(),
            Some(patient_id)
        );
        assert_eq!(store.patient_id_for_user(DOCTOR_USER).await.unwrap(), None);
        assert_eq!(store.doctor_id_for_user("not-a-user").await.unwrap(), None);

        let doctors = store.doctors().await.unwrap();
        assert_eq!(doctors.len(), 1);
        assert_eq!(doctors[0].id, doctor_id);
        assert_eq!(doctors[0].name, "Dr. Ines Duarte");
    }

    #[sqlx::test(migrations = "./migrations")]
    #[ignore = "needs DATABASE_URL for a disposable Postgres server"]
    async fn test_diagnoses_round_trip(pool: PgPool) {
        let (doctor_id, patient_id) = seed(&pool).await;
        let store = PostgresRecordStore::new(pool);

        let drafts = [
            ("2024-01-10", "Anaemia"),
            ("", "Migraine"),
            ("2024-03-02", "Asthma"),
        ];
        for (date, condition) in drafts {
            let draft = NewDiagnosis {
                patient_id: patient_id.clone(),
                date: date.into(),
                condition: condition.into(),
                severity: Some(Severity::Mild),
                ..Default::default()
            };
            store
                .insert_diagnosis(&doctor_id, &draft, Some("diagnoses/p/1_x.pdf".into()))
                .await
                .unwrap();
        }

        let rows = store.diagnoses(&patient_id).await.unwrap();
        let dates: Vec<Option<&str>> = rows.iter().map(|d| d.date.as_deref()).collect();
        assert_eq!(dates, vec![Some("2024-03-02"), Some("2024-01-10"), None]);
        assert_eq!(rows[0].doctor_id.as_deref(), Some(doctor_id.as_str()));
        assert_eq!(rows[0].severity.as_deref(), Some("mild"));
        assert_eq!(rows[0].clinical_notes, None);
        assert_eq!(rows[0].file_url.as_deref(), Some("diagnoses/p/1_x.pdf"));
    }

    #[sqlx::test(migrations = "./migrations")]
    #[ignore = "needs DATABASE_URL for a disposable Postgres server"]
    async fn test_lab_reports_and_surgeries_round_trip(pool: PgPool) {
        let (doctor_id, patient_id) = seed(&pool).await;
        let store = PostgresRecordStore::new(pool);

        let lab = NewLabReport {
            patient_id: patient_id.clone(),
            date: "2024-05-06".into(),
            report_type: "CBC".into(),
            tags: vec!["fasting".into()],
            ..Default::default()
        };
        let created = store
            .insert_lab_report(&doctor_id, &lab, "lab-reports/p/1_cbc.pdf".into())
            .await
            .unwrap();
        assert_eq!(created.tags, Some(json!({ "tags": ["fasting"] })));
        assert_eq!(created.remarks, None);
        assert_eq!(store.lab_reports(&patient_id).await.unwrap(), vec![created]);

        let surgery = NewSurgery {
            patient_id: patient_id.clone(),
            procedure: "Appendectomy".into(),
            outcome: "Recovered".into(),
            ..Default::default()
        };
        let created = store
            .insert_surgery(&doctor_id, &surgery, None)
            .await
            .unwrap();
        assert_eq!(created.date, None);
        assert_eq!(created.complications, None);
        assert_eq!(created.outcome.as_deref(), Some("Recovered"));
        assert_eq!(store.surgeries(&patient_id).await.unwrap(), vec![created]);
    }

    #[sqlx::test(migrations = "./migrations")]
    #[ignore = "needs DATABASE_URL for a disposable Postgres server"]
    async fn test_prescriptions_with_items(pool: PgPool) {
        let (doctor_id, patient_id) = seed(&pool).await;
        sqlx::query(
            "INSERT INTO prescriptions (patient_id, issue_date) VALUES ($1::uuid, '2023-12-01')",
        )
        .bind(&patient_id)
        .execute(&pool)
        .await
        .unwrap();
        let store = PostgresRecordStore::new(pool);

        let draft = NewPrescription {
            patient_id: patient_id.clone(),
            start_date: "2024-06-01".into(),
            remarks: "Recheck BP".into(),
            medications: vec![
                MedicationDraft {
                    name: "Amlodipine".into(),
                    dosage: "5mg".into(),
                    duration: "30 days".into(),
                    ..Default::default()
                },
                MedicationDraft {
                    name: "Aspirin".into(),
                    ..Default::default()
                },
            ],
            ..Default::default()
        };
        let created = store.insert_prescription(&doctor_id, &draft).await.unwrap();

        let rows = store.prescriptions(&patient_id).await.unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].id, created.id);
        assert_eq!(rows[0].instructions.as_deref(), Some("Recheck BP"));
        let mut medications: Vec<&str> =
            rows[0].items.iter().map(|i| i.medication.as_str()).collect();
        medications.sort();
        assert_eq!(medications, vec!["Amlodipine", "Aspirin"]);
        assert!(rows[0].items.iter().any(|i| i.duration_days == Some(30)));
        assert!(rows[1].items.is_empty());
        assert_eq!(rows[1].doctor_id, None);
    }
}
