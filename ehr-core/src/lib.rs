pub mod aggregator;
pub mod blob;
pub mod chat;
pub mod document;
pub mod error;
pub mod extraction;
pub mod extractor;
pub mod generation;
pub mod recording;
pub mod records;
pub mod retry;
pub mod sanitize;
pub mod store;
pub mod store_postgres;

// Re-export commonly used types
pub use aggregator::{Caller, PatientData, RecordAggregator, RecordEntry, Subject};
pub use blob::{Attachment, BlobStore, InMemoryBlobStore, SupabaseBlobStore};
pub use chat::ChatAssistant;
pub use document::{DocumentKind, ExtractionRequest, PromptTemplate};
pub use error::{EhrError, Result};
pub use extraction::ExtractionResult;
pub use extractor::{DocumentExtractor, ExtractorConfig};
pub use generation::{GeminiClient, GenerationClient, GenerationError};
pub use recording::RecordService;
pub use records::{
    Diagnosis, Doctor, LabReport, MedicationDraft, NewDiagnosis, NewLabReport, NewPrescription,
    NewSurgery, Prescription, RecordKind, Severity, Surgery,
};
pub use retry::{RetryError, RetryPolicy};
pub use sanitize::sanitize;
pub use store::{InMemoryRecordStore, RecordStore};
pub use store_postgres::PostgresRecordStore;
