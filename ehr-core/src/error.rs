use thiserror::Error;

use crate::generation::GenerationError;

/// Errors surfaced by the extraction, aggregation and recording services
#[derive(Error, Debug)]
pub enum EhrError {
    /// Caller input was rejected before any external call was made
    #[error("Validation failed: {0}")]
    Validation(String),

    /// The generation endpoint failed for good, either non-transiently or after the retry budget
    #[error("Generation service failed after {attempts} attempt(s): {source}")]
    ExternalService {
        attempts: u32,
        #[source]
        source: GenerationError,
    },

    /// The model output did not contain a well-formed JSON object
    #[error("Could not parse model response: {0}")]
    Parse(String),

    /// The subject or the caller's profile could not be resolved
    #[error("Lookup failed: {0}")]
    Lookup(String),

    /// The caller is signed in but may not see this patient's records
    #[error("Access denied: {0}")]
    Forbidden(String),

    #[error("Record not found: {0}")]
    NotFound(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Storage error: {0}")]
    Storage(String),
}

impl EhrError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn lookup(message: impl Into<String>) -> Self {
        Self::Lookup(message.into())
    }
}

pub type Result<T> = std::result::Result<T, EhrError>;
