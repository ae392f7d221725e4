use std::time::Duration;

use ehr_core::blob::DEFAULT_BUCKET;
use ehr_core::chat::CHAT_TIMEOUT;
use ehr_core::extractor::ATTEMPT_TIMEOUT;
use ehr_core::generation::{DEFAULT_GEMINI_BASE_URL, DEFAULT_GEMINI_MODEL};
use thiserror::Error;

pub const DEFAULT_PORT: u16 = 3000;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} environment variable is required")]
    Missing(&'static str),
}

pub const DEFAULT_EXTRACTION_ATTEMPTS: u32 = 5;

/// Time and attempt budgets for calls to the generation endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GenerationLimits {
    pub attempt_timeout: Duration,
    pub extraction_attempts: u32,
    pub chat_timeout: Duration,
}

impl Default for GenerationLimits {
    fn default() -> Self {
        Self {
            attempt_timeout: ATTEMPT_TIMEOUT,
            extraction_attempts: DEFAULT_EXTRACTION_ATTEMPTS,
            chat_timeout: CHAT_TIMEOUT,
        }
    }
}

/// Settings read once from the environment at start-up
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceConfig {
    pub gemini_api_key: String,
    pub gemini_model: String,
    pub gemini_base_url: String,
    pub database_url: String,
    pub storage_url: String,
    pub storage_key: String,
    pub storage_bucket: String,
    pub port: u16,
    pub limits: GenerationLimits,
}

impl ServiceConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let value = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let required = |key: &'static str| value(key).ok_or(ConfigError::Missing(key));
        let number = |key: &str| value(key).and_then(|v| v.trim().parse::<u64>().ok());
        let defaults = GenerationLimits::default();

        Ok(Self {
            gemini_api_key: required("GEMINI_API_KEY")?,
            gemini_model: value("GEMINI_MODEL").unwrap_or_else(|| DEFAULT_GEMINI_MODEL.to_string()),
            gemini_base_url: value("GEMINI_BASE_URL")
                .unwrap_or_else(|| DEFAULT_GEMINI_BASE_URL.to_string()),
            database_url: required("DATABASE_URL")?,
            storage_url: required("STORAGE_URL")?,
            storage_key: required("STORAGE_KEY")?,
            storage_bucket: value("STORAGE_BUCKET").unwrap_or_else(|| DEFAULT_BUCKET.to_string()),
            port: value("PORT")
                .and_then(|p| p.trim().parse::<u16>().ok())
                .unwrap_or(DEFAULT_PORT),
            limits: GenerationLimits {
                attempt_timeout: number("GENERATION_TIMEOUT_SECS")
                    .map(Duration::from_secs)
                    .unwrap_or(defaults.attempt_timeout),
                extraction_attempts: number("EXTRACTION_MAX_ATTEMPTS")
                    .and_then(|n| u32::try_from(n).ok())
                    .filter(|n| *n > 0)
                    .unwrap_or(defaults.extraction_attempts),
                chat_timeout: number("CHAT_TIMEOUT_SECS")
                    .map(Duration::from_secs)
                    .unwrap_or(defaults.chat_timeout),
            },
        })
    }
}
