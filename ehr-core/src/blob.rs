use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use reqwest::Client;
use serde_json::Value;
use tracing::{info, warn};

use crate::error::{EhrError, Result};

pub const DEFAULT_BUCKET: &str = "medical-files";

/// A file attached to a clinical record
#[derive(Debug, Clone, PartialEq)]
pub struct Attachment {
    pub file_name: String,
    pub content_type: String,
    pub bytes: Vec<u8>,
}

impl Attachment {
    pub fn new(
        file_name: impl Into<String>,
        content_type: impl Into<String>,
        bytes: Vec<u8>,
    ) -> Self {
        Self {
            file_name: file_name.into(),
            content_type: content_type.into(),
            bytes,
        }
    }

    pub fn size(&self) -> usize {
        self.bytes.len()
    }
}

/// Replace every character outside `[A-Za-z0-9.-]` with `_`
pub fn sanitize_file_name(file_name: &str) -> String {
    file_name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '.' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Storage path for an attachment: `{folder}/{patient_id}/{unix_millis}_{sanitized_name}`
pub fn attachment_path(
    folder: &str,
    patient_id: &str,
    file_name: &str,
    uploaded_at: DateTime<Utc>,
) -> String {
    format!(
        "{}/{}/{}_{}",
        folder,
        patient_id,
        uploaded_at.timestamp_millis(),
        sanitize_file_name(file_name)
    )
}

/// Split an object path into its segments, rejecting anything that could leave the bucket.
///
/// Empty, `.` and `..` segments are refused, as are backslashes.
pub fn object_segments(path: &str) -> Result<Vec<&str>> {
    let segments: Vec<&str> = path.split('/').collect();
    let invalid = segments
        .iter()
        .any(|segment| matches!(*segment, "" | "." | "..") || segment.contains('\\'));
    if invalid {
        return Err(EhrError::validation(format!(
            "Invalid attachment path: {}",
            path
        )));
    }
    Ok(segments)
}

/// Patient id encoded in an attachment path (`{folder}/{patient_id}/{file}`)
pub fn attachment_owner(path: &str) -> Result<&str> {
    match object_segments(path)?.as_slice() {
        [_, patient_id, _, ..] => Ok(*patient_id),
        _ => Err(EhrError::validation(format!(
            "Invalid attachment path: {}",
            path
        ))),
    }
}

/// Path-addressed object storage for record attachments
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Store `bytes` under `path` and return the stored path
    async fn upload(&self, path: &str, bytes: Vec<u8>, content_type: &str) -> Result<String>;

    async fn download(&self, path: &str) -> Result<Vec<u8>>;

    async fn remove(&self, path: &str) -> Result<()>;
}

/// In-memory implementation of BlobStore
#[derive(Debug, Default, Clone)]
pub struct InMemoryBlobStore {
    objects: Arc<DashMap<String, (String, Vec<u8>)>>,
}

impl InMemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn content_type(&self, path: &str) -> Option<String> {
        self.objects.get(path).map(|entry| entry.0.clone())
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }
}

#[async_trait]
impl BlobStore for InMemoryBlobStore {
    async fn upload(&self, path: &str, bytes: Vec<u8>, content_type: &str) -> Result<String> {
        object_segments(path)?;
        if self.objects.contains_key(path) {
            return Err(EhrError::Storage(format!("The resource already exists: {}", path)));
        }
        self.objects
            .insert(path.to_string(), (content_type.to_string(), bytes));
        Ok(path.to_string())
    }

    async fn download(&self, path: &str) -> Result<Vec<u8>> {
        object_segments(path)?;
        self.objects
            .get(path)
            .map(|entry| entry.1.clone())
            .ok_or_else(|| EhrError::NotFound(format!("Object not found: {}", path)))
    }

    async fn remove(&self, path: &str) -> Result<()> {
        object_segments(path)?;
        self.objects
            .remove(path)
            .map(|_| ())
            .ok_or_else(|| EhrError::NotFound(format!("Object not found: {}", path)))
    }
}

/// BlobStore over the hosted storage REST API
#[derive(Clone)]
pub struct SupabaseBlobStore {
    http: Client,
    base_url: String,
    bucket: String,
    service_key: String,
}

impl SupabaseBlobStore {
    pub fn new(
        base_url: impl Into<String>,
        service_key: impl Into<String>,
        bucket: impl Into<String>,
    ) -> Self {
        Self {
            http: Client::new(),
            base_url: base_url.into(),
            bucket: bucket.into(),
            service_key: service_key.into(),
        }
    }

    fn object_url(&self, path: &str) -> Result<String> {
        let encoded: Vec<String> = object_segments(path)?
            .into_iter()
            .map(|segment| urlencoding::encode(segment).into_owned())
            .collect();
        Ok(format!(
            "{}/storage/v1/object/{}/{}",
            self.base_url.trim_end_matches('/'),
            self.bucket,
            encoded.join("/")
        ))
    }

    async fn failure(response: reqwest::Response, path: &str) -> EhrError {
        let status = response.status();
        let body: Value = response.json().await.unwrap_or(Value::Null);
        let message = body["message"]
            .as_str()
            .or_else(|| body["error"].as_str())
            .map(str::to_string)
            .unwrap_or_else(|| format!("Storage request failed ({})", status.as_u16()));
        warn!(status = status.as_u16(), path = %path, message = %message, "Storage request rejected");

        if status == reqwest::StatusCode::NOT_FOUND || message.to_lowercase().contains("not found")
        {
            EhrError::NotFound(format!("Object not found: {}", path))
        } else {
            EhrError::Storage(message)
        }
    }
}

#[async_trait]
impl BlobStore for SupabaseBlobStore {
    async fn upload(&self, path: &str, bytes: Vec<u8>, content_type: &str) -> Result<String> {
        info!(path = %path, size = bytes.len(), "Uploading attachment");

        let response = self
            .http
            .post(self.object_url(path)?)
            .bearer_auth(&self.service_key)
            .header("apikey", &self.service_key)
            .header("content-type", content_type)
            .header("cache-control", "3600")
            .header("x-upsert", "false")
            .body(bytes)
            .send()
            .await
            .map_err(|e| EhrError::Storage(e.to_string()))?;

        if !response.status().is_success() {
            return Err(Self::failure(response, path).await);
        }
        Ok(path.to_string())
    }

    async fn download(&self, path: &str) -> Result<Vec<u8>> {
        info!(path = %path, "Downloading attachment");

        let response = self
            .http
            .get(self.object_url(path)?)
            .bearer_auth(&self.service_key)
            .header("apikey", &self.service_key)
            .send()
            .await
            .map_err(|e| EhrError::Storage(e.to_string()))?;

        if !response.status().is_success() {
            return Err(Self::failure(response, path).await);
        }
        let bytes = response
            .bytes()
            .await
            .map_err(|e| EhrError::Storage(e.to_string()))?;
        Ok(bytes.to_vec())
    }

    async fn remove(&self, path: &str) -> Result<()> {
        info!(path = %path, "Removing attachment");

        let response = self
            .http
            .delete(self.object_url(path)?)
            .bearer_auth(&self.service_key)
            .header("apikey", &self.service_key)
            .send()
            .await
            .map_err(|e| EhrError::Storage(e.to_string()))?;

        if !response.status().is_success() {
            return Err(Self::failure(response, path).await);
        }
        Ok(())
    }
}
