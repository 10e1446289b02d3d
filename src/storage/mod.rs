//! Object storage for raw audit artifacts.
//!
//! The pipeline persists the analysis tool's raw report through the
//! [`Storage`] capability and passes the returned [`StorageRef`] on to the
//! payloader, so reports can link to the full artifact.
//!
//! # Usage
//!
//! ```rust,ignore
//! use phpcs_server::storage::{Artifact, FileStorage, Storage};
//!
//! let storage = FileStorage::new("/var/lib/phpcs/storage", "audits")?;
//! let reference = storage.store(job_id, &Artifact::json("phpcs-report", bytes)).await?;
//! println!("stored at {}/{}", reference.bucket, reference.key);
//! ```

pub mod artifacts;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub use artifacts::{compute_checksum, FileStorage, ObjectMeta};

/// Errors that can occur during artifact storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Object not found: {0}")]
    NotFound(String),

    #[error("Checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    #[error("Failed to create storage directory: {0}")]
    DirectoryCreationFailed(String),

    #[error("Invalid bucket name: '{0}'")]
    InvalidBucket(String),

    #[error("Invalid artifact name: '{0}'")]
    InvalidName(String),
}

/// A raw artifact produced by a job.
#[derive(Debug, Clone)]
pub struct Artifact {
    /// Logical name, e.g. `phpcs-report`.
    pub name: String,
    pub content_type: String,
    pub data: Vec<u8>,
}

impl Artifact {
    pub fn new(name: impl Into<String>, content_type: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            content_type: content_type.into(),
            data,
        }
    }

    /// A JSON document.
    pub fn json(name: impl Into<String>, data: Vec<u8>) -> Self {
        Self::new(name, "application/json", data)
    }

    /// File extension matching the content type.
    pub fn extension(&self) -> &'static str {
        match self.content_type.as_str() {
            "application/json" => "json",
            "text/plain" => "txt",
            _ => "bin",
        }
    }
}

/// Location of a stored artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageRef {
    /// Name of the storage provider that holds the object.
    pub provider: String,
    pub bucket: String,
    pub key: String,
    /// SHA-256 of the object content.
    pub checksum: String,
    pub size_bytes: u64,
}

/// Capability for persisting job artifacts.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Persists `artifact` for `job_id` and returns where it was stored.
    async fn store(&self, job_id: Uuid, artifact: &Artifact) -> Result<StorageRef, StorageError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_artifact_extension() {
        assert_eq!(Artifact::json("r", vec![]).extension(), "json");
        assert_eq!(Artifact::new("r", "text/plain", vec![]).extension(), "txt");
        assert_eq!(
            Artifact::new("r", "application/zip", vec![]).extension(),
            "bin"
        );
    }

    #[test]
    fn test_storage_error_display() {
        let err = StorageError::ChecksumMismatch {
            expected: "abc".to_string(),
            actual: "xyz".to_string(),
        };
        assert!(err.to_string().contains("abc"));
        assert!(err.to_string().contains("xyz"));

        assert!(StorageError::InvalidBucket("..".into())
            .to_string()
            .contains(".."));
    }
}
