//! Filesystem-backed object storage for audit artifacts.
//!
//! Objects live under `{root}/{bucket}/{job_id}/{name}.{ext}`, so every job
//! owns its artifacts even when two jobs produce identical content. Each
//! object has a `.meta.json` sidecar, and references carry the SHA-256 of
//! the content.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

use super::{Artifact, Storage, StorageError, StorageRef};

/// Provider name recorded on references produced by [`FileStorage`].
pub const PROVIDER_NAME: &str = "local";

/// Sidecar metadata written next to every stored object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObjectMeta {
    pub job_id: Uuid,
    pub name: String,
    pub content_type: String,
    pub size_bytes: u64,
    pub checksum: String,
    pub created_at: DateTime<Utc>,
}

/// Object storage rooted at a local directory.
pub struct FileStorage {
    root: PathBuf,
    bucket: String,
}

impl FileStorage {
    /// Creates a storage handle for `bucket` under `root`.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::InvalidBucket` if the bucket name is empty or
    /// would escape the root directory.
    pub fn new(root: impl Into<PathBuf>, bucket: impl Into<String>) -> Result<Self, StorageError> {
        let bucket = bucket.into();
        if bucket.is_empty() || bucket.contains(['/', '\\']) || bucket == "." || bucket == ".." {
            return Err(StorageError::InvalidBucket(bucket));
        }

        Ok(Self {
            root: root.into(),
            bucket,
        })
    }

    /// Returns the directory holding this bucket's objects.
    fn bucket_path(&self) -> PathBuf {
        self.root.join(&self.bucket)
    }

    /// Object key for an artifact of `job_id`.
    fn object_key(job_id: Uuid, artifact: &Artifact) -> Result<String, StorageError> {
        let name = artifact.name.as_str();
        if name.is_empty() || name.contains(['/', '\\']) || name.starts_with('.') {
            return Err(StorageError::InvalidName(name.to_string()));
        }
        Ok(format!("{}/{}.{}", job_id, name, artifact.extension()))
    }

    fn object_path(&self, key: &str) -> PathBuf {
        self.bucket_path().join(key)
    }
}

#[cfg(test)]
impl FileStorage {
    /// Reads an object back, verifying its checksum.
    async fn retrieve(&self, reference: &StorageRef) -> Result<Vec<u8>, StorageError> {
        if reference.bucket != self.bucket {
            return Err(StorageError::NotFound(reference.key.clone()));
        }

        let path = self.object_path(&reference.key);
        let data = fs::read(&path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                StorageError::NotFound(reference.key.clone())
            } else {
                StorageError::Io(e)
            }
        })?;

        let actual = compute_checksum(&data);
        if actual != reference.checksum {
            return Err(StorageError::ChecksumMismatch {
                expected: reference.checksum.clone(),
                actual,
            });
        }

        Ok(data)
    }

    async fn metadata(&self, reference: &StorageRef) -> Result<ObjectMeta, StorageError> {
        let path = meta_path(&self.object_path(&reference.key));
        let data = fs::read(&path)
            .await
            .map_err(|_| StorageError::NotFound(reference.key.clone()))?;
        Ok(serde_json::from_slice(&data)?)
    }
}

#[async_trait]
impl Storage for FileStorage {
    async fn store(&self, job_id: Uuid, artifact: &Artifact) -> Result<StorageRef, StorageError> {
        let key = Self::object_key(job_id, artifact)?;
        let checksum = compute_checksum(&artifact.data);
        let path = self.object_path(&key);

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await.map_err(|e| {
                StorageError::DirectoryCreationFailed(format!("{}: {}", parent.display(), e))
            })?;
        }
        write_atomically(&path, &artifact.data).await?;

        let meta = ObjectMeta {
            job_id,
            name: artifact.name.clone(),
            content_type: artifact.content_type.clone(),
            size_bytes: artifact.data.len() as u64,
            checksum: checksum.clone(),
            created_at: Utc::now(),
        };
        write_atomically(&meta_path(&path), &serde_json::to_vec_pretty(&meta)?).await?;

        Ok(StorageRef {
            provider: PROVIDER_NAME.to_string(),
            bucket: self.bucket.clone(),
            key,
            checksum,
            size_bytes: meta.size_bytes,
        })
    }
}

/// Writes to a temporary sibling then renames, so readers never see a
/// partially written object.
async fn write_atomically(path: &Path, data: &[u8]) -> Result<(), StorageError> {
    let tmp = path.with_extension(format!("tmp-{}", Uuid::new_v4()));
    let mut file = fs::File::create(&tmp).await?;
    file.write_all(data).await?;
    file.sync_all().await?;
    drop(file);
    fs::rename(&tmp, path).await?;
    Ok(())
}

fn meta_path(object_path: &Path) -> PathBuf {
    let mut name = object_path.as_os_str().to_owned();
    name.push(".meta.json");
    PathBuf::from(name)
}

/// Computes the SHA-256 checksum of data as lowercase hex.
pub fn compute_checksum(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}
