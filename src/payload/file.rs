//! Writes reports to a local file.

use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::info;

use crate::message::Visibility;
use crate::pipeline::Findings;
use crate::storage::StorageRef;

use super::{PayloadError, Payloader};

#[derive(Serialize)]
struct FileReport<'a> {
    generated_at: DateTime<Utc>,
    visibility: Visibility,
    #[serde(skip_serializing_if = "Option::is_none")]
    storage: Option<&'a StorageRef>,
    findings: &'a Findings,
}

/// Payloader that writes each report as pretty JSON to a fixed path.
///
/// Later reports overwrite earlier ones.
#[derive(Debug, Clone)]
pub struct FilePayloader {
    path: PathBuf,
}

impl FilePayloader {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }
}

#[async_trait]
impl Payloader for FilePayloader {
    async fn submit(
        &self,
        findings: &Findings,
        visibility: Visibility,
        storage: Option<&StorageRef>,
    ) -> Result<(), PayloadError> {
        let report = FileReport {
            generated_at: Utc::now(),
            visibility,
            storage,
            findings,
        };
        let json = serde_json::to_vec_pretty(&report)?;

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        tokio::fs::write(&self.path, json).await?;

        info!(path = %self.path.display(), "Report written");
        Ok(())
    }
}
