//! Job records and terminal outcomes.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

use crate::message::Message;
use crate::storage::StorageRef;

use super::analyze::Totals;

/// Pipeline stages, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Ingest,
    Analyze,
    Store,
    Report,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::Ingest => write!(f, "ingest"),
            Stage::Analyze => write!(f, "analyze"),
            Stage::Store => write!(f, "store"),
            Stage::Report => write!(f, "report"),
        }
    }
}

/// Why a job failed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StageError {
    #[error("ingest-error: {0}")]
    Ingest(String),

    #[error("analysis-error: {0}")]
    Analysis(String),

    #[error("storage-error: {0}")]
    Storage(String),

    #[error("payloader-missing: no payloader registered for '{0}'")]
    PayloaderMissing(String),

    #[error("report-error: {0}")]
    Report(String),

    #[error("report-auth-error: {0}")]
    ReportAuth(String),

    /// The job's task died before producing an outcome.
    #[error("job-aborted: {0}")]
    Aborted(String),
}

impl StageError {
    /// Short machine-readable cause.
    pub fn cause(&self) -> &'static str {
        match self {
            StageError::Ingest(_) => "ingest-error",
            StageError::Analysis(_) => "analysis-error",
            StageError::Storage(_) => "storage-error",
            StageError::PayloaderMissing(_) => "payloader-missing",
            StageError::Report(_) => "report-error",
            StageError::ReportAuth(_) => "report-auth-error",
            StageError::Aborted(_) => "job-aborted",
        }
    }

    /// Stage that failed. `None` when the job was aborted mid-flight.
    pub fn stage(&self) -> Option<Stage> {
        match self {
            StageError::Ingest(_) => Some(Stage::Ingest),
            StageError::Analysis(_) => Some(Stage::Analyze),
            StageError::Storage(_) => Some(Stage::Store),
            StageError::PayloaderMissing(_) | StageError::Report(_) | StageError::ReportAuth(_) => {
                Some(Stage::Report)
            }
            StageError::Aborted(_) => None,
        }
    }

    /// Whether the failure means the service can no longer report anything.
    pub fn is_critical(&self) -> bool {
        matches!(self, StageError::ReportAuth(_))
    }
}

impl Serialize for StageError {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.cause())
    }
}

/// Terminal status of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Succeeded,
    Failed,
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobStatus::Succeeded => write!(f, "succeeded"),
            JobStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Mutable state accumulated while one message moves through the stages.
///
/// The message itself is never touched; everything derived lives here.
#[derive(Debug)]
pub(crate) struct JobRecord {
    pub job_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub totals: Option<Totals>,
    pub storage: Option<StorageRef>,
    pub storage_error: Option<StageError>,
    pub reported: bool,
}

impl JobRecord {
    pub fn new() -> Self {
        Self {
            job_id: Uuid::new_v4(),
            started_at: Utc::now(),
            totals: None,
            storage: None,
            storage_error: None,
            reported: false,
        }
    }

    /// Consumes the record into an outcome.
    ///
    /// `failure` is the error that stopped the pipeline, if any. A storage
    /// failure alone also fails the job, but a stopping failure takes
    /// precedence as the reported cause.
    pub fn finish(
        self,
        message: &Message,
        failure: Option<StageError>,
        elapsed: Duration,
    ) -> JobOutcome {
        let storage_error = self.storage_error.as_ref().map(|e| e.to_string());
        let cause = failure.or(self.storage_error);
        let status = if cause.is_none() {
            JobStatus::Succeeded
        } else {
            JobStatus::Failed
        };

        JobOutcome {
            job_id: self.job_id,
            source_url: message.source_url.clone(),
            response_target: message.response_target.clone(),
            status,
            cause,
            totals: self.totals,
            storage: self.storage,
            storage_error,
            reported: self.reported,
            started_at: self.started_at,
            duration_ms: elapsed.as_millis() as u64,
        }
    }
}

/// Result of processing one message.
#[derive(Debug, Clone, Serialize)]
pub struct JobOutcome {
    pub job_id: Uuid,
    pub source_url: String,
    pub response_target: String,
    pub status: JobStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cause: Option<StageError>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub totals: Option<Totals>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub storage: Option<StorageRef>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub storage_error: Option<String>,
    /// Whether a payloader accepted the report.
    pub reported: bool,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
}

impl JobOutcome {
    /// Outcome for a job whose task panicked or was cancelled.
    pub fn aborted(message: &Message, reason: impl Into<String>, elapsed: Duration) -> Self {
        JobRecord::new().finish(message, Some(StageError::Aborted(reason.into())), elapsed)
    }

    pub fn is_success(&self) -> bool {
        self.status == JobStatus::Succeeded
    }

    /// Cause string, e.g. `payloader-missing`.
    pub fn cause_str(&self) -> Option<&'static str> {
        self.cause.as_ref().map(StageError::cause)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Visibility;

    fn message() -> Message {
        Message::new("./pkg", Visibility::Public, "tide")
    }

    #[test]
    fn test_cause_strings() {
        assert_eq!(StageError::Ingest("x".into()).cause(), "ingest-error");
        assert_eq!(StageError::Analysis("x".into()).cause(), "analysis-error");
        assert_eq!(StageError::Storage("x".into()).cause(), "storage-error");
        assert_eq!(
            StageError::PayloaderMissing("x".into()).cause(),
            "payloader-missing"
        );
        assert_eq!(StageError::Report("x".into()).cause(), "report-error");
        assert_eq!(StageError::ReportAuth("x".into()).cause(), "report-auth-error");
        assert!(StageError::ReportAuth("x".into()).is_critical());
        assert!(!StageError::Report("x".into()).is_critical());
        assert_eq!(
            StageError::PayloaderMissing("x".into()).stage(),
            Some(Stage::Report)
        );
        assert_eq!(StageError::Aborted("x".into()).stage(), None);
    }

    #[test]
    fn test_aborted_outcome_fails_without_report() {
        let outcome = JobOutcome::aborted(&message(), "task panicked", Duration::from_millis(7));

        assert_eq!(outcome.status, JobStatus::Failed);
        assert_eq!(outcome.cause_str(), Some("job-aborted"));
        assert!(!outcome.reported);
        assert_eq!(outcome.duration_ms, 7);
        assert_eq!(outcome.source_url, "./pkg");
    }

    #[test]
    fn test_finish_success() {
        let mut record = JobRecord::new();
        record.reported = true;
        let outcome = record.finish(&message(), None, Duration::from_millis(42));

        assert!(outcome.is_success());
        assert_eq!(outcome.cause_str(), None);
        assert_eq!(outcome.duration_ms, 42);
        assert_eq!(outcome.response_target, "tide");
    }

    #[test]
    fn test_storage_failure_alone_fails_job() {
        let mut record = JobRecord::new();
        record.storage_error = Some(StageError::Storage("disk full".into()));
        record.reported = true;
        let outcome = record.finish(&message(), None, Duration::ZERO);

        assert_eq!(outcome.status, JobStatus::Failed);
        assert_eq!(outcome.cause_str(), Some("storage-error"));
        assert!(outcome.reported);
        assert!(outcome.storage_error.unwrap().contains("disk full"));
    }

    #[test]
    fn test_stopping_failure_takes_precedence() {
        let mut record = JobRecord::new();
        record.storage_error = Some(StageError::Storage("disk full".into()));
        let outcome = record.finish(
            &message(),
            Some(StageError::Report("503".into())),
            Duration::ZERO,
        );

        assert_eq!(outcome.cause_str(), Some("report-error"));
        assert!(outcome.storage_error.is_some());
    }

    #[test]
    fn test_outcome_serializes_cause_string() {
        let outcome = JobRecord::new().finish(
            &message(),
            Some(StageError::PayloaderMissing("tide".into())),
            Duration::ZERO,
        );
        let json = serde_json::to_value(&outcome).unwrap();
        assert_eq!(json["status"], "failed");
        assert_eq!(json["cause"], "payloader-missing");
    }
}
