//! The audit pipeline: ingest, analyze, store, report.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use tempfile::TempDir;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::error::ConfigError;
use crate::message::Message;
use crate::payload::PayloadError;
use crate::storage::{Artifact, Storage};

use super::analyze::{Analyzer, PhpcsAnalyzer, SourceInfo};
use super::config::{PayloaderMap, ProcessConfig};
use super::ingest::{Ingester, SourceIngester};
use super::outcome::{JobOutcome, JobRecord, StageError};

/// Name of the raw report artifact.
pub const REPORT_ARTIFACT: &str = "phpcs-report";

/// Per-job working directories.
///
/// Both directories are unique to one job and are removed when the
/// workspace is dropped, whether or not the job succeeded.
struct JobWorkspace {
    source: TempDir,
    scratch: TempDir,
}

impl JobWorkspace {
    fn create(ingest_root: &Path, analysis_root: &Path, job_id: Uuid) -> std::io::Result<Self> {
        std::fs::create_dir_all(ingest_root)?;
        std::fs::create_dir_all(analysis_root)?;

        let prefix = format!("{}-", job_id);
        let source = tempfile::Builder::new()
            .prefix(&prefix)
            .tempdir_in(ingest_root)?;
        let scratch = tempfile::Builder::new()
            .prefix(&prefix)
            .tempdir_in(analysis_root)?;

        Ok(Self { source, scratch })
    }

    fn source_dir(&self) -> &Path {
        self.source.path()
    }

    fn scratch_dir(&self) -> &Path {
        self.scratch.path()
    }
}

/// Runs one message through every stage.
///
/// Holds no per-job state, so a single pipeline is shared by all
/// concurrently running jobs.
pub struct AuditPipeline {
    ingest_root: PathBuf,
    analysis_root: PathBuf,
    storage: Arc<dyn Storage>,
    payloaders: PayloaderMap,
    ingester: Arc<dyn Ingester>,
    analyzer: Arc<dyn Analyzer>,
}

impl AuditPipeline {
    /// Builds a pipeline from a validated configuration.
    pub fn new(config: ProcessConfig) -> Result<Self, ConfigError> {
        config.validate()?;

        let ProcessConfig {
            ingest_temp_folder,
            analysis_temp_folder,
            storage,
            payloaders,
            ingester,
            analyzer,
        } = config;

        Ok(Self {
            ingest_root: ingest_temp_folder.ok_or(ConfigError::MissingField("ingest temp folder"))?,
            analysis_root: analysis_temp_folder
                .ok_or(ConfigError::MissingField("analysis temp folder"))?,
            storage: storage.ok_or(ConfigError::MissingField("storage provider"))?,
            payloaders: payloaders.ok_or(ConfigError::MissingField("payloaders"))?,
            ingester: ingester.unwrap_or_else(|| Arc::new(SourceIngester::new())),
            analyzer: analyzer.unwrap_or_else(|| Arc::new(PhpcsAnalyzer::default())),
        })
    }

    /// Sorted list of registered response targets.
    pub fn targets(&self) -> Vec<&str> {
        let mut targets: Vec<&str> = self.payloaders.keys().map(String::as_str).collect();
        targets.sort_unstable();
        targets
    }

    /// Processes one message to a terminal outcome.
    ///
    /// Never panics on stage failures; every failure is reflected in the
    /// returned outcome.
    pub async fn run(&self, message: &Message) -> JobOutcome {
        let started = Instant::now();
        let mut record = JobRecord::new();
        let span = info_span!("audit", job_id = %record.job_id, target = %message.response_target);

        async move {
            info!(source = %message.display_name(), "Starting audit");

            let failure = self.execute(message, &mut record).await.err();
            let outcome = record.finish(message, failure, started.elapsed());

            match &outcome.cause {
                None => info!(duration_ms = outcome.duration_ms, "Audit completed"),
                Some(cause) => error!(
                    cause = cause.cause(),
                    stage = cause.stage().map(tracing::field::display),
                    error = %cause,
                    "Audit failed"
                ),
            }
            outcome
        }
        .instrument(span)
        .await
    }

    async fn execute(&self, message: &Message, record: &mut JobRecord) -> Result<(), StageError> {
        let workspace = JobWorkspace::create(&self.ingest_root, &self.analysis_root, record.job_id)
            .map_err(|e| StageError::Ingest(format!("failed to create workspace: {}", e)))?;

        // Ingest
        let source = self
            .ingester
            .ingest(&message.source_url, workspace.source_dir())
            .await
            .map_err(|e| StageError::Ingest(e.to_string()))?;

        // Analyze
        let mut findings = self
            .analyzer
            .analyze(&source.root, workspace.scratch_dir())
            .await
            .map_err(|e| StageError::Analysis(e.to_string()))?;
        findings.source = SourceInfo::from_message(message, source.checksum);
        record.totals = Some(findings.totals);
        info!(
            errors = findings.totals.errors,
            warnings = findings.totals.warnings,
            clean = findings.is_clean(),
            "Analysis finished"
        );

        // Store: a failure is recorded but does not stop reporting.
        let raw = if findings.raw.is_empty() {
            serde_json::to_vec(&findings).map_err(|e| StageError::Analysis(e.to_string()))?
        } else {
            std::mem::take(&mut findings.raw)
        };
        match self
            .storage
            .store(record.job_id, &Artifact::json(REPORT_ARTIFACT, raw))
            .await
        {
            Ok(reference) => record.storage = Some(reference),
            Err(e) => {
                warn!(error = %e, "Failed to store raw report, reporting without it");
                let err = StageError::Storage(e.to_string());
                findings.annotations.push(err.to_string());
                record.storage_error = Some(err);
            }
        }

        // Report
        let payloader = self
            .payloaders
            .get(&message.response_target)
            .ok_or_else(|| StageError::PayloaderMissing(message.response_target.clone()))?;

        payloader
            .submit(&findings, message.visibility, record.storage.as_ref())
            .await
            .map_err(|e| match e {
                PayloadError::Auth(auth) => StageError::ReportAuth(auth.to_string()),
                other => StageError::Report(other.to_string()),
            })?;
        record.reported = true;

        drop(workspace);
        Ok(())
    }
}
