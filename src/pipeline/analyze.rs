//! Static analysis stage.
//!
//! [`PhpcsAnalyzer`] runs PHP_CodeSniffer over an ingested source tree and
//! turns its JSON report into [`Findings`].

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::process::Command;
use tracing::debug;

use crate::message::Message;

/// File name of the raw report inside the job's scratch directory.
pub const REPORT_FILE_NAME: &str = "phpcs.json";

/// Errors that can occur while running the analysis tool.
#[derive(Debug, Error)]
pub enum AnalysisError {
    #[error("Failed to start analysis tool '{binary}': {reason}")]
    Spawn { binary: String, reason: String },

    #[error("Analysis tool exited with code {code:?}: {stderr}")]
    ToolFailed { code: Option<i32>, stderr: String },

    #[error("Failed to parse analysis report: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Identity of the audited source, attached to findings for reporting.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SourceInfo {
    pub url: String,
    #[serde(default)]
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub slug: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_client: Option<String>,
    /// SHA-256 of the downloaded archive, when the source was an archive.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
}

impl SourceInfo {
    pub fn from_message(message: &Message, checksum: Option<String>) -> Self {
        Self {
            url: message.source_url.clone(),
            title: message.title.clone(),
            slug: message.slug.clone(),
            request_client: message.request_client.clone(),
            checksum,
        }
    }
}

/// Issue counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Totals {
    pub errors: u64,
    pub warnings: u64,
    #[serde(default)]
    pub fixable: u64,
}

/// Issue counts for one file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileSummary {
    pub errors: u64,
    pub warnings: u64,
}

/// Structured result of analysing one source tree.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Findings {
    /// Analysis tool name.
    pub tool: String,
    /// Rule set the tool ran with.
    pub standard: String,
    #[serde(default)]
    pub source: SourceInfo,
    pub totals: Totals,
    /// Per-file counts keyed by path relative to the source root.
    #[serde(default)]
    pub files: BTreeMap<String, FileSummary>,
    /// Notes added by later stages, e.g. a storage failure.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub annotations: Vec<String>,
    /// Raw tool report, persisted by the store stage.
    #[serde(skip)]
    pub raw: Vec<u8>,
}

impl Findings {
    pub fn new(tool: impl Into<String>, standard: impl Into<String>) -> Self {
        Self {
            tool: tool.into(),
            standard: standard.into(),
            ..Default::default()
        }
    }

    /// Whether the tool reported no errors and no warnings.
    pub fn is_clean(&self) -> bool {
        self.totals.errors == 0 && self.totals.warnings == 0
    }
}

/// Capability for running static analysis over a source tree.
#[async_trait]
pub trait Analyzer: Send + Sync {
    /// Analyses `source`, using `scratch` for any files the tool writes.
    async fn analyze(&self, source: &Path, scratch: &Path) -> Result<Findings, AnalysisError>;
}

/// Runs the `phpcs` command line tool.
#[derive(Debug, Clone)]
pub struct PhpcsAnalyzer {
    binary: PathBuf,
    standard: String,
    extensions: String,
}

impl Default for PhpcsAnalyzer {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("phpcs"),
            standard: "WordPress".to_string(),
            extensions: "php".to_string(),
        }
    }
}

impl PhpcsAnalyzer {
    pub fn new(binary: impl Into<PathBuf>, standard: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
            standard: standard.into(),
            ..Default::default()
        }
    }

    /// Sets the comma separated file extensions to check.
    pub fn with_extensions(mut self, extensions: impl Into<String>) -> Self {
        self.extensions = extensions.into();
        self
    }
}

#[async_trait]
impl Analyzer for PhpcsAnalyzer {
    async fn analyze(&self, source: &Path, scratch: &Path) -> Result<Findings, AnalysisError> {
        let report_path = scratch.join(REPORT_FILE_NAME);

        debug!(
            binary = %self.binary.display(),
            standard = %self.standard,
            source = %source.display(),
            "Running phpcs"
        );

        let output = Command::new(&self.binary)
            .arg("-q")
            .arg("--report=json")
            .arg(format!("--report-file={}", report_path.display()))
            .arg(format!("--standard={}", self.standard))
            .arg(format!("--extensions={}", self.extensions))
            .arg(source)
            .current_dir(scratch)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| AnalysisError::Spawn {
                binary: self.binary.display().to_string(),
                reason: e.to_string(),
            })?;

        // phpcs exits 1 or 2 when it found issues; anything higher is a tool error.
        match output.status.code() {
            Some(0..=2) => {}
            code => {
                return Err(AnalysisError::ToolFailed {
                    code,
                    stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
                })
            }
        }

        let raw = tokio::fs::read(&report_path).await?;
        parse_report(raw, source, &self.standard)
    }
}

#[derive(Deserialize)]
struct RawReport {
    totals: Totals,
    #[serde(default)]
    files: BTreeMap<String, RawFile>,
}

#[derive(Deserialize)]
struct RawFile {
    errors: u64,
    warnings: u64,
}

/// Parses a phpcs JSON report, making file paths relative to `source`.
pub fn parse_report(raw: Vec<u8>, source: &Path, standard: &str) -> Result<Findings, AnalysisError> {
    let report: RawReport = serde_json::from_slice(&raw)?;

    let files = report
        .files
        .into_iter()
        .map(|(path, file)| {
            let relative = Path::new(&path)
                .strip_prefix(source)
                .map(|p| p.to_string_lossy().to_string())
                .unwrap_or(path);
            (
                relative,
                FileSummary {
                    errors: file.errors,
                    warnings: file.warnings,
                },
            )
        })
        .collect();

    Ok(Findings {
        tool: "phpcs".to_string(),
        standard: standard.to_string(),
        source: SourceInfo::default(),
        totals: report.totals,
        files,
        annotations: Vec::new(),
        raw,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const REPORT: &str = r#"{
        "totals": {"errors": 3, "warnings": 1, "fixable": 2},
        "files": {
            "/tmp/ingest/job/plugin/plugin.php": {
                "errors": 3, "warnings": 0,
                "messages": [{"message": "Missing doc comment", "source": "Squiz.Commenting", "severity": 5, "fixable": false, "type": "ERROR", "line": 1, "column": 1}]
            },
            "/tmp/ingest/job/plugin/readme.php": {"errors": 0, "warnings": 1, "messages": []}
        }
    }"#;

    #[test]
    fn test_parse_report() {
        let findings = parse_report(
            REPORT.as_bytes().to_vec(),
            Path::new("/tmp/ingest/job/plugin"),
            "WordPress",
        )
        .unwrap();

        assert_eq!(findings.tool, "phpcs");
        assert_eq!(findings.standard, "WordPress");
        assert_eq!(
            findings.totals,
            Totals {
                errors: 3,
                warnings: 1,
                fixable: 2
            }
        );
        assert_eq!(findings.files.len(), 2);
        assert_eq!(findings.files["plugin.php"].errors, 3);
        assert_eq!(findings.files["readme.php"].warnings, 1);
        assert_eq!(findings.raw, REPORT.as_bytes());
        assert!(!findings.is_clean());
    }

    #[test]
    fn test_parse_report_rejects_garbage() {
        assert!(matches!(
            parse_report(b"<html>".to_vec(), Path::new("/"), "WordPress"),
            Err(AnalysisError::Parse(_))
        ));
    }

    #[test]
    fn test_findings_serialization_skips_raw() {
        let mut findings = Findings::new("phpcs", "WordPress");
        findings.raw = b"raw".to_vec();
        let json = serde_json::to_value(&findings).unwrap();

        assert!(json.get("raw").is_none());
        assert!(json.get("annotations").is_none());
        assert!(findings.is_clean());
    }

    #[tokio::test]
    async fn test_missing_binary() {
        let dir = tempfile::tempdir().unwrap();
        let analyzer = PhpcsAnalyzer::new("/nonexistent/phpcs-binary", "WordPress");

        let result = analyzer.analyze(dir.path(), dir.path()).await;
        assert!(matches!(result, Err(AnalysisError::Spawn { .. })));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_tool_error_exit_code() {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("fake-phpcs");
        std::fs::write(&script, "#!/bin/sh\necho 'bad standard' >&2\nexit 3\n").unwrap();
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
        }

        let analyzer = PhpcsAnalyzer::new(&script, "Nope");
        let result = analyzer.analyze(dir.path(), dir.path()).await;
        match result {
            Err(AnalysisError::ToolFailed { code, stderr }) => {
                assert_eq!(code, Some(3));
                assert_eq!(stderr, "bad standard");
            }
            other => panic!("expected ToolFailed, got {:?}", other),
        }
    }
}
