//! Process configuration for the audit pipeline.
//!
//! A [`ProcessConfig`] names the temp folders each job works in and the
//! capabilities the stages use: where to store raw artifacts and which
//! payloaders can report results. Optional capabilities fall back to the
//! stock implementations.

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use crate::error::ConfigError;
use crate::payload::Payloader;
use crate::storage::Storage;

use super::analyze::Analyzer;
use super::ingest::Ingester;

/// Payloaders keyed by the `response_target` they serve.
pub type PayloaderMap = HashMap<String, Arc<dyn Payloader>>;

/// Configuration shared by every pipeline run.
#[derive(Clone, Default)]
pub struct ProcessConfig {
    /// Root for downloaded and unpacked sources.
    pub ingest_temp_folder: Option<PathBuf>,
    /// Root for analysis scratch files.
    pub analysis_temp_folder: Option<PathBuf>,
    pub storage: Option<Arc<dyn Storage>>,
    /// `None` means no payloader map was supplied at all; an empty map is
    /// valid and makes every job fail with `payloader-missing`.
    pub payloaders: Option<PayloaderMap>,
    /// Defaults to [`SourceIngester`](super::SourceIngester).
    pub ingester: Option<Arc<dyn Ingester>>,
    /// Defaults to [`PhpcsAnalyzer`](super::PhpcsAnalyzer).
    pub analyzer: Option<Arc<dyn Analyzer>>,
}

impl ProcessConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Checks that every required field is present.
    ///
    /// Fields are checked in a fixed order and the first missing one is
    /// reported.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if is_blank(&self.ingest_temp_folder) {
            return Err(ConfigError::MissingField("ingest temp folder"));
        }
        if is_blank(&self.analysis_temp_folder) {
            return Err(ConfigError::MissingField("analysis temp folder"));
        }
        if self.storage.is_none() {
            return Err(ConfigError::MissingField("storage provider"));
        }
        if self.payloaders.is_none() {
            return Err(ConfigError::MissingField("payloaders"));
        }
        Ok(())
    }

    // Builder methods

    pub fn with_ingest_temp_folder(mut self, path: impl Into<PathBuf>) -> Self {
        self.ingest_temp_folder = Some(path.into());
        self
    }

    pub fn with_analysis_temp_folder(mut self, path: impl Into<PathBuf>) -> Self {
        self.analysis_temp_folder = Some(path.into());
        self
    }

    pub fn with_storage(mut self, storage: Arc<dyn Storage>) -> Self {
        self.storage = Some(storage);
        self
    }

    pub fn with_payloaders(mut self, payloaders: PayloaderMap) -> Self {
        self.payloaders = Some(payloaders);
        self
    }

    /// Registers one payloader, replacing any previous one for `target`.
    pub fn with_payloader(mut self, target: impl Into<String>, payloader: Arc<dyn Payloader>) -> Self {
        self.payloaders
            .get_or_insert_with(HashMap::new)
            .insert(target.into(), payloader);
        self
    }

    pub fn with_ingester(mut self, ingester: Arc<dyn Ingester>) -> Self {
        self.ingester = Some(ingester);
        self
    }

    pub fn with_analyzer(mut self, analyzer: Arc<dyn Analyzer>) -> Self {
        self.analyzer = Some(analyzer);
        self
    }
}

impl fmt::Debug for ProcessConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut targets: Option<Vec<&String>> =
            self.payloaders.as_ref().map(|p| p.keys().collect());
        if let Some(targets) = targets.as_mut() {
            targets.sort();
        }

        f.debug_struct("ProcessConfig")
            .field("ingest_temp_folder", &self.ingest_temp_folder)
            .field("analysis_temp_folder", &self.analysis_temp_folder)
            .field("storage", &self.storage.is_some())
            .field("payloaders", &targets)
            .finish_non_exhaustive()
    }
}

fn is_blank(path: &Option<PathBuf>) -> bool {
    path.as_ref().map_or(true, |p| p.as_os_str().is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::FileStorage;

    fn storage() -> Arc<dyn Storage> {
        Arc::new(FileStorage::new("/tmp/phpcs-storage", "audits").unwrap())
    }

    fn assert_missing(config: &ProcessConfig, field: &str) {
        match config.validate() {
            Err(ConfigError::MissingField(f)) => assert_eq!(f, field),
            other => panic!("expected missing {}, got {:?}", field, other),
        }
    }

    #[test]
    fn test_validate_reports_first_missing_field() {
        let config = ProcessConfig::new();
        assert_missing(&config, "ingest temp folder");

        let config = config.with_ingest_temp_folder("/tmp/ingest");
        assert_missing(&config, "analysis temp folder");

        let config = config.with_analysis_temp_folder("/tmp/analysis");
        assert_missing(&config, "storage provider");

        let config = config.with_storage(storage());
        assert_missing(&config, "payloaders");

        let config = config.with_payloaders(PayloaderMap::new());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_blank_folder_counts_as_missing() {
        let config = ProcessConfig::new()
            .with_ingest_temp_folder("")
            .with_analysis_temp_folder("/tmp/analysis");
        assert_missing(&config, "ingest temp folder");
    }

    #[test]
    fn test_with_payloader_creates_map() {
        let config = ProcessConfig::new().with_payloader(
            "local",
            Arc::new(crate::payload::FilePayloader::new("/tmp/out.json")),
        );
        let payloaders = config.payloaders.as_ref().unwrap();
        assert!(payloaders.contains_key("local"));
        assert!(format!("{:?}", config).contains("local"));
    }
}
