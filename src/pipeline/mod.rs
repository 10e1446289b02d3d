//! Per-message audit pipeline.
//!
//! Every message runs through four stages in order:
//!
//! 1. **Ingest** - fetch the source package into a per-job temp directory
//! 2. **Analyze** - run phpcs and parse its report into [`Findings`]
//! 3. **Store** - persist the raw report through the [`Storage`](crate::storage::Storage) capability
//! 4. **Report** - hand the findings to the payloader matching the message's `response_target`
//!
//! A failure in ingest, analyze, or report ends the job with a
//! [`StageError`]. A storage failure is recorded on the outcome but the
//! findings are still reported.
//!
//! # Example
//!
//! ```rust,ignore
//! use phpcs_server::pipeline::{AuditPipeline, ProcessConfig};
//!
//! let config = ProcessConfig::new()
//!     .with_ingest_temp_folder("/tmp/phpcs/ingest")
//!     .with_analysis_temp_folder("/tmp/phpcs/analysis")
//!     .with_storage(storage)
//!     .with_payloader("tide", tide_payloader);
//!
//! let pipeline = AuditPipeline::new(config)?;
//! let outcome = pipeline.run(&message).await;
//! ```

pub mod analyze;
pub mod config;
pub mod ingest;
pub mod outcome;
pub mod process;

pub use analyze::{
    parse_report, AnalysisError, Analyzer, FileSummary, Findings, PhpcsAnalyzer, SourceInfo,
    Totals,
};
pub use config::{PayloaderMap, ProcessConfig};
pub use ingest::{IngestError, IngestedSource, Ingester, SourceIngester};
pub use outcome::{JobOutcome, JobStatus, Stage, StageError};
pub use process::{AuditPipeline, REPORT_ARTIFACT};
