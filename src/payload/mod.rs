//! Result reporting.
//!
//! A [`Payloader`] delivers a job's findings to one reporting target. The
//! pipeline picks the payloader whose registered key matches the message's
//! `response_target`.

pub mod file;
pub mod tide;

use async_trait::async_trait;
use thiserror::Error;

use crate::auth::AuthError;
use crate::message::Visibility;
use crate::pipeline::Findings;
use crate::storage::StorageRef;

pub use file::FilePayloader;
pub use tide::TidePayloader;

/// Errors that can occur while reporting results.
#[derive(Debug, Error)]
pub enum PayloadError {
    /// The reporting target refused our credential and it could not be renewed.
    #[error("Authentication failed: {0}")]
    Auth(#[from] AuthError),

    #[error("Report rejected with status {status}: {body}")]
    Rejected { status: u16, body: String },

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Capability for delivering findings to a reporting target.
#[async_trait]
pub trait Payloader: Send + Sync {
    async fn submit(
        &self,
        findings: &Findings,
        visibility: Visibility,
        storage: Option<&StorageRef>,
    ) -> Result<(), PayloadError>;
}
