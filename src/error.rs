//! Error types for service startup and lifecycle.
//!
//! Defines the errors that stop the service as a whole:
//! - Missing or invalid configuration
//! - Missing message source
//! - Reporting API authentication
//! - Connecting to the message provider
//! - Unrecoverable failures while serving
//!
//! Per-job failures never surface here; they are captured in the job's
//! terminal outcome (see [`crate::pipeline::StageError`]).

use thiserror::Error;

use crate::message::ProviderError;

/// Errors raised while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),

    /// A required process config field is absent or empty.
    #[error("Missing required process config field: {0}")]
    MissingField(&'static str),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// The dispatcher was started without a message channel to consume.
#[derive(Debug, Error)]
#[error("No message source channel supplied")]
pub struct SourceError;

/// Errors raised while obtaining a reporting API credential.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("Invalid credentials: {0}")]
    InvalidCredentials(String),

    #[error("Auth endpoint unreachable: {0}")]
    Unreachable(String),

    #[error("Unexpected auth response: {0}")]
    BadResponse(String),
}

/// Errors that stop the service.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Source error: {0}")]
    Source(#[from] SourceError),

    #[error("Authentication error: {0}")]
    Auth(#[from] AuthError),

    /// The message provider could not be opened.
    #[error("Message provider error: {0}")]
    Provider(#[from] ProviderError),

    /// A poll error or mid-service auth failure that cannot recover.
    #[error("Critical failure: {0}")]
    Critical(String),

    #[error("Task join error: {0}")]
    Join(#[from] tokio::task::JoinError),
}
