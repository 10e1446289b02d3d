//! phpcs-server: queue-driven PHP_CodeSniffer audit worker.
//!
//! Pulls audit requests from a message queue, runs each one through an
//! ingest → analyze → store → report pipeline under a bounded concurrency
//! gate, and shuts down gracefully on a termination signal.

// Core modules
pub mod auth;
pub mod cli;
pub mod config;
pub mod error;
pub mod message;
pub mod payload;
pub mod pipeline;
pub mod service;
pub mod storage;

// Re-export commonly used error types
pub use error::{AuthError, ConfigError, ServiceError, SourceError};
