//! Bearer credentials for the reporting API.
//!
//! An [`AuthClient`] exchanges the configured key and secret for a bearer
//! token. The live token sits in a [`CredentialStore`] shared by every
//! payloader: payloaders only read it, and a refresh replaces it for all of
//! them at once.

pub mod tide;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, RwLock};
use tracing::info;

pub use crate::error::AuthError;
pub use tide::TideAuthClient;

/// A bearer token and when it was obtained.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    pub token: String,
    pub obtained_at: DateTime<Utc>,
}

impl Credential {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            obtained_at: Utc::now(),
        }
    }

    /// Token with all but its first and last four characters hidden.
    pub fn masked(&self) -> String {
        let chars = self.token.chars().count();
        if chars <= 8 {
            return "*".repeat(chars);
        }
        let head: String = self.token.chars().take(4).collect();
        let tail: String = self.token.chars().skip(chars - 4).collect();
        format!("{}...{}", head, tail)
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("token", &self.masked())
            .field("obtained_at", &self.obtained_at)
            .finish()
    }
}

/// Capability for obtaining a bearer credential.
#[async_trait]
pub trait AuthClient: Send + Sync {
    async fn authenticate(&self) -> Result<Credential, AuthError>;
}

/// Shared, refreshable credential.
///
/// Cloning is cheap; all clones see the same credential.
#[derive(Clone, Default)]
pub struct CredentialStore {
    current: Arc<RwLock<Option<Credential>>>,
    refresh_lock: Arc<Mutex<()>>,
}

impl CredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the live credential, if one has been obtained.
    pub async fn current(&self) -> Option<Credential> {
        self.current.read().await.clone()
    }

    /// Obtains a fresh credential and makes it the live one.
    pub async fn refresh(&self, client: &dyn AuthClient) -> Result<Credential, AuthError> {
        let _guard = self.refresh_lock.lock().await;
        self.replace(client).await
    }

    /// Refreshes only if the live credential is still `stale`.
    ///
    /// When several payloaders see the same expired token at once, the first
    /// one refreshes and the rest pick up its result.
    pub async fn refresh_if_stale(
        &self,
        client: &dyn AuthClient,
        stale: Option<&Credential>,
    ) -> Result<Credential, AuthError> {
        let _guard = self.refresh_lock.lock().await;

        if let Some(live) = self.current().await {
            if stale.map_or(true, |s| s.token != live.token) {
                return Ok(live);
            }
        }

        self.replace(client).await
    }

    async fn replace(&self, client: &dyn AuthClient) -> Result<Credential, AuthError> {
        let credential = client.authenticate().await?;
        info!(token = %credential.masked(), "Obtained reporting API credential");
        *self.current.write().await = Some(credential.clone());
        Ok(credential)
    }
}

impl fmt::Debug for CredentialStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialStore").finish_non_exhaustive()
    }
}
