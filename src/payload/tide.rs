//! Reports audit results to the Tide API.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Serialize;
use tracing::{info, warn};

use crate::auth::{AuthClient, AuthError, Credential, CredentialStore};
use crate::config::TideConfig;
use crate::message::Visibility;
use crate::pipeline::{Findings, Totals};
use crate::storage::StorageRef;

use super::{PayloadError, Payloader};

/// Request timeout in seconds.
const REQUEST_TIMEOUT_SECS: u64 = 60;

#[derive(Serialize)]
struct AuditPayload<'a> {
    title: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    slug: Option<&'a str>,
    source_url: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    checksum: Option<&'a str>,
    visibility: Visibility,
    #[serde(skip_serializing_if = "Option::is_none")]
    request_client: Option<&'a str>,
    results: ResultsEntry<'a>,
}

#[derive(Serialize)]
struct ResultsEntry<'a> {
    #[serde(rename = "phpcs_wordpress")]
    entry: AuditResult<'a>,
}

#[derive(Serialize)]
struct AuditResult<'a> {
    standard: &'a str,
    summary: &'a Totals,
    #[serde(skip_serializing_if = "Option::is_none")]
    full: Option<&'a StorageRef>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    notes: &'a Vec<String>,
}

/// Payloader for the Tide audit API.
///
/// Authenticates with the bearer token held in a shared [`CredentialStore`].
/// A 401 triggers one refresh and one retry; if the refresh itself fails the
/// submission fails with [`PayloadError::Auth`].
pub struct TidePayloader {
    client: Client,
    endpoint: String,
    auth: Arc<dyn AuthClient>,
    credentials: CredentialStore,
}

impl TidePayloader {
    pub fn new(
        config: &TideConfig,
        auth: Arc<dyn AuthClient>,
        credentials: CredentialStore,
    ) -> Result<Self, PayloadError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()
            .map_err(|e| PayloadError::Transport(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            endpoint: format!("{}/audit", config.api_base()),
            auth,
            credentials,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn credential(&self) -> Result<Credential, AuthError> {
        match self.credentials.current().await {
            Some(credential) => Ok(credential),
            None => self.credentials.refresh_if_stale(self.auth.as_ref(), None).await,
        }
    }

    async fn post(
        &self,
        credential: &Credential,
        payload: &AuditPayload<'_>,
    ) -> Result<reqwest::Response, PayloadError> {
        self.client
            .post(&self.endpoint)
            .bearer_auth(&credential.token)
            .json(payload)
            .send()
            .await
            .map_err(|e| PayloadError::Transport(e.to_string()))
    }
}

#[async_trait]
impl Payloader for TidePayloader {
    async fn submit(
        &self,
        findings: &Findings,
        visibility: Visibility,
        storage: Option<&StorageRef>,
    ) -> Result<(), PayloadError> {
        let payload = AuditPayload {
            title: &findings.source.title,
            slug: findings.source.slug.as_deref(),
            source_url: &findings.source.url,
            checksum: findings.source.checksum.as_deref(),
            visibility,
            request_client: findings.source.request_client.as_deref(),
            results: ResultsEntry {
                entry: AuditResult {
                    standard: &findings.standard,
                    summary: &findings.totals,
                    full: storage,
                    notes: &findings.annotations,
                },
            },
        };

        let mut credential = self.credential().await?;
        let mut response = self.post(&credential, &payload).await?;

        if response.status() == StatusCode::UNAUTHORIZED {
            warn!(token = %credential.masked(), "Reporting API rejected token, refreshing");
            credential = self
                .credentials
                .refresh_if_stale(self.auth.as_ref(), Some(&credential))
                .await?;
            response = self.post(&credential, &payload).await?;

            if response.status() == StatusCode::UNAUTHORIZED {
                return Err(PayloadError::Auth(AuthError::InvalidCredentials(
                    "refreshed token was rejected".to_string(),
                )));
            }
        }

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(PayloadError::Rejected {
                status: status.as_u16(),
                body,
            });
        }

        info!(source = %findings.source.url, "Reported audit to Tide");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::SourceInfo;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    struct SequenceAuth {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl AuthClient for SequenceAuth {
        async fn authenticate(&self) -> Result<Credential, AuthError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(Credential::new(format!("token-{}", n)))
        }
    }

    struct RejectingAuth;

    #[async_trait]
    impl AuthClient for RejectingAuth {
        async fn authenticate(&self) -> Result<Credential, AuthError> {
            Err(AuthError::InvalidCredentials("revoked".to_string()))
        }
    }

    fn config(server: &MockServer) -> TideConfig {
        TideConfig {
            id: "key".to_string(),
            secret: "secret".to_string(),
            auth_endpoint: format!("{}/api/tide/v1/auth", server.uri()),
            host: server.address().to_string(),
            protocol: "http".to_string(),
            version: "v1".to_string(),
        }
    }

    fn findings() -> Findings {
        let mut findings = Findings::new("phpcs", "WordPress");
        findings.source = SourceInfo {
            url: "https://example.org/plugin.tar.gz".to_string(),
            title: "Plugin".to_string(),
            ..Default::default()
        };
        findings.totals.errors = 2;
        findings
    }

    #[tokio::test]
    async fn test_submit_with_stored_token() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/tide/v1/audit"))
            .and(header("authorization", "Bearer token-0"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let auth = Arc::new(SequenceAuth {
            calls: AtomicUsize::new(0),
        });
        let credentials = CredentialStore::new();
        credentials.refresh(auth.as_ref()).await.unwrap();

        let payloader = TidePayloader::new(&config(&server), auth.clone(), credentials).unwrap();
        payloader
            .submit(&findings(), Visibility::Public, None)
            .await
            .unwrap();

        assert_eq!(auth.calls.load(Ordering::SeqCst), 1);
        let requests = server.received_requests().await.unwrap();
        let body: serde_json::Value = serde_json::from_slice(&requests[0].body).unwrap();
        assert_eq!(body["results"]["phpcs_wordpress"]["summary"]["errors"], 2);
        assert_eq!(body["visibility"], "public");
    }

    #[tokio::test]
    async fn test_unauthorized_refreshes_once() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(header("authorization", "Bearer token-0"))
            .respond_with(ResponseTemplate::new(401))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(header("authorization", "Bearer token-1"))
            .respond_with(ResponseTemplate::new(201))
            .expect(1)
            .mount(&server)
            .await;

        let auth = Arc::new(SequenceAuth {
            calls: AtomicUsize::new(0),
        });
        let credentials = CredentialStore::new();
        credentials.refresh(auth.as_ref()).await.unwrap();

        let payloader =
            TidePayloader::new(&config(&server), auth.clone(), credentials.clone()).unwrap();
        payloader
            .submit(&findings(), Visibility::Public, None)
            .await
            .unwrap();

        assert_eq!(credentials.current().await.unwrap().token, "token-1");
    }

    #[tokio::test]
    async fn test_failed_refresh_is_auth_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(401))
            .expect(1)
            .mount(&server)
            .await;

        let credentials = CredentialStore::new();
        let ok = SequenceAuth {
            calls: AtomicUsize::new(0),
        };
        credentials.refresh(&ok).await.unwrap();

        let payloader =
            TidePayloader::new(&config(&server), Arc::new(RejectingAuth), credentials).unwrap();
        let result = payloader.submit(&findings(), Visibility::Public, None).await;
        assert!(matches!(result, Err(PayloadError::Auth(_))));
    }

    #[tokio::test]
    async fn test_server_error_is_rejected() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503).set_body_string("maintenance"))
            .mount(&server)
            .await;

        let auth = Arc::new(SequenceAuth {
            calls: AtomicUsize::new(0),
        });
        let payloader = TidePayloader::new(&config(&server), auth, CredentialStore::new()).unwrap();
        match payloader.submit(&findings(), Visibility::Private, None).await {
            Err(PayloadError::Rejected { status, body }) => {
                assert_eq!(status, 503);
                assert_eq!(body, "maintenance");
            }
            other => panic!("expected Rejected, got {:?}", other),
        }
    }
}
