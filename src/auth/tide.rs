//! Tide API auth client.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::TideConfig;

use super::{AuthClient, AuthError, Credential};

/// Request timeout in seconds.
const REQUEST_TIMEOUT_SECS: u64 = 30;

#[derive(Serialize)]
struct AuthRequest<'a> {
    api_key: &'a str,
    api_secret: &'a str,
}

#[derive(Deserialize)]
struct AuthResponse {
    #[serde(alias = "token")]
    access_token: String,
}

/// Exchanges the Tide API key and secret for a bearer token.
pub struct TideAuthClient {
    client: Client,
    endpoint: String,
    id: String,
    secret: String,
}

impl TideAuthClient {
    /// Creates a client for the configured auth endpoint.
    pub fn new(config: &TideConfig) -> Result<Self, AuthError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()
            .map_err(|e| AuthError::Unreachable(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self::with_client(client, config))
    }

    /// Creates a client that reuses an existing HTTP client.
    pub fn with_client(client: Client, config: &TideConfig) -> Self {
        Self {
            client,
            endpoint: config.auth_endpoint.clone(),
            id: config.id.clone(),
            secret: config.secret.clone(),
        }
    }
}

#[async_trait]
impl AuthClient for TideAuthClient {
    async fn authenticate(&self) -> Result<Credential, AuthError> {
        debug!(endpoint = %self.endpoint, "Requesting reporting API token");

        let response = self
            .client
            .post(&self.endpoint)
            .json(&AuthRequest {
                api_key: &self.id,
                api_secret: &self.secret,
            })
            .send()
            .await
            .map_err(|e| AuthError::Unreachable(e.to_string()))?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(AuthError::InvalidCredentials(format!(
                "auth endpoint returned {}",
                status
            )));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AuthError::BadResponse(format!("{}: {}", status, body)));
        }

        let body: AuthResponse = response
            .json()
            .await
            .map_err(|e| AuthError::BadResponse(e.to_string()))?;
        if body.access_token.is_empty() {
            return Err(AuthError::BadResponse("empty access token".to_string()));
        }

        Ok(Credential::new(body.access_token))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn tide_config(server: &MockServer) -> TideConfig {
        TideConfig {
            id: "tideapikey".to_string(),
            secret: "tideapisecret".to_string(),
            auth_endpoint: format!("{}/api/tide/v1/auth", server.uri()),
            host: server.address().to_string(),
            protocol: "http".to_string(),
            version: "v1".to_string(),
        }
    }

    #[tokio::test]
    async fn test_authenticate_success() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/tide/v1/auth"))
            .and(body_json(serde_json::json!({
                "api_key": "tideapikey",
                "api_secret": "tideapisecret"
            })))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({"access_token": "jwt-token-value"})),
            )
            .expect(1)
            .mount(&server)
            .await;

        let client = TideAuthClient::new(&tide_config(&server)).unwrap();
        let credential = client.authenticate().await.unwrap();
        assert_eq!(credential.token, "jwt-token-value");
    }

    #[tokio::test]
    async fn test_authenticate_invalid_credentials() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let client = TideAuthClient::new(&tide_config(&server)).unwrap();
        assert!(matches!(
            client.authenticate().await,
            Err(AuthError::InvalidCredentials(_))
        ));
    }

    #[tokio::test]
    async fn test_authenticate_bad_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_string("not json"))
            .mount(&server)
            .await;

        let client = TideAuthClient::new(&tide_config(&server)).unwrap();
        assert!(matches!(
            client.authenticate().await,
            Err(AuthError::BadResponse(_))
        ));
    }

    #[tokio::test]
    async fn test_authenticate_unreachable() {
        let config = TideConfig {
            id: "k".to_string(),
            secret: "s".to_string(),
            auth_endpoint: "http://127.0.0.1:1/auth".to_string(),
            host: "127.0.0.1:1".to_string(),
            protocol: "http".to_string(),
            version: "v1".to_string(),
        };

        let client = TideAuthClient::new(&config).unwrap();
        assert!(matches!(
            client.authenticate().await,
            Err(AuthError::Unreachable(_))
        ));
    }
}
