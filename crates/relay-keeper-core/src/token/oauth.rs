//! OAuth 2.0 refresh-token exchange over HTTP.

use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;
use url::Url;

use super::{Credential, RefreshError, SecretValue, TokenGrant, TokenRefresher};
use crate::config::ConfigError;

/// Token endpoint response body.
///
/// Both the success and the error shape of RFC 6749 §5 are accepted so that
/// an error body returned with status 200 is still recognized.
#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: Option<SecretValue>,
    refresh_token: Option<SecretValue>,
    expires_in: Option<u64>,
    error: Option<String>,
    error_description: Option<String>,
}

/// [`TokenRefresher`] posting a `grant_type=refresh_token` form to an OAuth
/// token endpoint.
#[derive(Debug, Clone)]
pub struct OAuthRefreshClient {
    http_client: reqwest::Client,
    token_url: Url,
}

impl OAuthRefreshClient {
    /// Create a client for a token endpoint.
    ///
    /// # Arguments
    ///
    /// * `token_url` - Absolute URL of the token endpoint
    /// * `timeout` - Bound on one exchange, connect included
    pub fn new(token_url: &str, timeout: Duration) -> Result<Self, ConfigError> {
        let token_url = Url::parse(token_url).map_err(|e| ConfigError::InvalidUrl {
            url: token_url.to_string(),
            message: e.to_string(),
        })?;

        let http_client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ConfigError::HttpClient {
                message: e.to_string(),
            })?;

        Ok(Self {
            http_client,
            token_url,
        })
    }

    /// Token endpoint this client posts to.
    pub fn token_url(&self) -> &Url {
        &self.token_url
    }
}

#[async_trait]
impl TokenRefresher for OAuthRefreshClient {
    async fn refresh(&self, credential: &Credential) -> Result<TokenGrant, RefreshError> {
        let form = [
            ("grant_type", "refresh_token"),
            ("refresh_token", credential.refresh_token.expose_secret()),
            ("client_id", credential.client_id.as_str()),
            ("client_secret", credential.client_secret.expose_secret()),
        ];

        debug!(token_url = %self.token_url, "Exchanging refresh token");

        let response = self
            .http_client
            .post(self.token_url.clone())
            .header("Accept", "application/json")
            .form(&form)
            .send()
            .await
            .map_err(|e| RefreshError::Network {
                message: e.to_string(),
            })?;

        let status = response.status();
        if status.is_server_error() {
            let message = response
                .text()
                .await
                .unwrap_or_else(|_| "Unable to read error body".to_string());
            return Err(RefreshError::ServerError {
                status: status.as_u16(),
                message,
            });
        }

        if !status.is_success() {
            let message = response
                .text()
                .await
                .unwrap_or_else(|_| "Unable to read error body".to_string());
            return Err(RefreshError::Rejected {
                status: status.as_u16(),
                message,
            });
        }

        let body = response.text().await.map_err(|e| RefreshError::Network {
            message: e.to_string(),
        })?;

        let parsed: TokenResponse =
            serde_json::from_str(&body).map_err(|e| RefreshError::MalformedResponse {
                message: e.to_string(),
            })?;

        match parsed.access_token {
            Some(access_token) if !access_token.is_empty() => Ok(TokenGrant {
                access_token,
                refresh_token: parsed.refresh_token.filter(|token| !token.is_empty()),
                expires_in: parsed.expires_in.map(Duration::from_secs),
            }),
            _ => match parsed.error {
                Some(error) => Err(RefreshError::Rejected {
                    status: status.as_u16(),
                    message: match parsed.error_description {
                        Some(description) => format!("{}: {}", error, description),
                        None => error,
                    },
                }),
                None => Err(RefreshError::MissingAccessToken),
            },
        }
    }
}

#[cfg(test)]
#[path = "oauth_tests.rs"]
mod tests;
