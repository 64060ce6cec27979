//! OAuth token endpoint client.
//!
//! The venue's token endpoint answers with either camelCase or snake_case
//! field names depending on the path that produced the token; both shapes
//! normalize into `TokenResponse`.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Production token endpoint.
pub const TOKEN_ENDPOINT: &str = "https://openapi.ctrader.com/apps/token";

const DEFAULT_EXPIRES_IN_SECS: u64 = 3600;

/// Normalized token exchange result.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenResponse {
    pub access_token: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    pub expires_in: u64,
}

#[derive(Debug, Deserialize)]
struct RawTokenResponse {
    #[serde(rename = "accessToken", alias = "access_token")]
    access_token: Option<String>,
    #[serde(rename = "refreshToken", alias = "refresh_token")]
    refresh_token: Option<String>,
    #[serde(rename = "expiresIn", alias = "expires_in")]
    expires_in: Option<u64>,
}

impl RawTokenResponse {
    fn normalize(self) -> Result<TokenResponse> {
        let access_token = self.access_token.ok_or(Error::OAuthMalformed)?;
        Ok(TokenResponse {
            access_token,
            refresh_token: self.refresh_token,
            expires_in: self.expires_in.unwrap_or(DEFAULT_EXPIRES_IN_SECS),
        })
    }
}

/// Blocking-style client for code exchange and refresh grants.
#[derive(Debug, Clone)]
pub struct OAuthClient {
    http: reqwest::Client,
    base_url: String,
    client_id: String,
    client_secret: String,
    redirect_uri: String,
}

impl OAuthClient {
    pub fn new(client_id: &str, client_secret: &str, redirect_uri: &str) -> Self {
        Self::with_base_url(TOKEN_ENDPOINT, client_id, client_secret, redirect_uri)
    }

    /// Custom endpoint, used by tests.
    pub fn with_base_url(
        base_url: impl Into<String>,
        client_id: &str,
        client_secret: &str,
        redirect_uri: &str,
    ) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into(),
            client_id: client_id.to_string(),
            client_secret: client_secret.to_string(),
            redirect_uri: redirect_uri.to_string(),
        }
    }

    /// `grant_type=authorization_code`.
    pub async fn exchange_code(&self, code: &str) -> Result<TokenResponse> {
        debug!("exchanging authorization code");
        self.request(&[
            ("grant_type", "authorization_code"),
            ("code", code),
            ("redirect_uri", &self.redirect_uri),
            ("client_id", &self.client_id),
            ("client_secret", &self.client_secret),
        ])
        .await
    }

    /// `grant_type=refresh_token`.
    pub async fn refresh(&self, refresh_token: &str) -> Result<TokenResponse> {
        debug!("refreshing access token");
        self.request(&[
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
            ("client_id", &self.client_id),
            ("client_secret", &self.client_secret),
        ])
        .await
    }

    async fn request(&self, form: &[(&str, &str)]) -> Result<TokenResponse> {
        let response = self.http.post(&self.base_url).form(form).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(Error::OAuthRejected {
                status: status.as_u16(),
                body: response.text().await.unwrap_or_default(),
            });
        }
        let raw: RawTokenResponse = response.json().await?;
        raw.normalize()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_snake_case() {
        let raw: RawTokenResponse = serde_json::from_str(
            r#"{"access_token":"A","refresh_token":"R","expires_in":3600}"#,
        )
        .unwrap();
        let token = raw.normalize().unwrap();
        assert_eq!(token.access_token, "A");
        assert_eq!(token.refresh_token.as_deref(), Some("R"));
        assert_eq!(token.expires_in, 3600);
    }

    #[test]
    fn test_normalize_camel_case() {
        let raw: RawTokenResponse = serde_json::from_str(
            r#"{"accessToken":"A","refreshToken":"R","expiresIn":60}"#,
        )
        .unwrap();
        let token = raw.normalize().unwrap();
        assert_eq!(token.access_token, "A");
        assert_eq!(token.expires_in, 60);
    }

    #[test]
    fn test_normalize_defaults_expiry() {
        let raw: RawTokenResponse = serde_json::from_str(r#"{"accessToken":"A"}"#).unwrap();
        let token = raw.normalize().unwrap();
        assert_eq!(token.expires_in, 3600);
        assert!(token.refresh_token.is_none());
    }

    #[test]
    fn test_missing_access_token_is_error() {
        let raw: RawTokenResponse = serde_json::from_str(r#"{"expires_in":10}"#).unwrap();
        assert!(matches!(raw.normalize(), Err(Error::OAuthMalformed)));
    }
}
