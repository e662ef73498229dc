//! Google OAuth2 identity provider.
//!
//! Only the refresh leg is implemented: the user record already carries a
//! refresh token obtained elsewhere. Google does not rotate refresh tokens on
//! refresh, so the response usually omits one.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use recurmail_core::{
    config::GoogleConfig,
    provider::{IdentityProvider, ProviderError},
    types::{Credential, Profile},
};
use serde::Deserialize;
use tracing::{debug, warn};

pub struct GoogleIdentity {
    client: reqwest::Client,
    client_id: String,
    client_secret: String,
    token_url: String,
    userinfo_url: String,
}

impl GoogleIdentity {
    pub fn new(config: &GoogleConfig) -> Self {
        Self::with_client(reqwest::Client::new(), config)
    }

    pub fn with_client(client: reqwest::Client, config: &GoogleConfig) -> Self {
        Self {
            client,
            client_id: config.client_id.clone(),
            client_secret: config.client_secret.clone(),
            token_url: config.token_url.clone(),
            userinfo_url: config.userinfo_url.clone(),
        }
    }

    fn refresh_body(&self, refresh_token: &str) -> String {
        format!(
            "grant_type=refresh_token&refresh_token={}&client_id={}&client_secret={}",
            urlencoding::encode(refresh_token),
            urlencoding::encode(&self.client_id),
            urlencoding::encode(&self.client_secret),
        )
    }
}

#[derive(Debug, Deserialize)]
struct TokenRefreshResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    expires_in: i64,
}

impl TokenRefreshResponse {
    fn into_credential(self, issued_at: DateTime<Utc>) -> Result<Credential, ProviderError> {
        let expires_at = Duration::try_seconds(self.expires_in)
            .and_then(|d| issued_at.checked_add_signed(d))
            .ok_or_else(|| {
                ProviderError::Parse(format!("expires_in out of range: {}", self.expires_in))
            })?;
        Ok(Credential {
            access_token: self.access_token,
            refresh_token: self.refresh_token,
            expires_at,
        })
    }
}

#[derive(Debug, Deserialize)]
struct UserInfo {
    email: String,
    #[serde(default)]
    name: Option<String>,
}

#[async_trait]
impl IdentityProvider for GoogleIdentity {
    fn name(&self) -> &str {
        "google"
    }

    async fn refresh_credential(&self, refresh_token: &str) -> Result<Credential, ProviderError> {
        if self.client_id.is_empty() {
            return Err(ProviderError::Unavailable(
                "google.client_id is not configured".to_string(),
            ));
        }

        let issued_at = Utc::now();
        let resp = self
            .client
            .post(&self.token_url)
            .header("Content-Type", "application/x-www-form-urlencoded")
            .header("Accept", "application/json")
            .body(self.refresh_body(refresh_token))
            .send()
            .await
            .map_err(|e| ProviderError::Http(e.to_string()))?;

        let status = resp.status().as_u16();
        if !resp.status().is_success() {
            let text = resp.text().await.unwrap_or_default();
            warn!(status, body = %text, "Google token refresh rejected");
            return Err(ProviderError::Api {
                status,
                message: format!("token refresh failed: {text}"),
            });
        }

        let token_resp: TokenRefreshResponse = resp
            .json()
            .await
            .map_err(|e| ProviderError::Parse(e.to_string()))?;
        debug!(expires_in = token_resp.expires_in, "Google token refreshed");
        token_resp.into_credential(issued_at)
    }

    async fn get_profile(&self, access_token: &str) -> Result<Profile, ProviderError> {
        let resp = self
            .client
            .get(&self.userinfo_url)
            .bearer_auth(access_token)
            .send()
            .await
            .map_err(|e| ProviderError::Http(e.to_string()))?;

        let status = resp.status().as_u16();
        if !resp.status().is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(ProviderError::Api {
                status,
                message: text,
            });
        }

        let info: UserInfo = resp
            .json()
            .await
            .map_err(|e| ProviderError::Parse(e.to_string()))?;
        Ok(Profile {
            email: info.email,
            name: info.name,
        })
    }
}
