use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use super::credentials::{default_token_lifetime, CredentialStore, Credentials};
use super::error::{Result, TwitchError};

pub const TOKEN_URL: &str = "https://id.twitch.tv/oauth2/token";
pub const VALIDATE_URL: &str = "https://id.twitch.tv/oauth2/validate";
pub const REVOKE_URL: &str = "https://id.twitch.tv/oauth2/revoke";

/// Tokens this close to expiry are refreshed before use
pub fn token_expiry_buffer() -> Duration {
    Duration::minutes(5)
}

/// True when `now` is inside the refresh window of `expires_at` (or past it)
pub fn needs_refresh_at(expires_at: DateTime<Utc>, now: DateTime<Utc>) -> bool {
    now + token_expiry_buffer() >= expires_at
}

/// Build the HTTP client shared by the token manager and the EventSub client
pub fn build_http_client(timeout: StdDuration) -> Result<reqwest::Client> {
    Ok(reqwest::Client::builder().timeout(timeout).build()?)
}

/// OAuth endpoint URLs
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OAuthEndpoints {
    pub token_url: String,
    pub validate_url: String,
    pub revoke_url: String,
}

impl Default for OAuthEndpoints {
    fn default() -> Self {
        Self {
            token_url: TOKEN_URL.to_string(),
            validate_url: VALIDATE_URL.to_string(),
            revoke_url: REVOKE_URL.to_string(),
        }
    }
}

/// Response from the token refresh endpoint
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TokenResponse {
    pub access_token: String,
    pub refresh_token: String,
    #[serde(default)]
    pub expires_in: Option<u64>,
    #[serde(default)]
    pub scope: Vec<String>,
    #[serde(default)]
    pub token_type: String,
}

/// Outcome of token introspection
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TokenValidation {
    pub valid: bool,
    pub username: Option<String>,
    pub user_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ValidateResponse {
    #[serde(default)]
    client_id: Option<String>,
    #[serde(default)]
    login: Option<String>,
    #[serde(default)]
    user_id: Option<String>,
}

/// Keeps the stored access token usable: refresh, validation and revocation
#[derive(Debug, Clone)]
pub struct TokenManager {
    store: CredentialStore,
    client: reqwest::Client,
    endpoints: OAuthEndpoints,
}

impl TokenManager {
    pub fn new(store: CredentialStore, client: reqwest::Client, endpoints: OAuthEndpoints) -> Self {
        Self {
            store,
            client,
            endpoints,
        }
    }

    pub fn store(&self) -> &CredentialStore {
        &self.store
    }

    /// Whether the stored token is within the expiry buffer.
    ///
    /// Reads the persisted expiry so every holder of a credential value sees
    /// the same answer. Nothing stored means nothing to refresh.
    pub fn needs_refresh(&self) -> bool {
        self.store
            .load()
            .is_some_and(|stored| needs_refresh_at(stored.expires_at, Utc::now()))
    }

    /// Refresh the access token using the refresh-token grant
    pub async fn refresh(
        &self,
        client_id: &str,
        client_secret: &str,
        refresh_token: &str,
    ) -> Result<TokenResponse> {
        let params = [
            ("client_id", client_id),
            ("client_secret", client_secret),
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
        ];

        let response = self
            .client
            .post(&self.endpoints.token_url)
            .form(&params)
            .send()
            .await
            .map_err(|e| TwitchError::RefreshFailed(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            log::error!("Failed to refresh token: HTTP {} - {}", status, error_text);
            return Err(TwitchError::RefreshFailed(format!(
                "HTTP {} - {}",
                status, error_text
            )));
        }

        response
            .json::<TokenResponse>()
            .await
            .map_err(|e| TwitchError::RefreshFailed(e.to_string()))
    }

    /// Return credentials that are safe to connect with.
    ///
    /// Unchanged when no refresh is due, or when the set cannot be refreshed
    /// (the caller keeps using it until it expires). Otherwise refreshes and
    /// persists the new tokens.
    pub async fn ensure_valid(&self, credentials: &Credentials) -> Result<Credentials> {
        if !self.needs_refresh() {
            return Ok(credentials.clone());
        }

        if !credentials.can_refresh() {
            log::warn!("Cannot refresh token: missing refresh token or client secret");
            return Ok(credentials.clone());
        }

        log::info!("Token needs refresh, refreshing...");
        self.refresh_and_store(credentials).await
    }

    /// Refresh regardless of the stored expiry, e.g. after the API rejected the token
    pub async fn force_refresh(&self, credentials: &Credentials) -> Result<Credentials> {
        if !credentials.can_refresh() {
            return Err(TwitchError::RefreshFailed(
                "missing refresh token or client secret".to_string(),
            ));
        }
        self.refresh_and_store(credentials).await
    }

    async fn refresh_and_store(&self, credentials: &Credentials) -> Result<Credentials> {
        let (Some(client_secret), Some(refresh_token)) = (
            credentials.client_secret.as_deref(),
            credentials.refresh_token.as_deref(),
        ) else {
            return Err(TwitchError::RefreshFailed(
                "missing refresh token or client secret".to_string(),
            ));
        };

        let tokens = self
            .refresh(&credentials.client_id, client_secret, refresh_token)
            .await?;

        let updated = Credentials {
            access_token: tokens.access_token,
            refresh_token: Some(tokens.refresh_token),
            ..credentials.clone()
        };

        let lifetime = tokens
            .expires_in
            .and_then(|secs| i64::try_from(secs).ok())
            .map(Duration::seconds)
            .unwrap_or_else(default_token_lifetime);

        // The old refresh token is already spent, so hand back the new one
        // even if it could not be written.
        if let Err(e) = self.store.save(&updated, Some(lifetime)) {
            log::error!("Refreshed token could not be persisted: {}", e);
        }

        log::info!("✓ Token refreshed successfully");
        Ok(updated)
    }

    /// Validate an access token. Any failure reads as `valid = false`.
    pub async fn validate(&self, client_id: &str, access_token: &str) -> TokenValidation {
        match self.try_validate(client_id, access_token).await {
            Ok(validation) => validation,
            Err(e) => {
                log::error!("Error validating token: {}", e);
                TokenValidation::default()
            }
        }
    }

    async fn try_validate(&self, client_id: &str, access_token: &str) -> Result<TokenValidation> {
        let response = self
            .client
            .get(&self.endpoints.validate_url)
            .header("Authorization", format!("OAuth {}", access_token))
            .send()
            .await
            .map_err(|e| TwitchError::ValidationFailed(e.to_string()))?;

        if !response.status().is_success() {
            log::debug!("Token validation returned HTTP {}", response.status());
            return Ok(TokenValidation::default());
        }

        let data = response
            .json::<ValidateResponse>()
            .await
            .map_err(|e| TwitchError::ValidationFailed(e.to_string()))?;

        if let Some(issued_to) = data.client_id.as_deref() {
            if issued_to != client_id {
                log::warn!(
                    "Token was issued to client '{}', not the configured '{}'",
                    issued_to,
                    client_id
                );
            }
        }

        Ok(TokenValidation {
            valid: true,
            username: data.login,
            user_id: data.user_id,
        })
    }

    /// Revoke a token. Best effort: failures are reported as `false`.
    pub async fn revoke(&self, client_id: &str, access_token: &str) -> bool {
        match self.try_revoke(client_id, access_token).await {
            Ok(revoked) => revoked,
            Err(e) => {
                log::error!("Error revoking token: {}", e);
                false
            }
        }
    }

    async fn try_revoke(&self, client_id: &str, access_token: &str) -> Result<bool> {
        let params = [("client_id", client_id), ("token", access_token)];

        let response = self
            .client
            .post(&self.endpoints.revoke_url)
            .form(&params)
            .send()
            .await
            .map_err(|e| TwitchError::RevocationFailed(e.to_string()))?;

        Ok(response.status().is_success())
    }
}
