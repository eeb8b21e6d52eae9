//! Access tokens for the HTTP mail providers and keyring-held secrets.
//!
//! Refresh tokens and passwords are provisioned out of band (settings UI);
//! this module only reads them and exchanges them for short-lived tokens.
use std::collections::HashMap;
use std::env;

use oauth2::basic::{BasicClient, BasicErrorResponse};
use oauth2::reqwest::async_http_client;
use oauth2::{
    AuthUrl, ClientId, ClientSecret, RefreshToken, RequestTokenError, Scope, TokenResponse,
    TokenUrl,
};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::errors::{AppError, AppResult};
use crate::types::now_ts;

const GOOGLE_AUTH_URL: &str = "https://accounts.google.com/o/oauth2/v2/auth";
const GOOGLE_TOKEN_URL: &str = "https://oauth2.googleapis.com/token";
const GOOGLE_SERVICE_NAME: &str = "deskpoll-google-oauth";
const GRAPH_SCOPE: &str = "https://graph.microsoft.com/.default";
/// Tokens this close to expiry are refreshed early.
const EXPIRY_SKEW_SECS: i64 = 60;

#[derive(Clone, Debug)]
struct CachedToken {
    access_token: String,
    expires_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredToken {
    refresh_token: String,
}

/// Per-mailbox access token cache shared by the HTTP adapters.
#[derive(Default)]
pub struct TokenCache {
    tokens: Mutex<HashMap<String, CachedToken>>,
}

impl TokenCache {
    pub fn new() -> Self {
        Self::default()
    }

    async fn cached(&self, key: &str) -> Option<String> {
        let tokens = self.tokens.lock().await;
        tokens
            .get(key)
            .filter(|t| t.expires_at - EXPIRY_SKEW_SECS > now_ts())
            .map(|t| t.access_token.clone())
    }

    async fn store(&self, key: String, access_token: String, expires_in: Option<i64>) {
        let expires_at = now_ts() + expires_in.unwrap_or(3600);
        self.tokens.lock().await.insert(
            key,
            CachedToken {
                access_token,
                expires_at,
            },
        );
    }

    /// Drops a token the provider rejected so the next call refreshes.
    pub async fn invalidate(&self, key: &str) {
        self.tokens.lock().await.remove(key);
    }

    /// Google access token from the refresh token stored for `address`.
    pub async fn google_token(&self, address: &str) -> AppResult<String> {
        let key = format!("google:{address}");
        if let Some(token) = self.cached(&key).await {
            return Ok(token);
        }

        let client_id = env::var("GOOGLE_CLIENT_ID")
            .map_err(|_| AppError::SourceConfigInvalid("GOOGLE_CLIENT_ID missing".into()))?;
        let client_secret = env::var("GOOGLE_CLIENT_SECRET")
            .map_err(|_| AppError::SourceConfigInvalid("GOOGLE_CLIENT_SECRET missing".into()))?;
        let stored = stored_secret(GOOGLE_SERVICE_NAME, address)?.ok_or_else(|| {
            AppError::SourceConfigInvalid(format!("no Google refresh token stored for {address}"))
        })?;
        let refresh: StoredToken = serde_json::from_str(&stored).map_err(|e| {
            AppError::SourceConfigInvalid(format!("stored Google token for {address}: {e}"))
        })?;

        let client = build_client(&client_id, &client_secret, GOOGLE_AUTH_URL, GOOGLE_TOKEN_URL)?;
        let res = client
            .exchange_refresh_token(&RefreshToken::new(refresh.refresh_token))
            .request_async(async_http_client)
            .await
            .map_err(|e| classify_token_error("Google", e))?;

        let access_token = res.access_token().secret().to_string();
        let expires_in = res.expires_in().map(|d| d.as_secs() as i64);
        debug!(address = %address, "Google access token refreshed");
        self.store(key, access_token.clone(), expires_in).await;
        Ok(access_token)
    }

    /// Microsoft Graph app-only token (client credentials grant).
    pub async fn microsoft_token(
        &self,
        tenant_id: &str,
        client_id: &str,
        client_secret: &str,
    ) -> AppResult<String> {
        let key = format!("microsoft:{tenant_id}:{client_id}");
        if let Some(token) = self.cached(&key).await {
            return Ok(token);
        }

        let auth_url = format!("https://login.microsoftonline.com/{tenant_id}/oauth2/v2.0/authorize");
        let token_url = format!("https://login.microsoftonline.com/{tenant_id}/oauth2/v2.0/token");
        let client = build_client(client_id, client_secret, &auth_url, &token_url)?;
        let res = client
            .exchange_client_credentials()
            .add_scope(Scope::new(GRAPH_SCOPE.to_string()))
            .request_async(async_http_client)
            .await
            .map_err(|e| classify_token_error("Microsoft", e))?;

        let access_token = res.access_token().secret().to_string();
        let expires_in = res.expires_in().map(|d| d.as_secs() as i64);
        debug!(tenant = %tenant_id, "Graph access token acquired");
        self.store(key, access_token.clone(), expires_in).await;
        Ok(access_token)
    }
}

fn build_client(
    client_id: &str,
    client_secret: &str,
    auth_url: &str,
    token_url: &str,
) -> AppResult<BasicClient> {
    let auth_url = AuthUrl::new(auth_url.to_string())
        .map_err(|e| AppError::SourceConfigInvalid(format!("invalid auth url: {e}")))?;
    let token_url = TokenUrl::new(token_url.to_string())
        .map_err(|e| AppError::SourceConfigInvalid(format!("invalid token url: {e}")))?;
    Ok(BasicClient::new(
        ClientId::new(client_id.to_string()),
        Some(ClientSecret::new(client_secret.to_string())),
        auth_url,
        Some(token_url),
    )
    .set_auth_type(oauth2::AuthType::RequestBody))
}

/// The token endpoint answering with an OAuth error means the grant or the
/// client is bad; anything else is a transport problem.
fn classify_token_error<E: std::error::Error + 'static>(
    provider: &str,
    err: RequestTokenError<E, BasicErrorResponse>,
) -> AppError {
    match err {
        RequestTokenError::ServerResponse(resp) => AppError::SourceConfigInvalid(format!(
            "{provider} token endpoint rejected credentials: {:?}",
            resp.error()
        )),
        other => AppError::SourceUnavailable(format!("{provider} token request failed: {other}")),
    }
}

/// Reads a secret from the OS keyring. A missing entry is `Ok(None)`; an
/// unreachable keyring is transient.
pub fn stored_secret(service: &str, key: &str) -> AppResult<Option<String>> {
    let entry = keyring::Entry::new(service, key)
        .map_err(|e| AppError::SourceConfigInvalid(format!("keyring entry error: {e}")))?;
    match entry.get_password() {
        Ok(secret) => Ok(Some(secret)),
        Err(keyring::Error::NoEntry) => Ok(None),
        Err(e) => {
            warn!(service = %service, "Keyring unavailable: {e}");
            Err(AppError::SourceUnavailable(format!("keyring read: {e}")))
        }
    }
}
