//! Bearer token acquisition and caching.
//!
//! The [`TokenManager`] logs in with the client's [`Credentials`], caches the
//! resulting token with its expiry, and refreshes it shortly before it expires.
//! Concurrent callers that find the token stale wait on a single refresh instead
//! of each logging in.

use crate::{Context, Error, Result};
use chrono::{DateTime, FixedOffset};
use http::{Method, StatusCode};
use serde::Deserialize;
use std::fmt;
use std::time::{Duration, SystemTime};
use tokio::sync::{Mutex, RwLock};
use url::Url;

/// Default path of the login endpoint, relative to the base URL.
pub const DEFAULT_LOGIN_PATH: &str = "/api/v1/authentication/login";

/// Tokens expiring within this margin are treated as expired.
pub const DEFAULT_REFRESH_MARGIN: Duration = Duration::from_secs(60);

/// Client identifier and secret key used to log in.
#[derive(Clone)]
pub struct Credentials {
    client_id: String,
    api_key: String,
}

impl Credentials {
    pub fn new(client_id: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            api_key: api_key.into(),
        }
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("client_id", &self.client_id)
            .field("api_key", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Deserialize)]
struct LoginResponse {
    token: String,
    expires_at: String,
}

#[derive(Debug, Clone)]
struct CachedToken {
    token: String,
    expires_at: SystemTime,
}

impl CachedToken {
    fn is_fresh(&self, margin: Duration) -> bool {
        SystemTime::now() + margin < self.expires_at
    }
}

/// Owns the bearer token for one client.
pub struct TokenManager {
    http_client: reqwest::Client,
    login_url: Url,
    credentials: Credentials,
    refresh_margin: Duration,
    cache: RwLock<Option<CachedToken>>,
    refresh_lock: Mutex<()>,
}

impl TokenManager {
    pub fn new(
        http_client: reqwest::Client,
        login_url: Url,
        credentials: Credentials,
        refresh_margin: Duration,
    ) -> Self {
        Self {
            http_client,
            login_url,
            credentials,
            refresh_margin,
            cache: RwLock::new(None),
            refresh_lock: Mutex::new(()),
        }
    }

    pub fn login_url(&self) -> &Url {
        &self.login_url
    }

    /// Returns a token that stays valid past the refresh margin, logging in if needed.
    pub async fn ensure_valid_token(&self, ctx: &Context) -> Result<String> {
        if let Some(token) = self.fresh_token().await {
            return Ok(token);
        }

        let _guard = ctx.run(self.refresh_lock.lock()).await?;

        // Another caller may have refreshed while we waited for the lock.
        if let Some(token) = self.fresh_token().await {
            return Ok(token);
        }

        self.fetch_token(ctx).await
    }

    /// Logs in unconditionally and replaces the cached token.
    pub async fn fetch_token(&self, ctx: &Context) -> Result<String> {
        let url = self.login_url.to_string();
        tracing::debug!(url = %url, client_id = %self.credentials.client_id, "Requesting access token");

        let request = self
            .http_client
            .post(self.login_url.clone())
            .header("x-client-id", &self.credentials.client_id)
            .header("x-api-key", &self.credentials.api_key)
            .send();

        let response = ctx
            .run(request)
            .await?
            .map_err(|e| self.auth_error(e.status(), e.to_string()))?;

        let status = response.status();
        let body = ctx
            .run(response.bytes())
            .await?
            .map_err(|e| self.auth_error(Some(status), e.to_string()))?;

        if !status.is_success() {
            let error = crate::ApiError::from_body(status, &body);
            tracing::warn!(status = status.as_u16(), error = %error, "Token request rejected");
            return Err(self.auth_error(Some(status), error.to_string()));
        }

        let login: LoginResponse = serde_json::from_slice(&body).map_err(|e| {
            self.auth_error(Some(status), format!("invalid login response: {}", e))
        })?;
        let expires_at = parse_expiry(&login.expires_at).ok_or_else(|| {
            self.auth_error(
                Some(status),
                format!("invalid expires_at timestamp: {}", login.expires_at),
            )
        })?;

        let token = login.token;
        *self.cache.write().await = Some(CachedToken {
            token: token.clone(),
            expires_at,
        });

        tracing::info!(
            expires_in_secs = expires_at
                .duration_since(SystemTime::now())
                .unwrap_or_default()
                .as_secs(),
            "Access token refreshed"
        );
        Ok(token)
    }

    /// Drops the cached token so the next call logs in again.
    pub async fn invalidate(&self) {
        *self.cache.write().await = None;
    }

    /// Returns the cached token's expiry, if a token is cached.
    pub async fn expires_at(&self) -> Option<SystemTime> {
        self.cache.read().await.as_ref().map(|cached| cached.expires_at)
    }

    async fn fresh_token(&self) -> Option<String> {
        let cache = self.cache.read().await;
        cache
            .as_ref()
            .filter(|cached| cached.is_fresh(self.refresh_margin))
            .map(|cached| cached.token.clone())
    }

    fn auth_error(&self, status: Option<StatusCode>, message: String) -> Error {
        Error::Authentication {
            method: Method::POST,
            url: self.login_url.to_string(),
            status,
            message,
        }
    }
}

impl fmt::Debug for TokenManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenManager")
            .field("login_url", &self.login_url.as_str())
            .field("credentials", &self.credentials)
            .field("refresh_margin", &self.refresh_margin)
            .finish_non_exhaustive()
    }
}

/// Parses an RFC 3339 timestamp, also accepting offsets written without a colon.
fn parse_expiry(value: &str) -> Option<SystemTime> {
    DateTime::parse_from_rfc3339(value)
        .or_else(|_| DateTime::<FixedOffset>::parse_from_str(value, "%Y-%m-%dT%H:%M:%S%.f%z"))
        .ok()
        .map(SystemTime::from)
}
