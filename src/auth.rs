// Credential cache - bearer tokens for forwarded requests
//
// Forwarded (non-tunnel) requests get an `Authorization: Bearer <token>`
// header injected. The token comes from an OAuth2 client-credentials grant
// and is cached until close to expiry; tunneled traffic never touches this
// (the client carries its own credential end-to-end).
//
// Concurrency note: the lock is never held across the fetch await, so
// concurrent callers during a refresh may each trigger their own fetch.
// That race is tolerated - the token endpoint is idempotent and cheap next
// to proxy traffic - and the cache is always replaced wholesale.

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Duration, Utc};
use futures::future::BoxFuture;
use serde::Deserialize;
use std::sync::Mutex;

/// Refresh this long before actual expiry so in-flight requests never carry
/// a token that dies mid-call
const REFRESH_BUFFER_SECS: i64 = 60;

/// Fallback lifetime when the token endpoint omits `expires_in`
const DEFAULT_EXPIRES_IN_SECS: i64 = 3600;

/// A fetched bearer token and the instant it stops being valid
#[derive(Debug, Clone)]
pub struct CachedToken {
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

/// Seam between the cache logic and the token endpoint, so tests can count
/// fetches without a network
pub trait TokenFetcher: Send + Sync {
    fn fetch(&self) -> BoxFuture<'_, Result<CachedToken>>;
}

/// OAuth2 client-credentials grant against a configured token endpoint
pub struct OAuthClientCredentials {
    http: reqwest::Client,
    token_url: String,
    client_id: String,
    client_secret: String,
}

impl OAuthClientCredentials {
    pub fn new(
        http: reqwest::Client,
        token_url: String,
        client_id: String,
        client_secret: String,
    ) -> Self {
        Self {
            http,
            token_url,
            client_id,
            client_secret,
        }
    }
}

#[derive(Deserialize)]
struct TokenEndpointResponse {
    access_token: String,
    expires_in: Option<i64>,
}

impl TokenFetcher for OAuthClientCredentials {
    fn fetch(&self) -> BoxFuture<'_, Result<CachedToken>> {
        Box::pin(async move {
            let params = [
                ("grant_type", "client_credentials"),
                ("client_id", self.client_id.as_str()),
                ("client_secret", self.client_secret.as_str()),
            ];

            let response = self
                .http
                .post(&self.token_url)
                .form(&params)
                .send()
                .await
                .context("token endpoint request failed")?;

            let status = response.status();
            if !status.is_success() {
                return Err(anyhow!("token endpoint returned {}", status));
            }

            let body: TokenEndpointResponse = response
                .json()
                .await
                .context("token endpoint returned unparseable body")?;

            let expires_in = body.expires_in.unwrap_or(DEFAULT_EXPIRES_IN_SECS);
            Ok(CachedToken {
                token: body.access_token,
                expires_at: Utc::now() + Duration::seconds(expires_in),
            })
        })
    }
}

/// Shared bearer-token cache for all forwarded requests of one server run
pub struct CredentialCache {
    cached: Mutex<Option<CachedToken>>,
    fetcher: Box<dyn TokenFetcher>,
}

impl CredentialCache {
    pub fn new(fetcher: Box<dyn TokenFetcher>) -> Self {
        Self {
            cached: Mutex::new(None),
            fetcher,
        }
    }

    /// Return a bearer token, fetching a fresh one only when the cached token
    /// is missing or within the refresh buffer of its expiry
    pub async fn token(&self) -> Result<String> {
        if let Some(token) = self.cached_if_fresh(Utc::now()) {
            return Ok(token);
        }

        tracing::debug!("credential cache stale, fetching fresh token");
        let fresh = self.fetcher.fetch().await?;
        let token = fresh.token.clone();
        *self.cached.lock().unwrap() = Some(fresh);
        Ok(token)
    }

    /// Drop the cached token so the next start always refreshes
    pub fn clear(&self) {
        *self.cached.lock().unwrap() = None;
    }

    fn cached_if_fresh(&self, now: DateTime<Utc>) -> Option<String> {
        let guard = self.cached.lock().unwrap();
        guard
            .as_ref()
            .filter(|t| t.expires_at - now > Duration::seconds(REFRESH_BUFFER_SECS))
            .map(|t| t.token.clone())
    }

    #[cfg(test)]
    fn seed(&self, token: CachedToken) {
        *self.cached.lock().unwrap() = Some(token);
    }
}
