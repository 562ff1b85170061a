use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};
use reqwest::{Client, Response, StatusCode};
use serde::{de::DeserializeOwned, Deserialize};
use thiserror::Error;
use url::Url;

/// How long before expiry a cached app token is considered stale.
const EXPIRY_MARGIN_SECS: i64 = 60;

/// Client for the Twitch OAuth token endpoint.
///
/// The engine only reads public stream data, so the client-credentials
/// grant is the whole surface; user-token flows live in the admin service.
#[derive(Clone)]
pub struct TwitchOAuthClient {
    http: Client,
    base_url: Url,
    client_id: String,
    client_secret: String,
}

impl TwitchOAuthClient {
    /// Creates a new client with the provided HTTP instance and configuration.
    pub fn new(
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
        base_url: Url,
        http: Client,
    ) -> Self {
        Self {
            http,
            base_url,
            client_id: client_id.into(),
            client_secret: client_secret.into(),
        }
    }

    /// Requests a fresh app access token via the client-credentials grant.
    pub async fn fetch_app_token(&self) -> Result<AppAccessToken, OAuthError> {
        let url = self.base_url.join("token")?;
        let response = self
            .http
            .post(url)
            .form(&[
                ("client_id", self.client_id.as_str()),
                ("client_secret", self.client_secret.as_str()),
                ("grant_type", "client_credentials"),
            ])
            .send()
            .await?;

        parse_json(response).await
    }
}

/// App access token response returned by Twitch.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct AppAccessToken {
    pub access_token: String,
    pub expires_in: u64,
    pub token_type: String,
}

impl AppAccessToken {
    /// Computes the expiration timestamp relative to the provided instant.
    pub fn expires_at(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now + Duration::seconds(self.expires_in as i64)
    }
}

/// Caches one app access token, refreshing it shortly before expiry.
pub struct AppTokenCache {
    client: TwitchOAuthClient,
    cached: Mutex<Option<CachedToken>>,
}

#[derive(Clone)]
struct CachedToken {
    access_token: String,
    expires_at: DateTime<Utc>,
}

impl AppTokenCache {
    pub fn new(client: TwitchOAuthClient) -> Self {
        Self {
            client,
            cached: Mutex::new(None),
        }
    }

    /// Returns a usable bearer token, fetching a new one when the cached
    /// token is absent or within the expiry margin.
    pub async fn bearer(&self, now: DateTime<Utc>) -> Result<String, OAuthError> {
        {
            let cached = self.cached.lock().expect("token cache poisoned");
            if let Some(token) = cached.as_ref() {
                if token.expires_at - Duration::seconds(EXPIRY_MARGIN_SECS) > now {
                    return Ok(token.access_token.clone());
                }
            }
        }

        let fresh = self.client.fetch_app_token().await?;
        let token = CachedToken {
            access_token: fresh.access_token.clone(),
            expires_at: fresh.expires_at(now),
        };
        *self.cached.lock().expect("token cache poisoned") = Some(token);
        Ok(fresh.access_token)
    }
}

/// Errors that can occur during OAuth interactions.
#[derive(Debug, Error)]
pub enum OAuthError {
    #[error("failed to build url: {0}")]
    Url(#[from] url::ParseError),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("unexpected status {status}: {body}")]
    Status { status: StatusCode, body: String },
}

async fn parse_json<T>(response: Response) -> Result<T, OAuthError>
where
    T: DeserializeOwned,
{
    let status = response.status();
    if !status.is_success() {
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| String::from("<unavailable>"));
        return Err(OAuthError::Status { status, body });
    }

    Ok(response.json().await?)
}
