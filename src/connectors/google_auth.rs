use std::path::Path;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::{GmailConfig, DEFAULT_GOOGLE_TOKEN_URL};
use crate::connectors::{retry_after, with_retry, ConnectorError, RetryPolicy};

const SERVICE: &str = "google oauth";
const CACHE_SKEW_SECONDS: i64 = 60;
const ASSERTION_LIFETIME_SECONDS: i64 = 3600;
const JWT_BEARER_GRANT: &str = "urn:ietf:params:oauth:grant-type:jwt-bearer";

pub const SHEETS_SCOPE: &str = "https://www.googleapis.com/auth/spreadsheets";

#[derive(Debug, Clone, Serialize, Deserialize)]
struct OAuthTokenResponse {
    access_token: String,
    token_type: Option<String>,
    expires_in: u64,
    scope: Option<String>,
}

#[derive(Debug, Clone)]
struct CachedAccessToken {
    access_token: String,
    expires_at: DateTime<Utc>,
}

impl CachedAccessToken {
    fn is_expired(&self) -> bool {
        self.expires_at <= Utc::now()
    }
}

/// Something that hands out bearer tokens for Google APIs.
#[async_trait(?Send)]
pub trait TokenSource {
    async fn access_token(&self) -> Result<String, ConnectorError>;

    /// Drops the cached token so the next call fetches a fresh one.
    fn invalidate(&self);
}

/// In-memory single-token cache shared by both grant flows.
#[derive(Debug, Default)]
struct TokenCache {
    slot: Mutex<Option<CachedAccessToken>>,
}

impl TokenCache {
    fn get(&self) -> Option<String> {
        let slot = self.slot.lock().ok()?;
        slot.as_ref()
            .filter(|token| !token.is_expired())
            .map(|token| token.access_token.clone())
    }

    fn put(&self, token: CachedAccessToken) {
        if let Ok(mut slot) = self.slot.lock() {
            *slot = Some(token);
        }
    }

    fn clear(&self) {
        if let Ok(mut slot) = self.slot.lock() {
            *slot = None;
        }
    }
}

/// POSTs a token request form. 400/401/403 mean the grant itself was refused.
async fn exchange_token(
    client: &Client,
    token_url: &str,
    form: &[(&str, &str)],
) -> Result<CachedAccessToken, ConnectorError> {
    let response = client
        .post(token_url)
        .form(form)
        .send()
        .await
        .map_err(|source| ConnectorError::transport(SERVICE, source))?;

    let status = response.status();
    let wait = retry_after(response.headers());
    let body = response
        .text()
        .await
        .map_err(|source| ConnectorError::transport(SERVICE, source))?;

    if matches!(
        status,
        StatusCode::BAD_REQUEST | StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN
    ) {
        return Err(ConnectorError::credentials_rejected(SERVICE, status, &body));
    }
    if !status.is_success() {
        return Err(ConnectorError::from_status(SERVICE, status, &body, wait));
    }

    let payload: OAuthTokenResponse =
        serde_json::from_str(&body).map_err(|e| ConnectorError::decode(SERVICE, e))?;
    let expires_at = Utc::now()
        + Duration::seconds((payload.expires_in as i64).saturating_sub(CACHE_SKEW_SECONDS));

    Ok(CachedAccessToken {
        access_token: payload.access_token,
        expires_at,
    })
}

/// Installed-app OAuth: trades a long-lived refresh token for access tokens.
#[derive(Debug)]
pub struct RefreshTokenAuth {
    client: Client,
    credentials: GmailConfig,
    retry: RetryPolicy,
    cache: TokenCache,
}

impl RefreshTokenAuth {
    pub fn new(client: Client, credentials: GmailConfig, retry: RetryPolicy) -> Self {
        Self {
            client,
            credentials,
            retry,
            cache: TokenCache::default(),
        }
    }
}

#[async_trait(?Send)]
impl TokenSource for RefreshTokenAuth {
    async fn access_token(&self) -> Result<String, ConnectorError> {
        if let Some(token) = self.cache.get() {
            return Ok(token);
        }

        let credentials = &self.credentials;
        let fresh = with_retry(&self.retry, "gmail token refresh", || async {
            exchange_token(
                &self.client,
                &credentials.token_url,
                &[
                    ("client_id", credentials.client_id.as_str()),
                    ("client_secret", credentials.client_secret.as_str()),
                    ("refresh_token", credentials.refresh_token.as_str()),
                    ("grant_type", "refresh_token"),
                ],
            )
            .await
        })
        .await?;

        debug!(expires_at = %fresh.expires_at, "refreshed gmail access token");
        let token = fresh.access_token.clone();
        self.cache.put(fresh);
        Ok(token)
    }

    fn invalidate(&self) {
        self.cache.clear();
    }
}

/// Fields of a service-account JSON key file that the JWT grant needs.
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceAccountKey {
    pub client_email: String,
    pub private_key: String,
    #[serde(default = "default_token_uri")]
    pub token_uri: String,
}

fn default_token_uri() -> String {
    DEFAULT_GOOGLE_TOKEN_URL.to_string()
}

impl ServiceAccountKey {
    pub fn from_file(path: &Path) -> Result<Self, ConnectorError> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            ConnectorError::Config(format!(
                "read service account key {}: {e}",
                path.display()
            ))
        })?;
        Self::from_json(&raw)
    }

    pub fn from_json(raw: &str) -> Result<Self, ConnectorError> {
        serde_json::from_str(raw)
            .map_err(|e| ConnectorError::Config(format!("parse service account key: {e}")))
    }
}

#[derive(Debug, Serialize)]
struct JwtClaims<'a> {
    iss: &'a str,
    scope: &'a str,
    aud: &'a str,
    iat: i64,
    exp: i64,
}

/// Service-account OAuth: signs an RS256 assertion and exchanges it.
pub struct ServiceAccountAuth {
    client: Client,
    key: ServiceAccountKey,
    encoding_key: EncodingKey,
    scope: String,
    retry: RetryPolicy,
    cache: TokenCache,
}

impl ServiceAccountAuth {
    pub fn new(
        client: Client,
        key: ServiceAccountKey,
        scope: impl Into<String>,
        retry: RetryPolicy,
    ) -> Result<Self, ConnectorError> {
        let encoding_key = EncodingKey::from_rsa_pem(key.private_key.as_bytes()).map_err(|e| {
            ConnectorError::Config(format!("service account private key is not RSA PEM: {e}"))
        })?;

        Ok(Self {
            client,
            key,
            encoding_key,
            scope: scope.into(),
            retry,
            cache: TokenCache::default(),
        })
    }

    pub fn client_email(&self) -> &str {
        &self.key.client_email
    }

    fn signed_assertion(&self, now: DateTime<Utc>) -> Result<String, ConnectorError> {
        let claims = JwtClaims {
            iss: &self.key.client_email,
            scope: &self.scope,
            aud: &self.key.token_uri,
            iat: now.timestamp(),
            exp: now.timestamp() + ASSERTION_LIFETIME_SECONDS,
        };
        encode(&Header::new(Algorithm::RS256), &claims, &self.encoding_key)
            .map_err(|e| ConnectorError::Config(format!("sign service account assertion: {e}")))
    }
}

#[async_trait(?Send)]
impl TokenSource for ServiceAccountAuth {
    async fn access_token(&self) -> Result<String, ConnectorError> {
        if let Some(token) = self.cache.get() {
            return Ok(token);
        }

        let fresh = with_retry(&self.retry, "service account token exchange", || async {
            let assertion = self.signed_assertion(Utc::now())?;
            exchange_token(
                &self.client,
                &self.key.token_uri,
                &[("grant_type", JWT_BEARER_GRANT), ("assertion", assertion.as_str())],
            )
            .await
        })
        .await?;

        debug!(
            client_email = %self.key.client_email,
            expires_at = %fresh.expires_at,
            "obtained service account access token"
        );
        let token = fresh.access_token.clone();
        self.cache.put(fresh);
        Ok(token)
    }

    fn invalidate(&self) {
        self.cache.clear();
    }
}
