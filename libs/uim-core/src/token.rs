//! Bearer tokens for the client-credentials flow.
//!
//! [`TokenCache`] serves the current token lock-free and refreshes it under
//! a single async mutex, so concurrent callers on an empty or expired cache
//! trigger one remote fetch between them.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use arc_swap::ArcSwapOption;
use async_trait::async_trait;
use bytes::Bytes;
use http::header::{ACCEPT, CONTENT_TYPE, USER_AGENT};
use http::{Method, Uri};
use http_body_util::Full;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};

use crate::config::{Credentials, DEFAULT_USER_AGENT};
use crate::error::{ClientError, ClientErrorCode, UimError};
use crate::request::JSON;
use crate::security::{ERROR_BODY_PREVIEW_LIMIT, body_preview};
use crate::transport::{TimeoutPolicy, Transport, failure_error};

/// Tokens are treated as expired this long before the remote expiry.
pub const EXPIRY_MARGIN: Duration = Duration::from_secs(300);

/// Token as returned by a [`TokenSource`].
pub struct FetchedToken {
    pub access_token: SecretString,
    /// Remote lifetime, before [`EXPIRY_MARGIN`] is applied
    pub expires_in: Duration,
}

impl fmt::Debug for FetchedToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FetchedToken")
            .field("expires_in", &self.expires_in)
            .finish_non_exhaustive()
    }
}

/// Remote issuer of bearer tokens.
#[async_trait]
pub trait TokenSource: Send + Sync {
    /// Fetch a fresh token.
    ///
    /// # Errors
    ///
    /// `SDK.AuthenticationFailed` when the issuer rejects the credentials;
    /// transport failures as their client error kinds.
    async fn fetch_token(&self) -> Result<FetchedToken, UimError>;
}

struct CachedToken {
    token: SecretString,
    expires_at: Instant,
}

/// Double-checked bearer-token cache.
pub struct TokenCache {
    source: Arc<dyn TokenSource>,
    current: ArcSwapOption<CachedToken>,
    refresh: tokio::sync::Mutex<()>,
}

impl fmt::Debug for TokenCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenCache")
            .field("cached", &self.current.load().is_some())
            .finish_non_exhaustive()
    }
}

impl TokenCache {
    #[must_use]
    pub fn new(source: Arc<dyn TokenSource>) -> Self {
        Self {
            source,
            current: ArcSwapOption::empty(),
            refresh: tokio::sync::Mutex::new(()),
        }
    }

    /// Current token, fetching a new one when none is cached or the cached
    /// one is inside the expiry margin.
    ///
    /// # Errors
    ///
    /// Propagates the [`TokenSource`] failure; nothing is cached then.
    pub async fn get_token(&self) -> Result<SecretString, UimError> {
        if let Some(token) = self.cached() {
            return Ok(token);
        }

        let _refresh = self.refresh.lock().await;
        // another caller may have refreshed while we waited
        if let Some(token) = self.cached() {
            return Ok(token);
        }

        let fetched = self.source.fetch_token().await?;
        let expires_at = Instant::now() + fetched.expires_in.saturating_sub(EXPIRY_MARGIN);
        self.current.store(Some(Arc::new(CachedToken {
            token: fetched.access_token.clone(),
            expires_at,
        })));
        tracing::debug!(
            expires_in_secs = fetched.expires_in.as_secs(),
            "bearer token refreshed"
        );
        Ok(fetched.access_token)
    }

    /// Drop the cached token; the next call fetches a new one.
    pub fn invalidate(&self) {
        self.current.store(None);
    }

    fn cached(&self) -> Option<SecretString> {
        let current = self.current.load();
        current
            .as_ref()
            .filter(|cached| Instant::now() < cached.expires_at)
            .map(|cached| cached.token.clone())
    }
}

#[derive(Serialize)]
struct TokenRequest<'a> {
    client_id: &'a str,
    client_secret: &'a str,
    audience: &'a str,
    grant_type: &'static str,
}

/// Deserialize-only so the token never ends up serialized into a log.
#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    /// Missing lifetime means the token is not cached
    #[serde(default)]
    expires_in: u64,
}

/// Exchanges client credentials for a token at the configured endpoint.
pub struct ClientCredentialsSource {
    endpoint: Uri,
    credentials: Credentials,
    transport: Transport,
    timeouts: TimeoutPolicy,
    max_body_size: usize,
}

impl fmt::Debug for ClientCredentialsSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientCredentialsSource")
            .field("endpoint", &self.endpoint)
            .field("client_id", &self.credentials.client_id)
            .finish_non_exhaustive()
    }
}

impl ClientCredentialsSource {
    pub(crate) fn new(
        endpoint: Uri,
        credentials: Credentials,
        transport: Transport,
        timeouts: TimeoutPolicy,
        max_body_size: usize,
    ) -> Self {
        Self {
            endpoint,
            credentials,
            transport,
            timeouts,
            max_body_size,
        }
    }
}

#[async_trait]
impl TokenSource for ClientCredentialsSource {
    async fn fetch_token(&self) -> Result<FetchedToken, UimError> {
        let body = serde_json::to_vec(&TokenRequest {
            client_id: &self.credentials.client_id,
            client_secret: self.credentials.client_secret.expose_secret(),
            audience: &self.credentials.audience,
            grant_type: "client_credentials",
        })
        .map_err(UimError::json_marshal)?;

        let request = http::Request::builder()
            .method(Method::POST)
            .uri(self.endpoint.clone())
            .header(CONTENT_TYPE, JSON)
            .header(ACCEPT, JSON)
            .header(USER_AGENT, DEFAULT_USER_AGENT.as_str())
            .body(Full::new(Bytes::from(body)))
            .map_err(|e| {
                UimError::client_with_source(
                    ClientErrorCode::InvalidRequest,
                    "failed to build token request",
                    e,
                )
            })?;

        let (response, _) = self
            .transport
            .round_trip(request, self.timeouts.read, self.max_body_size)
            .await
            .map_err(|e| failure_error(e, 1, self.timeouts))?;

        if !response.is_success() {
            tracing::warn!(
                status = response.status().as_u16(),
                endpoint = %self.endpoint,
                "token endpoint rejected client credentials"
            );
            return Err(UimError::client(
                ClientErrorCode::AuthenticationFailed,
                format!(
                    "Authentication failed: HTTP {}: {}",
                    response.status(),
                    body_preview(response.body(), ERROR_BODY_PREVIEW_LIMIT)
                ),
            ));
        }

        match serde_json::from_slice::<TokenResponse>(response.body()) {
            Ok(token) => Ok(FetchedToken {
                access_token: SecretString::from(token.access_token),
                expires_in: Duration::from_secs(token.expires_in),
            }),
            Err(e) => Err(ClientError::new(
                ClientErrorCode::JsonUnmarshal,
                format!("Failed to unmarshal token response: {e}"),
            )
            .with_source(e)
            .with_response(response)
            .into()),
        }
    }
}
