//! Credential headers and token refresh for external endpoints.

use crate::errors::AuthError;
use async_trait::async_trait;
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Tokens are treated as expired this long before the provider says they are.
pub const EXPIRY_SAFETY_MARGIN: Duration = Duration::from_secs(60);

/// Authentication scheme.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthScheme {
    /// `Authorization: Basic base64(username:password)`.
    Basic,
    /// `Authorization: Bearer <token>`, static or refreshed.
    #[default]
    Bearer,
    /// `Authorization: Bearer <token>` obtained from a token endpoint.
    OAuth2,
}

/// Credential material. Which fields are required depends on the scheme.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthCredentials {
    /// Basic auth user.
    #[serde(default)]
    pub username: Option<String>,
    /// Basic auth password.
    #[serde(default)]
    pub password: Option<String>,
    /// Static bearer token.
    #[serde(default)]
    pub token: Option<String>,
    /// OAuth2 client id.
    #[serde(default)]
    pub client_id: Option<String>,
    /// OAuth2 client secret.
    #[serde(default)]
    pub client_secret: Option<String>,
    /// OAuth2 token endpoint.
    #[serde(default)]
    pub token_url: Option<String>,
    /// OAuth2 scope.
    #[serde(default)]
    pub scope: Option<String>,
}

/// Authentication configuration for an external endpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthConfig {
    /// The scheme.
    #[serde(rename = "type", default)]
    pub scheme: AuthScheme,
    /// Credential material.
    #[serde(default)]
    pub credentials: AuthCredentials,
    /// Initial refresh token.
    #[serde(default)]
    pub refresh_token: Option<String>,
    /// Refresh once and replay the request after a 401.
    #[serde(default)]
    pub retry_on_auth_failure: bool,
}

impl AuthConfig {
    /// Basic auth with the given user and password.
    #[must_use]
    pub fn basic(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            scheme: AuthScheme::Basic,
            credentials: AuthCredentials {
                username: Some(username.into()),
                password: Some(password.into()),
                ..AuthCredentials::default()
            },
            ..Self::default()
        }
    }

    /// Static bearer token.
    #[must_use]
    pub fn bearer(token: impl Into<String>) -> Self {
        Self {
            scheme: AuthScheme::Bearer,
            credentials: AuthCredentials {
                token: Some(token.into()),
                ..AuthCredentials::default()
            },
            ..Self::default()
        }
    }

    /// OAuth2 client-credentials against a token endpoint.
    #[must_use]
    pub fn oauth2(
        token_url: impl Into<String>,
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
    ) -> Self {
        Self {
            scheme: AuthScheme::OAuth2,
            credentials: AuthCredentials {
                client_id: Some(client_id.into()),
                client_secret: Some(client_secret.into()),
                token_url: Some(token_url.into()),
                ..AuthCredentials::default()
            },
            ..Self::default()
        }
    }

    /// Sets the initial refresh token.
    #[must_use]
    pub fn with_refresh_token(mut self, token: impl Into<String>) -> Self {
        self.refresh_token = Some(token.into());
        self
    }

    /// Enables the single refresh-and-replay after a 401.
    #[must_use]
    pub fn with_retry_on_auth_failure(mut self, retry: bool) -> Self {
        self.retry_on_auth_failure = retry;
        self
    }
}

/// A token issued by a [`TokenProvider`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenGrant {
    /// The access token.
    pub access_token: String,
    /// Lifetime in seconds, if the provider states one.
    #[serde(default)]
    pub expires_in: Option<u64>,
    /// Replacement refresh token, if rotated.
    #[serde(default)]
    pub refresh_token: Option<String>,
}

impl TokenGrant {
    /// Creates a grant without expiry.
    #[must_use]
    pub fn new(access_token: impl Into<String>) -> Self {
        Self {
            access_token: access_token.into(),
            expires_in: None,
            refresh_token: None,
        }
    }

    /// Sets the lifetime in seconds.
    #[must_use]
    pub fn expires_in(mut self, secs: u64) -> Self {
        self.expires_in = Some(secs);
        self
    }
}

/// Source of access tokens.
#[async_trait]
pub trait TokenProvider: Send + Sync {
    /// Obtains a fresh token, using the refresh token when one is held.
    async fn fetch_token(&self, refresh_token: Option<&str>) -> Result<TokenGrant, AuthError>;
}

/// Token provider speaking the OAuth2 token endpoint protocol.
///
/// Uses the `refresh_token` grant when a refresh token is held and the
/// `client_credentials` grant otherwise.
#[cfg(feature = "http")]
#[derive(Debug, Clone)]
pub struct OAuth2TokenProvider {
    client: reqwest::Client,
    token_url: String,
    client_id: String,
    client_secret: String,
    scope: Option<String>,
}

#[cfg(feature = "http")]
impl OAuth2TokenProvider {
    /// Creates a provider for the given endpoint and client.
    #[must_use]
    pub fn new(
        token_url: impl Into<String>,
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
    ) -> Self {
        Self {
            client: reqwest::Client::new(),
            token_url: token_url.into(),
            client_id: client_id.into(),
            client_secret: client_secret.into(),
            scope: None,
        }
    }

    /// Builds a provider from OAuth2 credentials.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::MissingCredentials`] if the token URL or client
    /// credentials are absent.
    pub fn from_credentials(credentials: &AuthCredentials) -> Result<Self, AuthError> {
        let token_url = credentials
            .token_url
            .clone()
            .ok_or_else(|| AuthError::MissingCredentials("tokenUrl".to_string()))?;
        let client_id = credentials
            .client_id
            .clone()
            .ok_or_else(|| AuthError::MissingCredentials("clientId".to_string()))?;
        let client_secret = credentials
            .client_secret
            .clone()
            .ok_or_else(|| AuthError::MissingCredentials("clientSecret".to_string()))?;
        let mut provider = Self::new(token_url, client_id, client_secret);
        provider.scope = credentials.scope.clone();
        Ok(provider)
    }

    /// Sets the requested scope.
    #[must_use]
    pub fn with_scope(mut self, scope: impl Into<String>) -> Self {
        self.scope = Some(scope.into());
        self
    }
}

#[cfg(feature = "http")]
#[async_trait]
impl TokenProvider for OAuth2TokenProvider {
    async fn fetch_token(&self, refresh_token: Option<&str>) -> Result<TokenGrant, AuthError> {
        let mut form: Vec<(&str, &str)> = vec![
            ("client_id", self.client_id.as_str()),
            ("client_secret", self.client_secret.as_str()),
        ];
        match refresh_token {
            Some(token) => {
                form.push(("grant_type", "refresh_token"));
                form.push(("refresh_token", token));
            }
            None => form.push(("grant_type", "client_credentials")),
        }
        if let Some(scope) = &self.scope {
            form.push(("scope", scope.as_str()));
        }

        let response = self
            .client
            .post(&self.token_url)
            .form(&form)
            .send()
            .await
            .map_err(|e| AuthError::RefreshFailed(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(AuthError::RefreshFailed(format!(
                "token endpoint returned {status}"
            )));
        }

        response
            .json::<TokenGrant>()
            .await
            .map_err(|e| AuthError::RefreshFailed(e.to_string()))
    }
}

#[derive(Debug, Default)]
struct TokenState {
    access_token: Option<String>,
    expires_at: Option<Instant>,
    refresh_token: Option<String>,
    generation: u64,
}

impl TokenState {
    fn fresh_token(&self) -> Option<&str> {
        let token = self.access_token.as_deref()?;
        match self.expires_at {
            Some(at) if Instant::now() >= at => None,
            _ => Some(token),
        }
    }
}

/// Produces authentication headers for one endpoint.
///
/// At most one token refresh is in flight at a time; callers arriving while a
/// refresh runs wait for it and reuse its result.
pub struct AuthHandler {
    config: AuthConfig,
    provider: Option<Arc<dyn TokenProvider>>,
    state: parking_lot::Mutex<TokenState>,
    refresh_lock: tokio::sync::Mutex<()>,
}

impl std::fmt::Debug for AuthHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthHandler")
            .field("scheme", &self.config.scheme)
            .field("has_provider", &self.provider.is_some())
            .finish_non_exhaustive()
    }
}

impl AuthHandler {
    /// Creates a handler. OAuth2 configurations carrying a token URL get an
    /// [`OAuth2TokenProvider`] when no provider is supplied.
    #[must_use]
    pub fn new(config: AuthConfig, provider: Option<Arc<dyn TokenProvider>>) -> Self {
        #[cfg(feature = "http")]
        let provider = provider.or_else(|| {
            if config.scheme == AuthScheme::OAuth2 {
                OAuth2TokenProvider::from_credentials(&config.credentials)
                    .ok()
                    .map(|p| Arc::new(p) as Arc<dyn TokenProvider>)
            } else {
                None
            }
        });

        let state = TokenState {
            access_token: config.credentials.token.clone(),
            refresh_token: config.refresh_token.clone(),
            ..TokenState::default()
        };

        Self {
            config,
            provider,
            state: parking_lot::Mutex::new(state),
            refresh_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Returns the configuration.
    #[must_use]
    pub fn config(&self) -> &AuthConfig {
        &self.config
    }

    /// Returns the headers to merge into a request.
    ///
    /// # Errors
    ///
    /// Returns an [`AuthError`] if credentials are missing or a needed
    /// refresh fails.
    pub async fn get_auth_headers(&self) -> Result<HashMap<String, String>, AuthError> {
        let value = match self.config.scheme {
            AuthScheme::Basic => {
                let creds = &self.config.credentials;
                let (Some(user), Some(pass)) = (&creds.username, &creds.password) else {
                    return Err(AuthError::MissingCredentials(
                        "username and password".to_string(),
                    ));
                };
                let encoded =
                    base64::engine::general_purpose::STANDARD.encode(format!("{user}:{pass}"));
                format!("Basic {encoded}")
            }
            AuthScheme::Bearer | AuthScheme::OAuth2 => {
                format!("Bearer {}", self.current_token().await?)
            }
        };

        let mut headers = HashMap::new();
        headers.insert("Authorization".to_string(), value);
        Ok(headers)
    }

    async fn current_token(&self) -> Result<String, AuthError> {
        if let Some(token) = self.state.lock().fresh_token() {
            return Ok(token.to_string());
        }
        if self.provider.is_none() {
            return Err(AuthError::MissingCredentials("token".to_string()));
        }
        self.refresh_auth().await?;
        self.state
            .lock()
            .access_token
            .clone()
            .ok_or_else(|| AuthError::RefreshFailed("provider returned no token".to_string()))
    }

    /// Forces a token refresh.
    ///
    /// A caller that arrives while another refresh is running waits for it
    /// and returns without issuing a second one.
    ///
    /// # Errors
    ///
    /// Returns an [`AuthError`] if there is no provider or it fails.
    pub async fn refresh_auth(&self) -> Result<(), AuthError> {
        let Some(provider) = &self.provider else {
            return Err(AuthError::MissingCredentials("token provider".to_string()));
        };

        let observed = self.state.lock().generation;
        let _guard = self.refresh_lock.lock().await;

        let refresh_token = {
            let state = self.state.lock();
            if state.generation != observed {
                debug!("Token refreshed by a concurrent caller");
                return Ok(());
            }
            state.refresh_token.clone()
        };

        let grant = match provider.fetch_token(refresh_token.as_deref()).await {
            Ok(grant) => grant,
            Err(e) => {
                warn!(error = %e, "Token refresh failed");
                return Err(e);
            }
        };

        let mut state = self.state.lock();
        state.expires_at = grant.expires_in.map(|secs| {
            Instant::now() + Duration::from_secs(secs).saturating_sub(EXPIRY_SAFETY_MARGIN)
        });
        state.access_token = Some(grant.access_token);
        if grant.refresh_token.is_some() {
            state.refresh_token = grant.refresh_token;
        }
        state.generation += 1;
        info!(expires_in = ?grant.expires_in, "Access token refreshed");
        Ok(())
    }
}
