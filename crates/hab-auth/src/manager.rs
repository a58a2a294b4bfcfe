//! Authentication state for one process invocation.
//!
//! [`AuthManager`] memoizes the active credential, decides when it must be
//! refreshed, and hands the REST layer a ready-to-use [`AuthenticatedClient`].
//!
//! The cached credential is not synchronised.  A manager belongs to a single
//! thread of control; sharing one across threads requires the caller to add
//! its own locking.

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::AuthConfig;
use crate::credentials::{self, Credentials, TokenState};
use crate::error::{AuthError, Result};
use crate::oauth::OAuthClient;
use crate::store::CredentialStore;

const NOT_AUTHENTICATED_MESSAGE: &str = "Not authenticated. Run 'hab auth login' to authenticate.";

/// How the active credential authenticates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthKind {
    /// Long-lived access token.
    Token,
    /// OAuth access + refresh token pair.
    #[serde(rename = "oauth")]
    OAuth,
}

/// Status projection of the active credential.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AuthStatus {
    pub authenticated: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth_type: Option<AuthKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_expiry: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// What the REST layer needs to talk to the controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthenticatedClient {
    pub server_url: String,
    pub access_token: String,
}

/// Owns the in-memory credential for the lifetime of one invocation.
pub struct AuthManager {
    store: CredentialStore,
    oauth: OAuthClient,
    cached: Option<Credentials>,
    loaded: bool,
}

impl AuthManager {
    /// A manager over the store described by `config`.
    pub fn new(config: &AuthConfig) -> Self {
        Self::with_parts(
            CredentialStore::new(&config.config_dir),
            OAuthClient::new().with_callback_timeout(config.callback_timeout),
        )
    }

    pub fn with_parts(store: CredentialStore, oauth: OAuthClient) -> Self {
        Self {
            store,
            oauth,
            cached: None,
            loaded: false,
        }
    }

    pub fn oauth(&self) -> &OAuthClient {
        &self.oauth
    }

    /// The active credential, loading it on first access.
    ///
    /// Absence is `Ok(None)`; an unreadable store is an error and is not
    /// cached, so a later call retries.
    pub fn get_credentials(&mut self) -> Result<Option<&Credentials>> {
        if !self.loaded {
            self.cached = self.store.load()?;
            self.loaded = true;
        }
        Ok(self.cached.as_ref())
    }

    fn peek(&mut self) -> Option<&Credentials> {
        match self.get_credentials() {
            Ok(creds) => creds,
            Err(err) => {
                debug!(error = %err, "credentials unavailable");
                None
            }
        }
    }

    /// `true` when a credential with an access token is present.
    pub fn is_authenticated(&mut self) -> bool {
        self.peek().is_some_and(Credentials::has_valid_token)
    }

    /// Controller URL, or an empty string.
    pub fn get_url(&mut self) -> String {
        self.peek().map(|c| c.url.clone()).unwrap_or_default()
    }

    /// Access token, or an empty string.
    pub fn get_token(&mut self) -> String {
        self.peek()
            .and_then(Credentials::access_token)
            .map(str::to_string)
            .unwrap_or_default()
    }

    /// `true` only for OAuth credentials close to or past expiry.
    pub fn needs_refresh(&mut self) -> bool {
        self.peek().is_some_and(Credentials::needs_refresh)
    }

    /// Lifecycle state of the active credential right now.
    pub fn token_state(&mut self) -> TokenState {
        let now = credentials::now();
        self.peek().map_or(TokenState::NoCredentials, |c| c.state_at(now))
    }

    /// Refresh the OAuth access token, replace the cached credential and
    /// persist it.
    ///
    /// On failure the cached credential is left untouched.
    pub async fn refresh_token(&mut self) -> Result<()> {
        let refreshed = self.refresh_cached().await?;
        self.store.save(&refreshed)
    }

    async fn refresh_cached(&mut self) -> Result<Credentials> {
        let current = self
            .get_credentials()?
            .cloned()
            .ok_or(AuthError::NotAuthenticated)?;
        if !current.is_oauth() {
            return Err(AuthError::NoRefreshToken);
        }

        let refreshed = self.oauth.refresh_access_token(&current).await?;
        self.cached = Some(refreshed.clone());
        Ok(refreshed)
    }

    /// Adopt and persist `creds`.
    pub fn save(&mut self, creds: Credentials) -> Result<()> {
        self.store.save(&creds)?;
        self.cached = Some(creds);
        self.loaded = true;
        Ok(())
    }

    /// Forget the cached credential and delete the stored one.
    ///
    /// Returns whether a stored file was removed.
    pub fn logout(&mut self) -> bool {
        self.cached = None;
        self.loaded = false;
        let removed = self.store.delete();
        info!(removed, "logged out");
        removed
    }

    pub fn get_auth_status(&mut self) -> AuthStatus {
        match self.peek() {
            None => AuthStatus {
                authenticated: false,
                url: None,
                auth_type: None,
                token_expiry: None,
                message: Some(NOT_AUTHENTICATED_MESSAGE.to_string()),
            },
            Some(creds) => AuthStatus {
                authenticated: true,
                url: Some(creds.url.clone()),
                auth_type: Some(if creds.is_oauth() {
                    AuthKind::OAuth
                } else {
                    AuthKind::Token
                }),
                token_expiry: Some(creds.token_expiry),
                message: None,
            },
        }
    }

    /// Credentials for the REST layer, refreshed first when due.
    ///
    /// A refresh failure is returned as [`AuthError::RefreshFailed`].  A
    /// failure to persist the refreshed credential only logs a warning.
    pub async fn get_authenticated_client(&mut self) -> Result<AuthenticatedClient> {
        let creds = self
            .get_credentials()?
            .cloned()
            .ok_or(AuthError::NotAuthenticated)?;

        let creds = if creds.needs_refresh() {
            let refreshed = self
                .refresh_cached()
                .await
                .map_err(|e| AuthError::RefreshFailed(Box::new(e)))?;
            if let Err(err) = self.store.save(&refreshed) {
                warn!(error = %err, "failed to save refreshed credentials");
            }
            refreshed
        } else {
            creds
        };

        let access_token = creds
            .access_token()
            .ok_or(AuthError::NotAuthenticated)?
            .to_string();
        Ok(AuthenticatedClient {
            server_url: creds.url,
            access_token,
        })
    }
}
