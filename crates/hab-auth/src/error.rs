//! Error types for authentication and discovery.
//!
//! [`AuthError`] unifies every failure mode of the crate.  Callers that only
//! care about the broad category can branch on [`AuthError::kind`].

use std::time::Duration;

/// Convenience alias used throughout the crate.
pub type Result<T, E = AuthError> = std::result::Result<T, E>;

/// Broad classification of an [`AuthError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Reading or writing the credential file failed.
    Storage,
    /// The credential blob could not be decrypted or authenticated.
    Crypto,
    /// The controller answered with a non-success status or a malformed body,
    /// or could not be reached at all.
    Protocol,
    /// The OAuth callback carried a state that does not match the flow.
    Csrf,
    /// The OAuth callback did not arrive in time.
    Timeout,
    /// The operation does not apply to the current credential or setup.
    Config,
    /// An authenticated client was requested with no credential present.
    NotAuthenticated,
}

/// Errors that can occur while loading credentials, logging in, refreshing
/// tokens or discovering controllers.
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    /// File I/O on the credential store failed.
    #[error("credential storage error: {0}")]
    Storage(#[from] std::io::Error),

    /// Decryption or authentication of the stored blob failed.
    ///
    /// Tampering, truncation and a key derived on another machine are
    /// indistinguishable here. Moving a credential file between machines
    /// always ends in this error and requires a fresh login.
    #[error("failed to decrypt credentials: {0}")]
    Crypto(String),

    /// The controller returned a non-success HTTP status.
    #[error("{context} failed with status {status}")]
    Protocol {
        /// Which exchange was attempted.
        context: &'static str,
        /// HTTP status code returned by the controller.
        status: u16,
    },

    /// The controller answered with a body we could not interpret.
    #[error("malformed response from controller: {0}")]
    MalformedResponse(String),

    /// The HTTP call to the controller failed at the transport level.
    #[error("failed to reach controller: {0}")]
    Http(#[from] reqwest::Error),

    /// The callback state did not match the state generated for the flow.
    #[error("state mismatch - possible CSRF attack")]
    CsrfMismatch,

    /// The authorization server redirected back with an `error` parameter.
    #[error("OAuth error: {0}")]
    OAuthDenied(String),

    /// The callback arrived without an authorization code.
    #[error("no authorization code received")]
    MissingCode,

    /// No callback arrived within the allotted time.
    #[error("OAuth callback not received within {0:?}")]
    CallbackTimeout(Duration),

    /// The callback server is not running or its result was already taken.
    #[error("callback server is not running")]
    CallbackUnavailable,

    /// A refresh was requested for a credential without a refresh token.
    #[error("no refresh token available")]
    NoRefreshToken,

    /// No credential is stored or provided through the environment.
    #[error("not authenticated. Run 'hab auth login' to authenticate.")]
    NotAuthenticated,

    /// Refreshing the access token failed while preparing a client.
    #[error("token refresh failed: {0}")]
    RefreshFailed(#[source] Box<AuthError>),

    /// The mDNS browser could not be set up.
    #[error("failed to start mDNS browser: {0}")]
    Discovery(String),

    /// JSON (de)serialisation error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl AuthError {
    /// The category this error belongs to.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Storage(_) | Self::Serialization(_) => ErrorKind::Storage,
            Self::Crypto(_) => ErrorKind::Crypto,
            Self::Protocol { .. }
            | Self::MalformedResponse(_)
            | Self::Http(_)
            | Self::OAuthDenied(_)
            | Self::MissingCode => ErrorKind::Protocol,
            Self::CsrfMismatch => ErrorKind::Csrf,
            Self::CallbackTimeout(_) => ErrorKind::Timeout,
            Self::CallbackUnavailable | Self::NoRefreshToken | Self::Discovery(_) => {
                ErrorKind::Config
            }
            Self::NotAuthenticated => ErrorKind::NotAuthenticated,
            Self::RefreshFailed(inner) => inner.kind(),
        }
    }
}
