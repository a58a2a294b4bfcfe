//! The credential record and its token lifecycle.

use serde::{Deserialize, Serialize};

/// Seconds before expiry at which an OAuth token is considered due for refresh.
pub const REFRESH_MARGIN_SECS: i64 = 300;

/// Credentials for one controller.
///
/// * A record with a refresh token is an OAuth credential and expires at
///   `token_expiry` (epoch seconds, `0` = unknown).
/// * A record with only an access token is a long-lived token and never
///   expires.
///
/// Records are replaced wholesale on refresh, never patched field by field.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Credentials {
    /// Base URL of the controller.
    pub url: String,
    /// Bearer token sent to the REST API.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_token: Option<String>,
    /// OAuth refresh token.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    /// OAuth client identifier used when the tokens were issued.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    /// Access-token expiry in epoch seconds; `0` when unknown.
    #[serde(default, skip_serializing_if = "is_zero")]
    pub token_expiry: i64,
}

fn is_zero(value: &i64) -> bool {
    *value == 0
}

fn non_empty(value: Option<&String>) -> Option<&str> {
    value.map(String::as_str).filter(|v| !v.is_empty())
}

/// Where a credential sits in its lifecycle at a given instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenState {
    NoCredentials,
    LongLivedValid,
    OAuthValid,
    OAuthNeedsRefresh,
    OAuthExpired,
}

impl Credentials {
    /// A long-lived access token for `url`.
    pub fn long_lived(url: impl Into<String>, access_token: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            access_token: Some(access_token.into()),
            ..Self::default()
        }
    }

    /// `true` when the record carries a non-empty refresh token.
    pub fn is_oauth(&self) -> bool {
        self.refresh_token().is_some()
    }

    /// `true` when there is an access token to present.
    pub fn has_valid_token(&self) -> bool {
        self.access_token().is_some()
    }

    pub fn access_token(&self) -> Option<&str> {
        non_empty(self.access_token.as_ref())
    }

    pub fn refresh_token(&self) -> Option<&str> {
        non_empty(self.refresh_token.as_ref())
    }

    pub fn client_id(&self) -> Option<&str> {
        non_empty(self.client_id.as_ref())
    }

    /// `true` when the access token is past its expiry.
    ///
    /// Long-lived tokens never expire; OAuth tokens without a known expiry
    /// are treated as expired.
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(now())
    }

    /// `true` when the access token expires within [`REFRESH_MARGIN_SECS`].
    pub fn needs_refresh(&self) -> bool {
        self.needs_refresh_at(now())
    }

    pub fn is_expired_at(&self, now: i64) -> bool {
        if !self.is_oauth() {
            return false;
        }
        self.token_expiry == 0 || now >= self.token_expiry
    }

    pub fn needs_refresh_at(&self, now: i64) -> bool {
        if !self.is_oauth() {
            return false;
        }
        self.token_expiry == 0 || now >= self.token_expiry.saturating_sub(REFRESH_MARGIN_SECS)
    }

    /// Lifecycle state at `now`.
    ///
    /// An expired token also needs a refresh; the more severe state wins.
    pub fn state_at(&self, now: i64) -> TokenState {
        if !self.is_oauth() {
            return TokenState::LongLivedValid;
        }
        if self.is_expired_at(now) {
            TokenState::OAuthExpired
        } else if self.needs_refresh_at(now) {
            TokenState::OAuthNeedsRefresh
        } else {
            TokenState::OAuthValid
        }
    }
}

/// Current time in epoch seconds.
pub(crate) fn now() -> i64 {
    chrono::Utc::now().timestamp()
}
