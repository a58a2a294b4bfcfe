//! OAuth authorization-code flow against the controller.
//!
//! [`OAuthClient::run_oauth_flow`] drives the full browser round-trip:
//!
//! 1. Generate a CSRF state and start the [`CallbackServer`].
//! 2. Open the authorization URL in the user's browser.
//! 3. Wait for the redirect, validate the state and the code.
//! 4. Exchange the code at `/auth/token`.
//!
//! The callback server is stopped on every exit path.

use std::net::IpAddr;
use std::time::Duration;

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use rand::RngCore;
use serde::Deserialize;
use tracing::{debug, info, instrument, warn};
use url::Url;

use crate::callback::{CallbackResult, CallbackServer};
use crate::config::DEFAULT_CALLBACK_TIMEOUT;
use crate::credentials::{self, Credentials};
use crate::error::{AuthError, Result};

/// Authorization endpoint path on the controller.
pub const AUTHORIZE_PATH: &str = "/auth/authorize";
/// Token endpoint path on the controller.
pub const TOKEN_PATH: &str = "/auth/token";
/// Client identifier presented to the controller.
pub const CLIENT_ID: &str = "https://github.com/home-assistant/hab";

/// Token lifetime assumed when the response omits `expires_in`.
const DEFAULT_EXPIRES_IN: i64 = 1800;

/// Opens a URL for the user to visit.
pub trait BrowserLauncher: Send + Sync {
    fn open(&self, url: &str) -> std::io::Result<()>;
}

/// Launches the system default browser.
pub struct SystemBrowser;

impl BrowserLauncher for SystemBrowser {
    fn open(&self, url: &str) -> std::io::Result<()> {
        open::that(url)
    }
}

impl<F> BrowserLauncher for F
where
    F: Fn(&str) -> std::io::Result<()> + Send + Sync,
{
    fn open(&self, url: &str) -> std::io::Result<()> {
        self(url)
    }
}

/// Body of a successful `/auth/token` response.
#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<i64>,
}

impl TokenResponse {
    fn expiry_from(&self, now: i64) -> i64 {
        let expires_in = self
            .expires_in
            .filter(|secs| *secs > 0)
            .unwrap_or(DEFAULT_EXPIRES_IN);
        now.saturating_add(expires_in)
    }
}

/// Random CSRF state: 32 bytes, URL-safe base64.
pub fn generate_state() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Build `<server>/auth/authorize?client_id=…&redirect_uri=…&response_type=code&state=…`.
pub fn build_authorize_url(server_url: &str, redirect_uri: &str, state: &str) -> String {
    let query = url::form_urlencoded::Serializer::new(String::new())
        .append_pair("client_id", CLIENT_ID)
        .append_pair("redirect_uri", redirect_uri)
        .append_pair("response_type", "code")
        .append_pair("state", state)
        .finish();
    format!("{}{AUTHORIZE_PATH}?{query}", server_url.trim_end_matches('/'))
}

fn token_url(server_url: &str) -> String {
    format!("{}{TOKEN_PATH}", server_url.trim_end_matches('/'))
}

/// HTTP side of the OAuth flow.
pub struct OAuthClient {
    http: reqwest::Client,
    launcher: Box<dyn BrowserLauncher>,
    callback_timeout: Duration,
    callback_ip: Option<IpAddr>,
}

impl Default for OAuthClient {
    fn default() -> Self {
        Self::new()
    }
}

impl OAuthClient {
    pub fn new() -> Self {
        Self {
            http: reqwest::Client::new(),
            launcher: Box::new(SystemBrowser),
            callback_timeout: DEFAULT_CALLBACK_TIMEOUT,
            callback_ip: None,
        }
    }

    #[must_use]
    pub fn with_launcher(mut self, launcher: impl BrowserLauncher + 'static) -> Self {
        self.launcher = Box::new(launcher);
        self
    }

    #[must_use]
    pub fn with_callback_timeout(mut self, timeout: Duration) -> Self {
        self.callback_timeout = timeout;
        self
    }

    /// Bind the callback server on `ip` instead of the outbound address.
    #[must_use]
    pub fn with_callback_ip(mut self, ip: IpAddr) -> Self {
        self.callback_ip = Some(ip);
        self
    }

    /// Exchange an authorization code for tokens.
    #[instrument(skip(self, code), fields(server = %server_url))]
    pub async fn exchange_code_for_tokens(
        &self,
        server_url: &str,
        code: &str,
        redirect_uri: &str,
    ) -> Result<Credentials> {
        let token = self
            .post_token(
                server_url,
                &[
                    ("grant_type", "authorization_code"),
                    ("code", code),
                    ("client_id", CLIENT_ID),
                    ("redirect_uri", redirect_uri),
                ],
                "token exchange",
            )
            .await?;

        info!("authorization code exchanged");

        Ok(Credentials {
            url: server_url.to_string(),
            token_expiry: token.expiry_from(credentials::now()),
            access_token: Some(token.access_token),
            refresh_token: token.refresh_token.filter(|t| !t.is_empty()),
            client_id: Some(CLIENT_ID.to_string()),
        })
    }

    /// Obtain a fresh access token for `creds`.
    ///
    /// If the controller does not rotate the refresh token, the previous one
    /// is kept.
    #[instrument(skip(self, creds), fields(server = %creds.url))]
    pub async fn refresh_access_token(&self, creds: &Credentials) -> Result<Credentials> {
        let refresh_token = creds.refresh_token().ok_or(AuthError::NoRefreshToken)?;
        let client_id = creds.client_id().unwrap_or(CLIENT_ID);

        let token = self
            .post_token(
                &creds.url,
                &[
                    ("grant_type", "refresh_token"),
                    ("refresh_token", refresh_token),
                    ("client_id", client_id),
                ],
                "token refresh",
            )
            .await?;

        info!("access token refreshed");

        Ok(Credentials {
            url: creds.url.clone(),
            client_id: Some(client_id.to_string()),
            token_expiry: token.expiry_from(credentials::now()),
            refresh_token: Some(
                token
                    .refresh_token
                    .filter(|t| !t.is_empty())
                    .unwrap_or_else(|| refresh_token.to_string()),
            ),
            access_token: Some(token.access_token),
        })
    }

    /// Run the browser-based login against `server_url`.
    pub async fn run_oauth_flow(&self, server_url: &str) -> Result<Credentials> {
        let server_url = server_url.trim_end_matches('/');
        let state = generate_state();

        let mut server = CallbackServer::new();
        let redirect_uri = match self.callback_ip {
            Some(ip) => server.start_on(ip).await,
            None => server.start().await,
        }?;

        let outcome = self
            .complete_flow(&mut server, server_url, &state, &redirect_uri)
            .await;
        server.stop().await;
        outcome
    }

    async fn complete_flow(
        &self,
        server: &mut CallbackServer,
        server_url: &str,
        state: &str,
        redirect_uri: &str,
    ) -> Result<Credentials> {
        let authorize_url = build_authorize_url(server_url, redirect_uri, state);

        println!("\nOpening browser for authentication...");
        println!("If browser doesn't open, visit: {authorize_url}\n");
        if let Err(err) = self.launcher.open(&authorize_url) {
            warn!(error = %err, "failed to open browser");
        }

        let callback = server.wait_for_callback(self.callback_timeout).await?;
        let code = validate_callback(callback, state)?;

        debug!("callback validated; exchanging code");
        self.exchange_code_for_tokens(server_url, &code, redirect_uri)
            .await
    }

    async fn post_token(
        &self,
        server_url: &str,
        form: &[(&str, &str)],
        context: &'static str,
    ) -> Result<TokenResponse> {
        let res = self.http.post(token_url(server_url)).form(form).send().await?;

        let status = res.status();
        if !status.is_success() {
            warn!(%status, context, "controller rejected token request");
            return Err(AuthError::Protocol {
                context,
                status: status.as_u16(),
            });
        }

        let body = res.text().await?;
        serde_json::from_str(&body).map_err(|e| AuthError::MalformedResponse(e.to_string()))
    }
}

/// Check a callback against the flow's state and pull out the code.
fn validate_callback(callback: CallbackResult, expected_state: &str) -> Result<String> {
    if !callback.error.is_empty() {
        return Err(AuthError::OAuthDenied(callback.error));
    }
    if callback.state.as_bytes() != expected_state.as_bytes() {
        return Err(AuthError::CsrfMismatch);
    }
    if callback.code.is_empty() {
        return Err(AuthError::MissingCode);
    }
    Ok(callback.code)
}

/// Pull `redirect_uri` back out of an authorization URL.
pub fn redirect_uri_of(authorize_url: &str) -> Option<String> {
    Url::parse(authorize_url)
        .ok()?
        .query_pairs()
        .find(|(key, _)| key == "redirect_uri")
        .map(|(_, value)| value.into_owned())
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use serde_json::json;
    use wiremock::matchers::{body_string_contains, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;
    use crate::error::ErrorKind;

    const LOCALHOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

    fn state_of(authorize_url: &str) -> String {
        Url::parse(authorize_url)
            .unwrap()
            .query_pairs()
            .find(|(k, _)| k == "state")
            .map(|(_, v)| v.into_owned())
            .unwrap()
    }

    /// A launcher that plays the browser: follows the authorize URL straight
    /// back to the callback with the given parameters.
    fn redirecting_browser(
        query: impl Fn(&str) -> String + Send + Sync + 'static,
    ) -> impl BrowserLauncher {
        move |url: &str| -> std::io::Result<()> {
            let redirect = redirect_uri_of(url).expect("redirect_uri in authorize url");
            let target = format!("{redirect}?{}", query(&state_of(url)));
            tokio::spawn(async move {
                let _ = reqwest::get(target).await;
            });
            Ok(())
        }
    }

    fn oauth_client(launcher: impl BrowserLauncher + 'static) -> OAuthClient {
        OAuthClient::new()
            .with_launcher(launcher)
            .with_callback_ip(LOCALHOST)
            .with_callback_timeout(Duration::from_secs(5))
    }

    #[test]
    fn state_is_random_url_safe() {
        let a = generate_state();
        let b = generate_state();
        assert_ne!(a, b);
        assert_eq!(a.len(), 43);
        assert_eq!(URL_SAFE_NO_PAD.decode(&a).unwrap().len(), 32);
        assert!(
            a.chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        );
    }

    #[test]
    fn authorize_url_has_required_params() {
        let url = build_authorize_url(
            "http://ha.local:8123/",
            "http://192.168.1.20:5000/callback",
            "st@te",
        );
        assert!(url.starts_with("http://ha.local:8123/auth/authorize?"));

        let parsed = Url::parse(&url).unwrap();
        let pairs: Vec<(String, String)> = parsed.query_pairs().into_owned().collect();
        assert!(pairs.contains(&("client_id".into(), CLIENT_ID.into())));
        assert!(pairs.contains(&(
            "redirect_uri".into(),
            "http://192.168.1.20:5000/callback".into()
        )));
        assert!(pairs.contains(&("response_type".into(), "code".into())));
        assert!(pairs.contains(&("state".into(), "st@te".into())));
    }

    #[test]
    fn callback_validation_order() {
        let ok = CallbackResult {
            code: "c".into(),
            state: "s".into(),
            error: String::new(),
        };
        assert_eq!(validate_callback(ok.clone(), "s").unwrap(), "c");

        let denied = CallbackResult {
            error: "access_denied".into(),
            ..ok.clone()
        };
        assert!(matches!(
            validate_callback(denied, "s"),
            Err(AuthError::OAuthDenied(e)) if e == "access_denied"
        ));

        assert!(matches!(
            validate_callback(ok.clone(), "other"),
            Err(AuthError::CsrfMismatch)
        ));

        let no_code = CallbackResult {
            code: String::new(),
            ..ok
        };
        assert!(matches!(
            validate_callback(no_code, "s"),
            Err(AuthError::MissingCode)
        ));
    }

    #[tokio::test]
    async fn exchange_computes_expiry() {
        let controller = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(TOKEN_PATH))
            .and(body_string_contains("grant_type=authorization_code"))
            .and(body_string_contains("code=abc"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "access_token": "A1",
                "refresh_token": "R1",
                "expires_in": 600,
                "token_type": "Bearer"
            })))
            .expect(1)
            .mount(&controller)
            .await;

        let before = credentials::now();
        let creds = OAuthClient::new()
            .exchange_code_for_tokens(&controller.uri(), "abc", "http://127.0.0.1:1/callback")
            .await
            .unwrap();
        assert_eq!(creds.access_token(), Some("A1"));
        assert_eq!(creds.refresh_token(), Some("R1"));
        assert_eq!(creds.client_id(), Some(CLIENT_ID));
        assert!(creds.token_expiry >= before + 600);
        assert!(creds.token_expiry <= credentials::now() + 600);
    }

    #[tokio::test]
    async fn exchange_defaults_expiry_to_thirty_minutes() {
        let controller = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(TOKEN_PATH))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "access_token": "A1",
                "refresh_token": "R1"
            })))
            .mount(&controller)
            .await;

        let before = credentials::now();
        let creds = OAuthClient::new()
            .exchange_code_for_tokens(&controller.uri(), "abc", "http://127.0.0.1:1/callback")
            .await
            .unwrap();
        assert!(creds.token_expiry >= before + 1800);
        assert!(creds.token_expiry <= credentials::now() + 1800);
    }

    #[tokio::test]
    async fn exchange_failure_carries_status() {
        let controller = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(TOKEN_PATH))
            .respond_with(ResponseTemplate::new(400).set_body_string("invalid_grant"))
            .mount(&controller)
            .await;

        let err = OAuthClient::new()
            .exchange_code_for_tokens(&controller.uri(), "bad", "http://127.0.0.1:1/callback")
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::Protocol { status: 400, .. }));
        assert_eq!(err.kind(), ErrorKind::Protocol);
    }

    #[tokio::test]
    async fn huge_expires_in_saturates() {
        let controller = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(TOKEN_PATH))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "access_token": "A1",
                "refresh_token": "R1",
                "expires_in": i64::MAX
            })))
            .mount(&controller)
            .await;

        let creds = OAuthClient::new()
            .exchange_code_for_tokens(&controller.uri(), "abc", "http://127.0.0.1:1/callback")
            .await
            .unwrap();
        assert_eq!(creds.token_expiry, i64::MAX);
        assert_eq!(
            creds.state_at(credentials::now()),
            crate::credentials::TokenState::OAuthValid
        );
    }

    #[tokio::test]
    async fn exchange_rejects_malformed_body() {
        let controller = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(TOKEN_PATH))
            .respond_with(ResponseTemplate::new(200).set_body_string("not json"))
            .mount(&controller)
            .await;

        let err = OAuthClient::new()
            .exchange_code_for_tokens(&controller.uri(), "abc", "http://127.0.0.1:1/callback")
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::MalformedResponse(_)));
    }

    #[tokio::test]
    async fn refresh_keeps_refresh_token_when_not_rotated() {
        let controller = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(TOKEN_PATH))
            .and(body_string_contains("grant_type=refresh_token"))
            .and(body_string_contains("refresh_token=R0"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "access_token": "A2",
                "expires_in": 1800,
                "token_type": "Bearer"
            })))
            .expect(1)
            .mount(&controller)
            .await;

        let old = Credentials {
            url: controller.uri(),
            access_token: Some("A0".into()),
            refresh_token: Some("R0".into()),
            client_id: None,
            token_expiry: 1,
        };
        let new = OAuthClient::new().refresh_access_token(&old).await.unwrap();
        assert_eq!(new.access_token(), Some("A2"));
        assert_eq!(new.refresh_token(), Some("R0"));
        assert_eq!(new.client_id(), Some(CLIENT_ID));
        assert!(new.token_expiry > credentials::now());
        assert_eq!(old.access_token(), Some("A0"));
    }

    #[tokio::test]
    async fn refresh_adopts_rotated_token() {
        let controller = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(TOKEN_PATH))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "access_token": "A2",
                "refresh_token": "R1",
                "expires_in": 1800
            })))
            .mount(&controller)
            .await;

        let old = Credentials {
            url: controller.uri(),
            refresh_token: Some("R0".into()),
            ..Credentials::default()
        };
        let new = OAuthClient::new().refresh_access_token(&old).await.unwrap();
        assert_eq!(new.refresh_token(), Some("R1"));
    }

    #[tokio::test]
    async fn refresh_requires_refresh_token() {
        let creds = Credentials::long_lived("http://127.0.0.1:1", "abc");
        let err = OAuthClient::new()
            .refresh_access_token(&creds)
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::NoRefreshToken));
    }

    #[tokio::test]
    async fn full_flow_exchanges_code() {
        let controller = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(TOKEN_PATH))
            .and(body_string_contains("code=good-code"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "access_token": "A1",
                "refresh_token": "R1",
                "expires_in": 1800
            })))
            .expect(1)
            .mount(&controller)
            .await;

        let client = oauth_client(redirecting_browser(|state| {
            format!("code=good-code&state={state}")
        }));
        let creds = client.run_oauth_flow(&controller.uri()).await.unwrap();
        assert_eq!(creds.url, controller.uri());
        assert_eq!(creds.access_token(), Some("A1"));
        assert!(creds.is_oauth());
    }

    #[tokio::test]
    async fn forged_state_aborts_before_exchange() {
        let controller = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(TOKEN_PATH))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&controller)
            .await;

        let client = oauth_client(redirecting_browser(|_| {
            "code=stolen&state=forged".to_string()
        }));
        let err = client.run_oauth_flow(&controller.uri()).await.unwrap_err();
        assert!(matches!(err, AuthError::CsrfMismatch));
        assert_eq!(err.kind(), ErrorKind::Csrf);
    }

    #[tokio::test]
    async fn missing_code_is_reported_distinctly() {
        let controller = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(TOKEN_PATH))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&controller)
            .await;

        let client = oauth_client(redirecting_browser(|state| format!("state={state}")));
        let err = client.run_oauth_flow(&controller.uri()).await.unwrap_err();
        assert!(matches!(err, AuthError::MissingCode));
    }

    #[tokio::test]
    async fn browser_failure_is_not_fatal() {
        let client = OAuthClient::new()
            .with_launcher(|_: &str| -> std::io::Result<()> {
                Err(std::io::Error::new(std::io::ErrorKind::NotFound, "no browser"))
            })
            .with_callback_ip(LOCALHOST)
            .with_callback_timeout(Duration::from_millis(200));

        let err = client
            .run_oauth_flow("http://127.0.0.1:1")
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::CallbackTimeout(_)));
    }
}
