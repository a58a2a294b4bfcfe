//! Mock controller: just enough of the OAuth endpoints to log in against.
//!
//! `GET /auth/authorize` approves every request and redirects straight back
//! with a fresh code.  `POST /auth/token` serves both the
//! `authorization_code` and `refresh_token` grants.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Arc, Mutex, MutexGuard};

use axum::extract::{Form, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Redirect, Response};
use axum::routing::{get, post};
use axum::Router;
use clap::Parser;
use serde::Deserialize;
use serde_json::json;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Parser, Debug)]
#[command(name = "mock-controller", about = "Mock controller OAuth endpoints")]
struct Args {
    /// Address to listen on.
    #[arg(long, default_value = "127.0.0.1")]
    bind: IpAddr,

    #[arg(long, default_value_t = 8123)]
    port: u16,

    /// Lifetime reported for issued access tokens, in seconds.
    #[arg(long, default_value_t = 1800)]
    expires_in: i64,

    /// Issue a new refresh token on every refresh.
    #[arg(long)]
    rotate_refresh: bool,
}

#[derive(Debug, Clone)]
struct Settings {
    expires_in: i64,
    rotate_refresh: bool,
}

/// A code handed out by `/auth/authorize`, redeemable once.
struct PendingCode {
    client_id: String,
    redirect_uri: String,
}

#[derive(Default)]
struct Registry {
    codes: HashMap<String, PendingCode>,
    /// refresh token -> client id
    refresh_tokens: HashMap<String, String>,
}

#[derive(Clone)]
struct AppState {
    settings: Settings,
    registry: Arc<Mutex<Registry>>,
}

impl AppState {
    fn new(settings: Settings) -> Self {
        Self {
            settings,
            registry: Arc::default(),
        }
    }

    fn registry(&self) -> MutexGuard<'_, Registry> {
        match self.registry.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let state = AppState::new(Settings {
        expires_in: args.expires_in,
        rotate_refresh: args.rotate_refresh,
    });

    let listener = tokio::net::TcpListener::bind((args.bind, args.port)).await?;
    info!(address = %listener.local_addr()?, "mock controller listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

fn app(state: AppState) -> Router {
    Router::new()
        .route("/auth/authorize", get(authorize))
        .route("/auth/token", post(token))
        .with_state(state)
}

// --- Endpoints ---

#[derive(Deserialize)]
struct AuthorizeParams {
    #[serde(default)]
    client_id: String,
    redirect_uri: String,
    #[serde(default)]
    response_type: String,
    #[serde(default)]
    state: String,
}

async fn authorize(
    State(app): State<AppState>,
    Query(params): Query<AuthorizeParams>,
) -> Redirect {
    let mut query = url::form_urlencoded::Serializer::new(String::new());
    if params.response_type == "code" {
        let code = Uuid::new_v4().simple().to_string();
        info!(client_id = %params.client_id, "authorize request approved");
        app.registry().codes.insert(
            code.clone(),
            PendingCode {
                client_id: params.client_id,
                redirect_uri: params.redirect_uri.clone(),
            },
        );
        query.append_pair("code", &code);
    } else {
        warn!(response_type = %params.response_type, "unsupported response type");
        query.append_pair("error", "unsupported_response_type");
    }
    query.append_pair("state", &params.state);

    let separator = if params.redirect_uri.contains('?') { '&' } else { '?' };
    Redirect::to(&format!("{}{separator}{}", params.redirect_uri, query.finish()))
}

#[derive(Deserialize)]
struct TokenRequest {
    grant_type: String,
    code: Option<String>,
    redirect_uri: Option<String>,
    client_id: Option<String>,
    refresh_token: Option<String>,
}

fn token_error(error: &str) -> Response {
    (StatusCode::BAD_REQUEST, Json(json!({ "error": error }))).into_response()
}

fn new_token() -> String {
    Uuid::new_v4().to_string()
}

async fn token(State(app): State<AppState>, Form(req): Form<TokenRequest>) -> Response {
    let mut registry = app.registry();
    let client_id = req.client_id.unwrap_or_default();

    let issue_refresh = match req.grant_type.as_str() {
        "authorization_code" => {
            let Some(pending) = req.code.and_then(|c| registry.codes.remove(&c)) else {
                warn!("unknown or reused authorization code");
                return token_error("invalid_grant");
            };
            if pending.client_id != client_id
                || req.redirect_uri.as_deref() != Some(pending.redirect_uri.as_str())
            {
                warn!("authorization code presented with mismatched client");
                return token_error("invalid_grant");
            }
            true
        }
        "refresh_token" => {
            let known = req
                .refresh_token
                .as_ref()
                .and_then(|t| registry.refresh_tokens.get(t));
            if known != Some(&client_id) {
                warn!("unknown refresh token");
                return token_error("invalid_grant");
            }
            if app.settings.rotate_refresh {
                if let Some(old) = &req.refresh_token {
                    registry.refresh_tokens.remove(old);
                }
                true
            } else {
                false
            }
        }
        other => {
            warn!(grant_type = %other, "unsupported grant type");
            return token_error("unsupported_grant_type");
        }
    };

    let mut body = json!({
        "access_token": new_token(),
        "token_type": "Bearer",
        "expires_in": app.settings.expires_in,
    });
    if issue_refresh {
        let refresh = new_token();
        registry.refresh_tokens.insert(refresh.clone(), client_id);
        body["refresh_token"] = json!(refresh);
    }

    info!(grant_type = %req.grant_type, "token issued");
    Json(body).into_response()
}
