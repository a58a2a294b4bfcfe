//! Ephemeral HTTP listener for the OAuth redirect.
//!
//! The server binds an OS-assigned port on the machine's outbound-routable
//! address, serves `GET /callback`, and hands the first request's parameters
//! to the single waiter.  Later requests still get a page but are not
//! recorded.

use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::{RawQuery, State};
use axum::response::Html;
use axum::routing::get;
use axum::Router;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::{AuthError, Result};

/// Path the authorization server redirects to.
pub const CALLBACK_PATH: &str = "/callback";

/// Grace period given to in-flight requests on [`CallbackServer::stop`].
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Parameters captured from the redirect. Missing parameters are empty.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallbackResult {
    pub code: String,
    pub state: String,
    pub error: String,
}

impl CallbackResult {
    /// Parse a redirect query string. The first value of a repeated key
    /// wins; malformed input never fails.
    pub fn from_query(query: &str) -> Self {
        let mut result = Self::default();
        let (mut code, mut state, mut error) = (false, false, false);
        for (key, value) in url::form_urlencoded::parse(query.as_bytes()) {
            let (seen, field) = match key.as_ref() {
                "code" => (&mut code, &mut result.code),
                "state" => (&mut state, &mut result.state),
                "error" => (&mut error, &mut result.error),
                _ => continue,
            };
            if !*seen {
                *seen = true;
                *field = value.into_owned();
            }
        }
        result
    }
}

/// Single-assignment slot shared with the request handler.
///
/// The sender is taken on first use, so only one result can ever be
/// delivered no matter how many requests race in.
#[derive(Default)]
struct ResultSlot {
    sender: Mutex<Option<oneshot::Sender<CallbackResult>>>,
}

impl ResultSlot {
    fn deliver(&self, result: CallbackResult) -> bool {
        let sender = match self.sender.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        match sender {
            Some(tx) => tx.send(result).is_ok(),
            None => false,
        }
    }
}

async fn handle_callback(
    State(slot): State<Arc<ResultSlot>>,
    RawQuery(query): RawQuery,
) -> Html<String> {
    let result = CallbackResult::from_query(query.as_deref().unwrap_or_default());
    let page = render_page(&result.error);
    if slot.deliver(result) {
        debug!("OAuth callback received");
    } else {
        debug!("ignoring repeated OAuth callback");
    }
    Html(page)
}

fn render_page(error: &str) -> String {
    if error.is_empty() {
        r#"<html>
<body style="font-family: sans-serif; text-align: center; padding-top: 50px;">
  <h1>Authentication Successful!</h1>
  <p>You can close this window and return to the terminal.</p>
</body>
</html>"#
            .to_string()
    } else {
        format!(
            r#"<html>
<body style="font-family: sans-serif; text-align: center; padding-top: 50px;">
  <h1>Authentication Failed</h1>
  <p>Error: {}</p>
  <p>You can close this window.</p>
</body>
</html>"#,
            escape_html(error)
        )
    }
}

fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '&' => out.push_str("&amp;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

fn router(slot: Arc<ResultSlot>) -> Router {
    Router::new()
        .route(CALLBACK_PATH, get(handle_callback))
        .with_state(slot)
}

/// The local address used to reach the outside world.
///
/// Connecting a UDP socket only selects a route; no datagram is sent.
/// Falls back to `127.0.0.1` when there is no route.
pub fn outbound_local_ip() -> IpAddr {
    let probe = || -> std::io::Result<IpAddr> {
        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))?;
        socket.connect((Ipv4Addr::new(8, 8, 8, 8), 80))?;
        Ok(socket.local_addr()?.ip())
    };
    probe().unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST))
}

/// One-shot OAuth redirect receiver.
#[derive(Default)]
pub struct CallbackServer {
    addr: Option<SocketAddr>,
    result_rx: Option<oneshot::Receiver<CallbackResult>>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl CallbackServer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind on the outbound-routable address and start serving.
    ///
    /// Returns the redirect URI to register with the authorization request.
    pub async fn start(&mut self) -> Result<String> {
        self.start_on(outbound_local_ip()).await
    }

    /// Bind on `ip` with an OS-assigned port and start serving.
    pub async fn start_on(&mut self, ip: IpAddr) -> Result<String> {
        if self.task.is_some() {
            self.stop().await;
        }

        let listener = tokio::net::TcpListener::bind((ip, 0)).await?;
        let addr = listener.local_addr()?;

        let (result_tx, result_rx) = oneshot::channel();
        let slot = Arc::new(ResultSlot {
            sender: Mutex::new(Some(result_tx)),
        });
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();

        let app = router(slot);
        let task = tokio::spawn(async move {
            let shutdown = async move {
                let _ = shutdown_rx.await;
            };
            if let Err(err) = axum::serve(listener, app)
                .with_graceful_shutdown(shutdown)
                .await
            {
                warn!(error = %err, "callback server failed");
            }
        });

        self.addr = Some(addr);
        self.result_rx = Some(result_rx);
        self.shutdown_tx = Some(shutdown_tx);
        self.task = Some(task);

        debug!(address = %addr, "callback server listening");
        Ok(redirect_uri(addr))
    }

    /// The bound address, once started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.addr
    }

    /// Block until the first callback arrives or `timeout` elapses.
    ///
    /// A timeout leaves the listener running; the caller must still
    /// [`stop`](Self::stop) the server.
    pub async fn wait_for_callback(&mut self, timeout: Duration) -> Result<CallbackResult> {
        let rx = self.result_rx.take().ok_or(AuthError::CallbackUnavailable)?;
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(_)) => Err(AuthError::CallbackUnavailable),
            Err(_) => Err(AuthError::CallbackTimeout(timeout)),
        }
    }

    /// Shut the listener down, allowing in-flight requests a short grace
    /// period.  Does nothing if the server was never started.
    pub async fn stop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(mut task) = self.task.take() {
            if tokio::time::timeout(SHUTDOWN_GRACE, &mut task).await.is_err() {
                warn!("callback server did not stop in time; aborting");
                task.abort();
                let _ = task.await;
            }
            debug!("callback server stopped");
        }
        self.result_rx = None;
        self.addr = None;
    }
}

impl Drop for CallbackServer {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

fn redirect_uri(addr: SocketAddr) -> String {
    format!("http://{addr}{CALLBACK_PATH}")
}
