//! # hab-auth
//!
//! Authentication and controller discovery for the **hab** command-line
//! client.
//!
//! The crate provides:
//!
//! * [`AuthManager`]: memoized credential for one invocation, refresh
//!   decisions and the [`AuthenticatedClient`] handed to the REST layer.
//! * [`CredentialStore`]: environment overrides first, then an encrypted
//!   file bound to the current machine.
//! * [`OAuthClient`]: browser-based authorization-code login and token
//!   refresh against the controller.
//! * [`CallbackServer`]: the one-shot loopback listener behind the login.
//! * [`discovery`]: mDNS browsing for controllers on the local network.
//!
//! Credential files are encrypted with a key derived from this machine's
//! identity.  They cannot be copied to another machine; a fresh login is
//! required there.
//!
//! # Quick start
//!
//! ```rust,no_run
//! use hab_auth::{AuthConfig, AuthManager};
//!
//! # async fn run() -> Result<(), hab_auth::AuthError> {
//! let config = AuthConfig::from_env();
//! let mut auth = AuthManager::new(&config);
//!
//! if !auth.is_authenticated() {
//!     let creds = auth.oauth().run_oauth_flow("http://homeassistant.local:8123").await?;
//!     auth.save(creds)?;
//! }
//!
//! let client = auth.get_authenticated_client().await?;
//! println!("{} ready", client.server_url);
//! # Ok(())
//! # }
//! ```

pub mod callback;
pub mod cipher;
pub mod config;
pub mod credentials;
pub mod discovery;
pub mod error;
pub mod machine_id;
pub mod manager;
pub mod oauth;
pub mod store;

pub use callback::{CallbackResult, CallbackServer};
pub use cipher::CipherBox;
pub use config::AuthConfig;
pub use credentials::{Credentials, TokenState};
pub use discovery::{discover_servers, discover_servers_with, DiscoveredServer};
pub use error::{AuthError, ErrorKind, Result};
pub use manager::{AuthKind, AuthManager, AuthStatus, AuthenticatedClient};
pub use oauth::{BrowserLauncher, OAuthClient};
pub use store::CredentialStore;
