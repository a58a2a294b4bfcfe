//! Client configuration.
//!
//! Resolves where credentials live and how long the interactive parts of the
//! login may take.  Built from environment variables at startup and handed to
//! [`AuthManager`](crate::AuthManager).

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Directory name used below the user's config base.
pub const DEFAULT_CONFIG_DIR: &str = "home-assistant-builder";

/// Encrypted credentials file name.
pub const CREDENTIALS_FILE: &str = "credentials.json";

/// How long the login flow waits for the browser redirect.
pub const DEFAULT_CALLBACK_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// How long discovery listens for advertisements.
pub const DEFAULT_DISCOVERY_TIMEOUT: Duration = Duration::from_secs(3);

/// Settings shared by the credential store, the OAuth flow and discovery.
#[derive(Debug, Clone)]
pub struct AuthConfig {
    /// Directory holding the credential file.
    pub config_dir: PathBuf,
    /// Upper bound on waiting for the OAuth redirect.
    pub callback_timeout: Duration,
    /// Length of the discovery window.
    pub discovery_timeout: Duration,
}

impl AuthConfig {
    /// Build the configuration from environment variables.
    ///
    /// | Variable          | Default     | Description                           |
    /// |-------------------|-------------|---------------------------------------|
    /// | `HAB_CONFIG`      | unset       | Explicit config directory             |
    /// | `XDG_CONFIG_HOME` | `~/.config` | Base directory for the default config |
    pub fn from_env() -> Self {
        let explicit = std::env::var_os("HAB_CONFIG")
            .filter(|v| !v.is_empty())
            .map(PathBuf::from);
        Self::with_config_dir(explicit.as_deref())
    }

    /// Build the configuration with an optional directory override.
    pub fn with_config_dir(config_dir: Option<&Path>) -> Self {
        Self {
            config_dir: resolve_config_dir(config_dir),
            callback_timeout: DEFAULT_CALLBACK_TIMEOUT,
            discovery_timeout: DEFAULT_DISCOVERY_TIMEOUT,
        }
    }

    /// Path of the encrypted credential file.
    pub fn credentials_path(&self) -> PathBuf {
        self.config_dir.join(CREDENTIALS_FILE)
    }
}

/// Resolve the config directory.
///
/// An explicit directory wins; otherwise `$XDG_CONFIG_HOME/home-assistant-builder`,
/// then `<home>/.config/home-assistant-builder`, then a directory relative to
/// the working directory when no home can be determined.
pub fn resolve_config_dir(explicit: Option<&Path>) -> PathBuf {
    if let Some(dir) = explicit {
        return dir.to_path_buf();
    }

    if let Some(xdg) = std::env::var_os("XDG_CONFIG_HOME").filter(|v| !v.is_empty()) {
        return PathBuf::from(xdg).join(DEFAULT_CONFIG_DIR);
    }

    match dirs::home_dir() {
        Some(home) => home.join(".config").join(DEFAULT_CONFIG_DIR),
        None => PathBuf::from(".").join(DEFAULT_CONFIG_DIR),
    }
}

/// Create the config directory (owner-only on Unix) if it does not exist.
pub fn ensure_config_dir(dir: &Path) -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;

        fs::DirBuilder::new().recursive(true).mode(0o700).create(dir)
    }

    #[cfg(not(unix))]
    {
        fs::create_dir_all(dir)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_dir_wins() {
        let cfg = AuthConfig::with_config_dir(Some(Path::new("/tmp/hab-explicit")));
        assert_eq!(cfg.config_dir, PathBuf::from("/tmp/hab-explicit"));
        assert_eq!(
            cfg.credentials_path(),
            PathBuf::from("/tmp/hab-explicit/credentials.json")
        );
    }

    #[test]
    fn default_dir_ends_with_app_name() {
        let dir = resolve_config_dir(None);
        assert!(dir.ends_with(DEFAULT_CONFIG_DIR));
    }

    #[test]
    fn default_timeouts() {
        let cfg = AuthConfig::with_config_dir(None);
        assert_eq!(cfg.callback_timeout, Duration::from_secs(300));
        assert_eq!(cfg.discovery_timeout, Duration::from_secs(3));
    }

    #[cfg(unix)]
    #[test]
    fn ensure_config_dir_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let tmp = tempfile::TempDir::new().unwrap();
        let dir = tmp.path().join("nested").join(DEFAULT_CONFIG_DIR);
        ensure_config_dir(&dir).unwrap();
        ensure_config_dir(&dir).unwrap();

        let mode = fs::metadata(&dir).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o700);
    }
}
