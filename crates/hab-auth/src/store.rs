//! Credential persistence.
//!
//! Credentials come from the environment first and from the encrypted file
//! second.  Writes go straight to the file: there is no temp-file-and-rename
//! step and no fsync, so a crash mid-write can leave a corrupt store that
//! then fails to decrypt and needs a fresh login.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::cipher::CipherBox;
use crate::config::{self, CREDENTIALS_FILE};
use crate::credentials::Credentials;
use crate::error::Result;

/// Controller URL override.
pub const ENV_URL: &str = "HAB_URL";
/// Long-lived token override, used together with [`ENV_URL`].
pub const ENV_TOKEN: &str = "HAB_TOKEN";
/// OAuth refresh token override, used together with [`ENV_URL`].
pub const ENV_REFRESH_TOKEN: &str = "HAB_REFRESH_TOKEN";

type EnvLookup = fn(&str) -> Option<String>;

fn process_env(key: &str) -> Option<String> {
    std::env::var(key).ok()
}

/// Loads, saves and deletes the single credential record of a config
/// directory.
pub struct CredentialStore {
    config_dir: PathBuf,
    cipher: CipherBox,
    env: EnvLookup,
}

impl CredentialStore {
    /// A store in `config_dir` keyed to the current machine.
    pub fn new(config_dir: impl Into<PathBuf>) -> Self {
        Self::with_cipher(config_dir, CipherBox::for_this_machine())
    }

    /// A store using an explicit cipher.
    pub fn with_cipher(config_dir: impl Into<PathBuf>, cipher: CipherBox) -> Self {
        Self {
            config_dir: config_dir.into(),
            cipher,
            env: process_env,
        }
    }

    /// Replace the environment lookup.
    #[must_use]
    pub fn with_env(mut self, env: EnvLookup) -> Self {
        self.env = env;
        self
    }

    pub fn config_dir(&self) -> &Path {
        &self.config_dir
    }

    pub fn path(&self) -> PathBuf {
        self.config_dir.join(CREDENTIALS_FILE)
    }

    /// Load the active credential.
    ///
    /// `HAB_URL` + `HAB_TOKEN` wins, then `HAB_URL` + `HAB_REFRESH_TOKEN`;
    /// either pair bypasses the file entirely.  A missing file yields
    /// `Ok(None)`.  Any other read, decrypt or decode failure is an error.
    pub fn load(&self) -> Result<Option<Credentials>> {
        if let Some(creds) = self.from_env() {
            debug!("using credentials from environment");
            return Ok(Some(creds));
        }

        let path = self.path();
        let blob = match fs::read(&path) {
            Ok(blob) => blob,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "no stored credentials");
                return Ok(None);
            }
            Err(err) => return Err(err.into()),
        };

        let plaintext = self.cipher.open(&blob)?;
        let creds = serde_json::from_slice(&plaintext)?;
        debug!(path = %path.display(), "loaded stored credentials");
        Ok(Some(creds))
    }

    /// Encrypt and write `creds`, readable by the owner only.
    pub fn save(&self, creds: &Credentials) -> Result<()> {
        config::ensure_config_dir(&self.config_dir)?;

        let plaintext = serde_json::to_vec(creds)?;
        let blob = self.cipher.seal(&plaintext)?;

        let path = self.path();
        write_owner_only(&path, &blob)?;
        debug!(path = %path.display(), "saved credentials");
        Ok(())
    }

    /// Remove the credential file. Returns `false` if nothing was removed.
    pub fn delete(&self) -> bool {
        let path = self.path();
        match fs::remove_file(&path) {
            Ok(()) => true,
            Err(err) => {
                debug!(path = %path.display(), error = %err, "credential file not removed");
                false
            }
        }
    }

    fn from_env(&self) -> Option<Credentials> {
        let non_empty = |key: &str| (self.env)(key).filter(|v: &String| !v.is_empty());

        let url = non_empty(ENV_URL)?;
        if let Some(token) = non_empty(ENV_TOKEN) {
            return Some(Credentials::long_lived(url, token));
        }
        non_empty(ENV_REFRESH_TOKEN).map(|refresh| Credentials {
            url,
            refresh_token: Some(refresh),
            ..Credentials::default()
        })
    }
}

fn write_owner_only(path: &Path, data: &[u8]) -> io::Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};

        let mut file = fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(path)?;
        // `mode` only applies on creation; tighten files that already existed.
        if let Err(err) = fs::set_permissions(path, fs::Permissions::from_mode(0o600)) {
            warn!(
                path = %path.display(),
                error = %err,
                "could not restrict credential file permissions"
            );
        }
        file.write_all(data)
    }

    #[cfg(not(unix))]
    {
        fs::File::create(path)?.write_all(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::machine_id::KEY_LEN;
    use tempfile::TempDir;

    fn no_env(_: &str) -> Option<String> {
        None
    }

    fn store(dir: &Path, seed: u8) -> CredentialStore {
        CredentialStore::with_cipher(dir, CipherBox::new([seed; KEY_LEN])).with_env(no_env)
    }

    fn oauth_creds() -> Credentials {
        Credentials {
            url: "http://192.168.1.5:8123".into(),
            access_token: Some("access".into()),
            refresh_token: Some("refresh".into()),
            client_id: Some("http://192.168.1.20:41234/".into()),
            token_expiry: 1_700_000_000,
        }
    }

    #[test]
    fn missing_file_is_absence() {
        let dir = TempDir::new().unwrap();
        assert_eq!(store(dir.path(), 1).load().unwrap(), None);
    }

    #[test]
    fn save_then_load() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir.path().join("cfg"), 1);
        store.save(&oauth_creds()).unwrap();
        assert_eq!(store.load().unwrap(), Some(oauth_creds()));
    }

    #[test]
    fn file_is_not_plaintext() {
        let dir = TempDir::new().unwrap();
        let store = store(dir.path(), 1);
        store.save(&oauth_creds()).unwrap();
        let raw = fs::read(store.path()).unwrap();
        assert!(!String::from_utf8_lossy(&raw).contains("refresh"));
    }

    #[test]
    fn wrong_machine_key_is_an_error() {
        let dir = TempDir::new().unwrap();
        store(dir.path(), 1).save(&oauth_creds()).unwrap();
        let err = store(dir.path(), 2).load().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Crypto);
    }

    #[test]
    fn corrupt_file_is_an_error() {
        let dir = TempDir::new().unwrap();
        let store = store(dir.path(), 1);
        fs::write(store.path(), b"short").unwrap();
        assert_eq!(store.load().unwrap_err().kind(), ErrorKind::Crypto);
    }

    #[cfg(unix)]
    #[test]
    fn file_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let dir = TempDir::new().unwrap();
        let store = store(dir.path(), 1);
        fs::write(store.path(), b"old").unwrap();
        fs::set_permissions(store.path(), fs::Permissions::from_mode(0o644)).unwrap();

        store.save(&oauth_creds()).unwrap();
        let mode = fs::metadata(store.path()).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn delete_reports_outcome() {
        let dir = TempDir::new().unwrap();
        let store = store(dir.path(), 1);
        assert!(!store.delete());
        store.save(&oauth_creds()).unwrap();
        assert!(store.delete());
        assert_eq!(store.load().unwrap(), None);
    }

    #[test]
    fn token_pair_overrides_file() {
        fn env(key: &str) -> Option<String> {
            match key {
                ENV_URL => Some("http://x".into()),
                ENV_TOKEN => Some("abc".into()),
                ENV_REFRESH_TOKEN => Some("ignored".into()),
                _ => None,
            }
        }

        let dir = TempDir::new().unwrap();
        store(dir.path(), 1).save(&oauth_creds()).unwrap();
        let creds = store(dir.path(), 1).with_env(env).load().unwrap().unwrap();
        assert_eq!(creds, Credentials::long_lived("http://x", "abc"));
    }

    #[test]
    fn refresh_pair_overrides_file() {
        fn env(key: &str) -> Option<String> {
            match key {
                ENV_URL => Some("http://x".into()),
                ENV_REFRESH_TOKEN => Some("r".into()),
                _ => None,
            }
        }

        let dir = TempDir::new().unwrap();
        // Undecryptable file: never read when the environment supplies a pair.
        fs::write(dir.path().join(CREDENTIALS_FILE), b"garbage").unwrap();
        let creds = store(dir.path(), 1).with_env(env).load().unwrap().unwrap();
        assert_eq!(creds.url, "http://x");
        assert_eq!(creds.refresh_token(), Some("r"));
        assert!(creds.is_oauth());
        assert_eq!(creds.token_expiry, 0);
    }

    #[test]
    fn incomplete_pair_falls_through_to_file() {
        fn env(key: &str) -> Option<String> {
            (key == ENV_TOKEN).then(|| "abc".to_string())
        }

        let dir = TempDir::new().unwrap();
        store(dir.path(), 1).save(&oauth_creds()).unwrap();
        let creds = store(dir.path(), 1).with_env(env).load().unwrap();
        assert_eq!(creds, Some(oauth_creds()));
    }
}
