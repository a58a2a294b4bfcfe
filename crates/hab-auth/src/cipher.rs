//! Authenticated encryption of the credential blob.
//!
//! Blobs are `nonce ‖ ChaCha20-Poly1305(plaintext)` with a fresh random
//! 96-bit nonce per call.

use chacha20poly1305::{
    aead::{rand_core::RngCore, Aead, OsRng},
    ChaCha20Poly1305, KeyInit, Nonce,
};
use zeroize::Zeroize;

use crate::error::{AuthError, Result};
use crate::machine_id::{self, KEY_LEN};

const NONCE_LEN: usize = 12;

/// Seals and opens blobs under one symmetric key.
pub struct CipherBox {
    cipher: ChaCha20Poly1305,
}

impl CipherBox {
    /// Build a box around `key`. The caller's copy is wiped.
    pub fn new(mut key: [u8; KEY_LEN]) -> Self {
        let cipher = ChaCha20Poly1305::new(&key.into());
        key.zeroize();
        Self { cipher }
    }

    /// Build a box keyed to the current machine.
    pub fn for_this_machine() -> Self {
        Self::new(machine_id::derive_machine_key())
    }

    /// Encrypt `plaintext`, returning `nonce ‖ ciphertext`.
    pub fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(nonce, plaintext)
            .map_err(|e| AuthError::Crypto(format!("encryption failed: {e}")))?;

        let mut blob = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        blob.extend_from_slice(&nonce_bytes);
        blob.extend_from_slice(&ciphertext);
        Ok(blob)
    }

    /// Split `blob` into nonce and sealed body and verify it.
    ///
    /// Fails on truncation, on any modified byte and on a blob sealed under a
    /// different key.
    pub fn open(&self, blob: &[u8]) -> Result<Vec<u8>> {
        if blob.len() < NONCE_LEN {
            return Err(AuthError::Crypto("ciphertext too short".into()));
        }

        let (nonce_bytes, ciphertext) = blob.split_at(NONCE_LEN);
        self.cipher
            .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
            .map_err(|_| AuthError::Crypto("authentication failed".into()))
    }
}
